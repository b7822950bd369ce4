use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Weekday};

use crate::{
    relay::{RelayCoordinator, RelayPin},
    telemetry::{Publisher, TOPIC_SCHEDULED_EVENT},
};

pub const MAX_EVENTS: usize = 24;
pub const MINUTES_PER_WEEK: u32 = 7 * 24 * 60;
/// A clock that lands this many minutes or fewer behind the cursor has
/// stepped backwards; it is not a week-long catch-up.
pub const BACKWARD_STEP_MINUTES: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DayOfWeek {
    Sun,
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl DayOfWeek {
    pub fn index(self) -> usize {
        match self {
            Self::Sun => 0,
            Self::Mon => 1,
            Self::Tue => 2,
            Self::Wed => 3,
            Self::Thu => 4,
            Self::Fri => 5,
            Self::Sat => 6,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index % 7 {
            0 => Self::Sun,
            1 => Self::Mon,
            2 => Self::Tue,
            3 => Self::Wed,
            4 => Self::Thu,
            5 => Self::Fri,
            _ => Self::Sat,
        }
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Mon => Self::Mon,
            Weekday::Tue => Self::Tue,
            Weekday::Wed => Self::Wed,
            Weekday::Thu => Self::Thu,
            Weekday::Fri => Self::Fri,
            Weekday::Sat => Self::Sat,
            Weekday::Sun => Self::Sun,
        }
    }
}

/// Bit `i` selects weekday `i`, Sunday being bit 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DayMask(u8);

impl DayMask {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(0x7f);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x7f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, day: DayOfWeek) -> bool {
        self.0 & (1 << day.index()) != 0
    }

    pub fn with(self, day: DayOfWeek) -> Self {
        Self(self.0 | (1 << day.index()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    #[default]
    None = 0,
    On = 1,
    Off = 2,
    Toggle = 3,
    PulseOff = 4,
    PulseOn = 5,
}

impl Action {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::On),
            2 => Some(Self::Off),
            3 => Some(Self::Toggle),
            4 => Some(Self::PulseOff),
            5 => Some(Self::PulseOn),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::On => "On",
            Self::Off => "Off",
            Self::Toggle => "Toggle",
            Self::PulseOff => "Pulse Off",
            Self::PulseOn => "Pulse On",
        }
    }

    /// Accepts the numeric code or the label, ignoring case and spaces.
    pub fn parse(value: &str) -> Option<Self> {
        if let Ok(code) = value.trim().parse::<u8>() {
            return Self::from_u8(code);
        }

        let compact: String = value
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        match compact.as_str() {
            "none" => Some(Self::None),
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "toggle" => Some(Self::Toggle),
            "pulseoff" => Some(Self::PulseOff),
            "pulseon" => Some(Self::PulseOn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Event {
    pub days: DayMask,
    pub hour: u8,
    pub minute: u8,
    pub action: Action,
}

impl Event {
    pub const EMPTY: Self = Self {
        days: DayMask::EMPTY,
        hour: 0,
        minute: 0,
        action: Action::None,
    };

    pub fn validate(&self) -> bool {
        self.hour < 24 && self.minute < 60
    }

    pub fn matches(&self, at: WallTime) -> bool {
        self.action != Action::None
            && self.days.contains(at.day)
            && self.hour == at.hour
            && self.minute == at.minute
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTable {
    pub on_after_power_fail: bool,
    pub events: [Event; MAX_EVENTS],
}

impl Default for EventTable {
    fn default() -> Self {
        Self {
            on_after_power_fail: false,
            events: [Event::EMPTY; MAX_EVENTS],
        }
    }
}

impl EventTable {
    pub fn normalize(&mut self) {
        for event in &mut self.events {
            if !event.validate() {
                *event = Event::EMPTY;
            }
        }
    }

    /// Last matching entry in table order wins within one minute.
    fn action_at(&self, at: WallTime) -> Option<Action> {
        self.events
            .iter()
            .filter(|event| event.matches(at))
            .last()
            .map(|event| event.action)
    }
}

/// Local weekday, hour and minute; the resolution the schedule works at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallTime {
    pub day: DayOfWeek,
    pub hour: u8,
    pub minute: u8,
}

impl WallTime {
    pub fn new(day: DayOfWeek, hour: u8, minute: u8) -> Self {
        Self { day, hour, minute }
    }

    pub fn from_datetime<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        Self {
            day: DayOfWeek::from_chrono(now.weekday()),
            hour: now.hour() as u8,
            minute: now.minute() as u8,
        }
    }

    pub fn minute_of_week(self) -> u32 {
        (self.day.index() as u32 * 24 + self.hour as u32) * 60 + self.minute as u32
    }

    pub fn from_minute_of_week(minutes: u32) -> Self {
        let minutes = minutes % MINUTES_PER_WEEK;
        Self {
            day: DayOfWeek::from_index((minutes / (24 * 60)) as usize),
            hour: ((minutes / 60) % 24) as u8,
            minute: (minutes % 60) as u8,
        }
    }
}

/// Successive minutes after `from` up to and including `to`, wrapping
/// Saturday into Sunday, capped at `limit` steps.
#[derive(Debug, Clone)]
pub struct MinuteWalk {
    current: u32,
    remaining: u32,
}

impl MinuteWalk {
    pub fn between(from: WallTime, to: WallTime, limit: u32) -> Self {
        Self {
            current: from.minute_of_week(),
            remaining: Self::span(from, to).min(limit),
        }
    }

    /// Forward distance in minutes from `from` to `to`, wrapping the week.
    pub fn span(from: WallTime, to: WallTime) -> u32 {
        (to.minute_of_week() + MINUTES_PER_WEEK - from.minute_of_week()) % MINUTES_PER_WEEK
    }
}

impl Iterator for MinuteWalk {
    type Item = WallTime;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.current = (self.current + 1) % MINUTES_PER_WEEK;
        Some(WallTime::from_minute_of_week(self.current))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining as usize;
        (remaining, Some(remaining))
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleEngine {
    cursor: Option<WallTime>,
    max_catch_up_minutes: u32,
}

impl Default for ScheduleEngine {
    fn default() -> Self {
        Self::new(MINUTES_PER_WEEK)
    }
}

impl ScheduleEngine {
    pub fn new(max_catch_up_minutes: u32) -> Self {
        Self {
            cursor: None,
            max_catch_up_minutes: max_catch_up_minutes.max(1),
        }
    }

    pub fn cursor(&self) -> Option<WallTime> {
        self.cursor
    }

    pub fn is_tracking(&self) -> bool {
        self.cursor.is_some()
    }

    /// Forget the cursor; the next tick with a known time reseeds it
    /// without firing.
    pub fn stop(&mut self) {
        self.cursor = None;
    }

    /// Advances the cursor to `now` one minute at a time and returns the
    /// action of the latest matching minute, if any. `None` for `now` means
    /// the wall clock is not known yet.
    pub fn step(&mut self, now: Option<WallTime>, table: &EventTable) -> Option<Action> {
        let now = now?;
        let Some(last) = self.cursor else {
            self.cursor = Some(now);
            return None;
        };
        if last == now {
            return None;
        }
        if MinuteWalk::span(last, now) >= MINUTES_PER_WEEK - BACKWARD_STEP_MINUTES {
            log::info!("wall clock stepped backwards; reseeding schedule");
            self.cursor = Some(now);
            return None;
        }

        let mut pending = None;
        for minute in MinuteWalk::between(last, now, self.max_catch_up_minutes) {
            if let Some(action) = table.action_at(minute) {
                pending = Some(action);
            }
        }

        self.cursor = Some(now);
        pending
    }

    /// One scheduler pass: evaluate, announce the firing, then drive the
    /// relay. At most one action runs per call.
    pub fn run<P: RelayPin, T: Publisher>(
        &mut self,
        now: Option<WallTime>,
        table: &EventTable,
        relay: &mut RelayCoordinator<P, T>,
        pause: impl FnOnce(Duration),
    ) -> Option<Action> {
        let action = self.step(now, table)?;

        log::info!("schedule fired: {}", action.label());
        relay
            .telemetry_mut()
            .publish(TOPIC_SCHEDULED_EVENT, action.label());
        relay.perform(action, pause);
        Some(action)
    }
}
