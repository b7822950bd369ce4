use std::{
    io::{self, Write},
    sync::OnceLock,
    time::{Duration, Instant},
};

use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use wifiplug_common::{
    handle_button,
    web::{write_error, write_ok, write_protocol_error, Status},
    Action, ButtonEvent, ControllerConfig, CurrentSensor, DayMask, Eeprom, Event, PowerCommand,
    PowerMonitor, Publisher, RelayCoordinator, RelayPin, Request, RequestSource, ScheduleEngine,
    Settings, SettingsStore, StoreError, WallTime,
};

#[derive(Debug, thiserror::Error)]
enum CommandError {
    #[error("no such page: {0}")]
    NotFound(String),
    #[error("missing parameter `{0}`")]
    Missing(&'static str),
    #[error("bad value `{value}` for `{name}`")]
    BadParameter { name: String, value: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CommandError {
    fn bad(name: &str, value: &str) -> Self {
        Self::BadParameter {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn status(&self) -> Status {
        match self {
            Self::NotFound(_) => Status::NotFound,
            Self::Missing(_) | Self::BadParameter { .. } => Status::BadRequest,
            Self::Store(_) | Self::Json(_) => Status::ServerError,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusView {
    relay: bool,
    #[serde(rename = "currentMa")]
    current_ma: i32,
    #[serde(rename = "timeSynced")]
    time_synced: bool,
    time: Option<String>,
    timezone: String,
    hostname: String,
    #[serde(rename = "onAfterPowerFail")]
    on_after_power_fail: bool,
    #[serde(rename = "authEnabled")]
    auth_enabled: bool,
    #[serde(rename = "mqttEnabled")]
    mqtt_enabled: bool,
    #[serde(rename = "scheduleTracking")]
    schedule_tracking: bool,
}

#[derive(Debug, Serialize)]
struct EventView {
    index: usize,
    days: u8,
    hour: u8,
    minute: u8,
    action: &'static str,
}

/// The whole appliance: settings, relay, schedule and power monitor, stepped
/// from one loop. Nothing in here is shared across threads.
pub struct Device<D, P, T> {
    config: ControllerConfig,
    store: SettingsStore<D>,
    settings: Settings,
    relay: RelayCoordinator<P, T>,
    schedule: ScheduleEngine,
    power: PowerMonitor,
    pause: fn(Duration),
}

impl<D: Eeprom, P: RelayPin, T: Publisher> Device<D, P, T> {
    /// Loads settings (writing defaults back when the stored record was
    /// rejected) and starts the relay in the power-fail state.
    pub fn boot(
        config: ControllerConfig,
        eeprom: D,
        pin: P,
        telemetry: T,
        reset: bool,
        pause: fn(Duration),
    ) -> Self {
        let mut store = SettingsStore::new(eeprom);
        let (settings, restored) = store.load(reset);
        if !restored {
            if let Err(err) = store.save(&settings) {
                log::warn!("failed to persist default settings: {err}");
            }
        }

        let mut relay = RelayCoordinator::new(pin, telemetry)
            .with_pulse_hold(Duration::from_millis(config.pulse_hold_ms));
        relay.start(settings.events.on_after_power_fail);

        let schedule = ScheduleEngine::new(config.max_catch_up_minutes);
        let power = PowerMonitor::new(config.power_sample_interval_ms);

        Self {
            config,
            store,
            settings,
            relay,
            schedule,
            power,
            pause,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn relay(&self) -> &RelayCoordinator<P, T> {
        &self.relay
    }

    pub fn telemetry_mut(&mut self) -> &mut T {
        self.relay.telemetry_mut()
    }

    pub fn local_now(&self, utc: Option<DateTime<Utc>>) -> Option<DateTime<FixedOffset>> {
        now_in_timezone(&self.settings.time.timezone, utc?)
    }

    pub fn on_button(&mut self, event: ButtonEvent) {
        log::info!("button {}", event.label());
        handle_button(event, &mut self.relay);
    }

    pub fn on_remote_power(&mut self, payload: &str) {
        match PowerCommand::parse(payload) {
            Some(command) => {
                log::info!("remote power command {command:?}");
                self.relay.apply(command);
            }
            None => log::warn!("ignoring remote power payload `{payload}`"),
        }
    }

    /// Power sampling, then the schedule. Runs once per loop pass.
    pub fn tick<S: CurrentSensor + ?Sized>(
        &mut self,
        now_ms: u64,
        utc: Option<DateTime<Utc>>,
        sensor: &mut S,
    ) -> Option<Action> {
        self.power.step(now_ms, sensor, self.relay.telemetry_mut());
        let now = self.local_now(utc).map(|local| WallTime::from_datetime(&local));
        self.schedule
            .run(now, &self.settings.events, &mut self.relay, self.pause)
    }

    /// Reads one request and writes one response. Protocol failures are
    /// answered (or dropped, for timeouts) here; only write errors escape.
    pub fn serve<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        utc: Option<DateTime<Utc>>,
    ) -> io::Result<()>
    where
        R: RequestSource + ?Sized,
        W: Write + ?Sized,
    {
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let server = self.config.device_name.clone();

        let request = match wifiplug_common::read_request(reader, &self.settings.ui, true, timeout)
        {
            Ok(request) => request,
            Err(err) => {
                log::debug!("request rejected: {err}");
                return write_protocol_error(writer, &server, &err);
            }
        };

        log::debug!("{:?} /{}", request.method, request.path);
        match self.route(request, utc) {
            Ok(body) => write_ok(writer, &server, &body),
            Err(err) => {
                log::info!("command failed: {err}");
                write_error(writer, &server, err.status(), &[])
            }
        }
    }

    fn route(
        &mut self,
        request: Request,
        utc: Option<DateTime<Utc>>,
    ) -> Result<String, CommandError> {
        let Request { path, params, .. } = request;
        let params: Vec<(String, String)> = params.collect();

        match path.as_str() {
            "" | "index.html" | "status" => {}
            "events" => return self.events_json(),
            "relay" => {
                let value = require(&params, "state")?;
                let command =
                    PowerCommand::parse(value).ok_or_else(|| CommandError::bad("state", value))?;
                self.relay.apply(command);
            }
            "event" => {
                self.edit_event(&params)?;
                return self.events_json();
            }
            "config/ui" => self.configure_ui(&params)?,
            "config/mqtt" => self.configure_mqtt(&params)?,
            "config/time" => self.configure_time(&params)?,
            "config/network" => self.configure_network(&params)?,
            "config/poweron" => {
                let value = require(&params, "state")?;
                let on = match PowerCommand::parse(value) {
                    Some(PowerCommand::On) => true,
                    Some(PowerCommand::Off) => false,
                    _ => return Err(CommandError::bad("state", value)),
                };
                self.settings.events.on_after_power_fail = on;
                self.commit()?;
            }
            "reset" => {
                log::warn!("factory reset requested");
                let (defaults, _) = self.store.load(true);
                self.settings = defaults;
                self.commit()?;
            }
            other => return Err(CommandError::NotFound(other.to_string())),
        }

        self.status_json(utc)
    }

    /// Sanitizes, saves, and drops the schedule cursor so the next tick
    /// reseeds without firing.
    fn commit(&mut self) -> Result<(), CommandError> {
        self.settings.sanitize();
        self.store.save(&self.settings)?;
        self.schedule.stop();
        Ok(())
    }

    fn edit_event(&mut self, params: &[(String, String)]) -> Result<(), CommandError> {
        let raw_index = require(params, "index")?;
        let index: usize = raw_index
            .trim()
            .parse()
            .ok()
            .filter(|index| *index < self.settings.events.events.len())
            .ok_or_else(|| CommandError::bad("index", raw_index))?;

        let mut event: Event = self.settings.events.events[index];
        for (name, value) in params {
            match name.as_str() {
                "days" => {
                    let bits: u8 = value
                        .trim()
                        .parse()
                        .ok()
                        .filter(|bits| *bits < 0x80)
                        .ok_or_else(|| CommandError::bad(name, value))?;
                    event.days = DayMask::from_bits(bits);
                }
                "hour" => {
                    event.hour = parse_below(name, value, 24)?;
                }
                "minute" => {
                    event.minute = parse_below(name, value, 60)?;
                }
                "action" => {
                    event.action =
                        Action::parse(value).ok_or_else(|| CommandError::bad(name, value))?;
                }
                _ => {}
            }
        }

        self.settings.events.events[index] = event;
        log::info!(
            "event {index} set to days={:#04x} {:02}:{:02} {}",
            event.days.bits(),
            event.hour,
            event.minute,
            event.action.label()
        );
        self.commit()
    }

    fn configure_ui(&mut self, params: &[(String, String)]) -> Result<(), CommandError> {
        for (name, value) in params {
            match name.as_str() {
                "user" => self.settings.ui.user = value.clone(),
                "pass" => self.settings.ui.set_password(value, &mut rand::thread_rng()),
                _ => {}
            }
        }
        log::info!(
            "web credentials updated, authentication {}",
            if self.settings.ui.is_protected() { "on" } else { "off" }
        );
        self.commit()
    }

    /// Takes effect after a restart.
    fn configure_mqtt(&mut self, params: &[(String, String)]) -> Result<(), CommandError> {
        let mut mqtt = self.settings.mqtt.clone();
        for (name, value) in params {
            match name.as_str() {
                "enable" => mqtt.enable = parse_flag(name, value)?,
                "host" => mqtt.host = value.clone(),
                "port" => {
                    mqtt.port = value
                        .trim()
                        .parse()
                        .map_err(|_| CommandError::bad(name, value))?;
                }
                "ssl" => mqtt.ssl = parse_flag(name, value)?,
                "clientid" => mqtt.client_id = value.clone(),
                "topic" => mqtt.topic = value.clone(),
                "user" => mqtt.user = value.clone(),
                "pass" => mqtt.pass = value.clone(),
                _ => {}
            }
        }
        self.settings.mqtt = mqtt;
        self.commit()
    }

    fn configure_time(&mut self, params: &[(String, String)]) -> Result<(), CommandError> {
        let mut time = self.settings.time.clone();
        for (name, value) in params {
            match name.as_str() {
                "ntp" => time.ntp_server = value.clone(),
                "tz" => {
                    value
                        .parse::<Tz>()
                        .map_err(|_| CommandError::bad(name, value))?;
                    time.timezone = value.clone();
                }
                "use12hr" => time.use_12hr = parse_flag(name, value)?,
                "usedmy" => time.use_dmy = parse_flag(name, value)?,
                _ => {}
            }
        }
        self.settings.time = time;
        self.commit()
    }

    fn configure_network(&mut self, params: &[(String, String)]) -> Result<(), CommandError> {
        let mut net = self.settings.network.clone();
        for (name, value) in params {
            match name.as_str() {
                "ssid" => net.ssid = value.clone(),
                "psk" => net.psk = value.clone(),
                "hostname" => net.hostname = value.clone(),
                "dhcp" => net.use_dhcp = parse_flag(name, value)?,
                "ip" => net.ip = parse_quad(value),
                "dns" => net.dns = parse_quad(value),
                "gateway" => net.gateway = parse_quad(value),
                "netmask" => net.netmask = parse_quad(value),
                "logsvr" => net.log_server = parse_quad(value),
                _ => {}
            }
        }
        self.settings.network = net;
        self.commit()
    }

    fn status_json(&self, utc: Option<DateTime<Utc>>) -> Result<String, CommandError> {
        let local = self.local_now(utc);
        let view = StatusView {
            relay: self.relay.relay(),
            current_ma: self.power.current_ma(),
            time_synced: local.is_some(),
            time: local.map(|now| {
                format_time(&now, self.settings.time.use_12hr, self.settings.time.use_dmy)
            }),
            timezone: self.settings.time.timezone.clone(),
            hostname: self.settings.network.hostname.clone(),
            on_after_power_fail: self.settings.events.on_after_power_fail,
            auth_enabled: self.settings.ui.is_protected(),
            mqtt_enabled: self.settings.mqtt.enable,
            schedule_tracking: self.schedule.is_tracking(),
        };
        Ok(serde_json::to_string(&view)?)
    }

    fn events_json(&self) -> Result<String, CommandError> {
        let events: Vec<EventView> = self
            .settings
            .events
            .events
            .iter()
            .enumerate()
            .map(|(index, event)| EventView {
                index,
                days: event.days.bits(),
                hour: event.hour,
                minute: event.minute,
                action: event.action.label(),
            })
            .collect();
        Ok(serde_json::to_string(&events)?)
    }
}

fn require<'a>(
    params: &'a [(String, String)],
    name: &'static str,
) -> Result<&'a str, CommandError> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
        .ok_or(CommandError::Missing(name))
}

fn parse_below(name: &str, value: &str, limit: u8) -> Result<u8, CommandError> {
    value
        .trim()
        .parse::<u8>()
        .ok()
        .filter(|parsed| *parsed < limit)
        .ok_or_else(|| CommandError::bad(name, value))
}

/// Checkbox semantics: a bare name (empty value) or `on` means set.
fn parse_flag(name: &str, value: &str) -> Result<bool, CommandError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "on" | "1" | "true" | "yes" => Ok(true),
        "off" | "0" | "false" | "no" => Ok(false),
        _ => Err(CommandError::bad(name, value)),
    }
}

/// Reads up to four decimal fields separated by any non-digit. Missing
/// fields are zero and each field keeps its low eight bits.
pub fn parse_quad(value: &str) -> [u8; 4] {
    let mut quad = [0u8; 4];
    let mut bytes = value.bytes().peekable();

    for slot in &mut quad {
        let mut field: u32 = 0;
        while let Some(digit) = bytes.peek().filter(|byte| byte.is_ascii_digit()).copied() {
            field = field.saturating_mul(10).saturating_add(u32::from(digit - b'0'));
            bytes.next();
        }
        *slot = (field & 0xff) as u8;
        if bytes.next().is_none() {
            break;
        }
    }
    quad
}

fn format_time(now: &DateTime<FixedOffset>, use_12hr: bool, use_dmy: bool) -> String {
    let date = if use_dmy { "%d/%m/%Y" } else { "%m/%d/%Y" };
    let clock = if use_12hr { "%I:%M:%S %p" } else { "%H:%M:%S" };
    now.format(&format!("{date} {clock}")).to_string()
}

pub fn now_in_timezone(timezone: &str, utc: DateTime<Utc>) -> Option<DateTime<FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = utc.with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
