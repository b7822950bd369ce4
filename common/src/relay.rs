use std::time::Duration;

use crate::{
    schedule::Action,
    telemetry::{Publisher, TOPIC_POWER_STATE},
};

const DEFAULT_PULSE_HOLD: Duration = Duration::from_millis(500);

/// The relay driver line.
pub trait RelayPin {
    fn set_output(&mut self, high: bool);

    /// Switches the line to output mode. The level written before this call
    /// is the one the relay starts at.
    fn enable_output(&mut self);

    /// Reads the line level back from the hardware.
    fn is_high(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCommand {
    On,
    Off,
    Toggle,
}

impl PowerCommand {
    pub fn parse(value: &str) -> Option<Self> {
        let lower = value.trim().to_ascii_lowercase();
        match lower.as_str() {
            "on" | "1" => Some(Self::On),
            "off" | "0" => Some(Self::Off),
            "toggle" => Some(Self::Toggle),
            _ => None,
        }
    }
}

/// Sole writer of the relay state. Every change drives the pin and then
/// publishes `powerstate`, so telemetry never diverges from the hardware.
#[derive(Debug)]
pub struct RelayCoordinator<P, T> {
    pin: P,
    telemetry: T,
    pulse_hold: Duration,
}

impl<P: RelayPin, T: Publisher> RelayCoordinator<P, T> {
    pub fn new(pin: P, telemetry: T) -> Self {
        Self {
            pin,
            telemetry,
            pulse_hold: DEFAULT_PULSE_HOLD,
        }
    }

    pub fn with_pulse_hold(mut self, pulse_hold: Duration) -> Self {
        self.pulse_hold = pulse_hold;
        self
    }

    pub fn start(&mut self, initial: bool) {
        self.set_relay(initial);
        self.pin.enable_output();
    }

    pub fn set_relay(&mut self, on: bool) {
        self.pin.set_output(on);
        self.telemetry.publish_int(TOPIC_POWER_STATE, i32::from(on));
    }

    pub fn relay(&self) -> bool {
        self.pin.is_high()
    }

    pub fn toggle(&mut self) {
        let on = !self.relay();
        self.set_relay(on);
    }

    pub fn apply(&mut self, command: PowerCommand) {
        match command {
            PowerCommand::On => self.set_relay(true),
            PowerCommand::Off => self.set_relay(false),
            PowerCommand::Toggle => self.toggle(),
        }
    }

    /// Runs a schedule action. Pulses set one state, call `pause` for the
    /// hold interval, then set the opposite state.
    pub fn perform(&mut self, action: Action, pause: impl FnOnce(Duration)) {
        match action {
            Action::None => {}
            Action::On => self.set_relay(true),
            Action::Off => self.set_relay(false),
            Action::Toggle => self.toggle(),
            Action::PulseOff => {
                self.set_relay(false);
                pause(self.pulse_hold);
                self.set_relay(true);
            }
            Action::PulseOn => {
                self.set_relay(true);
                pause(self.pulse_hold);
                self.set_relay(false);
            }
        }
    }

    pub fn pin(&self) -> &P {
        &self.pin
    }

    pub fn telemetry(&self) -> &T {
        &self.telemetry
    }

    pub fn telemetry_mut(&mut self) -> &mut T {
        &mut self.telemetry
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::telemetry::CapturingPublisher;

    #[derive(Debug, Default)]
    struct FakePin {
        level: bool,
        output: bool,
        level_when_enabled: Option<bool>,
    }

    impl RelayPin for FakePin {
        fn set_output(&mut self, high: bool) {
            self.level = high;
        }

        fn enable_output(&mut self) {
            self.output = true;
            self.level_when_enabled = Some(self.level);
        }

        fn is_high(&self) -> bool {
            self.level
        }
    }

    #[test]
    fn set_relay_reads_back_and_publishes_once() {
        let telemetry = CapturingPublisher::default();
        let mut relay = RelayCoordinator::new(FakePin::default(), telemetry.clone());

        relay.set_relay(true);

        assert!(relay.relay());
        assert_eq!(
            telemetry.messages(),
            vec![("powerstate".to_string(), "1".to_string())]
        );
    }

    #[test]
    fn start_sets_level_before_enabling_output() {
        let mut relay = RelayCoordinator::new(FakePin::default(), CapturingPublisher::default());
        relay.start(true);

        assert!(relay.pin().output);
        assert_eq!(relay.pin().level_when_enabled, Some(true));
    }

    #[test]
    fn toggle_inverts_current_level() {
        let mut relay = RelayCoordinator::new(FakePin::default(), CapturingPublisher::default());
        relay.apply(PowerCommand::Toggle);
        assert!(relay.relay());
        relay.apply(PowerCommand::Toggle);
        assert!(!relay.relay());
    }

    #[test]
    fn pulse_off_returns_to_on() {
        let telemetry = CapturingPublisher::default();
        let mut relay = RelayCoordinator::new(FakePin::default(), telemetry.clone())
            .with_pulse_hold(Duration::from_millis(250));
        let mut held = Duration::ZERO;

        relay.perform(Action::PulseOff, |hold| held = hold);

        assert!(relay.relay());
        assert_eq!(held, Duration::from_millis(250));
        assert_eq!(
            telemetry.values("powerstate"),
            vec!["0".to_string(), "1".to_string()]
        );
    }

    #[test]
    fn parses_power_commands_case_insensitively() {
        assert_eq!(PowerCommand::parse("ON"), Some(PowerCommand::On));
        assert_eq!(PowerCommand::parse("1"), Some(PowerCommand::On));
        assert_eq!(PowerCommand::parse("Off"), Some(PowerCommand::Off));
        assert_eq!(PowerCommand::parse("0"), Some(PowerCommand::Off));
        assert_eq!(PowerCommand::parse("Toggle"), Some(PowerCommand::Toggle));
        assert_eq!(PowerCommand::parse("maybe"), None);
    }
}
