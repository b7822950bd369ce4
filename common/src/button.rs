use crate::{
    relay::{RelayCoordinator, RelayPin},
    telemetry::{Publisher, TOPIC_BUTTON},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    Press,
    Release,
}

impl ButtonEvent {
    pub fn label(self) -> &'static str {
        match self {
            Self::Press => "press",
            Self::Release => "release",
        }
    }
}

/// Turns an already debounced pressed/released level into edge events.
#[derive(Debug, Clone, Default)]
pub struct ButtonEdge {
    pressed: bool,
}

impl ButtonEdge {
    pub fn update(&mut self, pressed: bool) -> Option<ButtonEvent> {
        if pressed == self.pressed {
            return None;
        }
        self.pressed = pressed;
        Some(if pressed {
            ButtonEvent::Press
        } else {
            ButtonEvent::Release
        })
    }
}

/// A press always toggles the relay; both edges are published.
pub fn handle_button<P: RelayPin, T: Publisher>(
    event: ButtonEvent,
    relay: &mut RelayCoordinator<P, T>,
) {
    if event == ButtonEvent::Press {
        relay.toggle();
    }
    relay.telemetry_mut().publish(TOPIC_BUTTON, event.label());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::CapturingPublisher;

    #[derive(Default)]
    struct Pin(bool);

    impl RelayPin for Pin {
        fn set_output(&mut self, high: bool) {
            self.0 = high;
        }

        fn enable_output(&mut self) {}

        fn is_high(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn edges_only_fire_on_change() {
        let mut edge = ButtonEdge::default();
        assert_eq!(edge.update(false), None);
        assert_eq!(edge.update(true), Some(ButtonEvent::Press));
        assert_eq!(edge.update(true), None);
        assert_eq!(edge.update(false), Some(ButtonEvent::Release));
    }

    #[test]
    fn press_toggles_and_release_only_reports() {
        let telemetry = CapturingPublisher::default();
        let mut relay = RelayCoordinator::new(Pin::default(), telemetry.clone());

        handle_button(ButtonEvent::Press, &mut relay);
        assert!(relay.relay());
        handle_button(ButtonEvent::Release, &mut relay);
        assert!(relay.relay());

        assert_eq!(
            telemetry.values("button"),
            vec!["press".to_string(), "release".to_string()]
        );
        assert_eq!(telemetry.values("powerstate"), vec!["1".to_string()]);
    }
}
