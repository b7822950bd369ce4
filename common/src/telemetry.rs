use std::{cell::RefCell, rc::Rc};

pub const TOPIC_POWER_STATE: &str = "powerstate";
pub const TOPIC_SCHEDULED_EVENT: &str = "scheduledevent";
pub const TOPIC_BUTTON: &str = "button";
pub const TOPIC_POWER_MA: &str = "powerma";
pub const TOPIC_REMOTE_POWER: &str = "remotepower";

/// Outbound half of the message-bus client. Topics are suffixes; the
/// implementation prepends the configured prefix.
pub trait Publisher {
    fn publish(&mut self, suffix: &str, value: &str);

    fn publish_int(&mut self, suffix: &str, value: i32) {
        self.publish(suffix, &value.to_string());
    }
}

impl<T: Publisher + ?Sized> Publisher for &mut T {
    fn publish(&mut self, suffix: &str, value: &str) {
        (**self).publish(suffix, value);
    }
}

pub fn full_topic(prefix: &str, suffix: &str) -> String {
    format!("{prefix}/{suffix}")
}

/// Keeps every publish in memory. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct CapturingPublisher {
    log: Rc<RefCell<Vec<(String, String)>>>,
}

impl CapturingPublisher {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.log.borrow().clone()
    }

    pub fn values(&self, suffix: &str) -> Vec<String> {
        self.log
            .borrow()
            .iter()
            .filter(|(topic, _)| topic == suffix)
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.log.borrow_mut().clear();
    }
}

impl Publisher for CapturingPublisher {
    fn publish(&mut self, suffix: &str, value: &str) {
        self.log
            .borrow_mut()
            .push((suffix.to_string(), value.to_string()));
    }
}
