use crate::{password::Credential, schedule::EventTable};

/// Bump whenever the persisted record layout changes so stale images are
/// discarded instead of misread.
pub const SETTINGS_VERSION: u8 = 3;

pub const SSID_CAP: usize = 32;
pub const PSK_CAP: usize = 32;
pub const HOSTNAME_CAP: usize = 16;
pub const NTP_CAP: usize = 48;
pub const TIMEZONE_CAP: usize = 40;
pub const MQTT_HOST_CAP: usize = 48;
pub const MQTT_CLIENT_ID_CAP: usize = 32;
pub const MQTT_TOPIC_CAP: usize = 32;
pub const MQTT_USER_CAP: usize = 32;
pub const MQTT_PASS_CAP: usize = 32;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub device_name: String,
    pub request_timeout_ms: u64,
    pub pulse_hold_ms: u64,
    pub power_sample_interval_ms: u64,
    pub loop_period_ms: u64,
    pub max_catch_up_minutes: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            device_name: "WiFiPlug".to_string(),
            request_timeout_ms: 5_000,
            pulse_hold_ms: 500,
            power_sample_interval_ms: 10_000,
            loop_period_ms: 10,
            max_catch_up_minutes: 7 * 24 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub ssid: String,
    pub psk: String,
    pub hostname: String,
    pub use_dhcp: bool,
    pub ip: [u8; 4],
    pub dns: [u8; 4],
    pub gateway: [u8; 4],
    pub netmask: [u8; 4],
    pub log_server: [u8; 4],
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            psk: String::new(),
            hostname: "wifiplug".to_string(),
            use_dhcp: true,
            ip: [0; 4],
            dns: [0; 4],
            gateway: [0; 4],
            netmask: [0; 4],
            log_server: [0; 4],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeConfig {
    pub ntp_server: String,
    pub use_12hr: bool,
    pub use_dmy: bool,
    pub timezone: String,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            ntp_server: "us.pool.ntp.org".to_string(),
            use_12hr: false,
            use_dmy: false,
            timezone: "America/Los_Angeles".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub enable: bool,
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub client_id: String,
    pub topic: String,
    pub user: String,
    pub pass: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enable: false,
            host: String::new(),
            port: 1883,
            ssl: false,
            client_id: "wifiplug".to_string(),
            topic: "wifiplug".to_string(),
            user: String::new(),
            pass: String::new(),
        }
    }
}

/// The single persisted configuration and schedule record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub version: u8,
    pub network: NetworkConfig,
    pub time: TimeConfig,
    pub mqtt: MqttConfig,
    pub ui: Credential,
    pub events: EventTable,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            network: NetworkConfig::default(),
            time: TimeConfig::default(),
            mqtt: MqttConfig::default(),
            ui: Credential::default(),
            events: EventTable::default(),
        }
    }
}

impl Settings {
    /// Truncates every text field to what its fixed slot can hold and drops
    /// malformed schedule entries, so a save/load cycle is lossless.
    pub fn sanitize(&mut self) {
        self.version = SETTINGS_VERSION;

        truncate_to_slot(&mut self.network.ssid, SSID_CAP);
        truncate_to_slot(&mut self.network.psk, PSK_CAP);
        truncate_to_slot(&mut self.network.hostname, HOSTNAME_CAP);

        truncate_to_slot(&mut self.time.ntp_server, NTP_CAP);
        truncate_to_slot(&mut self.time.timezone, TIMEZONE_CAP);

        truncate_to_slot(&mut self.mqtt.host, MQTT_HOST_CAP);
        truncate_to_slot(&mut self.mqtt.client_id, MQTT_CLIENT_ID_CAP);
        truncate_to_slot(&mut self.mqtt.topic, MQTT_TOPIC_CAP);
        truncate_to_slot(&mut self.mqtt.user, MQTT_USER_CAP);
        truncate_to_slot(&mut self.mqtt.pass, MQTT_PASS_CAP);

        self.ui.sanitize();
        self.events.normalize();
    }
}

/// Slots are NUL terminated, so `cap - 1` bytes of text fit. Cuts on a char
/// boundary and stops at any embedded NUL.
pub(crate) fn truncate_to_slot(value: &mut String, cap: usize) {
    if let Some(nul) = value.find('\0') {
        value.truncate(nul);
    }

    let limit = cap.saturating_sub(1);
    if value.len() <= limit {
        return;
    }

    let mut cut = limit;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    value.truncate(cut);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut value = "ab\u{e9}cd".to_string();
        truncate_to_slot(&mut value, 4);
        assert_eq!(value, "ab");

        let mut value = "hostname-that-is-too-long".to_string();
        truncate_to_slot(&mut value, HOSTNAME_CAP);
        assert_eq!(value.len(), HOSTNAME_CAP - 1);
    }

    #[test]
    fn sanitize_strips_embedded_nul() {
        let mut settings = Settings::default();
        settings.network.ssid = "home\0garbage".to_string();
        settings.sanitize();
        assert_eq!(settings.network.ssid, "home");
    }
}
