use crate::{
    config::{
        truncate_to_slot, MqttConfig, NetworkConfig, Settings, TimeConfig, HOSTNAME_CAP,
        MQTT_CLIENT_ID_CAP, MQTT_HOST_CAP, MQTT_PASS_CAP, MQTT_TOPIC_CAP, MQTT_USER_CAP, NTP_CAP,
        PSK_CAP, SETTINGS_VERSION, SSID_CAP, TIMEZONE_CAP,
    },
    password::{Credential, DIGEST_LEN, SALT_LEN, USER_CAP},
    schedule::{Action, DayMask, Event, EventTable, MAX_EVENTS},
};

pub const NETWORK_BLOCK_LEN: usize = SSID_CAP + PSK_CAP + HOSTNAME_CAP + 1 + 5 * 4;
pub const TIME_BLOCK_LEN: usize = NTP_CAP + 1 + 1 + TIMEZONE_CAP;
pub const MQTT_BLOCK_LEN: usize = 1
    + MQTT_HOST_CAP
    + 2
    + 1
    + MQTT_CLIENT_ID_CAP
    + MQTT_TOPIC_CAP
    + MQTT_USER_CAP
    + MQTT_PASS_CAP;
pub const UI_BLOCK_LEN: usize = USER_CAP + SALT_LEN + DIGEST_LEN;
pub const EVENT_BLOCK_LEN: usize = 1 + MAX_EVENTS * 4;

/// Version byte followed by every sub-block.
pub const RECORD_LEN: usize =
    1 + NETWORK_BLOCK_LEN + TIME_BLOCK_LEN + MQTT_BLOCK_LEN + UI_BLOCK_LEN + EVENT_BLOCK_LEN;
/// Record plus the `(checksum, !checksum)` trailer.
pub const SEALED_LEN: usize = RECORD_LEN + 2;
pub const EEPROM_SIZE: usize = 4096;

const CHECKSUM_SEED: u8 = 0xef;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage device error: {0}")]
    Device(String),
    #[error("access outside the storage region")]
    OutOfRange,
}

/// Byte-addressed persistent storage with an explicit open/commit/close
/// lifecycle.
pub trait Eeprom {
    fn begin(&mut self, size: usize) -> Result<(), StoreError>;
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError>;
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
    fn end(&mut self);
}

/// Open session on an [`Eeprom`]; `end` runs on drop, whichever way the
/// caller leaves.
struct StorageSession<'a, D: Eeprom> {
    device: &'a mut D,
}

impl<'a, D: Eeprom> StorageSession<'a, D> {
    fn open(device: &'a mut D) -> Result<Self, StoreError> {
        device.begin(EEPROM_SIZE)?;
        Ok(Self { device })
    }
}

impl<D: Eeprom> Drop for StorageSession<'_, D> {
    fn drop(&mut self) {
        self.device.end();
    }
}

pub fn checksum(record: &[u8]) -> u8 {
    record.iter().fold(CHECKSUM_SEED, |acc, byte| acc ^ byte)
}

pub fn seal(record: &[u8]) -> Vec<u8> {
    let check = checksum(record);
    let mut sealed = Vec::with_capacity(record.len() + 2);
    sealed.extend_from_slice(record);
    sealed.push(check);
    sealed.push(!check);
    sealed
}

/// Returns the record when both trailer bytes agree with it.
pub fn open(sealed: &[u8]) -> Option<&[u8]> {
    let (record, trailer) = sealed.split_at(sealed.len().checked_sub(2)?);
    let check = checksum(record);
    (trailer[0] == check && trailer[1] == !check).then_some(record)
}

struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(RECORD_LEN),
        }
    }

    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    /// NUL-padded text slot of exactly `cap` bytes.
    fn text(&mut self, value: &str, cap: usize) {
        let mut value = value.to_string();
        truncate_to_slot(&mut value, cap);
        let start = self.buf.len();
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.resize(start + cap, 0);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct RecordReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> &'a [u8] {
        let end = (self.pos + len).min(self.bytes.len());
        let slice = &self.bytes[self.pos.min(end)..end];
        self.pos = end;
        slice
    }

    fn u8(&mut self) -> u8 {
        self.take(1).first().copied().unwrap_or(0)
    }

    fn bool(&mut self) -> bool {
        self.u8() != 0
    }

    fn u16(&mut self) -> u16 {
        let raw = self.take(2);
        match raw {
            [lo, hi] => u16::from_le_bytes([*lo, *hi]),
            _ => 0,
        }
    }

    fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0; N];
        let raw = self.take(N);
        out[..raw.len()].copy_from_slice(raw);
        out
    }

    fn text(&mut self, cap: usize) -> String {
        let raw = self.take(cap);
        let end = raw.iter().position(|byte| *byte == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }
}

impl Settings {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = RecordWriter::new();
        w.u8(self.version);

        let net = &self.network;
        w.text(&net.ssid, SSID_CAP);
        w.text(&net.psk, PSK_CAP);
        w.text(&net.hostname, HOSTNAME_CAP);
        w.bool(net.use_dhcp);
        for quad in [net.ip, net.dns, net.gateway, net.netmask, net.log_server] {
            w.bytes(&quad);
        }

        let time = &self.time;
        w.text(&time.ntp_server, NTP_CAP);
        w.bool(time.use_12hr);
        w.bool(time.use_dmy);
        w.text(&time.timezone, TIMEZONE_CAP);

        let mqtt = &self.mqtt;
        w.bool(mqtt.enable);
        w.text(&mqtt.host, MQTT_HOST_CAP);
        w.u16(mqtt.port);
        w.bool(mqtt.ssl);
        w.text(&mqtt.client_id, MQTT_CLIENT_ID_CAP);
        w.text(&mqtt.topic, MQTT_TOPIC_CAP);
        w.text(&mqtt.user, MQTT_USER_CAP);
        w.text(&mqtt.pass, MQTT_PASS_CAP);

        w.text(&self.ui.user, USER_CAP);
        w.bytes(self.ui.salt());
        w.bytes(self.ui.digest());

        w.bool(self.events.on_after_power_fail);
        for event in &self.events.events {
            w.u8(event.days.bits());
            w.u8(event.hour);
            w.u8(event.minute);
            w.u8(event.action.as_u8());
        }

        w.finish()
    }

    /// Decodes a record of exactly [`RECORD_LEN`] bytes. Unknown action codes
    /// come back as `Action::None`; out-of-range times are cleared.
    pub fn from_bytes(record: &[u8]) -> Option<Self> {
        if record.len() != RECORD_LEN {
            return None;
        }
        let mut r = RecordReader::new(record);
        let version = r.u8();

        let network = NetworkConfig {
            ssid: r.text(SSID_CAP),
            psk: r.text(PSK_CAP),
            hostname: r.text(HOSTNAME_CAP),
            use_dhcp: r.bool(),
            ip: r.array(),
            dns: r.array(),
            gateway: r.array(),
            netmask: r.array(),
            log_server: r.array(),
        };

        let time = TimeConfig {
            ntp_server: r.text(NTP_CAP),
            use_12hr: r.bool(),
            use_dmy: r.bool(),
            timezone: r.text(TIMEZONE_CAP),
        };

        let mqtt = MqttConfig {
            enable: r.bool(),
            host: r.text(MQTT_HOST_CAP),
            port: r.u16(),
            ssl: r.bool(),
            client_id: r.text(MQTT_CLIENT_ID_CAP),
            topic: r.text(MQTT_TOPIC_CAP),
            user: r.text(MQTT_USER_CAP),
            pass: r.text(MQTT_PASS_CAP),
        };

        let user = r.text(USER_CAP);
        let salt = r.array::<SALT_LEN>();
        let digest = r.array::<DIGEST_LEN>();
        let ui = Credential::from_parts(user, salt, digest);

        let mut events = EventTable {
            on_after_power_fail: r.bool(),
            ..EventTable::default()
        };
        for slot in &mut events.events {
            *slot = Event {
                days: DayMask::from_bits(r.u8()),
                hour: r.u8(),
                minute: r.u8(),
                action: Action::from_u8(r.u8()).unwrap_or_default(),
            };
        }
        events.normalize();

        Some(Self {
            version,
            network,
            time,
            mqtt,
            ui,
            events,
        })
    }
}

/// Owns the storage device holding the one settings record.
#[derive(Debug)]
pub struct SettingsStore<D> {
    device: D,
}

impl<D: Eeprom> SettingsStore<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Reads and verifies the stored record. Any integrity, version or read
    /// failure, or an explicit `reset`, yields the default record and
    /// `false`; nothing is written back.
    pub fn load(&mut self, reset: bool) -> (Settings, bool) {
        if reset {
            log::info!("settings reset requested, using defaults");
            return (Settings::default(), false);
        }

        let image = match self.read_image() {
            Ok(image) => image,
            Err(err) => {
                log::warn!("settings read failed ({err}), using defaults");
                return (Settings::default(), false);
            }
        };

        match open(&image).and_then(Settings::from_bytes) {
            Some(settings) if settings.version == SETTINGS_VERSION => {
                log::info!("settings restored from storage");
                (settings, true)
            }
            Some(settings) => {
                log::warn!(
                    "settings version {} does not match {SETTINGS_VERSION}, using defaults",
                    settings.version
                );
                (Settings::default(), false)
            }
            None => {
                log::warn!("settings checksum mismatch, using defaults");
                (Settings::default(), false)
            }
        }
    }

    /// Sanitizes a copy, then writes the record and its trailer, so what is
    /// stored is exactly what the next `load` returns. Saving an unchanged
    /// record leaves the storage bytes unchanged.
    pub fn save(&mut self, settings: &Settings) -> Result<(), StoreError> {
        let mut record = settings.clone();
        record.sanitize();
        let sealed = seal(&record.to_bytes());
        let mut session = StorageSession::open(&mut self.device)?;
        session.device.write(0, &sealed)?;
        session.device.commit()
    }

    fn read_image(&mut self) -> Result<Vec<u8>, StoreError> {
        let mut session = StorageSession::open(&mut self.device)?;
        let mut image = vec![0; SEALED_LEN];
        session.device.read(0, &mut image)?;
        Ok(image)
    }
}

/// RAM-backed [`Eeprom`], erased to `0xff` like fresh flash.
#[derive(Debug, Clone)]
pub struct MemoryEeprom {
    image: Vec<u8>,
    open: bool,
    sessions: usize,
    commits: usize,
}

impl Default for MemoryEeprom {
    fn default() -> Self {
        Self::with_image(vec![0xff; EEPROM_SIZE])
    }
}

impl MemoryEeprom {
    pub fn with_image(image: Vec<u8>) -> Self {
        Self {
            image,
            open: false,
            sessions: 0,
            commits: 0,
        }
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut [u8] {
        &mut self.image
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn sessions(&self) -> usize {
        self.sessions
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    fn range(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>, StoreError> {
        if !self.open {
            return Err(StoreError::Device("not open".to_string()));
        }
        let end = offset.checked_add(len).ok_or(StoreError::OutOfRange)?;
        if end > self.image.len() {
            return Err(StoreError::OutOfRange);
        }
        Ok(offset..end)
    }
}

impl Eeprom for MemoryEeprom {
    fn begin(&mut self, _size: usize) -> Result<(), StoreError> {
        self.open = true;
        self.sessions += 1;
        Ok(())
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.image[range]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        let range = self.range(offset, data.len())?;
        self.image[range].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.commits += 1;
        Ok(())
    }

    fn end(&mut self) {
        self.open = false;
    }
}
