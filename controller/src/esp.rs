use core::convert::TryInto;
use std::{
    io::{BufReader, ErrorKind},
    net::{Ipv4Addr, TcpListener, TcpStream},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{
        delay::TickType,
        gpio::{AnyIOPin, AnyOutputPin, Input, Output, PinDriver, Pull},
        i2c::{I2cConfig, I2cDriver},
        modem::Modem,
        prelude::*,
    },
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SntpConf, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use wifiplug_common::{
    full_topic,
    power::READING_LEN,
    store::{Eeprom, StoreError},
    ButtonEdge, ButtonEvent, ControllerConfig, CurrentSensor, LedPattern, MqttConfig,
    NetworkConfig, PeripheralTimeout, Publisher, RelayPin, TOPIC_REMOTE_POWER,
};

use crate::{
    device::{monotonic_ms, Device},
    netlog::{self, UdpLogSink},
};

const NVS_NAMESPACE: &str = "wifiplug";
const NVS_EEPROM_KEY: &str = "eeprom";
const RELAY_GPIO: i32 = 15;
const BUTTON_GPIO: i32 = 13;
const STATUS_LED_GPIO: i32 = 2;
const SENSOR_I2C_ADDR: u8 = 0;
const SENSOR_TIMEOUT_MS: u64 = 1_000;
const HTTP_PORT: u16 = 80;
const MAX_MQTT_PAYLOAD_BYTES: usize = 32;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

/// EEPROM image kept as one NVS blob. The blob is read on `begin` and
/// written back only on `commit`.
struct NvsEeprom {
    nvs: EspNvs<NvsDefault>,
    image: Option<Vec<u8>>,
}

impl NvsEeprom {
    fn new(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .context("failed to open settings namespace")?;
        Ok(Self { nvs, image: None })
    }

    fn image_mut(&mut self) -> Result<&mut Vec<u8>, StoreError> {
        self.image
            .as_mut()
            .ok_or_else(|| StoreError::Device("eeprom not open".to_string()))
    }
}

impl Eeprom for NvsEeprom {
    fn begin(&mut self, size: usize) -> Result<(), StoreError> {
        let mut image = vec![0xff_u8; size];
        let stored = self
            .nvs
            .get_raw(NVS_EEPROM_KEY, &mut image)
            .map_err(|err| StoreError::Device(err.to_string()))?
            .is_some();
        if !stored {
            debug!("no stored settings image");
        }
        self.image = Some(image);
        Ok(())
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        let image = self.image_mut()?;
        let end = offset.checked_add(buf.len()).ok_or(StoreError::OutOfRange)?;
        buf.copy_from_slice(image.get(offset..end).ok_or(StoreError::OutOfRange)?);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        let image = self.image_mut()?;
        let end = offset.checked_add(data.len()).ok_or(StoreError::OutOfRange)?;
        image
            .get_mut(offset..end)
            .ok_or(StoreError::OutOfRange)?
            .copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let image = self
            .image
            .as_deref()
            .ok_or_else(|| StoreError::Device("eeprom not open".to_string()))?;
        self.nvs
            .set_raw(NVS_EEPROM_KEY, image)
            .map(|_| ())
            .map_err(|err| StoreError::Device(err.to_string()))
    }

    fn end(&mut self) {
        self.image = None;
    }
}

/// Relay driver line. The level is latched before the output stage is
/// enabled, and reads come back from the pad itself.
struct GpioRelay {
    gpio: i32,
}

impl RelayPin for GpioRelay {
    fn set_output(&mut self, high: bool) {
        let rc = unsafe { esp_idf_svc::sys::gpio_set_level(self.gpio, u32::from(high)) };
        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("gpio_set_level({}) failed: esp_err_t={rc}", self.gpio);
        }
    }

    fn enable_output(&mut self) {
        let rc = unsafe {
            esp_idf_svc::sys::gpio_set_direction(
                self.gpio,
                esp_idf_svc::sys::gpio_mode_t_GPIO_MODE_INPUT_OUTPUT,
            )
        };
        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("relay GPIO{} direction failed: esp_err_t={rc}", self.gpio);
        }
    }

    fn is_high(&self) -> bool {
        unsafe { esp_idf_svc::sys::gpio_get_level(self.gpio) != 0 }
    }
}

/// Active-low push button with a two-sample debounce across loop passes.
struct Button {
    pin: PinDriver<'static, AnyIOPin, Input>,
    last_raw: bool,
    edge: ButtonEdge,
}

impl Button {
    fn new(gpio: i32) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input(unsafe { AnyIOPin::new(gpio) })?;
        pin.set_pull(Pull::Up)?;
        Ok(Self {
            pin,
            last_raw: false,
            edge: ButtonEdge::default(),
        })
    }

    fn is_pressed(&self) -> bool {
        self.pin.is_low()
    }

    fn poll(&mut self) -> Option<ButtonEvent> {
        let raw = self.is_pressed();
        let stable = raw == self.last_raw;
        self.last_raw = raw;
        if stable {
            self.edge.update(raw)
        } else {
            None
        }
    }
}

struct I2cCurrentSensor {
    driver: I2cDriver<'static>,
}

impl CurrentSensor for I2cCurrentSensor {
    fn read_raw(&mut self) -> Result<[u8; READING_LEN], PeripheralTimeout> {
        let mut reading = [0_u8; READING_LEN];
        let timeout = TickType::new_millis(SENSOR_TIMEOUT_MS).ticks();
        self.driver
            .read(SENSOR_I2C_ADDR, &mut reading, timeout)
            .map_err(|err| {
                debug!("current sensor read failed: {err}");
                PeripheralTimeout
            })?;
        Ok(reading)
    }
}

/// Used when the bus could not be brought up; reads as zero current.
struct MissingSensor;

impl CurrentSensor for MissingSensor {
    fn read_raw(&mut self) -> Result<[u8; READING_LEN], PeripheralTimeout> {
        Err(PeripheralTimeout)
    }
}

type SharedMqtt = Arc<Mutex<EspMqttClient<'static>>>;

struct EspTelemetry {
    client: Option<SharedMqtt>,
    prefix: String,
}

impl Publisher for EspTelemetry {
    fn publish(&mut self, suffix: &str, value: &str) {
        let Some(client) = &self.client else {
            return;
        };
        let topic = full_topic(&self.prefix, suffix);
        let mut client = client.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = client.enqueue(&topic, QoS::AtMostOnce, false, value.as_bytes()) {
            warn!("mqtt publish to {topic} failed: {err:?}");
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    let log_sink = install_logger()?;

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let peripherals = Peripherals::take()?;

    let mut button = Button::new(BUTTON_GPIO).context("button init failed")?;
    // Holding the button through power-up discards the stored settings.
    let reset = button.is_pressed();
    if reset {
        warn!("button held at boot; restoring factory settings");
    }

    let config = ControllerConfig::default();
    let eeprom = NvsEeprom::new(nvs_partition.clone())?;
    let mut device = Device::boot(
        config,
        eeprom,
        GpioRelay { gpio: RELAY_GPIO },
        EspTelemetry {
            client: None,
            prefix: String::new(),
        },
        reset,
        thread::sleep,
    );
    let settings = device.settings().clone();

    let i2c_config = I2cConfig::new().baudrate(100.kHz().into());
    let mut sensor: Box<dyn CurrentSensor> = match I2cDriver::new(
        peripherals.i2c0,
        peripherals.pins.gpio21,
        peripherals.pins.gpio22,
        &i2c_config,
    ) {
        Ok(driver) => Box::new(I2cCurrentSensor { driver }),
        Err(err) => {
            warn!("current sensor unavailable: {err}");
            Box::new(MissingSensor)
        }
    };

    let mut status_led = init_status_led(STATUS_LED_GPIO);
    // The join blocks, so the LED is held on rather than blinked.
    update_status_led(&mut status_led, LedPattern::On, monotonic_ms());
    let wifi = connect_wifi(
        peripherals.modem,
        sys_loop,
        nvs_partition,
        &settings.network,
    )
    .context("wifi startup failed")?;
    let led_pattern = wifi.led_pattern();
    let _wifi = wifi.into_inner();
    netlog::attach_configured(&log_sink, settings.network.log_server);

    let mut sntp_conf = SntpConf::default();
    sntp_conf.servers[0] = settings.time.ntp_server.as_str();
    let sntp = EspSntp::new(&sntp_conf).context("failed to start SNTP")?;
    info!("SNTP started against {}", settings.time.ntp_server);

    let (remote_tx, remote_rx) = mpsc::channel();
    let _mqtt = if settings.mqtt.enable {
        let remote_topic = full_topic(&settings.mqtt.topic, TOPIC_REMOTE_POWER);
        let (client, conn) = create_mqtt_client(&settings.mqtt)?;
        let client = Arc::new(Mutex::new(client));
        spawn_mqtt_receiver(conn, client.clone(), remote_topic, remote_tx)?;
        let telemetry = device.telemetry_mut();
        telemetry.client = Some(client.clone());
        telemetry.prefix = settings.mqtt.topic.clone();
        Some(client)
    } else {
        info!("mqtt disabled");
        None
    };

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, HTTP_PORT))
        .context("failed to bind web server")?;
    listener.set_nonblocking(true)?;
    info!("{} listening on port {HTTP_PORT}", device.config().device_name);

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let loop_period = Duration::from_millis(device.config().loop_period_ms);
    loop {
        feed_watchdog();
        update_status_led(&mut status_led, led_pattern, monotonic_ms());

        if let Some(event) = button.poll() {
            device.on_button(event);
        }

        let utc = (sntp.get_sync_status() == SyncStatus::Completed).then(Utc::now);
        device.tick(monotonic_ms(), utc, sensor.as_mut());

        drain_remote_power(&mut device, &remote_rx);

        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("connection from {peer}");
                if let Err(err) = serve_connection(&mut device, stream, utc) {
                    warn!("request from {peer} failed: {err:#}");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => warn!("accept failed: {err}"),
        }

        thread::sleep(loop_period);
    }
}

fn drain_remote_power<D: Eeprom, P: RelayPin, T: Publisher>(
    device: &mut Device<D, P, T>,
    remote_rx: &Receiver<String>,
) {
    while let Ok(payload) = remote_rx.try_recv() {
        device.on_remote_power(&payload);
    }
}

fn serve_connection<D: Eeprom, P: RelayPin, T: Publisher>(
    device: &mut Device<D, P, T>,
    stream: TcpStream,
    utc: Option<chrono::DateTime<Utc>>,
) -> anyhow::Result<()> {
    stream.set_nonblocking(false)?;
    let mut writer = stream.try_clone().context("cloning tcp stream")?;
    let mut reader = BufReader::new(stream);
    device.serve(&mut reader, &mut writer, utc)?;
    Ok(())
}

/// Kept alive for the program lifetime; dropping it tears the link down.
enum WifiStartup {
    Joined(BlockingWifi<EspWifi<'static>>),
    AccessPoint(BlockingWifi<EspWifi<'static>>),
}

impl WifiStartup {
    fn led_pattern(&self) -> LedPattern {
        match self {
            Self::Joined(_) => LedPattern::Connected,
            Self::AccessPoint(_) => LedPattern::AwaitSetup,
        }
    }

    fn into_inner(self) -> BlockingWifi<EspWifi<'static>> {
        match self {
            Self::Joined(wifi) | Self::AccessPoint(wifi) => wifi,
        }
    }
}

fn ipv4_from_octets(ip: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::from(ip)
}

fn build_sta_netif(network: &NetworkConfig) -> anyhow::Result<Option<EspNetif>> {
    if network.use_dhcp {
        return Ok(None);
    }

    let mask_ip = ipv4_from_octets(network.netmask);
    let mask = Mask::try_from(mask_ip).map_err(|_| anyhow!("invalid netmask: {mask_ip}"))?;

    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: ipv4_from_octets(network.ip),
                subnet: Subnet {
                    gateway: ipv4_from_octets(network.gateway),
                    mask,
                },
                dns: Some(ipv4_from_octets(network.dns)),
                secondary_dns: None,
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };

    Ok(Some(EspNetif::new_with_conf(&conf)?))
}

/// Joins the configured network. With no SSID, or when every attempt fails,
/// an open access point named after the hostname comes up instead so the
/// web surface stays reachable for setup.
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    match build_sta_netif(network) {
        Ok(Some(sta_netif)) => {
            esp_wifi
                .swap_netif_sta(sta_netif)
                .context("failed to apply static IP configuration")?;
        }
        Ok(None) => {}
        Err(err) => warn!("static IP configuration rejected ({err:#}); using DHCP"),
    }
    if let Err(err) = esp_wifi.sta_netif_mut().set_hostname(&network.hostname) {
        warn!("failed to set hostname `{}`: {err}", network.hostname);
    }

    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    if network.ssid.trim().is_empty() {
        warn!("no wifi network configured");
        start_access_point(&mut wifi, &network.hostname)?;
        return Ok(WifiStartup::AccessPoint(wifi));
    }

    let auth_method = if network.psk.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .psk
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;
    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                return Ok(WifiStartup::Joined(wifi));
            }
            Err(err) => warn!("wifi attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err}"),
        }
        let _ = wifi.disconnect();
        thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
    }

    warn!("could not join `{}`", network.ssid);
    let _ = wifi.stop();
    start_access_point(&mut wifi, &network.hostname)?;
    Ok(WifiStartup::AccessPoint(wifi))
}

fn start_access_point(
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    hostname: &str,
) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: hostname
            .try_into()
            .map_err(|_| anyhow!("access point name too long"))?,
        auth_method: AuthMethod::None,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("access point `{hostname}` started");
    Ok(())
}

fn create_mqtt_client(
    mqtt: &MqttConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let scheme = if mqtt.ssl { "mqtts" } else { "mqtt" };
    let url = format!("{scheme}://{}:{}", mqtt.host, mqtt.port);

    let conf = MqttClientConfiguration {
        client_id: Some(mqtt.client_id.as_str()),
        username: (!mqtt.user.is_empty()).then_some(mqtt.user.as_str()),
        password: (!mqtt.pass.is_empty()).then_some(mqtt.pass.as_str()),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

/// Forwards complete `remotepower` payloads to the control loop. The topic
/// is (re)subscribed on every connect.
fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    client: SharedMqtt,
    remote_topic: String,
    remote_tx: Sender<String>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            let event = match conn.next() {
                Ok(event) => event,
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    continue;
                }
            };

            match event.payload() {
                EventPayload::Connected(_) => {
                    info!("mqtt connected, subscribing to {remote_topic}");
                    let mut client = client.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Err(err) = client.subscribe(&remote_topic, QoS::AtMostOnce) {
                        warn!("mqtt subscribe failed: {err:?}");
                    }
                }
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details: Details::Complete,
                    ..
                } if topic == remote_topic => {
                    if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!("dropping oversized remote power payload ({} bytes)", data.len());
                        continue;
                    }
                    match core::str::from_utf8(data) {
                        Ok(payload) => {
                            if remote_tx.send(payload.to_string()).is_err() {
                                return;
                            }
                        }
                        Err(_) => warn!("non utf8 remote power payload"),
                    }
                }
                _ => {}
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

static ESP_LOGGER: EspLogger = EspLogger::new();

/// Console logging through ESP-IDF, plus a copy of every enabled line to
/// the UDP log server once one is attached.
struct ForwardingLogger {
    sink: UdpLogSink,
}

impl log::Log for ForwardingLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        log::Log::enabled(&ESP_LOGGER, metadata)
    }

    fn log(&self, record: &log::Record) {
        log::Log::log(&ESP_LOGGER, record);
        if self.sink.is_attached() && self.enabled(record.metadata()) {
            let line = format!("{} {}: {}\n", record.level(), record.target(), record.args());
            self.sink.send(line.as_bytes());
        }
    }

    fn flush(&self) {
        log::Log::flush(&ESP_LOGGER);
    }
}

fn install_logger() -> anyhow::Result<UdpLogSink> {
    let sink = UdpLogSink::default();
    let logger: &'static ForwardingLogger = Box::leak(Box::new(ForwardingLogger {
        sink: sink.clone(),
    }));
    log::set_logger(logger).map_err(|err| anyhow!("logger already installed: {err}"))?;
    log::set_max_level(log::LevelFilter::Info);
    Ok(sink)
}

/// Active-low indicator; `lit` tracks the last level driven.
struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
    match driver {
        Ok(mut pin) => {
            let _ = pin.set_high();
            Some(StatusLed { pin, lit: false })
        }
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            None
        }
    }
}

fn update_status_led(status_led: &mut Option<StatusLed>, pattern: LedPattern, now_ms: u64) {
    let Some(led) = status_led.as_mut() else {
        return;
    };

    let desired = pattern.is_lit(now_ms);
    if desired == led.lit {
        return;
    }

    let result = if desired {
        led.pin.set_low()
    } else {
        led.pin.set_high()
    };
    match result {
        Ok(()) => led.lit = desired,
        Err(err) => warn!("failed to drive status LED: {err}"),
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}
