use std::{
    io::{BufReader, ErrorKind},
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use wifiplug_common::{
    full_topic,
    store::{Eeprom, StoreError},
    ControllerConfig, CurrentSensor, MqttConfig, PeripheralTimeout, Publisher, RelayPin,
    TOPIC_REMOTE_POWER,
};

use crate::{
    device::{monotonic_ms, Device},
    netlog::{self, UdpLogSink},
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 32;

/// EEPROM image kept in a file. `begin` loads it, `commit` writes it back
/// through a temporary file, `end` drops the buffer.
struct FileEeprom {
    path: PathBuf,
    image: Option<Vec<u8>>,
}

impl FileEeprom {
    fn new() -> Self {
        let data_dir = std::env::var("WIFIPLUG_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.wifiplug"));
        Self {
            path: data_dir.join("eeprom.bin"),
            image: None,
        }
    }

    fn image_mut(&mut self) -> Result<&mut Vec<u8>, StoreError> {
        self.image
            .as_mut()
            .ok_or_else(|| StoreError::Device("eeprom not open".to_string()))
    }
}

fn device_error(err: std::io::Error) -> StoreError {
    StoreError::Device(err.to_string())
}

impl Eeprom for FileEeprom {
    fn begin(&mut self, size: usize) -> Result<(), StoreError> {
        let mut image = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(device_error(err)),
        };
        image.resize(size, 0xff);
        self.image = Some(image);
        Ok(())
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        let image = self.image_mut()?;
        let end = offset.checked_add(buf.len()).ok_or(StoreError::OutOfRange)?;
        let source = image.get(offset..end).ok_or(StoreError::OutOfRange)?;
        buf.copy_from_slice(source);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        let image = self.image_mut()?;
        let end = offset.checked_add(data.len()).ok_or(StoreError::OutOfRange)?;
        let target = image.get_mut(offset..end).ok_or(StoreError::OutOfRange)?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let path = self.path.clone();
        let image = self.image_mut()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(device_error)?;
        }
        let staging = path.with_extension("bin.tmp");
        std::fs::write(&staging, image.as_slice()).map_err(device_error)?;
        std::fs::rename(&staging, &path).map_err(device_error)
    }

    fn end(&mut self) {
        self.image = None;
    }
}

/// Stands in for the relay driver line; logs every change.
#[derive(Debug, Default)]
struct SimulatedPin {
    level: bool,
    output: bool,
}

impl RelayPin for SimulatedPin {
    fn set_output(&mut self, high: bool) {
        if self.output && high != self.level {
            info!("relay {}", if high { "ON" } else { "OFF" });
        }
        self.level = high;
    }

    fn enable_output(&mut self) {
        self.output = true;
        let initial = if self.level { "ON" } else { "OFF" };
        info!("relay output enabled, initially {initial}");
    }

    fn is_high(&self) -> bool {
        self.level
    }
}

/// No current-sense hardware on a host; every sample reads as zero.
struct NoCurrentSensor;

impl CurrentSensor for NoCurrentSensor {
    fn read_raw(&mut self) -> Result<[u8; 12], PeripheralTimeout> {
        Err(PeripheralTimeout)
    }
}

struct MqttTelemetry {
    client: Option<AsyncClient>,
    prefix: String,
}

impl Publisher for MqttTelemetry {
    fn publish(&mut self, suffix: &str, value: &str) {
        let topic = full_topic(&self.prefix, suffix);
        debug!("publish {topic} = {value}");
        if let Some(client) = &self.client {
            let payload = value.as_bytes().to_vec();
            if let Err(err) = client.try_publish(topic, QoS::AtMostOnce, false, payload) {
                warn!("mqtt publish failed: {err}");
            }
        }
    }
}

fn mqtt_options(mqtt: &MqttConfig) -> Option<MqttOptions> {
    let env_host = std::env::var("MQTT_HOST").ok();
    if !mqtt.enable && env_host.is_none() {
        return None;
    }

    let host = env_host.unwrap_or_else(|| mqtt.host.clone());
    let port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(mqtt.port);
    if mqtt.ssl {
        warn!("mqtt ssl is not supported on the host build; connecting in plain text");
    }

    let mut options = MqttOptions::new(mqtt.client_id.clone(), host, port);
    options.set_keep_alive(Duration::from_secs(30));
    if !mqtt.user.is_empty() {
        options.set_credentials(mqtt.user.clone(), mqtt.pass.clone());
    }
    Some(options)
}

async fn poll_mqtt(eventloop: &mut Option<EventLoop>) -> Result<Event, rumqttc::ConnectionError> {
    match eventloop {
        Some(eventloop) => eventloop.poll().await,
        None => std::future::pending().await,
    }
}

pub async fn run() -> anyhow::Result<()> {
    let log_sink = UdpLogSink::default();
    let udp = log_sink.clone();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr.and(move || udp.writer()))
        .init();

    let config = ControllerConfig::default();
    let reset = std::env::args().any(|arg| arg == "--factory-reset");

    let mut device = Device::boot(
        config,
        FileEeprom::new(),
        SimulatedPin::default(),
        MqttTelemetry {
            client: None,
            prefix: String::new(),
        },
        reset,
        std::thread::sleep,
    );

    netlog::attach_configured(&log_sink, device.settings().network.log_server);

    let mqtt_settings = device.settings().mqtt.clone();
    let remote_topic = full_topic(&mqtt_settings.topic, TOPIC_REMOTE_POWER);
    let (client, mut eventloop) = match mqtt_options(&mqtt_settings) {
        Some(options) => {
            let (client, eventloop) = AsyncClient::new(options, 16);
            (Some(client), Some(eventloop))
        }
        None => {
            info!("mqtt disabled");
            (None, None)
        }
    };
    let telemetry = device.telemetry_mut();
    telemetry.client = client.clone();
    telemetry.prefix = mqtt_settings.topic.clone();

    let port = std::env::var("WIFIPLUG_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web server at {addr}"))?;
    info!("{} listening on http://{addr}", device.config().device_name);

    let mut tick = tokio::time::interval(Duration::from_millis(device.config().loop_period_ms));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
            _ = tick.tick() => {
                device.tick(monotonic_ms(), Some(Utc::now()), &mut NoCurrentSensor);
            }
            event = poll_mqtt(&mut eventloop) => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected, subscribing to {remote_topic}");
                    if let Some(client) = &client {
                        if let Err(err) =
                            client.try_subscribe(remote_topic.clone(), QoS::AtMostOnce)
                        {
                            warn!("mqtt subscribe failed: {err}");
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(message))) if message.topic == remote_topic => {
                    handle_remote_power(&mut device, &message.payload);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("connection from {peer}");
                    if let Err(err) = serve_connection(&mut device, stream) {
                        warn!("request from {peer} failed: {err:#}");
                    }
                }
                Err(err) => warn!("accept failed: {err}"),
            },
        }
    }
}

fn handle_remote_power<D: Eeprom, P: RelayPin, T: Publisher>(
    device: &mut Device<D, P, T>,
    payload: &[u8],
) {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!("dropping oversized remote power payload ({} bytes)", payload.len());
        return;
    }
    match std::str::from_utf8(payload) {
        Ok(payload) => device.on_remote_power(payload),
        Err(_) => warn!("non utf8 remote power payload"),
    }
}

/// One request per connection, served inline. The bounded read stalls the
/// loop for at most the request timeout.
fn serve_connection<D: Eeprom, P: RelayPin, T: Publisher>(
    device: &mut Device<D, P, T>,
    stream: tokio::net::TcpStream,
) -> anyhow::Result<()> {
    let stream = stream.into_std().context("detaching tcp stream")?;
    stream.set_nonblocking(false)?;
    let mut writer = stream.try_clone().context("cloning tcp stream")?;
    let mut reader = BufReader::new(stream);
    device.serve(&mut reader, &mut writer, Some(Utc::now()))?;
    Ok(())
}
