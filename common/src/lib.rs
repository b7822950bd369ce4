pub mod button;
pub mod config;
pub mod led;
pub mod password;
pub mod power;
pub mod relay;
pub mod schedule;
pub mod store;
pub mod telemetry;
pub mod web;

pub use button::{handle_button, ButtonEdge, ButtonEvent};
pub use config::{ControllerConfig, MqttConfig, NetworkConfig, Settings, TimeConfig, SETTINGS_VERSION};
pub use led::LedPattern;
pub use password::Credential;
pub use power::{CurrentSensor, PeripheralTimeout, PowerMonitor};
pub use relay::{PowerCommand, RelayCoordinator, RelayPin};
pub use schedule::{Action, DayMask, DayOfWeek, Event, EventTable, ScheduleEngine, WallTime};
pub use store::{Eeprom, MemoryEeprom, SettingsStore, StoreError};
pub use telemetry::*;
pub use web::{read_request, Method, Params, ProtocolError, Request, RequestSource, Status};
