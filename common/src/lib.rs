pub mod clock;
pub mod config;
pub mod controller;
pub mod daylight;
pub mod error;
pub mod event_log;
pub mod kasa;
pub mod light;
pub mod network;
pub mod ranging;
pub mod resolve;
pub mod telemetry;
pub mod types;

pub use clock::{Millis, TickPacer};
pub use config::{HardwareConfig, NetworkConfig, RuntimeConfig, SiteConfig, TimingConfig};
pub use controller::{
    BackgroundWork, ControllerState, Indicators, NetworkLinks, StairHardware, StairStatus, TickReport,
};
pub use daylight::{Daylight, DaylightOracle, DaylightSource, SolarDay};
pub use error::{ConfigError, FrameError, LinkError};
pub use event_log::{EventKind, EventLog, PendingEvent};
pub use kasa::KasaClient;
pub use light::{LightAction, LightController, LightStatus};
pub use network::{Backoff, NetworkState, NetworkStatus, SwitchLink, TelemetryLink, WifiCheck, WifiLink};
pub use ranging::{MicrosClock, Ping, RangeSampler, RangingSensor, SensorReading, Ultrasonic};
pub use resolve::CachedAddr;
pub use telemetry::{FormSession, FormTarget, HttpTransport, RequestMethod};
pub use types::{CommandOutcome, SwitchCommand, TriggerSource};
