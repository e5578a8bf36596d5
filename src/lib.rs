//! # PV Router Gateway
//!
//! Supervisory gateway for a solar PV-router controller attached over a
//! serial line. The controller does the fast power regulation; the gateway
//! polls its measurements, keeps a history of the energy indices, runs the
//! boost and relay schedules, mirrors the relay to a remote device and
//! publishes telemetry over MQTT.
//!
//! ## Features
//!
//! - **Framed serial protocol**: ASCII `TAG,args,END#` frames with deadlines
//!   and link health tracking
//! - **Energy history**: 193-point ring buffer with JSON and CSV export
//! - **Boost**: manual or daily scheduled high-priority routing
//! - **Relay+**: daily minimum and maximum relay on-time
//! - **Remote relay mirror**: HTTP on/off commands following the local relay
//! - **Telemetry**: MQTT topics and inbound `*/set` commands
//! - **Watchdog**: serial session and network restarts on silence
//! - **Bounded memory**: fixed-capacity buffers for frames, history and events
//!
//! ## Quick Start
//!
//! ```no_run
//! use pvgate::{Gateway, GatewayConfig, SystemClock, TtySerialPort};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::load("pvgate.json")?;
//! let clock = Arc::new(SystemClock::new(config.network.utc_offset_min));
//! let port = TtySerialPort::open(&config.serial.device, config.serial.baud)?;
//! let mut gateway = Gateway::new(&config, clock, Box::new(port));
//!
//! loop {
//!     let report = gateway.tick();
//!     if let Some(e) = report.poll_error {
//!         eprintln!("poll failed: {e}");
//!     }
//!     std::thread::sleep(pvgate::gateway::TICK_INTERVAL);
//! }
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`gateway`] - Control loop context and the handle used by other threads
//! - [`protocol`] - Frame codec for the controller link
//! - [`params`] / [`stats`] - Parameter and statistics vectors
//! - [`history`] - Energy index history
//! - [`boost`] / [`relay_plus`] - Schedulers
//! - [`mirror`] - Remote relay mirroring
//! - [`telemetry`] - MQTT topic mapping and event log
//! - [`watchdog`] - Liveness supervision
//! - [`config`] - JSON configuration
//! - [`api`] - Line-delimited JSON API served by the daemon
//! - [`adapters`] - Serial, MQTT and HTTP implementations of the transport traits

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod adapters;
pub mod api;
pub mod boost;
pub mod clock;
pub mod config;
pub mod gateway;
pub mod history;
pub mod mirror;
pub mod params;
pub mod protocol;
pub mod relay_plus;
pub mod stats;
pub mod telemetry;
pub mod watchdog;

pub use adapters::{HttpRelayEndpoint, MqttTransport, TtySerialPort};
pub use boost::{BoostScheduler, BoostSettings, BoostState};
pub use clock::{Clock, DailyTime, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, GatewayConfig};
pub use gateway::{Gateway, GatewayError, GatewayHandle, GatewaySnapshot, Intent, TickReport};
pub use history::{HistoryInterval, HistoryPoint, HistoryRingBuffer};
pub use mirror::{RelayEndpoint, RemoteRelayMirror};
pub use params::{ParamField, ParameterVector};
pub use protocol::{FrameCodec, LinkCommand, ProtocolError, SerialError, SerialPort};
pub use relay_plus::{RelayPlusScheduler, RelayPlusSettings};
pub use stats::{EnergyIndex, EnergyIndices, RoutingMode, StatField, StatisticsVector};
pub use telemetry::{TelemetryPublisher, TelemetryTransport};
pub use watchdog::{Watchdog, WatchdogSettings};
