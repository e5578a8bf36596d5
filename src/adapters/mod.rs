//! Concrete transports for the controller link, MQTT and the remote relay.
//!
//! The control loop only sees the [`SerialPort`](crate::protocol::SerialPort),
//! [`TelemetryTransport`](crate::telemetry::TelemetryTransport) and
//! [`RelayEndpoint`](crate::mirror::RelayEndpoint) traits; these adapters are
//! wired in by the daemon.

pub mod http;
pub mod mqtt;
pub mod serial;

pub use http::HttpRelayEndpoint;
pub use mqtt::{MqttInbound, MqttTransport};
pub use serial::TtySerialPort;
