//! Gateway configuration, loaded once at startup from a JSON file.
//!
//! Every section and field has a default, so a partial file (or none at all)
//! yields a working configuration.

use crate::boost::{BoostSettings, MAX_RATIO};
use crate::clock::DailyTime;
use crate::history::{HistoryInterval, ALLOWED_INTERVALS_MIN};
use crate::relay_plus::{RelayPlusSettings, MINUTES_PER_DAY};
use crate::watchdog::WatchdogSettings;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Upper bound on the compact JSON form of the whole configuration.
pub const MAX_CONFIG_SIZE: usize = 1100;
pub const MAX_CREDENTIAL_LEN: usize = 39;
pub const MAX_RELAY_COMMAND_LEN: usize = 64;
pub const MIN_RELAY_PERIOD_S: u64 = 15;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{section}.{field}: {reason}")]
    Invalid {
        section: &'static str,
        field: &'static str,
        reason: String,
    },
    #[error("configuration is {size} characters, limit is {max}")]
    TooLarge { size: usize, max: usize },
}

fn invalid(section: &'static str, field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        section,
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub network: NetworkConfig,
    pub serial: SerialConfig,
    pub mqtt: MqttConfig,
    pub relay: RemoteRelayConfig,
    pub boost: BoostConfig,
    pub relay_plus: RelayPlusConfig,
    pub history: HistoryConfig,
    pub api: ApiConfig,
    pub watchdog: WatchdogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub gateway: String,
    pub subnet: String,
    pub dns1: String,
    pub dns2: String,
    pub ntp_server: String,
    /// Local time = UTC + offset. Zero keeps solar time.
    pub utc_offset_min: i32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: "192.168.1.250".into(),
            gateway: "192.168.1.1".into(),
            subnet: "255.255.255.0".into(),
            dns1: "192.168.1.1".into(),
            dns2: "8.8.8.8".into(),
            ntp_server: "europe.pool.ntp.org".into(),
            utc_offset_min: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub device: String,
    pub baud: u32,
    pub timeout_ms: u64,
    pub poll_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".into(),
            baud: 500_000,
            timeout_ms: 100,
            poll_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub period_s: u64,
    pub user: String,
    pub password: String,
    pub reconnect_s: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "192.168.1.100".into(),
            port: 1883,
            client_id: "maxpv".into(),
            period_s: 10,
            user: String::new(),
            password: String::new(),
            reconnect_s: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteRelayConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub cmd_on: String,
    pub cmd_off: String,
    pub period_s: u64,
}

impl Default for RemoteRelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "192.168.1.200".into(),
            port: 80,
            cmd_on: "/relay0/cmd/1".into(),
            cmd_off: "/relay0/cmd/0".into(),
            period_s: 20,
        }
    }
}

impl RemoteRelayConfig {
    pub fn url(&self, on: bool) -> String {
        let path = if on { &self.cmd_on } else { &self.cmd_off };
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostConfig {
    pub ratio: u8,
    pub duration_min: u32,
    pub scheduled: bool,
    pub hour: u8,
    pub minute: u8,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            ratio: MAX_RATIO,
            duration_min: 120,
            scheduled: false,
            hour: 4,
            minute: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayPlusConfig {
    pub enabled: bool,
    pub min_minutes: u32,
    pub max_minutes: u32,
    pub hour: u8,
    pub forced: bool,
}

impl Default for RelayPlusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_minutes: 60,
            max_minutes: 480,
            hour: 21,
            forced: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub interval_min: u16,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { interval_min: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub link_restart_s: u64,
    pub network_timeout_s: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            link_restart_s: 60,
            network_timeout_s: 600,
        }
    }
}

impl GatewayConfig {
    /// Reads and validates `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let config = Self::from_json(&text)?;
                info!(path = %path.display(), "configuration loaded");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "configuration file not found, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Length of the compact JSON form.
    pub fn serialized_size(&self) -> Result<usize, ConfigError> {
        Ok(serde_json::to_string(self)?.len())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let net = &self.network;
        for (field, value) in [
            ("ip", &net.ip),
            ("gateway", &net.gateway),
            ("subnet", &net.subnet),
            ("dns1", &net.dns1),
            ("dns2", &net.dns2),
        ] {
            value
                .parse::<Ipv4Addr>()
                .map_err(|_| invalid("network", field, format!("{value:?} is not an IPv4 address")))?;
        }
        if net.ntp_server.trim().is_empty() {
            return Err(invalid("network", "ntp_server", "must not be empty"));
        }
        if net.utc_offset_min.abs() > 14 * 60 {
            return Err(invalid("network", "utc_offset_min", "must be within ±14 h"));
        }

        let serial = &self.serial;
        if serial.device.trim().is_empty() {
            return Err(invalid("serial", "device", "must not be empty"));
        }
        if serial.baud == 0 {
            return Err(invalid("serial", "baud", "must be positive"));
        }
        if serial.timeout_ms == 0 || serial.timeout_ms > 10_000 {
            return Err(invalid("serial", "timeout_ms", "must be between 1 and 10000"));
        }
        if serial.poll_ms < serial.timeout_ms {
            return Err(invalid("serial", "poll_ms", "must not be shorter than timeout_ms"));
        }

        let mqtt = &self.mqtt;
        if mqtt.port == 0 {
            return Err(invalid("mqtt", "port", "must be positive"));
        }
        if mqtt.period_s == 0 {
            return Err(invalid("mqtt", "period_s", "must be positive"));
        }
        if mqtt.client_id.is_empty() || mqtt.client_id.len() > MAX_CREDENTIAL_LEN {
            return Err(invalid("mqtt", "client_id", "must be 1 to 39 characters"));
        }
        if mqtt.user.len() > MAX_CREDENTIAL_LEN {
            return Err(invalid("mqtt", "user", "longer than 39 characters"));
        }
        if mqtt.password.len() > MAX_CREDENTIAL_LEN {
            return Err(invalid("mqtt", "password", "longer than 39 characters"));
        }
        if mqtt.enabled && mqtt.host.trim().is_empty() {
            return Err(invalid("mqtt", "host", "must not be empty"));
        }

        let relay = &self.relay;
        if relay.enabled && relay.host.trim().is_empty() {
            return Err(invalid("relay", "host", "must not be empty"));
        }
        for (field, cmd) in [("cmd_on", &relay.cmd_on), ("cmd_off", &relay.cmd_off)] {
            if cmd.len() > MAX_RELAY_COMMAND_LEN {
                return Err(invalid("relay", field, "longer than 64 characters"));
            }
            if !cmd.starts_with('/') {
                return Err(invalid("relay", field, "must start with '/'"));
            }
        }
        if relay.period_s < MIN_RELAY_PERIOD_S {
            return Err(invalid("relay", "period_s", "must be at least 15"));
        }

        let boost = &self.boost;
        if boost.ratio > MAX_RATIO {
            return Err(invalid("boost", "ratio", "must be 0 to 100"));
        }
        if boost.duration_min == 0 || boost.duration_min > MINUTES_PER_DAY {
            return Err(invalid("boost", "duration_min", "must be 1 to 1440"));
        }
        if DailyTime::new(boost.hour, boost.minute).is_none() {
            return Err(invalid("boost", "hour", "not a valid time of day"));
        }

        self.relay_plus_settings()
            .validate()
            .map_err(|reason| invalid("relay_plus", "max_minutes", reason))?;
        if self.relay_plus.hour > 23 {
            return Err(invalid("relay_plus", "hour", "must be 0 to 23"));
        }

        if HistoryInterval::from_minutes(self.history.interval_min).is_none() {
            return Err(invalid(
                "history",
                "interval_min",
                format!("must be one of {ALLOWED_INTERVALS_MIN:?}"),
            ));
        }

        self.api
            .bind
            .parse::<SocketAddr>()
            .map_err(|_| invalid("api", "bind", format!("{:?} is not host:port", self.api.bind)))?;

        let size = self.serialized_size()?;
        if size > MAX_CONFIG_SIZE {
            return Err(ConfigError::TooLarge {
                size,
                max: MAX_CONFIG_SIZE,
            });
        }
        Ok(())
    }

    pub fn boost_settings(&self) -> BoostSettings {
        BoostSettings {
            ratio: self.boost.ratio.min(MAX_RATIO),
            duration_min: self.boost.duration_min,
            trigger: if self.boost.scheduled {
                DailyTime::new(self.boost.hour, self.boost.minute)
            } else {
                None
            },
        }
    }

    pub fn relay_plus_settings(&self) -> RelayPlusSettings {
        RelayPlusSettings {
            min_minutes: self.relay_plus.min_minutes,
            max_minutes: self.relay_plus.max_minutes,
            reference: DailyTime::new(self.relay_plus.hour, 0).unwrap_or(DailyTime::MIDNIGHT),
            forced: self.relay_plus.forced,
        }
    }

    pub fn history_interval(&self) -> HistoryInterval {
        HistoryInterval::from_minutes(self.history.interval_min).unwrap_or_default()
    }

    pub fn watchdog_settings(&self) -> WatchdogSettings {
        WatchdogSettings {
            link_restart: Duration::from_secs(self.watchdog.link_restart_s),
            network_timeout: Duration::from_secs(self.watchdog.network_timeout_s),
        }
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.serial.poll_ms)
    }

    pub fn publish_period(&self) -> Duration {
        Duration::from_secs(self.mqtt.period_s)
    }

    pub fn mirror_period(&self) -> Duration {
        Duration::from_secs(self.relay.period_s)
    }
}
