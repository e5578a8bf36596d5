//! Periodic publication of gateway state onto named topics.
//!
//! Publication is best-effort: a failed message is counted and logged, and
//! the next period publishes a fresh set regardless.

use crate::clock::Cadence;
use crate::gateway::{GatewaySnapshot, Intent};
use crate::stats::{RoutingMode, StatField};
use arrayvec::ArrayString;
use heapless::Deque;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::{Cpu, CpuRefreshKind, System};
use tracing::{debug, warn};

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(10);

pub mod topics {
    pub const STATE: &str = "maxpv/state";
    pub const VRMS: &str = "maxpv/vrms";
    pub const IRMS: &str = "maxpv/irms";
    pub const PACT: &str = "maxpv/pact";
    pub const PAPP: &str = "maxpv/papp";
    pub const PROUTED: &str = "maxpv/prouted";
    pub const PIMPULSION: &str = "maxpv/pimpulsion";
    pub const COSPHI: &str = "maxpv/cosphi";
    pub const INDEX_ROUTED: &str = "maxpv/indexrouted";
    pub const INDEX_IMPORT: &str = "maxpv/indeximport";
    pub const INDEX_EXPORT: &str = "maxpv/indexexport";
    pub const INDEX_IMPULSION: &str = "maxpv/indeximpulsion";
    pub const INDEX_RELAY: &str = "maxpv/indexrelay";
    pub const TRIAC_MODE: &str = "maxpv/triacmode";
    pub const TRIAC_MODE_SET: &str = "maxpv/triacmode/set";
    pub const RELAY_MODE: &str = "maxpv/relaymode";
    pub const RELAY_MODE_SET: &str = "maxpv/relaymode/set";
    pub const BOOST: &str = "maxpv/boost";
    pub const BOOST_SET: &str = "maxpv/boost/set";
    pub const STATUS_BYTE: &str = "maxpv/statusbyte";
    pub const RELAY_PLUS: &str = "maxpv/relayplus";
    pub const MIRROR: &str = "maxpv/mirror";
    pub const SYS_FREE_HEAP: &str = "maxpv/SYS/freeHeap";
    pub const SYS_HEAP_FRAGMENTATION: &str = "maxpv/SYS/heapFragmentation";
    pub const SYS_MAX_FREE_BLOCK: &str = "maxpv/SYS/maxFreeBlockSize";
    pub const SYS_CPU_FREQUENCY: &str = "maxpv/SYS/cpuFrequency";
    pub const SYS_LAST_RESET_REASON: &str = "maxpv/SYS/lastResetReason";
    pub const SYS_LOGGER: &str = "maxpv/SYS/logger";
    pub const SYS_LINK: &str = "maxpv/SYS/link";

    /// Topics the gateway listens on.
    pub const SUBSCRIPTIONS: [&str; 3] = [TRIAC_MODE_SET, RELAY_MODE_SET, BOOST_SET];
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("transport not connected")]
    NotConnected,
    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Outbound message sink. Implementations must not block the control loop.
pub trait TelemetryTransport: Send {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), PublishError>;

    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetReason {
    PowerOn,
    Watchdog,
    Software,
    External,
    Unknown,
}

impl ResetReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ResetReason::PowerOn => "Power on",
            ResetReason::Watchdog => "Watchdog",
            ResetReason::Software => "Software",
            ResetReason::External => "External",
            ResetReason::Unknown => "Unknown",
        }
    }
}

/// Host figures published on the `SYS` topics.
///
/// The topic names come from the controller board's firmware. On a Linux
/// host `free_heap` and `max_free_block` both carry the memory available to
/// new allocations, and `heap_fragmentation` is always 0: the kernel hands
/// out pages, so there is no heap to fragment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SystemDiagnostics {
    pub free_heap: u64,
    pub heap_fragmentation: u8,
    pub max_free_block: u64,
    pub cpu_frequency_mhz: u32,
    pub last_reset_reason: ResetReason,
}

/// Raw figures read from the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostReadings {
    pub available_memory: u64,
    pub cpu_frequencies_mhz: Vec<u64>,
}

impl HostReadings {
    pub fn collect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_specifics(CpuRefreshKind::new().with_frequency());
        Self {
            available_memory: sys.available_memory(),
            cpu_frequencies_mhz: sys.cpus().iter().map(Cpu::frequency).collect(),
        }
    }
}

impl Default for SystemDiagnostics {
    fn default() -> Self {
        Self {
            free_heap: 0,
            heap_fragmentation: 0,
            max_free_block: 0,
            cpu_frequency_mhz: 0,
            last_reset_reason: ResetReason::PowerOn,
        }
    }
}

impl SystemDiagnostics {
    pub fn refresh(&mut self) {
        self.apply(&HostReadings::collect());
    }

    /// CPU frequency is the fastest core. A reading of zero (not reported
    /// by the platform) keeps the previous figure.
    pub fn apply(&mut self, readings: &HostReadings) {
        self.free_heap = readings.available_memory;
        self.max_free_block = readings.available_memory;
        self.heap_fragmentation = 0;
        let mhz = readings.cpu_frequencies_mhz.iter().copied().max().unwrap_or(0);
        if mhz > 0 {
            self.cpu_frequency_mhz = u32::try_from(mhz).unwrap_or(u32::MAX);
        }
    }
}

pub const EVENT_LOG_CAPACITY: usize = 16;
pub const EVENT_TEXT_SIZE: usize = 96;

pub type EventText = ArrayString<EVENT_TEXT_SIZE>;

/// Bounded queue of notable events waiting to go out on the logger topic.
/// When full, the oldest entry is dropped.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Deque<EventText, EVENT_LOG_CAPACITY>,
    dropped: u32,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Longer texts are cut at the buffer size.
    pub fn push(&mut self, text: &str) {
        let mut entry = EventText::new();
        for c in text.chars() {
            if entry.try_push(c).is_err() {
                break;
            }
        }
        if self.entries.is_full() {
            self.entries.pop_front();
            self.dropped += 1;
        }
        let _ = self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn recent(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.as_str())
    }

    pub fn front(&self) -> Option<EventText> {
        self.entries.front().copied()
    }

    pub fn pop(&mut self) -> Option<EventText> {
        self.entries.pop_front()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryMessage {
    pub topic: &'static str,
    pub payload: String,
    pub retain: bool,
}

impl TelemetryMessage {
    fn new(topic: &'static str, payload: impl Into<String>) -> Self {
        Self {
            topic,
            payload: payload.into(),
            retain: false,
        }
    }

    fn retained(topic: &'static str, payload: impl Into<String>) -> Self {
        Self {
            topic,
            payload: payload.into(),
            retain: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub sent: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    pub cycles: u64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub skipped_offline: u64,
}

#[derive(Debug)]
pub struct TelemetryPublisher {
    cadence: Cadence,
    stats: PublisherStats,
}

impl TelemetryPublisher {
    pub fn new(period: Duration) -> Self {
        Self {
            cadence: Cadence::new(period),
            stats: PublisherStats::default(),
        }
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats
    }

    pub fn period(&self) -> Duration {
        self.cadence.period()
    }

    /// Publishes the snapshot and pending events when the period has elapsed.
    /// Returns `None` when not due.
    pub fn tick(
        &mut self,
        now_ms: u64,
        transport: &mut dyn TelemetryTransport,
        snapshot: &GatewaySnapshot,
        events: &mut EventLog,
    ) -> Option<PublishReport> {
        if !self.cadence.due(now_ms) {
            return None;
        }
        self.stats.cycles += 1;

        let mut report = PublishReport::default();
        if !transport.is_connected() {
            debug!("telemetry transport offline, skipping period");
            self.stats.skipped_offline += 1;
            return Some(report);
        }

        for message in Self::messages(snapshot) {
            Self::send(transport, &message, &mut report);
        }
        // An event leaves the log only once the transport has taken it.
        while let Some(event) = events.front() {
            let message = TelemetryMessage::new(topics::SYS_LOGGER, event.as_str());
            if !Self::send(transport, &message, &mut report) {
                break;
            }
            events.pop();
        }

        self.stats.messages_sent += u64::from(report.sent);
        self.stats.messages_failed += u64::from(report.failed);
        if report.failed > 0 {
            warn!(failed = report.failed, sent = report.sent, "telemetry period incomplete");
        }
        Some(report)
    }

    fn send(
        transport: &mut dyn TelemetryTransport,
        message: &TelemetryMessage,
        report: &mut PublishReport,
    ) -> bool {
        match transport.publish(message.topic, &message.payload, message.retain) {
            Ok(()) => {
                report.sent += 1;
                true
            }
            Err(e) => {
                debug!(topic = message.topic, error = %e, "publish failed");
                report.failed += 1;
                false
            }
        }
    }

    /// The full message set for one period, without events.
    pub fn messages(snapshot: &GatewaySnapshot) -> Vec<TelemetryMessage> {
        let mut out = Vec::with_capacity(32);
        let state = if snapshot.link.degraded { "degraded" } else { "online" };
        out.push(TelemetryMessage::retained(topics::STATE, state));

        if let Some(stats) = &snapshot.stats {
            let numeric = [
                (topics::VRMS, StatField::VRms),
                (topics::IRMS, StatField::IRms),
                (topics::PACT, StatField::PAct),
                (topics::PAPP, StatField::PApp),
                (topics::PROUTED, StatField::PRouted),
                (topics::PIMPULSION, StatField::PImpulsion),
                (topics::COSPHI, StatField::CosPhi),
                (topics::INDEX_ROUTED, StatField::IndexRouted),
                (topics::INDEX_IMPORT, StatField::IndexImport),
                (topics::INDEX_EXPORT, StatField::IndexExport),
                (topics::INDEX_IMPULSION, StatField::IndexImpulsion),
                (topics::INDEX_RELAY, StatField::IndexRelay),
            ];
            for (topic, field) in numeric {
                out.push(TelemetryMessage::new(topic, stats.get(field).to_string()));
            }
            let mode_text = |mode: Option<RoutingMode>| mode.map_or("UNKNOWN", RoutingMode::as_str);
            out.push(TelemetryMessage::new(topics::TRIAC_MODE, mode_text(stats.triac_mode())));
            out.push(TelemetryMessage::new(topics::RELAY_MODE, mode_text(stats.relay_mode())));
            out.push(TelemetryMessage::new(topics::STATUS_BYTE, stats.status_byte().to_string()));
        }

        out.push(TelemetryMessage::new(
            topics::BOOST,
            if snapshot.boost.active { "on" } else { "off" },
        ));
        if let Some(summary) = &snapshot.relay_plus {
            if let Ok(json) = serde_json::to_string(summary) {
                out.push(TelemetryMessage::new(topics::RELAY_PLUS, json));
            }
        }
        if let Some(mirror) = &snapshot.mirror {
            if let Ok(json) = serde_json::to_string(mirror) {
                out.push(TelemetryMessage::new(topics::MIRROR, json));
            }
        }
        if let Ok(json) = serde_json::to_string(&snapshot.link) {
            out.push(TelemetryMessage::new(topics::SYS_LINK, json));
        }

        let diag = &snapshot.diagnostics;
        out.push(TelemetryMessage::new(topics::SYS_FREE_HEAP, diag.free_heap.to_string()));
        out.push(TelemetryMessage::new(
            topics::SYS_HEAP_FRAGMENTATION,
            diag.heap_fragmentation.to_string(),
        ));
        out.push(TelemetryMessage::new(topics::SYS_MAX_FREE_BLOCK, diag.max_free_block.to_string()));
        out.push(TelemetryMessage::new(
            topics::SYS_CPU_FREQUENCY,
            diag.cpu_frequency_mhz.to_string(),
        ));
        out.push(TelemetryMessage::retained(
            topics::SYS_LAST_RESET_REASON,
            diag.last_reset_reason.as_str(),
        ));
        out
    }
}

/// Maps a message on one of the `/set` topics to an intent.
pub fn parse_inbound(topic: &str, payload: &str) -> Option<Intent> {
    match topic {
        topics::TRIAC_MODE_SET => RoutingMode::parse(payload).map(Intent::SetTriacMode),
        topics::RELAY_MODE_SET => RoutingMode::parse(payload).map(Intent::SetRelayMode),
        topics::BOOST_SET => match payload.trim().to_ascii_lowercase().as_str() {
            "on" | "1" | "true" => Some(Intent::Boost { on: true }),
            "off" | "0" | "false" => Some(Intent::Boost { on: false }),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_log_drops_oldest() {
        let mut log = EventLog::new();
        for i in 0..EVENT_LOG_CAPACITY + 2 {
            log.push(&format!("event {i}"));
        }
        assert_eq!(log.len(), EVENT_LOG_CAPACITY);
        assert_eq!(log.dropped(), 2);
        assert_eq!(log.pop().as_deref(), Some("event 2"));
    }

    #[test]
    fn test_event_text_truncated() {
        let mut log = EventLog::new();
        log.push(&"x".repeat(EVENT_TEXT_SIZE * 2));
        assert_eq!(log.pop().map(|e| e.len()), Some(EVENT_TEXT_SIZE));
    }

    #[test]
    fn test_diagnostics_from_host_readings() {
        let mut diag = SystemDiagnostics::default();
        diag.apply(&HostReadings {
            available_memory: 8 << 30,
            cpu_frequencies_mhz: vec![1800, 2400, 2100],
        });
        assert_eq!(diag.free_heap, 8 << 30);
        assert_eq!(diag.max_free_block, 8 << 30);
        assert_eq!(diag.heap_fragmentation, 0);
        assert_eq!(diag.cpu_frequency_mhz, 2400);
        assert_eq!(diag.last_reset_reason, ResetReason::PowerOn);

        // Platforms without frequency reporting keep the last figure.
        diag.apply(&HostReadings {
            available_memory: 1 << 30,
            cpu_frequencies_mhz: vec![0, 0],
        });
        assert_eq!(diag.free_heap, 1 << 30);
        assert_eq!(diag.cpu_frequency_mhz, 2400);
    }

    #[test]
    fn test_parse_inbound() {
        assert_eq!(
            parse_inbound(topics::RELAY_MODE_SET, "force"),
            Some(Intent::SetRelayMode(RoutingMode::Forced))
        );
        assert_eq!(
            parse_inbound(topics::TRIAC_MODE_SET, "9"),
            Some(Intent::SetTriacMode(RoutingMode::Auto))
        );
        assert_eq!(parse_inbound(topics::BOOST_SET, "ON"), Some(Intent::Boost { on: true }));
        assert_eq!(parse_inbound(topics::BOOST_SET, "maybe"), None);
        assert_eq!(parse_inbound(topics::VRMS, "1"), None);
    }
}
