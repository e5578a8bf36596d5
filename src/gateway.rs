//! The control loop context.
//!
//! [`Gateway`] owns every component and runs them in a fixed order on each
//! call to [`Gateway::tick`]. Nothing else touches component state: external
//! handlers read the latest [`GatewaySnapshot`] and queue [`Intent`]s through
//! a [`GatewayHandle`].

use crate::boost::{BoostAction, BoostScheduler, BoostSummary};
use crate::clock::{Cadence, SharedClock};
use crate::config::{ConfigError, GatewayConfig};
use crate::history::{HistoryPoint, HistoryRingBuffer};
use crate::mirror::{MirrorOutcome, MirrorState, RelayEndpoint, RemoteRelayMirror};
use crate::params::{ParamField, ParameterVector};
use crate::protocol::{FrameCodec, LinkCommand, LinkHealth, ProtocolError, SerialPort};
use crate::relay_plus::{RelayPlusAction, RelayPlusScheduler, RelayPlusSummary};
use crate::stats::{DailyIndexTracker, EnergyIndices, RoutingMode, StatisticsVector};
use crate::telemetry::{
    EventLog, PublishReport, PublisherStats, ResetReason, SystemDiagnostics, TelemetryPublisher,
    TelemetryTransport,
};
use crate::watchdog::{Watchdog, WatchdogActions, WatchdogState};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const INTENT_QUEUE_SIZE: usize = 32;
/// Sleep between ticks in the daemon. Steps run on their own cadences.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);
const DIAGNOSTICS_PERIOD: Duration = Duration::from_secs(10);

/// A state change requested from outside the loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Intent {
    WriteParameter { field: ParamField, value: f64 },
    SetTriacMode(RoutingMode),
    SetRelayMode(RoutingMode),
    Boost { on: bool },
    RefreshParameters,
    SaveControllerConfig,
    LoadControllerConfig,
    ResetIndices,
    ClearHistory,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("intent queue full")]
    QueueFull,
    #[error("gateway stopped")]
    Stopped,
    #[error("controller link: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GatewayState {
    pub ticks: u64,
    pub polls_ok: u64,
    pub polls_failed: u64,
    pub intents_applied: u32,
    pub intents_failed: u32,
    pub day_rollovers: u32,
    pub last_error: Option<String>,
}

/// Consistent view of the gateway published after every tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GatewaySnapshot {
    pub taken_at: NaiveDateTime,
    pub uptime_s: u64,
    pub state: GatewayState,
    pub stats: Option<StatisticsVector>,
    pub params: Option<ParameterVector>,
    pub daily: Option<EnergyIndices>,
    pub relay_on: bool,
    pub boost: BoostSummary,
    pub relay_plus: Option<RelayPlusSummary>,
    pub mirror: Option<MirrorState>,
    pub link: LinkHealth,
    pub watchdog: WatchdogState,
    pub transport_connected: bool,
    pub publisher: PublisherStats,
    pub diagnostics: SystemDiagnostics,
    pub history_interval_min: u16,
    pub history: Vec<HistoryPoint>,
    pub events: Vec<String>,
}

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub polled: bool,
    pub poll_error: Option<ProtocolError>,
    pub day_rolled: bool,
    pub intents_applied: usize,
    pub history_sampled: bool,
    pub boost: Option<BoostAction>,
    pub relay_plus: Option<RelayPlusAction>,
    pub mirror: Option<MirrorOutcome>,
    pub publish: Option<PublishReport>,
    pub watchdog: WatchdogActions,
}

/// Cloneable access for API and MQTT handlers.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    intents: mpsc::Sender<Intent>,
    snapshot: watch::Receiver<Arc<GatewaySnapshot>>,
}

impl GatewayHandle {
    /// Queues an intent for the next tick. Never blocks.
    pub fn submit(&self, intent: Intent) -> Result<(), GatewayError> {
        self.intents.try_send(intent).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => GatewayError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => GatewayError::Stopped,
        })
    }

    pub fn snapshot(&self) -> Arc<GatewaySnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<GatewaySnapshot>> {
        self.snapshot.clone()
    }
}

pub struct Gateway {
    clock: SharedClock,
    link: FrameCodec,
    poll: Cadence,
    params: Option<ParameterVector>,
    params_stale: bool,
    stats: Option<StatisticsVector>,
    daily: DailyIndexTracker,
    history: HistoryRingBuffer,
    boost: BoostScheduler,
    pending_boost: Option<u8>,
    relay_plus: Option<RelayPlusScheduler>,
    pending_relay: Option<RoutingMode>,
    /// Relay mode to restore when RelayPlus ends its override.
    relay_mode_before_override: Option<RoutingMode>,
    boost_send_failed: bool,
    mirror: Option<RemoteRelayMirror>,
    transport: Option<Box<dyn TelemetryTransport>>,
    publisher: TelemetryPublisher,
    watchdog: Watchdog,
    events: EventLog,
    diagnostics: SystemDiagnostics,
    diagnostics_cadence: Cadence,
    intents_rx: mpsc::Receiver<Intent>,
    intents_tx: mpsc::Sender<Intent>,
    snapshot_tx: watch::Sender<Arc<GatewaySnapshot>>,
    state: GatewayState,
    started_ms: u64,
}

impl Gateway {
    pub fn new(config: &GatewayConfig, clock: SharedClock, port: Box<dyn SerialPort>) -> Self {
        let now_ms = clock.monotonic_ms();
        let (intents_tx, intents_rx) = mpsc::channel(INTENT_QUEUE_SIZE);
        let (snapshot_tx, _) = watch::channel(Arc::new(GatewaySnapshot::default()));

        let relay_plus = config
            .relay_plus
            .enabled
            .then(|| RelayPlusScheduler::new(config.relay_plus_settings()));

        let mut gateway = Self {
            link: FrameCodec::new(port, clock.clone(), config.serial.timeout_ms),
            poll: Cadence::new(config.poll_period()),
            params: None,
            params_stale: true,
            stats: None,
            daily: DailyIndexTracker::new(),
            history: HistoryRingBuffer::new(config.history_interval()),
            boost: BoostScheduler::new(config.boost_settings()),
            pending_boost: None,
            relay_plus,
            pending_relay: None,
            relay_mode_before_override: None,
            boost_send_failed: false,
            mirror: None,
            transport: None,
            publisher: TelemetryPublisher::new(config.publish_period()),
            watchdog: Watchdog::new(config.watchdog_settings(), now_ms),
            events: EventLog::new(),
            diagnostics: SystemDiagnostics::default(),
            diagnostics_cadence: Cadence::new(DIAGNOSTICS_PERIOD),
            intents_rx,
            intents_tx,
            snapshot_tx,
            state: GatewayState::default(),
            started_ms: now_ms,
            clock,
        };
        let wall = gateway.clock.local_now();
        gateway.publish_snapshot(now_ms, wall);
        gateway
    }

    pub fn with_mirror(mut self, endpoint: Box<dyn RelayEndpoint>, period: Duration) -> Self {
        self.mirror = Some(RemoteRelayMirror::new(endpoint, period));
        self
    }

    pub fn with_transport(mut self, transport: Box<dyn TelemetryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            intents: self.intents_tx.clone(),
            snapshot: self.snapshot_tx.subscribe(),
        }
    }

    /// Installs a freshly opened serial port after a watchdog restart.
    pub fn replace_serial(&mut self, port: Box<dyn SerialPort>) {
        self.link.replace_port(port);
        self.params_stale = true;
        self.poll.expedite();
    }

    pub fn replace_transport(&mut self, transport: Box<dyn TelemetryTransport>) {
        self.transport = Some(transport);
    }

    pub fn set_reset_reason(&mut self, reason: ResetReason) {
        self.diagnostics.last_reset_reason = reason;
    }

    pub fn stats(&self) -> Option<&StatisticsVector> {
        self.stats.as_ref()
    }

    pub fn params(&self) -> Option<&ParameterVector> {
        self.params.as_ref()
    }

    pub fn history(&self) -> &HistoryRingBuffer {
        &self.history
    }

    pub fn boost(&self) -> &BoostScheduler {
        &self.boost
    }

    pub fn relay_plus(&self) -> Option<&RelayPlusScheduler> {
        self.relay_plus.as_ref()
    }

    pub fn mirror_state(&self) -> Option<MirrorState> {
        self.mirror.as_ref().map(RemoteRelayMirror::state)
    }

    pub fn link_health(&self) -> LinkHealth {
        self.link.health()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    pub fn latest_snapshot(&self) -> Arc<GatewaySnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Runs one control cycle.
    pub fn tick(&mut self) -> TickReport {
        let now_ms = self.clock.monotonic_ms();
        let wall = self.clock.local_now();
        let mut report = TickReport::default();
        self.state.ticks += 1;

        if self.poll.due(now_ms) {
            self.poll_controller(now_ms, wall, &mut report);
        }

        report.intents_applied = self.drain_intents(wall);

        if report.polled {
            if let Some(stats) = &self.stats {
                report.history_sampled = self.history.sample(wall, stats.indices());
            }
        }

        self.run_boost(wall, &mut report);
        self.run_relay_plus(wall, &mut report);
        self.run_mirror(now_ms, wall, &mut report);

        if self.diagnostics_cadence.due(now_ms) {
            self.diagnostics.refresh();
        }
        let snapshot = self.publish_snapshot(now_ms, wall);
        if let Some(transport) = self.transport.as_mut() {
            if transport.is_connected() {
                self.watchdog.feed_network(now_ms);
            }
            report.publish =
                self.publisher
                    .tick(now_ms, transport.as_mut(), &snapshot, &mut self.events);
        }

        report.watchdog = self.watchdog.check(now_ms, self.transport.is_some());
        if report.watchdog.restart_serial {
            self.diagnostics.last_reset_reason = ResetReason::Watchdog;
            self.params = None;
            self.params_stale = true;
            self.note(wall, "watchdog: serial session restart");
        }
        if report.watchdog.restart_network {
            self.diagnostics.last_reset_reason = ResetReason::Watchdog;
            self.note(wall, "watchdog: network restart");
        }

        report
    }

    fn poll_controller(&mut self, now_ms: u64, wall: NaiveDateTime, report: &mut TickReport) {
        let was_degraded = self.link.health().degraded;
        match self.link.request_statistics() {
            Ok(mut stats) => {
                self.state.polls_ok += 1;
                if self.daily.observe(wall.date(), &mut stats) {
                    report.day_rolled = true;
                    self.state.day_rollovers += 1;
                    self.note(wall, "new day, daily counters reset");
                }
                self.watchdog.feed_link(now_ms);
                let version_changed = self
                    .params
                    .as_ref()
                    .is_some_and(|p| p.version() != stats.version());
                self.stats = Some(stats);
                report.polled = true;

                if was_degraded {
                    self.note(wall, "serial link restored");
                }
                if self.params.is_none() || self.params_stale || version_changed {
                    if let Err(e) = self.refresh_parameters() {
                        debug!(error = %e, "parameter refresh deferred");
                    }
                }
            }
            Err(e) => {
                self.state.polls_failed += 1;
                self.state.last_error = Some(e.to_string());
                debug!(error = %e, "statistics poll failed");
                if self.link.health().degraded && !was_degraded {
                    self.params = None;
                    self.params_stale = true;
                    self.note(wall, "serial link degraded");
                }
                report.poll_error = Some(e);
            }
        }
    }

    fn refresh_parameters(&mut self) -> Result<(), GatewayError> {
        let params = self.link.request_parameters()?;
        info!(version = params.version(), "controller parameters loaded");
        self.params = Some(params);
        self.params_stale = false;
        Ok(())
    }

    fn drain_intents(&mut self, wall: NaiveDateTime) -> usize {
        let mut applied = 0;
        for _ in 0..INTENT_QUEUE_SIZE {
            let Ok(intent) = self.intents_rx.try_recv() else {
                break;
            };
            match self.apply_intent(intent, wall) {
                Ok(()) => {
                    applied += 1;
                    self.state.intents_applied += 1;
                }
                Err(e) => {
                    warn!(?intent, error = %e, "intent failed");
                    self.state.intents_failed += 1;
                    self.state.last_error = Some(e.to_string());
                }
            }
        }
        applied
    }

    fn apply_intent(&mut self, intent: Intent, wall: NaiveDateTime) -> Result<(), GatewayError> {
        debug!(?intent, "applying intent");
        match intent {
            Intent::WriteParameter { field, value } => {
                self.link.write_parameter(field, value)?;
                if let Some(params) = self.params.as_mut() {
                    params.set(field, value);
                }
            }
            Intent::SetTriacMode(mode) => {
                self.link.send_command(LinkCommand::SetTriacMode(mode))?;
            }
            Intent::SetRelayMode(mode) => {
                self.link.send_command(LinkCommand::SetRelayMode(mode))?;
                self.pending_relay = None;
                if self.relay_mode_before_override.is_some() {
                    self.relay_mode_before_override = Some(mode);
                }
            }
            Intent::Boost { on } => {
                let action = if on {
                    self.boost.activate(wall)
                } else {
                    self.boost.cancel(wall)
                };
                if let Some(action) = action {
                    self.queue_boost(action, wall);
                }
            }
            Intent::RefreshParameters => self.refresh_parameters()?,
            Intent::SaveControllerConfig => {
                self.link.send_command(LinkCommand::SaveConfig)?;
                self.note(wall, "controller configuration saved");
            }
            Intent::LoadControllerConfig => {
                self.link.send_command(LinkCommand::LoadConfig)?;
                self.params_stale = true;
                self.refresh_parameters()?;
            }
            Intent::ResetIndices => {
                self.link.send_command(LinkCommand::ResetIndices)?;
                self.daily.reset();
                self.note(wall, "energy indices reset");
            }
            Intent::ClearHistory => {
                self.history.clear();
                self.note(wall, "history cleared");
            }
        }
        Ok(())
    }

    fn queue_boost(&mut self, action: BoostAction, wall: NaiveDateTime) {
        let ratio = match action {
            BoostAction::Start { ratio } => {
                self.note(wall, "boost started");
                ratio
            }
            BoostAction::Stop => {
                self.note(wall, "boost stopped");
                0
            }
        };
        self.pending_boost = Some(ratio);
        self.boost_send_failed = false;
    }

    fn run_boost(&mut self, wall: NaiveDateTime, report: &mut TickReport) {
        if let Some(action) = self.boost.tick(wall) {
            self.queue_boost(action, wall);
            report.boost = Some(action);
        }
        // A failed command waits for the poll cadence before it is retried.
        let poll_attempted = report.polled || report.poll_error.is_some();
        if let Some(ratio) = self.pending_boost {
            if self.boost_send_failed && !poll_attempted {
                return;
            }
            match self.link.send_command(LinkCommand::Boost { ratio }) {
                Ok(()) => {
                    self.pending_boost = None;
                    self.boost_send_failed = false;
                }
                Err(e) => {
                    debug!(ratio, error = %e, "boost command will be retried");
                    self.boost_send_failed = true;
                }
            }
        }
    }

    fn run_relay_plus(&mut self, wall: NaiveDateTime, report: &mut TickReport) {
        if !report.polled {
            return;
        }
        let (Some(plus), Some(stats)) = (self.relay_plus.as_mut(), self.stats.as_ref()) else {
            return;
        };
        if let Some(action) = plus.tick(wall, stats.relay_on()) {
            report.relay_plus = Some(action);
            let (mode, text) = match action {
                RelayPlusAction::ForceOff | RelayPlusAction::KeepOn => {
                    if self.relay_mode_before_override.is_none() {
                        self.relay_mode_before_override =
                            Some(stats.relay_mode().unwrap_or(RoutingMode::Auto));
                    }
                    if action == RelayPlusAction::ForceOff {
                        (RoutingMode::Stop, "relay maximum reached, forced off")
                    } else {
                        (RoutingMode::Forced, "relay held on until minimum")
                    }
                }
                RelayPlusAction::Release => (
                    self.relay_mode_before_override.take().unwrap_or(RoutingMode::Auto),
                    "relay override ended, previous mode restored",
                ),
            };
            self.pending_relay = Some(mode);
            self.note(wall, text);
        }
        if let Some(mode) = self.pending_relay {
            match self.link.send_command(LinkCommand::SetRelayMode(mode)) {
                Ok(()) => self.pending_relay = None,
                Err(e) => debug!(mode = mode.as_str(), error = %e, "relay command will be retried"),
            }
        }
    }

    fn run_mirror(&mut self, now_ms: u64, wall: NaiveDateTime, report: &mut TickReport) {
        let (Some(mirror), Some(stats)) = (self.mirror.as_mut(), self.stats.as_ref()) else {
            return;
        };
        let was_degraded = mirror.state().degraded;
        let outcome = mirror.tick(now_ms, wall, stats.relay_on());
        let degraded = mirror.state().degraded;
        if degraded && !was_degraded {
            self.note(wall, "remote relay mirror degraded");
        } else if was_degraded && !degraded {
            self.note(wall, "remote relay mirror restored");
        }
        if outcome != MirrorOutcome::NotDue {
            report.mirror = Some(outcome);
        }
    }

    fn note(&mut self, wall: NaiveDateTime, text: &str) {
        info!("{text}");
        self.events.push(&format!("{} {}", wall.format("%H:%M:%S"), text));
    }

    fn build_snapshot(&self, now_ms: u64, wall: NaiveDateTime) -> GatewaySnapshot {
        GatewaySnapshot {
            taken_at: wall,
            uptime_s: now_ms.saturating_sub(self.started_ms) / 1000,
            state: self.state.clone(),
            stats: self.stats,
            params: self.params,
            daily: self.stats.as_ref().map(StatisticsVector::daily_deltas),
            relay_on: self.stats.as_ref().is_some_and(StatisticsVector::relay_on),
            boost: self.boost.summary(),
            relay_plus: self.relay_plus.as_ref().map(RelayPlusScheduler::summary),
            mirror: self.mirror_state(),
            link: self.link.health(),
            watchdog: self.watchdog.state(),
            transport_connected: self.transport.as_ref().is_some_and(|t| t.is_connected()),
            publisher: self.publisher.stats(),
            diagnostics: self.diagnostics,
            history_interval_min: self.history.interval().minutes(),
            history: self.history.export().iter().collect(),
            events: self.events.recent().map(str::to_owned).collect(),
        }
    }

    fn publish_snapshot(&mut self, now_ms: u64, wall: NaiveDateTime) -> Arc<GatewaySnapshot> {
        let snapshot = Arc::new(self.build_snapshot(now_ms, wall));
        self.snapshot_tx.send_replace(snapshot.clone());
        snapshot
    }
}

impl core::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Gateway")
            .field("link", &self.link)
            .field("history", &self.history)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
