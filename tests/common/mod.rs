#![allow(dead_code)]

use chrono::NaiveDate;
use pvgate::mirror::{MirrorError, RelayEndpoint};
use pvgate::params::PARAM_COUNT;
use pvgate::protocol::{SerialError, SerialPort};
use pvgate::stats::{EnergyIndex, StatField, STATS_WIRE_COUNT, STATUS_RELAY_ON};
use pvgate::telemetry::{PublishError, TelemetryTransport};
use pvgate::{Clock, GatewayConfig, ManualClock, RoutingMode};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

pub const FIRMWARE_VERSION: f64 = 3.3;

pub fn clock_at(hour: u32, minute: u32) -> ManualClock {
    ManualClock::at(
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        hour,
        minute,
        0,
    )
}

/// Configuration tuned for deterministic tests: fast polling, no network.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.serial.poll_ms = 1000;
    config.serial.timeout_ms = 100;
    config
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Normal,
    /// Never answers.
    Silent,
    /// Answers with a frame the codec cannot parse.
    Garbage,
    /// Answers without the `END` marker.
    Truncated,
    /// Answers write commands with a wrong echo.
    RejectWrites,
}

#[derive(Debug)]
pub struct ControllerState {
    pub params: [f64; PARAM_COUNT],
    pub stats: [f64; STATS_WIRE_COUNT],
    pub behaviour: Behaviour,
    pub latency_ms: u64,
    pub boost_ratio: Option<u8>,
    pub saved: u32,
    pub requests: Vec<String>,
    input: Vec<u8>,
    pending: VecDeque<u8>,
    ready_at: u64,
}

/// Simulated routing controller speaking the framed ASCII protocol.
///
/// Clones share state, so a test keeps one clone and hands another to the
/// gateway. Every empty read advances the manual clock by 1 ms, which lets
/// the codec deadline expire without real sleeping.
#[derive(Debug, Clone)]
pub struct MockController {
    state: Arc<Mutex<ControllerState>>,
    clock: ManualClock,
}

impl MockController {
    pub fn new(clock: &ManualClock) -> Self {
        let mut params = [0.0; PARAM_COUNT];
        params[0] = FIRMWARE_VERSION;
        for (i, p) in params.iter_mut().enumerate().skip(1) {
            *p = 10.0 * i as f64;
        }
        let mut stats = [0.0; STATS_WIRE_COUNT];
        stats[StatField::Version.index()] = FIRMWARE_VERSION;
        stats[StatField::VRms.index()] = 231.5;
        stats[StatField::IRms.index()] = 4.2;
        stats[StatField::PAct.index()] = -850.0;
        stats[StatField::CosPhi.index()] = 0.98;
        stats[StatField::TriacMode.index()] = f64::from(RoutingMode::Auto.code());
        stats[StatField::RelayMode.index()] = f64::from(RoutingMode::Auto.code());
        Self {
            state: Arc::new(Mutex::new(ControllerState {
                params,
                stats,
                behaviour: Behaviour::Normal,
                latency_ms: 0,
                boost_ratio: None,
                saved: 0,
                requests: Vec::new(),
                input: Vec::new(),
                pending: VecDeque::new(),
                ready_at: 0,
            })),
            clock: clock.clone(),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap()
    }

    pub fn boxed(&self) -> Box<dyn SerialPort> {
        Box::new(self.clone())
    }

    pub fn set_behaviour(&self, behaviour: Behaviour) {
        self.state().behaviour = behaviour;
    }

    pub fn set_latency(&self, ms: u64) {
        self.state().latency_ms = ms;
    }

    pub fn set_stat(&self, field: StatField, value: f64) {
        self.state().stats[field.index()] = value;
    }

    pub fn stat(&self, field: StatField) -> f64 {
        self.state().stats[field.index()]
    }

    pub fn add_energy(&self, index: EnergyIndex, wh: f64) {
        self.state().stats[index.field().index()] += wh;
    }

    /// Energises the relay the way the controller reports it in auto mode.
    pub fn set_relay_output(&self, on: bool) {
        let mut state = self.state();
        let status = state.stats[StatField::StatusByte.index()] as u8;
        let status = if on {
            status | STATUS_RELAY_ON
        } else {
            status & !STATUS_RELAY_ON
        };
        state.stats[StatField::StatusByte.index()] = f64::from(status);
    }

    pub fn relay_mode(&self) -> Option<RoutingMode> {
        RoutingMode::from_code(self.stat(StatField::RelayMode))
    }

    pub fn requests_with_tag(&self, tag: &str) -> Vec<String> {
        self.state()
            .requests
            .iter()
            .filter(|r| r.split(',').next() == Some(tag))
            .cloned()
            .collect()
    }
}

fn frame(tag: &str, values: &[f64]) -> String {
    let mut out = String::from(tag);
    for v in values {
        out.push_str(&format!(",{v}"));
    }
    out.push_str(",END#");
    out
}

impl ControllerState {
    fn answer(&mut self, request: &str) -> Option<String> {
        let body = request.trim_end_matches('#');
        let mut parts = body.split(',');
        let tag = parts.next()?;
        let args: Vec<f64> = parts
            .take_while(|p| *p != "END")
            .filter_map(|p| p.parse().ok())
            .collect();

        match self.behaviour {
            Behaviour::Silent => return None,
            Behaviour::Garbage => return Some("@@garbage@@#".into()),
            Behaviour::Truncated => return Some(format!("{tag},1,2#")),
            Behaviour::RejectWrites if !matches!(tag, "PARAM" | "STATS" | "VERSION") => {
                return Some(frame(tag, &[-1.0]));
            }
            _ => {}
        }

        let reply = match tag {
            "PARAM" => frame("PARAM", &self.params),
            "STATS" => frame("STATS", &self.stats),
            "VERSION" => frame("VERSION", &[self.params[0]]),
            "SETPARAM" => {
                let index = *args.first()? as usize;
                let value = *args.get(1)?;
                if index == 0 || index >= PARAM_COUNT {
                    return Some(frame("ERROR", &[]));
                }
                self.params[index] = value;
                frame("SETPARAM", &[index as f64])
            }
            "SETTRIAC" => {
                let mode = *args.first()?;
                self.stats[StatField::TriacMode.index()] = mode;
                frame("SETTRIAC", &[mode])
            }
            "SETRELAY" => {
                let mode = *args.first()?;
                self.stats[StatField::RelayMode.index()] = mode;
                frame("SETRELAY", &[mode])
            }
            "BOOST" => {
                let ratio = *args.first()?;
                self.boost_ratio = (ratio > 0.0).then_some(ratio as u8);
                frame("BOOST", &[ratio])
            }
            "SAVECFG" => {
                self.saved += 1;
                frame("SAVECFG", &[])
            }
            "LOADCFG" => frame("LOADCFG", &[]),
            "RESETINDEX" => {
                for index in EnergyIndex::ALL {
                    self.stats[index.field().index()] = 0.0;
                }
                frame("RESETINDEX", &[])
            }
            _ => frame("ERROR", &[]),
        };
        Some(reply)
    }
}

impl SerialPort for MockController {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        let now = self.clock.monotonic_ms();
        let mut state = self.state();
        for &byte in bytes {
            state.input.push(byte);
            if byte == b'#' {
                let request = String::from_utf8_lossy(&state.input).into_owned();
                state.input.clear();
                state.requests.push(request.clone());
                if let Some(reply) = state.answer(&request) {
                    state.pending.extend(reply.bytes());
                    state.ready_at = now + state.latency_ms;
                }
            }
        }
        Ok(())
    }

    fn read(&mut self) -> nb::Result<u8, SerialError> {
        let now = self.clock.monotonic_ms();
        {
            let mut state = self.state();
            if now >= state.ready_at {
                if let Some(byte) = state.pending.pop_front() {
                    return Ok(byte);
                }
            }
        }
        self.clock.advance_ms(1);
        Err(nb::Error::WouldBlock)
    }

    fn discard_input(&mut self) -> Result<(), SerialError> {
        self.state().pending.clear();
        Ok(())
    }
}

/// Transport recording every publish.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    pub published: Arc<Mutex<Vec<(String, String, bool)>>>,
    pub connected: Arc<Mutex<bool>>,
}

impl RecordingTransport {
    pub fn online() -> Self {
        let transport = Self::default();
        *transport.connected.lock().unwrap() = true;
        transport
    }

    pub fn set_connected(&self, on: bool) {
        *self.connected.lock().unwrap() = on;
    }

    pub fn payloads(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, p, _)| p.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

impl TelemetryTransport for RecordingTransport {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string(), retain));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }
}

/// Remote relay answering from a script, then succeeding.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEndpoint {
    pub script: Arc<Mutex<VecDeque<Result<(), MirrorError>>>>,
    pub calls: Arc<Mutex<Vec<bool>>>,
}

impl ScriptedEndpoint {
    pub fn failing(times: usize) -> Self {
        let endpoint = Self::default();
        endpoint
            .script
            .lock()
            .unwrap()
            .extend((0..times).map(|_| Err(MirrorError::Unreachable("connection refused".into()))));
        endpoint
    }

    pub fn calls(&self) -> Vec<bool> {
        self.calls.lock().unwrap().clone()
    }
}

impl RelayEndpoint for ScriptedEndpoint {
    fn command(&mut self, on: bool) -> Result<(), MirrorError> {
        self.calls.lock().unwrap().push(on);
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}
