//! Serial framing for the routing controller link.
//!
//! Every exchange is one ASCII request line answered by one reply, both
//! comma separated and closed by `END#`:
//!
//! ```text
//! -> STATS,END#
//! <- STATS,1.2,231.4,...,END#
//! -> SETPARAM,6,30,END#
//! <- SETPARAM,6,END#
//! ```
//!
//! Replies are collected into a fixed 256-byte buffer until the `#` sentinel
//! arrives or the read window closes.

use crate::clock::SharedClock;
use crate::params::{ParamField, ParameterVector, PARAM_COUNT};
use crate::stats::{RoutingMode, StatisticsVector, STATS_WIRE_COUNT};
use arrayvec::ArrayString;
use core::fmt::Write as _;
use heapless::Vec;
use serde::Serialize;
use tracing::{debug, info, warn};

pub const RX_BUFFER_SIZE: usize = 256;
pub const MAX_REQUEST_SIZE: usize = 64;
pub const MAX_REPLY_FIELDS: usize = 32;
pub const SENTINEL: u8 = b'#';
pub const END_MARKER: &str = "END";
pub const DEFAULT_TIMEOUT_MS: u64 = 100;
/// Consecutive timeouts before the link is reported degraded.
pub const DEGRADED_AFTER: u32 = 3;

pub type RequestBuffer = ArrayString<MAX_REQUEST_SIZE>;
pub type ReceiveBuffer = Vec<u8, RX_BUFFER_SIZE>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("serial port: {0}")]
pub struct SerialError(pub String);

impl From<std::io::Error> for SerialError {
    fn from(e: std::io::Error) -> Self {
        SerialError(e.to_string())
    }
}

/// Byte transport to the controller. `read` never blocks for long: it yields
/// `WouldBlock` when nothing is pending so the codec can enforce its deadline.
pub trait SerialPort: Send {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SerialError>;

    fn read(&mut self) -> nb::Result<u8, SerialError>;

    /// Drops stale bytes left over from an earlier, abandoned exchange.
    fn discard_input(&mut self) -> Result<(), SerialError> {
        for _ in 0..RX_BUFFER_SIZE * 4 {
            match self.read() {
                Ok(_) => {}
                Err(nb::Error::WouldBlock) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(e),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("no frame sentinel within {0} ms")]
    FrameTimeout(u64),
    #[error("frame incomplete: expected {expected} fields, got {got}")]
    FrameIncomplete { expected: usize, got: usize },
    #[error("receive buffer full ({0} bytes) before sentinel")]
    FrameOverflow(usize),
    #[error("malformed frame: {0}")]
    FrameMalformed(String),
    #[error("controller did not acknowledge {command}")]
    WriteRejected { command: &'static str },
    #[error("request exceeds 64 bytes")]
    RequestTooLarge,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Serial(#[from] SerialError),
}

impl ProtocolError {
    /// Errors that mean the controller did not answer at all.
    pub fn is_silence(&self) -> bool {
        matches!(self, ProtocolError::FrameTimeout(_) | ProtocolError::Serial(_))
    }
}

/// Commands that change controller state and are acknowledged by echo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinkCommand {
    SetTriacMode(RoutingMode),
    SetRelayMode(RoutingMode),
    /// Elevated routing ratio in percent; 0 ends the boost.
    Boost { ratio: u8 },
    SaveConfig,
    LoadConfig,
    ResetIndices,
}

impl LinkCommand {
    pub const fn tag(self) -> &'static str {
        match self {
            LinkCommand::SetTriacMode(_) => "SETTRIAC",
            LinkCommand::SetRelayMode(_) => "SETRELAY",
            LinkCommand::Boost { .. } => "BOOST",
            LinkCommand::SaveConfig => "SAVECFG",
            LinkCommand::LoadConfig => "LOADCFG",
            LinkCommand::ResetIndices => "RESETINDEX",
        }
    }

    fn argument(self) -> Option<f64> {
        match self {
            LinkCommand::SetTriacMode(mode) | LinkCommand::SetRelayMode(mode) => {
                Some(f64::from(mode.code()))
            }
            LinkCommand::Boost { ratio } => Some(f64::from(ratio)),
            LinkCommand::SaveConfig | LinkCommand::LoadConfig | LinkCommand::ResetIndices => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkHealth {
    pub consecutive_timeouts: u32,
    pub degraded: bool,
    pub frames_ok: u64,
    pub frames_failed: u64,
}

impl LinkHealth {
    fn record_success(&mut self) {
        self.frames_ok += 1;
        self.consecutive_timeouts = 0;
        if self.degraded {
            self.degraded = false;
            info!("serial link restored");
        }
    }

    fn record_failure(&mut self, error: &ProtocolError) {
        self.frames_failed += 1;
        if error.is_silence() {
            self.consecutive_timeouts += 1;
            if self.consecutive_timeouts >= DEGRADED_AFTER && !self.degraded {
                self.degraded = true;
                warn!(timeouts = self.consecutive_timeouts, "serial link degraded");
            }
        } else {
            self.consecutive_timeouts = 0;
        }
    }
}

pub struct FrameCodec {
    port: Box<dyn SerialPort>,
    clock: SharedClock,
    timeout_ms: u64,
    rx: ReceiveBuffer,
    request: RequestBuffer,
    health: LinkHealth,
}

impl FrameCodec {
    pub fn new(port: Box<dyn SerialPort>, clock: SharedClock, timeout_ms: u64) -> Self {
        Self {
            port,
            clock,
            timeout_ms,
            rx: Vec::new(),
            request: ArrayString::new(),
            health: LinkHealth::default(),
        }
    }

    pub fn health(&self) -> LinkHealth {
        self.health
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Swaps in a freshly opened port after a watchdog restart. Health
    /// counters survive so degradation clears only on a real success.
    pub fn replace_port(&mut self, port: Box<dyn SerialPort>) {
        self.port = port;
        self.rx.clear();
    }

    pub fn request_parameters(&mut self) -> Result<ParameterVector, ProtocolError> {
        let result = self
            .query("PARAM", &[])
            .and_then(|()| self.parse_fixed::<PARAM_COUNT>("PARAM"))
            .map(ParameterVector::from_values);
        self.finish(result)
    }

    pub fn request_statistics(&mut self) -> Result<StatisticsVector, ProtocolError> {
        let result = self
            .query("STATS", &[])
            .and_then(|()| self.parse_fixed::<STATS_WIRE_COUNT>("STATS"))
            .map(StatisticsVector::from_wire);
        self.finish(result)
    }

    pub fn request_version(&mut self) -> Result<f64, ProtocolError> {
        let result = self
            .query("VERSION", &[])
            .and_then(|()| self.parse_fixed::<1>("VERSION"))
            .map(|[version]| version);
        self.finish(result)
    }

    /// Writes one configuration field. The controller must echo the index.
    pub fn write_parameter(&mut self, field: ParamField, value: f64) -> Result<(), ProtocolError> {
        if !field.is_writable() {
            return Err(ProtocolError::InvalidArgument(format!("{} is read-only", field.name())));
        }
        if !value.is_finite() {
            return Err(ProtocolError::InvalidArgument(format!("{} must be finite", field.name())));
        }
        let index = field.index() as f64;
        let result = self
            .query("SETPARAM", &[index, value])
            .and_then(|()| self.expect_echo("SETPARAM", Some(index)));
        debug!(field = field.name(), value, ok = result.is_ok(), "parameter write");
        self.finish(result)
    }

    pub fn send_command(&mut self, command: LinkCommand) -> Result<(), ProtocolError> {
        let tag = command.tag();
        let argument = command.argument();
        let args: &[f64] = match &argument {
            Some(value) => core::slice::from_ref(value),
            None => &[],
        };
        let result = self
            .query(tag, args)
            .and_then(|()| self.expect_echo(tag, argument));
        debug!(command = tag, ok = result.is_ok(), "controller command");
        self.finish(result)
    }

    fn finish<T>(&mut self, result: Result<T, ProtocolError>) -> Result<T, ProtocolError> {
        match &result {
            Ok(_) => self.health.record_success(),
            Err(e) => self.health.record_failure(e),
        }
        result
    }

    fn encode_request(&mut self, tag: &str, args: &[f64]) -> Result<(), ProtocolError> {
        self.request.clear();
        write!(self.request, "{tag}").map_err(|_| ProtocolError::RequestTooLarge)?;
        for arg in args {
            write!(self.request, ",{arg}").map_err(|_| ProtocolError::RequestTooLarge)?;
        }
        write!(self.request, ",{END_MARKER}#").map_err(|_| ProtocolError::RequestTooLarge)
    }

    /// Sends the request and fills `rx` up to and including the sentinel.
    fn query(&mut self, tag: &str, args: &[f64]) -> Result<(), ProtocolError> {
        self.encode_request(tag, args)?;
        self.port.discard_input()?;
        self.port.write_all(self.request.as_bytes())?;

        self.rx.clear();
        let deadline = self.clock.monotonic_ms().saturating_add(self.timeout_ms);
        loop {
            match self.port.read() {
                Ok(byte) => {
                    if self.rx.push(byte).is_err() {
                        return Err(ProtocolError::FrameOverflow(RX_BUFFER_SIZE));
                    }
                    if byte == SENTINEL {
                        return Ok(());
                    }
                    if self.rx.is_full() {
                        return Err(ProtocolError::FrameOverflow(RX_BUFFER_SIZE));
                    }
                }
                Err(nb::Error::WouldBlock) => {}
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
            if self.clock.monotonic_ms() >= deadline {
                return Err(ProtocolError::FrameTimeout(self.timeout_ms));
            }
        }
    }

    /// Splits the reply in `rx` into its numeric fields after checking the
    /// tag and the end marker.
    fn parse_reply(&self, tag: &str) -> Result<Vec<f64, MAX_REPLY_FIELDS>, ProtocolError> {
        let text = core::str::from_utf8(&self.rx)
            .map_err(|_| ProtocolError::FrameMalformed("reply is not ASCII".into()))?;
        let body = text.trim_end_matches(SENTINEL as char).trim();
        let mut tokens = body.split(',').map(str::trim);

        match tokens.next() {
            Some(t) if t == tag => {}
            other => {
                return Err(ProtocolError::FrameMalformed(format!(
                    "expected {tag} reply, got {:?}",
                    other.unwrap_or("")
                )))
            }
        }

        let mut values = Vec::new();
        let mut terminated = false;
        for token in tokens {
            if token == END_MARKER {
                terminated = true;
                break;
            }
            let value = token
                .parse::<f64>()
                .map_err(|_| ProtocolError::FrameMalformed(format!("bad number {token:?}")))?;
            values
                .push(value)
                .map_err(|_| ProtocolError::FrameMalformed("too many fields".into()))?;
        }
        if !terminated {
            return Err(ProtocolError::FrameIncomplete {
                expected: values.len() + 1,
                got: values.len(),
            });
        }
        Ok(values)
    }

    fn parse_fixed<const N: usize>(&self, tag: &str) -> Result<[f64; N], ProtocolError> {
        let values = self.parse_reply(tag).map_err(|e| match e {
            ProtocolError::FrameIncomplete { got, .. } => {
                ProtocolError::FrameIncomplete { expected: N, got }
            }
            other => other,
        })?;
        if values.len() < N {
            return Err(ProtocolError::FrameIncomplete {
                expected: N,
                got: values.len(),
            });
        }
        if values.len() > N {
            return Err(ProtocolError::FrameMalformed(format!(
                "{tag} carried {} fields, expected {N}",
                values.len()
            )));
        }
        let mut out = [0.0; N];
        out.copy_from_slice(&values);
        Ok(out)
    }

    fn expect_echo(&self, tag: &'static str, echo: Option<f64>) -> Result<(), ProtocolError> {
        let values = self.parse_reply(tag).map_err(|e| match e {
            ProtocolError::FrameMalformed(_) => ProtocolError::WriteRejected { command: tag },
            other => other,
        })?;
        match (echo, values.first()) {
            (None, _) => Ok(()),
            (Some(expected), Some(&got)) if got == expected => Ok(()),
            _ => Err(ProtocolError::WriteRejected { command: tag }),
        }
    }
}

impl core::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("timeout_ms", &self.timeout_ms)
            .field("health", &self.health)
            .finish()
    }
}
