//! Line-delimited JSON requests served by the daemon over TCP.
//!
//! Each request is one JSON object tagged by `cmd`; each answer is one
//! [`ApiResponse`] line. Reads are served from the latest snapshot, writes
//! are queued as intents and acknowledged before the loop applies them.

use crate::gateway::{GatewayHandle, GatewaySnapshot, Intent};
use crate::history::points_to_csv;
use crate::params::ParamField;
use crate::stats::RoutingMode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const MAX_REQUEST_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryFormat {
    #[default]
    Json,
    Csv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ApiRequest {
    Status,
    Stats,
    Params,
    History {
        #[serde(default)]
        format: HistoryFormat,
    },
    Events,
    SetParam {
        field: String,
        value: f64,
    },
    Triac {
        mode: String,
    },
    Relay {
        mode: String,
    },
    Boost {
        on: bool,
    },
    RefreshParams,
    SaveConfig,
    LoadConfig,
    ResetIndices,
    ClearHistory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiResponse {
    pub fn data(data: Value) -> Self {
        Self {
            ok: true,
            message: None,
            data: Some(data),
        }
    }

    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

/// How a request is answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Respond(ApiResponse),
    Enqueue(Intent),
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn parse_mode(mode: &str) -> Result<RoutingMode, ApiResponse> {
    RoutingMode::parse(mode)
        .ok_or_else(|| ApiResponse::error(format!("unknown mode {mode:?}, expected stop, force or auto")))
}

pub fn resolve(request: ApiRequest, snapshot: &GatewaySnapshot) -> Resolution {
    let intent = match request {
        ApiRequest::Status => {
            return Resolution::Respond(ApiResponse::data(json!({
                "taken_at": snapshot.taken_at,
                "uptime_s": snapshot.uptime_s,
                "relay_on": snapshot.relay_on,
                "daily": snapshot.daily,
                "boost": snapshot.boost,
                "relay_plus": snapshot.relay_plus,
                "mirror": snapshot.mirror,
                "link": snapshot.link,
                "watchdog": snapshot.watchdog,
                "transport_connected": snapshot.transport_connected,
                "state": snapshot.state,
                "history_points": snapshot.history.len(),
            })))
        }
        ApiRequest::Stats => {
            return Resolution::Respond(match &snapshot.stats {
                Some(stats) => ApiResponse::data(to_value(stats)),
                None => ApiResponse::error("no statistics received yet"),
            })
        }
        ApiRequest::Params => {
            return Resolution::Respond(match &snapshot.params {
                Some(params) => ApiResponse::data(to_value(params)),
                None => ApiResponse::error("controller parameters not loaded"),
            })
        }
        ApiRequest::History { format } => {
            let data = match format {
                HistoryFormat::Json => json!({
                    "interval_min": snapshot.history_interval_min,
                    "points": snapshot.history,
                }),
                HistoryFormat::Csv => Value::String(points_to_csv(snapshot.history.iter().copied())),
            };
            return Resolution::Respond(ApiResponse::data(data));
        }
        ApiRequest::Events => {
            return Resolution::Respond(ApiResponse::data(to_value(&snapshot.events)));
        }
        ApiRequest::SetParam { field, value } => {
            let Some(field) = ParamField::parse(&field) else {
                return Resolution::Respond(ApiResponse::error(format!("unknown parameter {field:?}")));
            };
            if !field.is_writable() {
                return Resolution::Respond(ApiResponse::error(format!("{} is read-only", field.name())));
            }
            if !value.is_finite() {
                return Resolution::Respond(ApiResponse::error("value must be finite"));
            }
            Intent::WriteParameter { field, value }
        }
        ApiRequest::Triac { mode } => match parse_mode(&mode) {
            Ok(mode) => Intent::SetTriacMode(mode),
            Err(response) => return Resolution::Respond(response),
        },
        ApiRequest::Relay { mode } => match parse_mode(&mode) {
            Ok(mode) => Intent::SetRelayMode(mode),
            Err(response) => return Resolution::Respond(response),
        },
        ApiRequest::Boost { on } => Intent::Boost { on },
        ApiRequest::RefreshParams => Intent::RefreshParameters,
        ApiRequest::SaveConfig => Intent::SaveControllerConfig,
        ApiRequest::LoadConfig => Intent::LoadControllerConfig,
        ApiRequest::ResetIndices => Intent::ResetIndices,
        ApiRequest::ClearHistory => Intent::ClearHistory,
    };
    Resolution::Enqueue(intent)
}

/// Answers one request line against the handle's latest snapshot.
pub fn handle_line(line: &str, handle: &GatewayHandle) -> ApiResponse {
    let line = line.trim();
    if line.len() > MAX_REQUEST_SIZE {
        return ApiResponse::error("request too large");
    }
    let request = match serde_json::from_str::<ApiRequest>(line) {
        Ok(request) => request,
        Err(e) => return ApiResponse::error(format!("invalid request: {e}")),
    };
    match resolve(request, &handle.snapshot()) {
        Resolution::Respond(response) => response,
        Resolution::Enqueue(intent) => match handle.submit(intent) {
            Ok(()) => ApiResponse::accepted("queued"),
            Err(e) => ApiResponse::error(e.to_string()),
        },
    }
}
