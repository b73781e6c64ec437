//! Wire frames shared by the gateway RPC surface and its clients.
//!
//! Every exchange is one of three JSON frames, tagged by `type`:
//! `req` (client → gateway), `res` (gateway → client) and `event`
//! (gateway push, sequenced).

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum accepted frame payload on the WebSocket and `/rpc` endpoints.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Interval at which connected WebSocket clients receive a `tick` event.
pub const TICK_INTERVAL_MS: u64 = 30_000;

pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CANCELLED: &str = "CANCELLED";
    pub const SANDBOX_VIOLATION: &str = "SANDBOX_VIOLATION";
    pub const ALL_MODELS_FAILED: &str = "ALL_MODELS_FAILED";
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";
    pub const AGENT_ERROR: &str = "AGENT_ERROR";
    pub const INTERNAL: &str = "INTERNAL";
}

// ── Frames ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

impl ErrorShape {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl std::fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RequestFrame {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            frame_type: "req".into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: &str, payload: serde_json::Value) -> Self {
        Self {
            frame_type: "res".into(),
            id: id.to_string(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: &str, error: ErrorShape) -> Self {
        Self {
            frame_type: "res".into(),
            id: id.to_string(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub event: String,
    pub payload: serde_json::Value,
    pub seq: u64,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value, seq: u64) -> Self {
        Self {
            frame_type: "event".into(),
            event: event.into(),
            payload,
            seq,
        }
    }
}
