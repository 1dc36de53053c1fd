//! IPC protocol types and validation for flowd.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_EVENT_ID_LEN: usize = 128;

/// Flat, lower-cased field map every source event is reduced to.
///
/// Kept as a `BTreeMap` so serialized events (and anything hashed from them)
/// are independent of insertion order.
pub type NormalizedEvent = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Event,
    ReplaceConfig,
    GetConfig,
    ExportBundle,
    ImportBundle,
    GetActivityCatalog,
    StartSession,
    SignalSession,
    GetSessionStatus,
    GetSessionResult,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: Option<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Router signals
// ═══════════════════════════════════════════════════════════════════════════════

/// Payload delivered into the router's event queue.
///
/// `event_id` may be left empty; the router then derives it from `fields`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventSignal {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_id: String,
    pub fields: NormalizedEvent,
}

impl EventSignal {
    pub fn new(fields: NormalizedEvent) -> Self {
        Self {
            event_id: String::new(),
            fields,
        }
    }

    /// Rewrites `fields` into canonical form (see [`canonical_field`]).
    /// When two raw keys collapse onto one, the first in key order wins.
    pub fn canonicalize(&mut self) {
        let mut canonical = NormalizedEvent::new();
        for (key, value) in &self.fields {
            if let Some((key, value)) = canonical_field(key, value) {
                canonical.entry(key).or_insert(value);
            }
        }
        self.fields = canonical;
        self.event_id = self.event_id.trim().to_string();
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.event_id.len() > MAX_EVENT_ID_LEN {
            return Err(ErrorInfo::new(
                "invalid_event_id",
                format!("event_id must be {} characters or fewer", MAX_EVENT_ID_LEN),
            ));
        }
        let has_type = self
            .fields
            .get("type")
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false);
        if !has_type {
            return Err(ErrorInfo::new("missing_field", "fields.type is required"));
        }
        if self.fields.keys().any(|key| key.trim().is_empty()) {
            return Err(ErrorInfo::new(
                "invalid_params",
                "field keys must be non-empty",
            ));
        }
        Ok(())
    }
}

/// Canonical form of one event field: the key trimmed and lower-cased, the
/// value trimmed. `None` when either ends up empty.
pub fn canonical_field(key: &str, value: &str) -> Option<(String, String)> {
    let key = key.trim().to_lowercase();
    let value = value.trim();
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value.to_string()))
}

/// Decodes, canonicalizes and validates an `event` request body.
pub fn parse_event_signal(params: Value) -> Result<EventSignal, ErrorInfo> {
    let mut signal: EventSignal = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("event payload is invalid JSON: {}", err),
        )
    })?;
    signal.canonicalize();
    signal.validate()?;
    Ok(signal)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session signals and state
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case", deny_unknown_fields)]
pub enum SessionSignal {
    UpdateTask {
        l1: String,
        #[serde(default)]
        l2: String,
    },
    Bell {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
    Resume {
        #[serde(default)]
        action: String,
    },
    Terminate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Notify {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },
}

impl SessionSignal {
    pub fn name(&self) -> &'static str {
        match self {
            SessionSignal::UpdateTask { .. } => "update_task",
            SessionSignal::Bell { .. } => "bell",
            SessionSignal::Resume { .. } => "resume",
            SessionSignal::Terminate { .. } => "terminate",
            SessionSignal::Notify { .. } => "notify",
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        match self {
            SessionSignal::UpdateTask { l1, .. } => {
                if l1.trim().is_empty() {
                    return Err(ErrorInfo::new("missing_field", "l1 is required"));
                }
            }
            SessionSignal::Bell {
                timestamp: Some(timestamp),
                ..
            } => {
                if DateTime::parse_from_rfc3339(timestamp).is_err() {
                    return Err(ErrorInfo::new(
                        "invalid_timestamp",
                        "timestamp must be RFC3339",
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Paused,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BellEvent {
    pub timestamp: String,
    #[serde(default)]
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub timestamp: String,
    pub l1: String,
    #[serde(default)]
    pub l2: String,
}

/// Point-in-time snapshot returned by the session status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWorkflowState {
    pub session_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub current_l1: String,
    #[serde(default)]
    pub current_l2: String,
    pub status: SessionStatus,
    pub start_time: String,
    #[serde(default)]
    pub bell_events: Vec<BellEvent>,
    #[serde(default)]
    pub task_events: Vec<TaskEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResult {
    pub session_id: String,
    pub end_time: String,
    pub final_status: SessionStatus,
    pub event_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartSessionParams {
    pub session_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub l1: String,
    #[serde(default)]
    pub l2: String,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSignalParams {
    pub session_id: String,
    pub signal: SessionSignal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionQueryParams {
    pub session_id: String,
}

pub fn parse_start_session(params: Value) -> Result<StartSessionParams, ErrorInfo> {
    let parsed: StartSessionParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("start_session params are invalid: {}", err),
        )
    })?;
    require_non_empty(&parsed.session_id, "session_id")?;
    require_non_empty(&parsed.agent_id, "agent_id")?;
    Ok(parsed)
}

pub fn parse_session_signal(params: Value) -> Result<SessionSignalParams, ErrorInfo> {
    let parsed: SessionSignalParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("signal_session params are invalid: {}", err),
        )
    })?;
    require_non_empty(&parsed.session_id, "session_id")?;
    parsed.signal.validate()?;
    Ok(parsed)
}

pub fn parse_session_query(params: Value) -> Result<SessionQueryParams, ErrorInfo> {
    let parsed: SessionQueryParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("session query params are invalid: {}", err),
        )
    })?;
    require_non_empty(&parsed.session_id, "session_id")?;
    Ok(parsed)
}

fn require_non_empty(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}
