//! Event normalization.
//!
//! Every source event (file watcher, config changes, workflow and agent
//! lifecycle, terminal lifecycle, free-form notify payloads) is reduced to a
//! flat [`NormalizedEvent`] so trigger matching never needs to know where an
//! event came from.
//!
//! Rules:
//! - keys are trimmed and lower-cased
//! - empty values are dropped, never stored as `""`
//! - `type` is always present and is written before anything else
//! - nested maps are flattened under a prefix (`context.`, `data.`); only
//!   scalar values survive, objects and arrays are skipped

use chrono::{DateTime, SecondsFormat, Utc};
use flowd_protocol::{canonical_field, NormalizedEvent};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const TYPE_KEY: &str = "type";
pub const TIMESTAMP_KEY: &str = "timestamp";
pub const SESSION_ID_KEY: &str = "session.id";
pub const AGENT_ID_KEY: &str = "agent.id";

/// Fallback category for notify payloads whose type is not recognized.
pub const DEFAULT_NOTIFY_TYPE: &str = "notify";

/// Canonical notify event types. The validator uses this closed set for its
/// session-scoping rule.
pub const NOTIFY_EVENT_TYPES: &[&str] = &[
    "agent-turn-complete",
    "approval-requested",
    "plan-new",
    "plan-update",
    "task-complete",
    DEFAULT_NOTIFY_TYPE,
];

const NOTIFY_TYPE_ALIASES: &[(&str, &str)] = &[
    ("new-plan", "plan-new"),
    ("plan-created", "plan-new"),
    ("progress", "plan-update"),
    ("plan-updated", "plan-update"),
    ("turn-complete", "agent-turn-complete"),
    ("agent-turn-completed", "agent-turn-complete"),
    ("approval-request", "approval-requested"),
    ("permission-request", "approval-requested"),
    ("done", "task-complete"),
    ("task-completed", "task-complete"),
];

static RE_TOKEN_SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

// ─────────────────────────────────────────────────────────────────────────────
// Source events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourceEvent {
    FileChange(FileChangeEvent),
    ConfigChange(ConfigChangeEvent),
    Workflow(WorkflowLifecycleEvent),
    Agent(AgentLifecycleEvent),
    Terminal(TerminalLifecycleEvent),
    Notify(NotifyPayload),
    /// Any source kind this build does not know about. Normalizes to an
    /// empty map.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub path: String,
    /// `create`, `modify`, `remove`, `rename`, as reported by the watcher.
    pub op: String,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigChangeEvent {
    pub scope: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventKind {
    WorkflowStarted,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCompleted,
    NotifyEvent,
}

impl WorkflowEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowEventKind::WorkflowStarted => "workflow_started",
            WorkflowEventKind::WorkflowPaused => "workflow_paused",
            WorkflowEventKind::WorkflowResumed => "workflow_resumed",
            WorkflowEventKind::WorkflowCompleted => "workflow_completed",
            WorkflowEventKind::NotifyEvent => "notify_event",
        }
    }
}

/// Lifecycle event emitted by a session state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowLifecycleEvent {
    pub kind: WorkflowEventKind,
    pub session_id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLifecycleEvent {
    /// `started`, `stopped`, `crashed`, ...
    pub kind: String,
    pub agent_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalLifecycleEvent {
    /// `started`, `exited`, ...
    pub kind: String,
    pub session_id: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Free-form payload sent by agents and scripts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotifyPayload {
    #[serde(default)]
    pub payload: Map<String, Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Normalization
// ─────────────────────────────────────────────────────────────────────────────

/// Reduces a source event to its normalized field map. Pure and total.
pub fn normalize(event: &SourceEvent) -> NormalizedEvent {
    match event {
        SourceEvent::FileChange(event) => {
            let mut fields = Fields::with_type("file_changed");
            fields.set("path", &event.path);
            fields.set("op", &event.op.to_lowercase());
            fields.set_opt("root", event.root.as_deref());
            fields.set_time(event.timestamp);
            fields.finish()
        }
        SourceEvent::ConfigChange(event) => {
            let mut fields = Fields::with_type("config_changed");
            fields.set("scope", &event.scope);
            fields.set_opt("path", event.path.as_deref());
            fields.set_opt("key", event.key.as_deref());
            fields.set_time(event.timestamp);
            fields.finish()
        }
        SourceEvent::Workflow(event) => normalize_workflow(event),
        SourceEvent::Agent(event) => {
            let mut fields = Fields::with_type(&format!("agent_{}", normalize_token(&event.kind)));
            fields.set(AGENT_ID_KEY, &event.agent_id);
            fields.set_opt(SESSION_ID_KEY, event.session_id.as_deref());
            fields.flatten("context.", &event.context);
            fields.set_time(event.timestamp);
            fields.finish()
        }
        SourceEvent::Terminal(event) => {
            let mut fields =
                Fields::with_type(&format!("terminal_{}", normalize_token(&event.kind)));
            fields.set(SESSION_ID_KEY, &event.session_id);
            if let Some(code) = event.exit_code {
                fields.set("exit_code", &code.to_string());
            }
            fields.set_time(event.timestamp);
            fields.finish()
        }
        SourceEvent::Notify(event) => normalize_notify(&event.payload),
        SourceEvent::Unknown => NormalizedEvent::new(),
    }
}

pub fn normalize_workflow(event: &WorkflowLifecycleEvent) -> NormalizedEvent {
    let mut fields = Fields::with_type(event.kind.as_str());
    fields.set(SESSION_ID_KEY, &event.session_id);
    fields.set(AGENT_ID_KEY, &event.agent_id);
    fields.set_opt("status", event.status.as_deref());
    fields.set_opt("context", event.context.as_deref());
    fields.flatten("data.", &event.data);
    fields.set_time(event.timestamp);
    fields.finish()
}

fn normalize_notify(payload: &Map<String, Value>) -> NormalizedEvent {
    let raw_type = ["type", "event_type", "event"]
        .iter()
        .find_map(|wanted| {
            payload
                .iter()
                .find(|(key, _)| key.trim().to_lowercase() == *wanted)
                .and_then(|(_, value)| value.as_str())
        })
        .unwrap_or_default();
    let canonical = canonical_notify_type(raw_type);

    let mut fields = Fields::with_type(&canonical);
    if canonical == DEFAULT_NOTIFY_TYPE && normalize_token(raw_type) != DEFAULT_NOTIFY_TYPE {
        fields.set("notify.raw_type", raw_type);
    }

    for (key, value) in payload {
        match key.trim().to_lowercase().as_str() {
            "type" | "event_type" | "event" => {}
            "session_id" | "session.id" | "sessionid" => {
                if let Some(value) = scalar_to_string(value) {
                    fields.set(SESSION_ID_KEY, &value);
                }
            }
            "context" => match value {
                Value::Object(map) => fields.flatten("context.", map),
                other => {
                    if let Some(value) = scalar_to_string(other) {
                        fields.set("context", &value);
                    }
                }
            },
            "data" => {
                if let Value::Object(map) = value {
                    fields.flatten("data.", map);
                }
            }
            "timestamp" => {
                let parsed = value
                    .as_str()
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|dt| dt.with_timezone(&Utc));
                fields.set_time(parsed);
            }
            _ => {
                if let Some(value) = scalar_to_string(value) {
                    fields.set(key, &value);
                }
            }
        }
    }

    fields.finish()
}

/// Lower-cases a token and collapses every run of non-alphanumeric
/// characters into a single `-`.
pub fn normalize_token(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    RE_TOKEN_SEPARATORS
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}

/// Maps a free-form notify type onto the canonical set, falling back to
/// [`DEFAULT_NOTIFY_TYPE`].
pub fn canonical_notify_type(raw: &str) -> String {
    let token = normalize_token(raw);
    let aliased = NOTIFY_TYPE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == token)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(token.as_str());

    if NOTIFY_EVENT_TYPES.contains(&aliased) {
        aliased.to_string()
    } else {
        DEFAULT_NOTIFY_TYPE.to_string()
    }
}

pub fn is_notify_event_type(event_type: &str) -> bool {
    let lowered = event_type.trim().to_lowercase();
    NOTIFY_EVENT_TYPES.contains(&lowered.as_str())
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

struct Fields {
    inner: NormalizedEvent,
}

impl Fields {
    fn with_type(event_type: &str) -> Self {
        let mut fields = Self {
            inner: NormalizedEvent::new(),
        };
        fields.set(TYPE_KEY, event_type);
        fields
    }

    fn set(&mut self, key: &str, value: &str) {
        let Some((key, value)) = canonical_field(key, value) else {
            return;
        };
        if key == TYPE_KEY && self.inner.contains_key(TYPE_KEY) {
            return;
        }
        self.inner.insert(key, value);
    }

    fn set_opt(&mut self, key: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.set(key, value);
        }
    }

    fn set_time(&mut self, timestamp: Option<DateTime<Utc>>) {
        if let Some(timestamp) = timestamp {
            self.set(TIMESTAMP_KEY, &format_timestamp(timestamp));
        }
    }

    fn flatten(&mut self, prefix: &str, map: &Map<String, Value>) {
        for (key, value) in map {
            if let Some(value) = scalar_to_string(value) {
                self.set(&format!("{}{}", prefix, key.trim()), &value);
            }
        }
    }

    fn finish(self) -> NormalizedEvent {
        self.inner
    }
}
