//! In-memory flow configuration: triggers and the activities bound to them.
//!
//! All types here are plain values. Readers get clones; nothing hands out
//! shared mutable references into a live [`Config`].

use flowd_protocol::NormalizedEvent;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Schema version this engine reads and writes.
pub const FLOW_CONFIG_VERSION: u32 = 1;

/// A named rule matching normalized events by type and field equality.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTrigger {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub event_type: String,
    /// AND-ed equality constraints; `"*"` always matches.
    #[serde(default, rename = "where")]
    pub where_clause: BTreeMap<String, String>,
}

impl EventTrigger {
    pub fn new(id: &str, event_type: &str) -> Self {
        Self {
            id: id.to_string(),
            label: String::new(),
            event_type: event_type.to_string(),
            where_clause: BTreeMap::new(),
        }
    }

    pub fn with_where(mut self, key: &str, value: &str) -> Self {
        self.where_clause.insert(key.to_string(), value.to_string());
        self
    }
}

/// An activity attached to a trigger, with its own configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityBinding {
    pub activity_id: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl ActivityBinding {
    pub fn new(activity_id: &str) -> Self {
        Self {
            activity_id: activity_id.to_string(),
            config: Map::new(),
        }
    }

    pub fn with_config(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    pub fn config_bool(&self, key: &str) -> bool {
        self.config
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub triggers: Vec<EventTrigger>,
    /// Bindings keyed by trigger id. Entries whose key matches no trigger are
    /// kept at rest but never matched.
    #[serde(default)]
    pub bindings_by_trigger_id: BTreeMap<String, Vec<ActivityBinding>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: FLOW_CONFIG_VERSION,
            triggers: Vec::new(),
            bindings_by_trigger_id: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Fills in the version of a zero-valued replacement.
    pub fn with_defaults(mut self) -> Self {
        if self.version == 0 {
            self.version = FLOW_CONFIG_VERSION;
        }
        self
    }

    pub fn trigger(&self, id: &str) -> Option<&EventTrigger> {
        self.triggers.iter().find(|trigger| trigger.id == id)
    }

    pub fn bindings_for(&self, trigger_id: &str) -> &[ActivityBinding] {
        self.bindings_by_trigger_id
            .get(trigger_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn add_trigger(&mut self, trigger: EventTrigger, bindings: Vec<ActivityBinding>) {
        if !bindings.is_empty() {
            self.bindings_by_trigger_id
                .insert(trigger.id.clone(), bindings);
        }
        self.triggers.push(trigger);
    }
}

/// Immutable payload handed to one activity dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRequest {
    pub event_id: String,
    pub trigger_id: String,
    pub activity_id: String,
    pub event: NormalizedEvent,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tail: Option<String>,
}

impl ActivityRequest {
    pub fn idempotency_key(&self) -> String {
        crate::dedupe::build_idempotency_key(&self.event_id, &self.trigger_id, &self.activity_id)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.event
            .get(crate::normalize::SESSION_ID_KEY)
            .or_else(|| self.event.get("session_id"))
            .map(String::as_str)
    }
}
