//! Catalog of dispatchable activity kinds.
//!
//! Built once at startup and passed by reference to whoever needs it (the
//! validator, the daemon's catalog query). There is no global registry.

use serde::{Deserialize, Serialize};

pub const SEND_TO_TERMINAL: &str = "send_to_terminal";
pub const WEBHOOK: &str = "webhook";
pub const TOAST: &str = "toast";

/// Binding config key that asks `send_to_terminal` to attach recent output.
pub const INCLUDE_OUTPUT_KEY: &str = "include_output";
pub const OUTPUT_LINES_KEY: &str = "output_lines";
pub const DEFAULT_OUTPUT_LINES: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Bool,
    Int,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Bool => "bool",
            FieldType::Int => "int",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityField {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityDef {
    pub id: String,
    pub label: String,
    pub description: String,
    pub fields: Vec<ActivityField>,
}

impl ActivityDef {
    pub fn field(&self, key: &str) -> Option<&ActivityField> {
        self.fields.iter().find(|field| field.key == key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityCatalog {
    activities: Vec<ActivityDef>,
}

impl ActivityCatalog {
    pub fn new(activities: Vec<ActivityDef>) -> Self {
        Self { activities }
    }

    /// The activity kinds this build can dispatch.
    pub fn builtin() -> Self {
        Self::new(vec![
            ActivityDef {
                id: SEND_TO_TERMINAL.to_string(),
                label: "Send to terminal".to_string(),
                description: "Writes a message into the target session's terminal.".to_string(),
                fields: vec![
                    field("message", "Message", FieldType::String, true),
                    field(INCLUDE_OUTPUT_KEY, "Include terminal output", FieldType::Bool, false),
                    field(OUTPUT_LINES_KEY, "Output lines", FieldType::Int, false),
                ],
            },
            ActivityDef {
                id: WEBHOOK.to_string(),
                label: "Webhook".to_string(),
                description: "Posts the event to an HTTP endpoint with an Idempotency-Key header."
                    .to_string(),
                fields: vec![
                    field("url", "URL", FieldType::String, true),
                    field("method", "Method", FieldType::String, false),
                    field("timeout_secs", "Timeout (seconds)", FieldType::Int, false),
                ],
            },
            ActivityDef {
                id: TOAST.to_string(),
                label: "Toast".to_string(),
                description: "Publishes a desktop notification.".to_string(),
                fields: vec![
                    field("title", "Title", FieldType::String, false),
                    field("message", "Message", FieldType::String, true),
                ],
            },
        ])
    }

    pub fn get(&self, id: &str) -> Option<&ActivityDef> {
        self.activities.iter().find(|def| def.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn activities(&self) -> &[ActivityDef] {
        &self.activities
    }
}

fn field(key: &str, label: &str, field_type: FieldType, required: bool) -> ActivityField {
    ActivityField {
        key: key.to_string(),
        label: label.to_string(),
        field_type,
        required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_has_unique_ids() {
        let catalog = ActivityCatalog::builtin();
        let mut ids: Vec<_> = catalog.activities().iter().map(|a| a.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), catalog.activities().len());
    }

    #[test]
    fn send_to_terminal_declares_output_fields() {
        let catalog = ActivityCatalog::builtin();
        let def = catalog.get(SEND_TO_TERMINAL).expect("send_to_terminal exists");
        assert_eq!(
            def.field(INCLUDE_OUTPUT_KEY).map(|f| f.field_type),
            Some(FieldType::Bool)
        );
        assert_eq!(
            def.field(OUTPUT_LINES_KEY).map(|f| f.field_type),
            Some(FieldType::Int)
        );
        assert!(def.field("message").unwrap().required);
    }
}
