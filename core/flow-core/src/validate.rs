//! Semantic validation of a flow [`Config`] against an [`ActivityCatalog`].
//!
//! The first violation found is returned. Identity collisions are
//! `conflict`; malformed or missing values are `bad_request`.

use crate::catalog::{ActivityCatalog, ActivityDef, FieldType};
use crate::error::ValidationError;
use crate::flow::{ActivityBinding, Config, EventTrigger, FLOW_CONFIG_VERSION};
use crate::matcher::is_session_key;
use crate::normalize::is_notify_event_type;
use serde_json::Value;
use std::collections::HashSet;

pub fn validate_config(config: &Config, catalog: &ActivityCatalog) -> Result<(), ValidationError> {
    if config.version != FLOW_CONFIG_VERSION {
        return Err(ValidationError::bad_request(format!(
            "unsupported config version {} (expected {})",
            config.version, FLOW_CONFIG_VERSION
        )));
    }

    let mut seen_ids = HashSet::new();
    for trigger in &config.triggers {
        validate_trigger(trigger)?;
        if !seen_ids.insert(trigger.id.as_str()) {
            return Err(ValidationError::conflict(format!(
                "duplicate trigger id `{}`",
                trigger.id
            )));
        }
    }

    for trigger in &config.triggers {
        validate_bindings(trigger, config.bindings_for(&trigger.id), catalog)?;
    }

    Ok(())
}

pub fn validate_trigger(trigger: &EventTrigger) -> Result<(), ValidationError> {
    if trigger.id.trim().is_empty() {
        return Err(ValidationError::bad_request("trigger id is required"));
    }
    if trigger.event_type.trim().is_empty() {
        return Err(ValidationError::bad_request(format!(
            "trigger `{}`: event_type is required",
            trigger.id
        )));
    }

    // Notify payloads carry timestamps and free text that never repeat, so a
    // session-scoped notify trigger may only constrain the session.
    let session_scoped = trigger
        .where_clause
        .keys()
        .any(|key| is_session_key(&key.trim().to_lowercase()));
    if session_scoped && is_notify_event_type(&trigger.event_type) {
        if let Some(key) = trigger
            .where_clause
            .keys()
            .find(|key| !is_session_key(&key.trim().to_lowercase()))
        {
            return Err(ValidationError::bad_request(format!(
                "trigger `{}`: `{}` triggers scoped to a session may only match on session.id, found `{}`",
                trigger.id, trigger.event_type, key
            )));
        }
    }

    Ok(())
}

fn validate_bindings(
    trigger: &EventTrigger,
    bindings: &[ActivityBinding],
    catalog: &ActivityCatalog,
) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for binding in bindings {
        let activity_id = binding.activity_id.trim();
        if activity_id.is_empty() {
            return Err(ValidationError::bad_request(format!(
                "trigger `{}`: binding activity_id is required",
                trigger.id
            )));
        }
        if !seen.insert(activity_id) {
            return Err(ValidationError::conflict(format!(
                "trigger `{}`: activity `{}` is bound more than once",
                trigger.id, activity_id
            )));
        }
        let def = catalog.get(activity_id).ok_or_else(|| {
            ValidationError::conflict(format!(
                "trigger `{}`: unknown activity `{}`",
                trigger.id, activity_id
            ))
        })?;
        validate_binding_config(trigger, binding, def)?;
    }
    Ok(())
}

fn validate_binding_config(
    trigger: &EventTrigger,
    binding: &ActivityBinding,
    def: &ActivityDef,
) -> Result<(), ValidationError> {
    for field in &def.fields {
        let value = binding.config.get(&field.key).filter(|v| !v.is_null());
        let value = match value {
            Some(value) => value,
            None if field.required => {
                return Err(ValidationError::bad_request(format!(
                    "trigger `{}`: activity `{}` requires `{}`",
                    trigger.id, def.id, field.key
                )))
            }
            None => continue,
        };

        if !value_has_type(value, field.field_type) {
            return Err(ValidationError::bad_request(format!(
                "trigger `{}`: activity `{}` field `{}` must be {}",
                trigger.id,
                def.id,
                field.key,
                field.field_type.as_str()
            )));
        }

        if field.required && field.field_type == FieldType::String {
            let blank = value.as_str().map(|s| s.trim().is_empty()).unwrap_or(true);
            if blank {
                return Err(ValidationError::bad_request(format!(
                    "trigger `{}`: activity `{}` requires `{}`",
                    trigger.id, def.id, field.key
                )));
            }
        }
    }
    Ok(())
}

fn value_has_type(value: &Value, field_type: FieldType) -> bool {
    match field_type {
        FieldType::String => value.is_string(),
        FieldType::Bool => value.is_boolean(),
        FieldType::Int => is_integral(value),
    }
}

/// Any JSON number whose value is integral (`3`, `3.0`, `-7`).
fn is_integral(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            n.is_i64()
                || n.is_u64()
                || n.as_f64()
                    .map(|f| f.is_finite() && f.fract() == 0.0)
                    .unwrap_or(false)
        }
        _ => false,
    }
}
