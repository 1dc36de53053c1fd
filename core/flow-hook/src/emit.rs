//! Event forwarding.
//!
//! `emit` reads one source event as JSON from stdin, normalizes it locally and
//! forwards the flat field map to the router. `notify` builds a notify payload
//! from command-line assignments. Both compute the event id here so that a
//! retried delivery dedupes on the daemon side.

use flow_core::normalize::NotifyPayload;
use flow_core::{build_event_id, normalize, SourceEvent};
use flowd_protocol::EventSignal;
use serde_json::{Map, Value};
use std::io::{self, Read};

use crate::daemon_client;
use crate::error::HookError;

pub fn run_emit() -> Result<Option<Value>, HookError> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;

    if input.trim().is_empty() {
        tracing::debug!("Empty stdin; nothing to emit");
        return Ok(None);
    }

    match signal_from_source(&input)? {
        Some(signal) => {
            tracing::debug!(event_id = %signal.event_id, "Emitting source event");
            daemon_client::send_event(&signal).map(Some)
        }
        None => {
            tracing::debug!("Source event normalized to nothing; skipping");
            Ok(None)
        }
    }
}

pub fn run_notify(
    event_type: &str,
    session_id: Option<&str>,
    assignments: &[String],
) -> Result<Value, HookError> {
    let payload = notify_payload(event_type, session_id, assignments)?;
    let signal = signal_for(&SourceEvent::Notify(payload))
        .ok_or_else(|| HookError::InvalidInput("notify payload is empty".to_string()))?;
    daemon_client::send_event(&signal)
}

/// Parses and normalizes one source event. Unknown source kinds normalize to
/// an empty map and yield `None`.
pub fn signal_from_source(input: &str) -> Result<Option<EventSignal>, HookError> {
    let event: SourceEvent = serde_json::from_str(input)
        .map_err(|err| HookError::InvalidInput(format!("Invalid source event: {}", err)))?;
    Ok(signal_for(&event))
}

fn signal_for(event: &SourceEvent) -> Option<EventSignal> {
    let fields = normalize(event);
    if fields.is_empty() {
        return None;
    }
    let mut signal = EventSignal::new(fields);
    signal.event_id = build_event_id(&signal.fields);
    Some(signal)
}

pub fn notify_payload(
    event_type: &str,
    session_id: Option<&str>,
    assignments: &[String],
) -> Result<NotifyPayload, HookError> {
    let mut payload = parse_assignments(assignments)?;
    payload.insert("type".to_string(), Value::String(event_type.to_string()));
    if let Some(session_id) = session_id.filter(|id| !id.trim().is_empty()) {
        payload.insert("session_id".to_string(), Value::String(session_id.to_string()));
    }
    Ok(NotifyPayload { payload })
}

/// Parses `key=value` pairs. Values are kept as strings; the first `=` splits.
pub fn parse_assignments(assignments: &[String]) -> Result<Map<String, Value>, HookError> {
    let mut map = Map::new();
    for assignment in assignments {
        let (key, value) = assignment.split_once('=').ok_or_else(|| {
            HookError::InvalidInput(format!("Expected key=value, got '{}'", assignment))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(HookError::InvalidInput(format!(
                "Empty key in '{}'",
                assignment
            )));
        }
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(map)
}
