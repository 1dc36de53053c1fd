//! Trigger matching against normalized events.
//!
//! Matching is flat: event type equality plus AND-ed field equality, all
//! case-insensitive. The one exception is the session id key, which accepts
//! numbered instances of an agent (`"coder"` matches `"coder 3"`) unless the
//! trigger pins a specific number itself.

use crate::flow::{ActivityBinding, Config, EventTrigger};
use crate::normalize::{SESSION_ID_KEY, TYPE_KEY};
use flowd_protocol::NormalizedEvent;

pub const WILDCARD: &str = "*";
const SESSION_ID_ALT_KEY: &str = "session_id";

/// One `(trigger, binding)` pair selected for an event.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedBinding {
    pub trigger: EventTrigger,
    pub binding: ActivityBinding,
}

pub fn matches(trigger: &EventTrigger, normalized: &NormalizedEvent) -> bool {
    let expected_type = trigger.event_type.trim();
    if expected_type.is_empty() {
        return false;
    }
    let actual_type = match normalized.get(TYPE_KEY) {
        Some(value) => value,
        None => return false,
    };
    if !expected_type.eq_ignore_ascii_case(actual_type.trim()) {
        return false;
    }

    trigger.where_clause.iter().all(|(key, expected)| {
        if expected == WILDCARD {
            return true;
        }
        let key = key.trim().to_lowercase();
        let actual = match lookup(normalized, &key) {
            Some(actual) => actual,
            None => return false,
        };
        if is_session_key(&key) {
            session_id_matches(expected, actual)
        } else {
            expected.trim().eq_ignore_ascii_case(actual.trim())
        }
    })
}

/// Ordered cross-product of matching triggers and their bindings. Trigger
/// order follows `config.triggers`; bindings keep their configured order.
pub fn match_bindings(config: &Config, normalized: &NormalizedEvent) -> Vec<MatchedBinding> {
    let mut matched = Vec::new();
    for trigger in &config.triggers {
        if !matches(trigger, normalized) {
            continue;
        }
        for binding in config.bindings_for(&trigger.id) {
            matched.push(MatchedBinding {
                trigger: trigger.clone(),
                binding: binding.clone(),
            });
        }
    }
    matched
}

pub fn is_session_key(key: &str) -> bool {
    key == SESSION_ID_KEY || key == SESSION_ID_ALT_KEY
}

fn lookup<'a>(normalized: &'a NormalizedEvent, key: &str) -> Option<&'a String> {
    normalized.get(key).or_else(|| match key {
        SESSION_ID_ALT_KEY => normalized.get(SESSION_ID_KEY),
        SESSION_ID_KEY => normalized.get(SESSION_ID_ALT_KEY),
        _ => None,
    })
}

/// Relaxed session id comparison.
///
/// - empty expected matches anything
/// - expected ending in a numeric token only matches exactly
/// - otherwise `actual` may be `expected + " " + <digits>`
pub fn session_id_matches(expected: &str, actual: &str) -> bool {
    let expected = expected.trim().to_lowercase();
    let actual = actual.trim().to_lowercase();
    if expected.is_empty() || expected == actual {
        return true;
    }
    if ends_with_numeric_token(&expected) {
        return false;
    }
    actual
        .strip_prefix(expected.as_str())
        .and_then(|rest| rest.strip_prefix(' '))
        .map(|digits| !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()))
        .unwrap_or(false)
}

fn ends_with_numeric_token(value: &str) -> bool {
    value
        .split_whitespace()
        .last()
        .map(|token| token.chars().all(|ch| ch.is_ascii_digit()))
        .unwrap_or(false)
}
