//! Journal replay helpers shared by the router and session recovery.
//!
//! A history splits at the applied cursor: signals at or below it are
//! replayed into state without side effects, later ones still need to run.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::journal::{HistoryEntry, HistoryRecord};

#[derive(Debug, Clone, PartialEq)]
pub struct ReplaySignal<T> {
    pub seq: i64,
    pub recorded_at: DateTime<Utc>,
    pub signal: T,
}

/// Decodes the signal entries of `history` and splits them into
/// `(applied, pending)` around `applied_through`. Effects are skipped;
/// callers look them up with [`HistoryRecord::find_effect`].
pub fn split_signals<T: DeserializeOwned>(
    history: &[HistoryRecord],
    applied_through: i64,
) -> (Vec<ReplaySignal<T>>, Vec<ReplaySignal<T>>) {
    let mut applied = Vec::new();
    let mut pending = Vec::new();

    for record in history {
        let payload = match &record.entry {
            HistoryEntry::Signal { payload, .. } => payload,
            HistoryEntry::Effect { .. } => continue,
        };
        let signal: T = match serde_json::from_value(payload.clone()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(
                    error = %err,
                    seq = record.seq,
                    "Skipping undecodable signal during replay"
                );
                continue;
            }
        };
        let replayed = ReplaySignal {
            seq: record.seq,
            recorded_at: record.recorded_at,
            signal,
        };
        if record.seq <= applied_through {
            applied.push(replayed);
        } else {
            pending.push(replayed);
        }
    }

    (applied, pending)
}
