//! Event ids, dedupe window and idempotency keys.
//!
//! Event ids are derived from the normalized fields alone, so the same event
//! delivered twice (or re-emitted during replay) hashes to the same id.

use flowd_protocol::NormalizedEvent;
use std::collections::{HashSet, VecDeque};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
pub const DISPATCH_IDENTITY_PREFIX: &str = "flow";
pub const DEFAULT_DEDUPE_CAPACITY: usize = 1024;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Deterministic id for a field map: FNV-1a (64-bit) over the key-sorted
/// pairs, each key and value followed by a NUL byte. Empty map gives `""`.
pub fn build_event_id(fields: &NormalizedEvent) -> String {
    if fields.is_empty() {
        return String::new();
    }
    // BTreeMap iteration is already key-sorted.
    let mut hash = FNV_OFFSET_BASIS;
    for (key, value) in fields {
        hash = fnv1a(hash, key.as_bytes());
        hash = fnv1a(hash, &[0]);
        hash = fnv1a(hash, value.as_bytes());
        hash = fnv1a(hash, &[0]);
    }
    format!("{:016x}", hash)
}

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// `eventID/triggerID/activityID`; empty only when all three parts are.
pub fn build_idempotency_key(event_id: &str, trigger_id: &str, activity_id: &str) -> String {
    if event_id.is_empty() && trigger_id.is_empty() && activity_id.is_empty() {
        return String::new();
    }
    format!("{}/{}/{}", event_id, trigger_id, activity_id)
}

/// Durable identity of one dispatch execution.
pub fn dispatch_identity(event_id: &str, trigger_id: &str, activity_id: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        DISPATCH_IDENTITY_PREFIX, event_id, trigger_id, activity_id
    )
}

/// Bounded FIFO seen-set.
///
/// `seen` records an id the first time and reports repeats while the id is
/// still inside the window. Oldest ids are evicted first; an evicted id is
/// new again.
#[derive(Debug, Clone)]
pub struct EventDeduper {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl EventDeduper {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    pub fn seen(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.members.insert(id.to_string());
        false
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventDeduper {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUPE_CAPACITY)
    }
}
