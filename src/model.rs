//! Core data model.
//!
//! A work item is one document in a topic. Its lease state is never stored
//! as a separate column; it is derived from which of the three lease
//! timestamps are set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work in a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Store-assigned identifier.
    pub id: ItemId,

    /// Topic (collection) the item lives in.
    pub topic: String,

    /// Publisher-supplied value. The queue never interprets it.
    pub payload: serde_json::Value,

    /// Set when the item is claimed, cleared on failure or reclamation.
    pub lease_start: Option<DateTime<Utc>>,

    /// Set at claim time and refreshed while the lease is held.
    pub heartbeat: Option<DateTime<Utc>>,

    /// Set only on successful completion.
    pub lease_end: Option<DateTime<Utc>>,

    /// Accumulated leased time across all attempts. Never decremented.
    pub work_seconds: f64,
}

impl WorkItem {
    /// Derived lease state.
    pub fn state(&self) -> LeaseState {
        if self.lease_end.is_some() {
            LeaseState::Completed
        } else if self.lease_start.is_some() {
            LeaseState::Leased
        } else {
            LeaseState::Unleased
        }
    }

    /// Seconds between `lease_start` and the last recorded heartbeat.
    ///
    /// Zero when either timestamp is missing; clock skew never produces a
    /// negative value.
    pub fn leased_seconds(&self) -> f64 {
        match (self.lease_start, self.heartbeat) {
            (Some(start), Some(beat)) => seconds_between(start, beat),
            _ => 0.0,
        }
    }
}

/// Fractional seconds from `start` to `end`, clamped at zero.
pub(crate) fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start)
        .to_std()
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ItemId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Other(format!("invalid item id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Lease State
// ---------------------------------------------------------------------------

/// Lease state of a work item, derived from its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    /// Claimable.
    Unleased,
    /// Held by exactly one consumer.
    Leased,
    /// Finished successfully. Terminal.
    Completed,
}

impl LeaseState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LeaseState::Completed)
    }
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LeaseState::Unleased => "unleased",
            LeaseState::Leased => "leased",
            LeaseState::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Payload Key
// ---------------------------------------------------------------------------

/// A validated path into an item's payload.
///
/// Keys are dotted paths: `"evaluation_id"` addresses a top-level field,
/// `"state.epoch"` a nested one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PayloadKey {
    raw: String,
    segments: Vec<String>,
}

impl PayloadKey {
    /// Parse a dotted key. Empty keys and empty segments are rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidKey(raw.to_string()));
        }
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(Error::InvalidKey(raw.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Look up the value this key addresses in `payload`.
    pub fn lookup<'a>(&self, payload: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        self.segments
            .iter()
            .try_fold(payload, |node, segment| node.as_object()?.get(segment))
    }

    /// Set the value this key addresses, creating intermediate objects.
    ///
    /// Non-object nodes along the path are replaced by objects.
    pub fn assign(&self, payload: &mut serde_json::Value, value: serde_json::Value) {
        let (last, parents) = match self.segments.split_last() {
            Some(split) => split,
            None => return,
        };
        let mut node = payload;
        for segment in parents {
            node = object_mut(node)
                .entry(segment.clone())
                .or_insert_with(|| serde_json::Value::Object(Default::default()));
        }
        object_mut(node).insert(last.clone(), value);
    }
}

impl std::fmt::Display for PayloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

fn object_mut(node: &mut serde_json::Value) -> &mut serde_json::Map<String, serde_json::Value> {
    if !node.is_object() {
        *node = serde_json::Value::Object(Default::default());
    }
    match node {
        serde_json::Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

/// Value equality as the document store sees it: numbers compare by value,
/// so `1` matches `1.0`.
pub fn values_match(left: &serde_json::Value, right: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_match(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| values_match(v, other)))
        }
        _ => left == right,
    }
}

// ---------------------------------------------------------------------------
// Outcomes and Stats
// ---------------------------------------------------------------------------

/// What `finish_processing` did to the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishOutcome {
    /// Marked completed; work time recorded.
    Completed,
    /// Returned to the unleased pool.
    Requeued,
    /// The lease was no longer held (reclaimed or already finished);
    /// nothing was written.
    LeaseLost,
}

/// Per-topic item counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicStats {
    pub unleased: u64,
    pub leased: u64,
    pub completed: u64,
    pub work_seconds: f64,
}

impl TopicStats {
    pub fn total(&self) -> u64 {
        self.unleased + self.leased + self.completed
    }
}
