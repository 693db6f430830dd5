//! Document store adapter.
//!
//! Every lease transition is a single conditional update: the store applies
//! the write only if the item still matches the predicate named in each
//! method's docs, and reports whether it did. That result is the only
//! synchronization the queue relies on.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{ItemId, PayloadKey, TopicStats, WorkItem};

pub use memory::MemoryStore;

/// How the success path computes the `work_seconds` increment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompletionTime {
    /// Add a caller-computed number of seconds.
    Fixed(f64),
    /// Add the time from `lease_start` to the moment of completion, measured
    /// by the store's clock.
    SinceLeaseStart,
}

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Open an independent handle to the same store, owning its own
    /// connections. Called from inside the runtime that will use it.
    async fn detach(&self) -> Result<Arc<dyn DocumentStore>>;

    /// Insert a new unleased item.
    async fn insert(&self, topic: &str, payload: &serde_json::Value) -> Result<WorkItem>;

    /// Claim one item with `lease_start == null`, setting `lease_start` and
    /// `heartbeat` to now in the same operation.
    async fn claim(&self, topic: &str) -> Result<Option<WorkItem>>;

    /// Set `heartbeat = now` where `id` matches and the item is leased.
    async fn refresh_heartbeat(&self, topic: &str, id: ItemId) -> Result<bool>;

    /// Leased items whose heartbeat is older than `now - grace`.
    async fn find_stale(&self, topic: &str, grace: Duration) -> Result<Vec<WorkItem>>;

    /// Return a stale item to the pool, adding `elapsed_secs` to its
    /// `work_seconds`. The staleness predicate is re-checked at write time.
    async fn reclaim(
        &self,
        topic: &str,
        id: ItemId,
        grace: Duration,
        elapsed_secs: f64,
    ) -> Result<bool>;

    /// Set `lease_end = now` and increment `work_seconds` where the item is
    /// leased.
    async fn complete(&self, topic: &str, id: ItemId, time: CompletionTime) -> Result<bool>;

    /// Clear all lease fields where the item is not completed.
    async fn release(&self, topic: &str, id: ItemId) -> Result<bool>;

    /// First item whose payload value at `key` equals `value`.
    async fn find_by_payload(
        &self,
        topic: &str,
        key: &PayloadKey,
        value: &serde_json::Value,
    ) -> Result<Option<WorkItem>>;

    /// Set the payload value at `key` on the item with `id`.
    async fn set_payload_value(
        &self,
        topic: &str,
        id: ItemId,
        key: &PayloadKey,
        value: &serde_json::Value,
    ) -> Result<bool>;

    async fn get(&self, topic: &str, id: ItemId) -> Result<Option<WorkItem>>;

    /// Topics holding at least one item.
    async fn topics(&self) -> Result<Vec<String>>;

    async fn topic_stats(&self, topic: &str) -> Result<TopicStats>;
}
