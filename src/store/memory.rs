//! In-process document store.
//!
//! Same conditional-update semantics as the Postgres store, with every
//! operation running under one mutex. Clones share state, so a detached
//! handle used from another thread sees the same items.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CompletionTime, DocumentStore};
use crate::error::Result;
use crate::model::{
    ItemId, LeaseState, PayloadKey, TopicStats, WorkItem, seconds_between, values_match,
};

type Topics = BTreeMap<String, Vec<WorkItem>>;

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    topics: Arc<Mutex<Topics>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Topics> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to the item if it exists, returning what `f` returned.
    fn with_item<T>(
        &self,
        topic: &str,
        id: ItemId,
        f: impl FnOnce(&mut WorkItem) -> T,
    ) -> Option<T> {
        let mut topics = self.lock();
        topics
            .get_mut(topic)
            .and_then(|items| items.iter_mut().find(|item| item.id == id))
            .map(f)
    }
}

fn stale_cutoff(grace: Duration) -> DateTime<Utc> {
    let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(grace)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn is_stale(item: &WorkItem, cutoff: DateTime<Utc>) -> bool {
    item.state() == LeaseState::Leased && item.heartbeat.is_some_and(|beat| beat < cutoff)
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn detach(&self) -> Result<Arc<dyn DocumentStore>> {
        Ok(Arc::new(self.clone()))
    }

    async fn insert(&self, topic: &str, payload: &serde_json::Value) -> Result<WorkItem> {
        let item = WorkItem {
            id: ItemId::new(),
            topic: topic.to_string(),
            payload: payload.clone(),
            lease_start: None,
            heartbeat: None,
            lease_end: None,
            work_seconds: 0.0,
        };
        self.lock()
            .entry(topic.to_string())
            .or_default()
            .push(item.clone());
        Ok(item)
    }

    async fn claim(&self, topic: &str) -> Result<Option<WorkItem>> {
        let mut topics = self.lock();
        let Some(items) = topics.get_mut(topic) else {
            return Ok(None);
        };
        let claimed = items
            .iter_mut()
            .find(|item| item.lease_start.is_none())
            .map(|item| {
                let now = Utc::now();
                item.lease_start = Some(now);
                item.heartbeat = Some(now);
                item.clone()
            });
        Ok(claimed)
    }

    async fn refresh_heartbeat(&self, topic: &str, id: ItemId) -> Result<bool> {
        let refreshed = self.with_item(topic, id, |item| {
            if item.state() != LeaseState::Leased {
                return false;
            }
            item.heartbeat = Some(Utc::now());
            true
        });
        Ok(refreshed.unwrap_or(false))
    }

    async fn find_stale(&self, topic: &str, grace: Duration) -> Result<Vec<WorkItem>> {
        let cutoff = stale_cutoff(grace);
        let topics = self.lock();
        Ok(topics
            .get(topic)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| is_stale(item, cutoff))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn reclaim(
        &self,
        topic: &str,
        id: ItemId,
        grace: Duration,
        elapsed_secs: f64,
    ) -> Result<bool> {
        let cutoff = stale_cutoff(grace);
        let reclaimed = self.with_item(topic, id, |item| {
            if !is_stale(item, cutoff) {
                return false;
            }
            item.work_seconds += elapsed_secs.max(0.0);
            item.lease_start = None;
            item.heartbeat = None;
            item.lease_end = None;
            true
        });
        Ok(reclaimed.unwrap_or(false))
    }

    async fn complete(&self, topic: &str, id: ItemId, time: CompletionTime) -> Result<bool> {
        let completed = self.with_item(topic, id, |item| {
            if item.state() != LeaseState::Leased {
                return false;
            }
            let now = Utc::now();
            let increment = match time {
                CompletionTime::Fixed(secs) => secs,
                CompletionTime::SinceLeaseStart => item
                    .lease_start
                    .map(|start| seconds_between(start, now))
                    .unwrap_or(0.0),
            };
            item.work_seconds += increment.max(0.0);
            item.lease_end = Some(now);
            true
        });
        Ok(completed.unwrap_or(false))
    }

    async fn release(&self, topic: &str, id: ItemId) -> Result<bool> {
        let released = self.with_item(topic, id, |item| {
            if item.state().is_terminal() {
                return false;
            }
            item.lease_start = None;
            item.heartbeat = None;
            item.lease_end = None;
            true
        });
        Ok(released.unwrap_or(false))
    }

    async fn find_by_payload(
        &self,
        topic: &str,
        key: &PayloadKey,
        value: &serde_json::Value,
    ) -> Result<Option<WorkItem>> {
        let topics = self.lock();
        Ok(topics.get(topic).and_then(|items| {
            items
                .iter()
                .find(|item| {
                    key.lookup(&item.payload)
                        .is_some_and(|found| values_match(found, value))
                })
                .cloned()
        }))
    }

    async fn set_payload_value(
        &self,
        topic: &str,
        id: ItemId,
        key: &PayloadKey,
        value: &serde_json::Value,
    ) -> Result<bool> {
        let updated = self.with_item(topic, id, |item| {
            key.assign(&mut item.payload, value.clone());
        });
        Ok(updated.is_some())
    }

    async fn get(&self, topic: &str, id: ItemId) -> Result<Option<WorkItem>> {
        Ok(self.with_item(topic, id, |item| item.clone()))
    }

    async fn topics(&self) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(topic, _)| topic.clone())
            .collect())
    }

    async fn topic_stats(&self, topic: &str) -> Result<TopicStats> {
        let topics = self.lock();
        let mut stats = TopicStats::default();
        for item in topics.get(topic).into_iter().flatten() {
            match item.state() {
                LeaseState::Unleased => stats.unleased += 1,
                LeaseState::Leased => stats.leased += 1,
                LeaseState::Completed => stats.completed += 1,
            }
            stats.work_seconds += item.work_seconds;
        }
        Ok(stats)
    }
}
