//! Communicator: the public API for publishing, leasing, and finishing work.
//!
//! A communicator wraps one document store. Producers `publish` items onto
//! topics; consumers `subscribe` with a handler and call `finish_processing`
//! for each item they receive. Subscription loops, heartbeats, and the
//! optional reaper coordinate only through conditional updates in the store.

pub mod heartbeat;
pub mod reaper;
pub mod subscription;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{FinishOutcome, ItemId, PayloadKey, TopicStats, WorkItem};
use crate::store::{CompletionTime, DocumentStore};
use crate::telemetry::metrics;

pub use reaper::Reaper;
pub use subscription::{Handler, SubscriptionHandle};
use subscription::Subscription;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How a successful finish computes the work time it records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkTimeAccounting {
    /// Time from `lease_start` to completion, on the store's clock.
    #[default]
    LeaseDuration,
    /// `heartbeat - lease_start` as recorded in the item the handler
    /// received. Usually zero, since both are set by the claim.
    ClaimSnapshot,
}

/// Configuration for a communicator.
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    /// Heartbeat interval, and the reaper's sweep interval.
    pub refresh_period: Duration,
    /// How long an idle or busy subscription sleeps between claim attempts.
    pub poll_interval: Duration,
    /// Extra heartbeat age tolerated on top of `refresh_period` before the
    /// reaper reclaims a lease.
    pub stale_margin: Duration,
    /// Delay before the reaper's first sweep.
    pub reaper_startup_delay: Duration,
    /// Run a reaper alongside this communicator.
    pub enable_reaper: bool,
    pub work_time: WorkTimeAccounting,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            refresh_period: Duration::from_secs(crate::config::DEFAULT_REFRESH_PERIOD_SECS),
            poll_interval: Duration::from_secs(10),
            stale_margin: Duration::from_secs(10),
            reaper_startup_delay: Duration::from_secs(2),
            enable_reaper: false,
            work_time: WorkTimeAccounting::default(),
        }
    }
}

impl CommunicatorConfig {
    pub fn with_refresh_period(mut self, period: Duration) -> Self {
        self.refresh_period = period;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_margin(mut self, margin: Duration) -> Self {
        self.stale_margin = margin;
        self
    }

    pub fn with_reaper_startup_delay(mut self, delay: Duration) -> Self {
        self.reaper_startup_delay = delay;
        self
    }

    pub fn with_reaper(mut self, enabled: bool) -> Self {
        self.enable_reaper = enabled;
        self
    }

    pub fn with_work_time(mut self, accounting: WorkTimeAccounting) -> Self {
        self.work_time = accounting;
        self
    }
}

// ---------------------------------------------------------------------------
// Communicator
// ---------------------------------------------------------------------------

/// Handle to the queue. Cheap to clone; clones share subscriptions and
/// the reaper.
pub struct Communicator {
    store: Arc<dyn DocumentStore>,
    config: CommunicatorConfig,
    subscriptions: Arc<Mutex<HashMap<String, Arc<Subscription>>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Clone for Communicator {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            subscriptions: Arc::clone(&self.subscriptions),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl Communicator {
    /// Create a communicator over `store`. Must be called inside a Tokio
    /// runtime when the reaper is enabled.
    pub fn new(store: Arc<dyn DocumentStore>, config: CommunicatorConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);

        if config.enable_reaper {
            let reaper = Reaper::new(Arc::clone(&store), &config);
            tokio::spawn(reaper.run(config.reaper_startup_delay, shutdown_rx));
        }

        Self {
            store,
            config,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Connect to Postgres, run migrations, and build a communicator on it.
    pub async fn connect(url: &str, config: CommunicatorConfig) -> Result<Self> {
        let db = Db::connect(url).await?;
        db.migrate().await?;
        Ok(Self::new(Arc::new(db), config))
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<Subscription>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Publisher
    // -----------------------------------------------------------------------

    /// Insert a new unleased item carrying `payload`.
    pub async fn publish<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> Result<WorkItem> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| Error::Other(format!("payload is not serializable: {e}")))?;
        let item = self.store.insert(topic, &payload).await?;
        metrics::items_published().add(1, &[KeyValue::new("topic", topic.to_string())]);
        info!(topic, item_id = %item.id, "published");
        Ok(item)
    }

    // -----------------------------------------------------------------------
    // Lease manager
    // -----------------------------------------------------------------------

    /// Start consuming `topic`, passing each claimed item to `handler`.
    ///
    /// Returns immediately. Fails with `AlreadySubscribed` if this
    /// communicator already has an active subscription to the topic.
    pub fn subscribe<H: Handler>(&self, topic: &str, handler: H) -> Result<SubscriptionHandle> {
        let subscription = {
            let mut registry = self.registry();
            if registry.get(topic).is_some_and(|s| s.is_active()) {
                return Err(Error::AlreadySubscribed(topic.to_string()));
            }
            let previous = registry.remove(topic).filter(|s| s.holds_lease());
            let subscription = Arc::new(Subscription::new(topic, previous));
            registry.insert(topic.to_string(), Arc::clone(&subscription));
            subscription
        };

        info!(topic, "subscribed");
        Ok(subscription::spawn(
            subscription,
            Arc::clone(&self.store),
            Arc::new(handler),
            self.config.clone(),
        ))
    }

    /// Stop claiming new items on `topic`. An in-flight handler and its
    /// heartbeat are left running.
    pub fn unsubscribe(&self, topic: &str) {
        if let Some(subscription) = self.registry().get(topic) {
            subscription.deactivate();
            info!(topic, "unsubscribed");
        }
    }

    /// True while a subscription to `topic` is claiming work.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.registry().get(topic).is_some_and(|s| s.is_active())
    }

    // -----------------------------------------------------------------------
    // Completion handler
    // -----------------------------------------------------------------------

    /// Finalize a claimed item.
    ///
    /// On success the item is completed and its work time recorded; on
    /// failure it goes back to the unleased pool. If the lease is no longer
    /// held nothing is written and `LeaseLost` is returned. Either way, if
    /// this is the item the topic's subscription has in flight, the
    /// subscription may claim its next one; finishing any other item leaves
    /// the subscription alone.
    pub async fn finish_processing(
        &self,
        topic: &str,
        item: &WorkItem,
        success: bool,
    ) -> Result<FinishOutcome> {
        let written = if success {
            let time = match self.config.work_time {
                WorkTimeAccounting::LeaseDuration => CompletionTime::SinceLeaseStart,
                WorkTimeAccounting::ClaimSnapshot => CompletionTime::Fixed(item.leased_seconds()),
            };
            self.store.complete(topic, item.id, time).await
        } else {
            self.store.release(topic, item.id).await
        };

        let subscription = self.registry().get(topic).cloned();
        if !subscription.is_some_and(|s| s.finish(item.id)) {
            debug!(topic, item_id = %item.id, "item not in flight on this communicator");
        }

        let outcome = match (written?, success) {
            (true, true) => FinishOutcome::Completed,
            (true, false) => FinishOutcome::Requeued,
            (false, _) => FinishOutcome::LeaseLost,
        };

        match outcome {
            FinishOutcome::Completed => {
                info!(topic, item_id = %item.id, "finished successfully");
                if let Some(done) = self.store.get(topic, item.id).await? {
                    metrics::lease_work_seconds().record(
                        done.work_seconds,
                        &[
                            KeyValue::new("topic", topic.to_string()),
                            KeyValue::new("outcome", "completed"),
                        ],
                    );
                }
            }
            FinishOutcome::Requeued => {
                info!(topic, item_id = %item.id, "processing failed, requeued");
            }
            FinishOutcome::LeaseLost => {
                warn!(topic, item_id = %item.id, success, "lease no longer held, nothing written");
            }
        }

        metrics::leases_finished().add(
            1,
            &[
                KeyValue::new("topic", topic.to_string()),
                KeyValue::new("outcome", outcome_label(outcome)),
            ],
        );
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// True if any item in `topic` has `payload[key] == value`, whatever
    /// its lease state.
    pub async fn check_data_exists(
        &self,
        topic: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<bool> {
        Ok(self.lookup(topic, key, value, "check_data_exists").await?.is_some())
    }

    /// First item in `topic` with `payload[key] == value`.
    pub async fn get_value(
        &self,
        topic: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<Option<WorkItem>> {
        self.lookup(topic, key, value, "get_value").await
    }

    /// Set `payload[key] = value` on the item with `item`'s id.
    pub async fn update(
        &self,
        topic: &str,
        item: &WorkItem,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let key = PayloadKey::parse(key)?;
        record_query(topic, "update");
        if !self.store.set_payload_value(topic, item.id, &key, value).await? {
            return Err(Error::NotFound(format!("item {} in topic {topic}", item.id)));
        }
        Ok(())
    }

    /// Point read of one item.
    pub async fn get_item(&self, topic: &str, id: ItemId) -> Result<Option<WorkItem>> {
        self.store.get(topic, id).await
    }

    pub async fn topic_stats(&self, topic: &str) -> Result<TopicStats> {
        self.store.topic_stats(topic).await
    }

    pub async fn topics(&self) -> Result<Vec<String>> {
        self.store.topics().await
    }

    async fn lookup(
        &self,
        topic: &str,
        key: &str,
        value: &serde_json::Value,
        operation: &'static str,
    ) -> Result<Option<WorkItem>> {
        let key = PayloadKey::parse(key)?;
        record_query(topic, operation);
        self.store.find_by_payload(topic, &key, value).await
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Deactivate every subscription and stop the reaper. In-flight
    /// handlers are not interrupted.
    pub fn shutdown(&self) {
        for subscription in self.registry().values() {
            subscription.deactivate();
        }
        let _ = self.shutdown.send(true);
        info!("communicator shut down");
    }
}

fn outcome_label(outcome: FinishOutcome) -> &'static str {
    match outcome {
        FinishOutcome::Completed => "completed",
        FinishOutcome::Requeued => "requeued",
        FinishOutcome::LeaseLost => "lease_lost",
    }
}

fn record_query(topic: &str, operation: &'static str) {
    metrics::queries().add(
        1,
        &[
            KeyValue::new("topic", topic.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}
