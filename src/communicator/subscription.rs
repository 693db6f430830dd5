//! Lease manager: the per-topic subscribe loop.
//!
//! A subscription claims at most one item at a time. After a claim it
//! starts a heartbeat, marks itself processing, and awaits the handler;
//! it does not claim again until `finish_processing` clears the flag.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, warn};

use super::CommunicatorConfig;
use super::heartbeat::{self, HeartbeatHandle};
use crate::error::{Error, Result};
use crate::model::{ItemId, WorkItem};
use crate::store::DocumentStore;
use crate::telemetry::lease::{record_lease_transition, start_lease_span};
use crate::telemetry::metrics;

/// Receives claimed items.
///
/// The handler owns the lease until it (or someone holding the
/// communicator) calls `finish_processing` for the item.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, item: WorkItem);
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, item: WorkItem) {
        (self)(item).await
    }
}

/// The item a subscription is processing, with its refresher if one started.
#[derive(Debug)]
struct Lease {
    item_id: ItemId,
    heartbeat: Option<HeartbeatHandle>,
}

/// State of one subscription, shared between the communicator and the
/// loop task.
#[derive(Debug)]
pub(crate) struct Subscription {
    topic: String,
    active: AtomicBool,
    processing: AtomicBool,
    wake: Notify,
    lease: Mutex<Option<Lease>>,
    /// Earlier subscription to the same topic whose handler still holds a
    /// lease. Kept so that lease can be finished and its heartbeat runs
    /// until then.
    previous: Mutex<Option<Arc<Subscription>>>,
}

impl Subscription {
    pub(crate) fn new(topic: &str, previous: Option<Arc<Subscription>>) -> Self {
        Self {
            topic: topic.to_string(),
            active: AtomicBool::new(true),
            processing: AtomicBool::new(false),
            wake: Notify::new(),
            lease: Mutex::new(None),
            previous: Mutex::new(previous),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// True while this subscription, or one it replaced, has an unfinished
    /// lease.
    pub(crate) fn holds_lease(&self) -> bool {
        self.lock_lease().is_some() || lock(&self.previous).is_some()
    }

    /// Stop claiming new items. An in-flight handler keeps running.
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.wake.notify_one();
    }

    /// Release the in-flight slot held for `item_id`: stop its heartbeat,
    /// clear the processing flag, and wake the loop.
    ///
    /// Any other item leaves this subscription untouched. Returns whether
    /// `item_id` was held here or by a replaced subscription.
    pub(crate) fn finish(&self, item_id: ItemId) -> bool {
        let lease = {
            let mut lease = self.lock_lease();
            match lease.as_ref() {
                Some(l) if l.item_id == item_id => lease.take(),
                _ => None,
            }
        };

        let Some(lease) = lease else {
            return self.finish_previous(item_id);
        };
        if let Some(h) = lease.heartbeat {
            h.stop();
        }
        self.processing.store(false, Ordering::Release);
        self.wake.notify_one();
        true
    }

    fn finish_previous(&self, item_id: ItemId) -> bool {
        let mut previous = lock(&self.previous);
        let Some(prev) = previous.as_ref() else {
            return false;
        };
        let finished = prev.finish(item_id);
        if !prev.holds_lease() {
            *previous = None;
        }
        finished
    }

    fn begin(&self, item_id: ItemId, heartbeat: Option<HeartbeatHandle>) {
        let replaced = self.lock_lease().replace(Lease { item_id, heartbeat });
        self.processing.store(true, Ordering::Release);
        if let Some(Lease {
            heartbeat: Some(h), ..
        }) = replaced
        {
            h.stop();
        }
    }

    fn lock_lease(&self) -> MutexGuard<'_, Option<Lease>> {
        lock(&self.lease)
    }

    /// Sleep for `interval`, returning early when finished or deactivated.
    async fn wait(&self, interval: Duration) {
        let _ = tokio::time::timeout(interval, self.wake.notified()).await;
    }
}

/// Handle to a running subscription loop.
///
/// Dropping it detaches the loop; use `unsubscribe` to stop it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    topic: String,
    task: JoinHandle<Result<()>>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to exit. Returns the store error that ended it,
    /// if any.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Other(format!("subscription task for {} failed: {e}", self.topic)))?
    }
}

/// Armed while the handler runs. If the handler panics (or the loop task
/// is dropped mid-handler) the lease is released locally: its heartbeat
/// stops so the reaper can reclaim the item, and the subscription ends.
struct InFlight<'a> {
    subscription: &'a Subscription,
    item_id: ItemId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        error!(
            topic = %self.subscription.topic,
            item_id = %self.item_id,
            "handler did not return, abandoning lease and ending subscription"
        );
        self.subscription.finish(self.item_id);
        self.subscription.deactivate();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawn the loop for `subscription` on the current runtime.
pub(crate) fn spawn(
    subscription: Arc<Subscription>,
    store: Arc<dyn DocumentStore>,
    handler: Arc<dyn Handler>,
    config: CommunicatorConfig,
) -> SubscriptionHandle {
    let topic = subscription.topic.clone();
    let task = tokio::spawn(run(subscription, store, handler, config));
    SubscriptionHandle { topic, task }
}

async fn run(
    subscription: Arc<Subscription>,
    store: Arc<dyn DocumentStore>,
    handler: Arc<dyn Handler>,
    config: CommunicatorConfig,
) -> Result<()> {
    let topic = subscription.topic.as_str();
    info!(topic, "subscription started");

    while subscription.is_active() {
        if subscription.is_processing() {
            subscription.wait(config.poll_interval).await;
            continue;
        }

        let claimed = match store.claim(topic).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(topic, error = %e, "claim failed, ending subscription");
                subscription.deactivate();
                return Err(e);
            }
        };
        let Some(item) = claimed else {
            subscription.wait(config.poll_interval).await;
            continue;
        };

        metrics::leases_claimed().add(1, &[KeyValue::new("topic", topic.to_string())]);

        let heartbeat = match heartbeat::spawn(Arc::clone(&store), &item, config.refresh_period) {
            Ok(h) => Some(h),
            Err(e) => {
                warn!(topic, item_id = %item.id, error = %e, "heartbeat not started; lease may be reclaimed");
                None
            }
        };
        subscription.begin(item.id, heartbeat);

        let in_flight = InFlight {
            subscription: &subscription,
            item_id: item.id,
        };
        let span = start_lease_span(topic, item.id);
        record_lease_transition(&span, "unleased", "leased");
        handler.handle(item).instrument(span).await;
        std::mem::forget(in_flight);
    }

    info!(topic, "subscription stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> CommunicatorConfig {
        CommunicatorConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_refresh_period(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn loop_waits_for_finish_before_next_claim() {
        let store = Arc::new(MemoryStore::new());
        store.insert("t", &json!({"x": 1})).await.unwrap();
        store.insert("t", &json!({"x": 2})).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sub = Arc::new(Subscription::new("t", None));
        let handle = spawn(
            Arc::clone(&sub),
            store.clone(),
            Arc::new(move |_item: WorkItem| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
            fast_config(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(sub.is_processing());

        let leased = store.topic_stats("t").await.unwrap();
        assert_eq!(leased.leased, 1);
        assert_eq!(leased.unleased, 1);

        sub.deactivate();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn finish_for_other_item_keeps_slot() {
        let sub = Subscription::new("t", None);
        let store = Arc::new(MemoryStore::new());
        store.insert("t", &json!(1)).await.unwrap();
        let item = store.claim("t").await.unwrap().unwrap();
        let hb = heartbeat::spawn(store.clone(), &item, Duration::from_millis(20)).unwrap();

        sub.begin(item.id, Some(hb));
        assert!(sub.is_processing());

        assert!(!sub.finish(ItemId::new()));
        assert!(sub.is_processing());
        assert!(sub.holds_lease());

        assert!(sub.finish(item.id));
        assert!(!sub.is_processing());
        assert!(!sub.holds_lease());
    }

    #[test]
    fn finish_without_heartbeat_matches_claimed_item() {
        let sub = Subscription::new("t", None);
        let claimed = ItemId::new();
        sub.begin(claimed, None);

        assert!(!sub.finish(ItemId::new()));
        assert!(sub.is_processing());
        assert!(sub.finish(claimed));
        assert!(!sub.is_processing());
    }

    #[test]
    fn finish_reaches_replaced_subscription() {
        let old = Arc::new(Subscription::new("t", None));
        let held = ItemId::new();
        old.begin(held, None);
        old.deactivate();

        let current = Subscription::new("t", Some(Arc::clone(&old)));
        let claimed = ItemId::new();
        current.begin(claimed, None);

        assert!(current.finish(held));
        assert!(!old.holds_lease());
        assert!(current.is_processing());
        assert!(current.finish(claimed));
        assert!(!current.holds_lease());
    }
}
