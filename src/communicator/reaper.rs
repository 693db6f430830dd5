//! Stale-lease reaper.
//!
//! Scans every topic for leases whose heartbeat is older than
//! `refresh_period + stale_margin` and returns them to the pool. The write
//! re-checks the staleness predicate, so a lease refreshed between the scan
//! and the write survives.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::CommunicatorConfig;
use crate::error::Result;
use crate::store::DocumentStore;
use crate::telemetry::metrics;

pub struct Reaper {
    store: Arc<dyn DocumentStore>,
    refresh_period: Duration,
    stale_margin: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn DocumentStore>, config: &CommunicatorConfig) -> Self {
        Self {
            store,
            refresh_period: config.refresh_period,
            stale_margin: config.stale_margin,
        }
    }

    /// Heartbeat age past which a lease counts as abandoned.
    pub fn grace(&self) -> Duration {
        self.refresh_period + self.stale_margin
    }

    /// One pass over all topics. Returns how many leases were reclaimed.
    pub async fn sweep(&self) -> Result<usize> {
        let grace = self.grace();
        let mut reclaimed = 0;

        debug!(grace_secs = grace.as_secs_f64(), "resetting stale leases");
        for topic in self.store.topics().await? {
            for item in self.store.find_stale(&topic, grace).await? {
                let elapsed = item.leased_seconds();
                if self.store.reclaim(&topic, item.id, grace, elapsed).await? {
                    info!(topic = %topic, item_id = %item.id, elapsed_secs = elapsed, "reclaimed stale lease");
                    metrics::leases_reclaimed().add(1, &[KeyValue::new("topic", topic.clone())]);
                    metrics::lease_work_seconds().record(
                        elapsed,
                        &[
                            KeyValue::new("topic", topic.clone()),
                            KeyValue::new("outcome", "reclaimed"),
                        ],
                    );
                    reclaimed += 1;
                } else {
                    debug!(topic = %topic, item_id = %item.id, "lease refreshed before reclaim");
                }
            }
        }

        Ok(reclaimed)
    }

    /// Sweep every `refresh_period` until `shutdown` flips to true, after
    /// an initial `startup_delay`. A store error ends the loop.
    pub async fn run(self, startup_delay: Duration, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            refresh_secs = self.refresh_period.as_secs_f64(),
            grace_secs = self.grace().as_secs_f64(),
            "reaper started"
        );

        if wait_or_shutdown(startup_delay, &mut shutdown).await {
            return Ok(());
        }

        loop {
            if let Err(e) = self.sweep().await {
                error!(error = %e, "reaper sweep failed, stopping");
                return Err(e);
            }
            if wait_or_shutdown(self.refresh_period, &mut shutdown).await {
                info!("reaper stopped");
                return Ok(());
            }
        }
    }
}

/// Sleep for `period`. Returns true if shutdown was requested meanwhile.
async fn wait_or_shutdown(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let closed = tokio::select! {
        _ = tokio::time::sleep(period) => false,
        changed = shutdown.changed() => changed.is_err(),
    };
    closed || *shutdown.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LeaseState;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn config() -> CommunicatorConfig {
        CommunicatorConfig::default()
            .with_refresh_period(Duration::from_millis(30))
            .with_stale_margin(Duration::from_millis(30))
    }

    #[tokio::test]
    async fn sweep_leaves_fresh_leases_alone() {
        let store = Arc::new(MemoryStore::new());
        store.insert("t", &json!(1)).await.unwrap();
        let item = store.claim("t").await.unwrap().unwrap();

        let reaper = Reaper::new(store.clone(), &config());
        assert_eq!(reaper.sweep().await.unwrap(), 0);
        let current = store.get("t", item.id).await.unwrap().unwrap();
        assert_eq!(current.state(), LeaseState::Leased);
    }

    #[tokio::test]
    async fn sweep_reclaims_abandoned_lease() {
        let store = Arc::new(MemoryStore::new());
        store.insert("t", &json!(1)).await.unwrap();
        let item = store.claim("t").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.refresh_heartbeat("t", item.id).await.unwrap();

        let reaper = Reaper::new(store.clone(), &config());
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert_eq!(reaper.sweep().await.unwrap(), 1);

        let current = store.get("t", item.id).await.unwrap().unwrap();
        assert_eq!(current.state(), LeaseState::Unleased);
        assert!(current.heartbeat.is_none());
        assert!(current.work_seconds >= 0.04);
        assert!(store.claim("t").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_never_touches_completed_items() {
        let store = Arc::new(MemoryStore::new());
        store.insert("t", &json!(1)).await.unwrap();
        let item = store.claim("t").await.unwrap().unwrap();
        store
            .complete("t", item.id, crate::store::CompletionTime::Fixed(0.5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(90)).await;
        let reaper = Reaper::new(store.clone(), &config());
        assert_eq!(reaper.sweep().await.unwrap(), 0);
        let current = store.get("t", item.id).await.unwrap().unwrap();
        assert_eq!(current.state(), LeaseState::Completed);
        assert_eq!(current.work_seconds, 0.5);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let reaper = Reaper::new(store, &config());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(reaper.run(Duration::from_millis(5), rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
