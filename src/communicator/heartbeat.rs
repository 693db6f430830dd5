//! Heartbeat refresher: keeps one lease alive while its handler runs.
//!
//! Each refresher gets a dedicated OS thread with its own current-thread
//! runtime and its own store connection, so a handler that blocks the
//! caller's runtime cannot starve it. The loop ends the first time its
//! conditional update matches nothing (the item was completed, released,
//! or reclaimed), or when the handle is stopped or dropped.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::model::{ItemId, WorkItem};
use crate::store::DocumentStore;
use crate::telemetry::metrics;

/// Owner side of a running refresher. Dropping it stops the refresher
/// at its next wake-up.
#[derive(Debug)]
pub struct HeartbeatHandle {
    item_id: ItemId,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    /// Ask the refresher to stop without waiting for it.
    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// True once the refresher thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }
}

/// Spawn a refresher for `item` that updates its heartbeat every `period`.
pub fn spawn(
    store: Arc<dyn DocumentStore>,
    item: &WorkItem,
    period: Duration,
) -> Result<HeartbeatHandle> {
    let (stop_tx, stop_rx) = oneshot::channel();
    let topic = item.topic.clone();
    let item_id = item.id;

    let thread = std::thread::Builder::new()
        .name(format!("leaseq-heartbeat-{item_id}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(topic = %topic, item_id = %item_id, "heartbeat runtime failed: {e}");
                    return;
                }
            };
            runtime.block_on(refresh_loop(store, topic, item_id, period, stop_rx));
        })?;

    Ok(HeartbeatHandle {
        item_id,
        stop: Some(stop_tx),
        thread: Some(thread),
    })
}

async fn refresh_loop(
    store: Arc<dyn DocumentStore>,
    topic: String,
    item_id: ItemId,
    period: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let store = match store.detach().await {
        Ok(store) => store,
        Err(e) => {
            error!(topic = %topic, item_id = %item_id, "heartbeat could not open store: {e}");
            return;
        }
    };

    loop {
        match store.refresh_heartbeat(&topic, item_id).await {
            Ok(true) => {
                debug!(topic = %topic, item_id = %item_id, "heartbeat refreshed");
                record(&topic, "ok");
            }
            Ok(false) => {
                debug!(topic = %topic, item_id = %item_id, "lease no longer held, heartbeat exiting");
                record(&topic, "lost");
                return;
            }
            Err(e) => {
                warn!(topic = %topic, item_id = %item_id, error = %e, "heartbeat failed, exiting");
                record(&topic, "error");
                return;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = &mut stop => {
                debug!(topic = %topic, item_id = %item_id, "heartbeat stopped");
                return;
            }
        }
    }
}

fn record(topic: &str, result: &'static str) {
    metrics::heartbeats().add(
        1,
        &[
            KeyValue::new("topic", topic.to_string()),
            KeyValue::new("result", result),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CompletionTime, MemoryStore};
    use serde_json::json;

    #[tokio::test]
    async fn heartbeat_advances_while_leased() {
        let store = Arc::new(MemoryStore::new());
        store.insert("t", &json!({"x": 1})).await.unwrap();
        let item = store.claim("t").await.unwrap().unwrap();
        let claimed_beat = item.heartbeat.unwrap();

        let handle = spawn(store.clone(), &item, Duration::from_millis(20)).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let current = store.get("t", item.id).await.unwrap().unwrap();
        assert!(current.heartbeat.unwrap() > claimed_beat);
        handle.stop();
    }

    #[tokio::test]
    async fn heartbeat_exits_after_completion() {
        let store = Arc::new(MemoryStore::new());
        store.insert("t", &json!({"x": 1})).await.unwrap();
        let item = store.claim("t").await.unwrap().unwrap();

        let handle = spawn(store.clone(), &item, Duration::from_millis(20)).unwrap();
        store
            .complete("t", item.id, CompletionTime::SinceLeaseStart)
            .await
            .unwrap();

        let mut finished = false;
        for _ in 0..50 {
            if handle.is_finished() {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(finished, "refresher should exit once its update stops matching");

        let done = store.get("t", item.id).await.unwrap().unwrap();
        let beat = done.heartbeat;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("t", item.id).await.unwrap().unwrap().heartbeat, beat);
    }

    #[tokio::test]
    async fn dropping_handle_stops_refresher() {
        let store = Arc::new(MemoryStore::new());
        store.insert("t", &json!(1)).await.unwrap();
        let item = store.claim("t").await.unwrap().unwrap();

        let handle = spawn(store.clone(), &item, Duration::from_millis(20)).unwrap();
        assert_eq!(handle.item_id(), item.id);
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(handle);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let beat = store.get("t", item.id).await.unwrap().unwrap().heartbeat;
        tokio::time::sleep(Duration::from_millis(80)).await;
        let later = store.get("t", item.id).await.unwrap().unwrap();
        assert_eq!(later.state(), crate::model::LeaseState::Leased);
        assert_eq!(later.heartbeat, beat);
    }
}
