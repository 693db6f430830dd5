//! Topic item operations via direct SQLx.
//!
//! Each lease transition is one `UPDATE ... WHERE <predicate>`; the number
//! of affected rows tells the caller whether its compare-and-swap won.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Db;
use crate::error::Result;
use crate::model::{ItemId, PayloadKey, TopicStats, WorkItem};
use crate::store::{CompletionTime, DocumentStore};

const ITEM_COLUMNS: &str = "id, topic, payload, lease_start, heartbeat, lease_end, work_seconds";

/// Predicate shared by the reaper's scan and its conditional write.
const STALE_PREDICATE: &str = "lease_start IS NOT NULL
     AND lease_end IS NULL
     AND heartbeat < now() - make_interval(secs => $2)";

#[async_trait]
impl DocumentStore for Db {
    async fn detach(&self) -> Result<Arc<dyn DocumentStore>> {
        let db = Db::connect_with(self.options.clone(), 1).await?;
        Ok(Arc::new(db))
    }

    async fn insert(&self, topic: &str, payload: &serde_json::Value) -> Result<WorkItem> {
        let row: ItemRow = sqlx::query_as(&format!(
            "INSERT INTO topic_items (topic, payload) VALUES ($1, $2) RETURNING {ITEM_COLUMNS}"
        ))
        .bind(topic)
        .bind(payload)
        .fetch_one(self.pool())
        .await?;
        Ok(row.into())
    }

    async fn claim(&self, topic: &str) -> Result<Option<WorkItem>> {
        // SKIP LOCKED lets concurrent claimers pass over a row another
        // transaction is already taking; the outer predicate re-checks it.
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "UPDATE topic_items SET lease_start = now(), heartbeat = now()
             WHERE lease_start IS NULL AND id = (
                 SELECT id FROM topic_items
                 WHERE topic = $1 AND lease_start IS NULL
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(topic)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(WorkItem::from))
    }

    async fn refresh_heartbeat(&self, topic: &str, id: ItemId) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE topic_items SET heartbeat = now()
             WHERE topic = $1 AND id = $2
             AND lease_start IS NOT NULL AND lease_end IS NULL",
        )
        .bind(topic)
        .bind(id.0)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    async fn find_stale(&self, topic: &str, grace: Duration) -> Result<Vec<WorkItem>> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM topic_items WHERE topic = $1 AND {STALE_PREDICATE}"
        ))
        .bind(topic)
        .bind(grace.as_secs_f64())
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(WorkItem::from).collect())
    }

    async fn reclaim(
        &self,
        topic: &str,
        id: ItemId,
        grace: Duration,
        elapsed_secs: f64,
    ) -> Result<bool> {
        let rows = sqlx::query(&format!(
            "UPDATE topic_items
             SET work_seconds = work_seconds + GREATEST($4::float8, 0),
                 lease_start = NULL, heartbeat = NULL, lease_end = NULL
             WHERE topic = $1 AND id = $3 AND {STALE_PREDICATE}"
        ))
        .bind(topic)
        .bind(grace.as_secs_f64())
        .bind(id.0)
        .bind(elapsed_secs)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    async fn complete(&self, topic: &str, id: ItemId, time: CompletionTime) -> Result<bool> {
        let fixed = match time {
            CompletionTime::Fixed(secs) => Some(secs),
            CompletionTime::SinceLeaseStart => None,
        };
        let rows = sqlx::query(
            "UPDATE topic_items
             SET lease_end = now(),
                 work_seconds = work_seconds + GREATEST(
                     COALESCE($3::float8, EXTRACT(EPOCH FROM (now() - lease_start))::float8),
                     0
                 )
             WHERE topic = $1 AND id = $2
             AND lease_start IS NOT NULL AND lease_end IS NULL",
        )
        .bind(topic)
        .bind(id.0)
        .bind(fixed)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    async fn release(&self, topic: &str, id: ItemId) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE topic_items SET lease_start = NULL, heartbeat = NULL, lease_end = NULL
             WHERE topic = $1 AND id = $2 AND lease_end IS NULL",
        )
        .bind(topic)
        .bind(id.0)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    async fn find_by_payload(
        &self,
        topic: &str,
        key: &PayloadKey,
        value: &serde_json::Value,
    ) -> Result<Option<WorkItem>> {
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM topic_items
             WHERE topic = $1 AND payload #> $2::text[] = $3::jsonb
             LIMIT 1"
        ))
        .bind(topic)
        .bind(key.segments())
        .bind(value)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(WorkItem::from))
    }

    async fn set_payload_value(
        &self,
        topic: &str,
        id: ItemId,
        key: &PayloadKey,
        value: &serde_json::Value,
    ) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE topic_items SET payload = leaseq_jsonb_assign(payload, $3::text[], $4::jsonb)
             WHERE topic = $1 AND id = $2",
        )
        .bind(topic)
        .bind(id.0)
        .bind(key.segments())
        .bind(value)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    async fn get(&self, topic: &str, id: ItemId) -> Result<Option<WorkItem>> {
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM topic_items WHERE topic = $1 AND id = $2"
        ))
        .bind(topic)
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(WorkItem::from))
    }

    async fn topics(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT topic FROM topic_items ORDER BY topic")
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|(topic,)| topic).collect())
    }

    async fn topic_stats(&self, topic: &str) -> Result<TopicStats> {
        let (unleased, leased, completed, work_seconds): (i64, i64, i64, f64) = sqlx::query_as(
            "SELECT
                 COUNT(*) FILTER (WHERE lease_start IS NULL),
                 COUNT(*) FILTER (WHERE lease_start IS NOT NULL AND lease_end IS NULL),
                 COUNT(*) FILTER (WHERE lease_end IS NOT NULL),
                 COALESCE(SUM(work_seconds), 0)::float8
             FROM topic_items WHERE topic = $1",
        )
        .bind(topic)
        .fetch_one(self.pool())
        .await?;

        Ok(TopicStats {
            unleased: unleased as u64,
            leased: leased as u64,
            completed: completed as u64,
            work_seconds,
        })
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ItemRow {
    id: Uuid,
    topic: String,
    payload: serde_json::Value,
    lease_start: Option<DateTime<Utc>>,
    heartbeat: Option<DateTime<Utc>>,
    lease_end: Option<DateTime<Utc>>,
    work_seconds: f64,
}

impl From<ItemRow> for WorkItem {
    fn from(row: ItemRow) -> Self {
        Self {
            id: ItemId(row.id),
            topic: row.topic,
            payload: row.payload,
            lease_start: row.lease_start,
            heartbeat: row.heartbeat,
            lease_end: row.lease_end,
            work_seconds: row.work_seconds,
        }
    }
}
