//! Postgres-backed sync queue.
//!
//! Claiming is a single `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP
//! LOCKED)` so concurrent processors never double-claim an item, and
//! terminal (`completed` / `failed`) items can never be selected again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::db::sync_queue::SyncQueueQueries;
use crate::error::Error;
use crate::sync::{NewSyncQueueItem, SyncQueueItem, SyncStatus};

use super::PostgresConnectionInfo;

const ITEM_COLUMNS: &str = "id, source, action, entity_type, entity_id, payload, priority, \
     status, retry_count, max_retries, scheduled_for, error_message, claimed_at, \
     created_at, updated_at";

/// Row shape for `sync_queue`; text enums are parsed into domain enums in
/// one place.
#[derive(Debug, FromRow)]
struct DbSyncQueueItem {
    id: Uuid,
    source: String,
    action: String,
    entity_type: String,
    entity_id: String,
    payload: serde_json::Value,
    priority: i32,
    status: String,
    retry_count: i32,
    max_retries: i32,
    scheduled_for: DateTime<Utc>,
    error_message: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DbSyncQueueItem> for SyncQueueItem {
    type Error = Error;

    fn try_from(row: DbSyncQueueItem) -> Result<Self, Error> {
        Ok(SyncQueueItem {
            id: row.id,
            source: row.source.parse()?,
            action: row.action.parse()?,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            payload: row.payload,
            priority: row.priority,
            status: row.status.parse()?,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            scheduled_for: row.scheduled_for,
            error_message: row.error_message,
            claimed_at: row.claimed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn rows_to_items(rows: Vec<DbSyncQueueItem>) -> Result<Vec<SyncQueueItem>, Error> {
    rows.into_iter().map(SyncQueueItem::try_from).collect()
}

#[async_trait]
impl SyncQueueQueries for PostgresConnectionInfo {
    async fn enqueue(&self, item: NewSyncQueueItem) -> Result<SyncQueueItem, Error> {
        let pool = self.pool()?;
        let scheduled_for = item.scheduled_for.unwrap_or_else(Utc::now);
        let row: DbSyncQueueItem = sqlx::query_as(&format!(
            "INSERT INTO sync_queue \
               (id, source, action, entity_type, entity_id, payload, priority, status, \
                retry_count, max_retries, scheduled_for) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', 0, $8, $9) \
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(item.source.as_str())
        .bind(item.action.as_str())
        .bind(&item.entity_type)
        .bind(&item.entity_id)
        .bind(&item.payload)
        .bind(item.priority)
        .bind(item.max_retries)
        .bind(scheduled_for)
        .fetch_one(pool)
        .await?;
        row.try_into()
    }

    async fn claim_due_batch(
        &self,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncQueueItem>, Error> {
        let pool = self.pool()?;
        let rows: Vec<DbSyncQueueItem> = sqlx::query_as(&format!(
            "UPDATE sync_queue AS q \
             SET status = 'processing', claimed_at = $2, updated_at = $2 \
             FROM (\
                 SELECT id FROM sync_queue \
                 WHERE status = 'pending' AND scheduled_for <= $2 \
                 ORDER BY priority ASC, created_at ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED\
             ) AS due \
             WHERE q.id = due.id \
             RETURNING q.{ITEM_COLUMNS}"
        ))
        .bind(i64::from(batch_size))
        .bind(now)
        .fetch_all(pool)
        .await?;

        // RETURNING does not preserve the subquery order.
        let mut items = rows_to_items(rows)?;
        items.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(items)
    }

    async fn complete_item(&self, id: Uuid) -> Result<(), Error> {
        let pool = self.pool()?;
        let result = sqlx::query(
            "UPDATE sync_queue \
             SET status = 'completed', error_message = NULL, claimed_at = NULL, \
                 updated_at = now() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .execute(pool)
        .await?;
        if result.rows_affected() == 0 {
            tracing::warn!("Sync item {id} was not `processing` when completion was recorded");
        }
        Ok(())
    }

    async fn reschedule_item(
        &self,
        id: Uuid,
        retry_count: i32,
        scheduled_for: DateTime<Utc>,
        error_message: &str,
    ) -> Result<(), Error> {
        let pool = self.pool()?;
        sqlx::query(
            "UPDATE sync_queue \
             SET status = 'pending', retry_count = $2, scheduled_for = $3, \
                 error_message = $4, claimed_at = NULL, updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(retry_count)
        .bind(scheduled_for)
        .bind(error_message)
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn fail_item(&self, id: Uuid, error_message: &str) -> Result<(), Error> {
        let pool = self.pool()?;
        sqlx::query(
            "UPDATE sync_queue \
             SET status = 'failed', error_message = $2, claimed_at = NULL, \
                 updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(error_message)
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn requeue_stale_processing(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let pool = self.pool()?;
        let result = sqlx::query(
            "UPDATE sync_queue \
             SET status = 'pending', claimed_at = NULL, updated_at = now() \
             WHERE status = 'processing' AND claimed_at IS NOT NULL AND claimed_at < $1",
        )
        .bind(claimed_before)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_completed(&self, completed_before: DateTime<Utc>) -> Result<u64, Error> {
        let pool = self.pool()?;
        let result = sqlx::query(
            "DELETE FROM sync_queue WHERE status = 'completed' AND updated_at < $1",
        )
        .bind(completed_before)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<SyncQueueItem>, Error> {
        let pool = self.pool()?;
        let row: Option<DbSyncQueueItem> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM sync_queue WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        row.map(SyncQueueItem::try_from).transpose()
    }

    async fn list_items(
        &self,
        status: Option<SyncStatus>,
        limit: u32,
    ) -> Result<Vec<SyncQueueItem>, Error> {
        let pool = self.pool()?;
        let rows: Vec<DbSyncQueueItem> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM sync_queue \
             WHERE $1::text IS NULL OR status = $1 \
             ORDER BY updated_at DESC \
             LIMIT $2"
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;
        rows_to_items(rows)
    }
}
