use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::sync::{NewSyncQueueItem, SyncQueueItem, SyncStatus};

#[async_trait]
#[cfg_attr(test, automock)]
pub trait SyncQueueQueries: Send + Sync {
    async fn enqueue(&self, item: NewSyncQueueItem) -> Result<SyncQueueItem, Error>;

    /// Atomically claims up to `batch_size` due pending items, marking
    /// them `processing`. Ordering is priority ascending, then FIFO by
    /// creation time. Completed and failed items are never returned, so
    /// terminal items cannot be re-processed; concurrent processors
    /// cannot claim the same item twice.
    async fn claim_due_batch(
        &self,
        batch_size: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<SyncQueueItem>, Error>;

    async fn complete_item(&self, id: Uuid) -> Result<(), Error>;

    /// Returns the item to `pending` for a later attempt. `scheduled_for`
    /// must be strictly later than the item's previous schedule.
    async fn reschedule_item(
        &self,
        id: Uuid,
        retry_count: i32,
        scheduled_for: DateTime<Utc>,
        error_message: &str,
    ) -> Result<(), Error>;

    /// Terminal failure: retries exhausted. The item stays queryable for
    /// inspection.
    async fn fail_item(&self, id: Uuid, error_message: &str) -> Result<(), Error>;

    /// Requeues `processing` items claimed before the given instant
    /// (orphaned by a crashed processor) without consuming a retry.
    /// Returns the number of requeued items.
    async fn requeue_stale_processing(&self, claimed_before: DateTime<Utc>) -> Result<u64, Error>;

    /// Deletes `completed` items older than the given instant. Returns
    /// the number of purged items.
    async fn purge_completed(&self, completed_before: DateTime<Utc>) -> Result<u64, Error>;

    async fn get_item(&self, id: Uuid) -> Result<Option<SyncQueueItem>, Error>;

    async fn list_items(
        &self,
        status: Option<SyncStatus>,
        limit: u32,
    ) -> Result<Vec<SyncQueueItem>, Error>;
}
