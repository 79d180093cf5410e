//! The queue processor loop.
//!
//! A single timer-driven task claims due pending items in batches,
//! dispatches them to their source handlers concurrently, and resolves
//! each item independently: success completes it, failure walks the
//! retry-with-backoff state machine until `max_retries` is exhausted.
//! The loop awaits each batch before sleeping again, so ticks cannot
//! overlap; stopping cancels between batches and never interrupts an
//! in-flight item.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SyncQueueConfig;
use crate::db::SyncQueueQueries;
use crate::error::{Error, ErrorDetails};

use super::handlers::HandlerRegistry;
use super::{SyncQueueItem, retry_delay};

pub struct QueueProcessor {
    queries: Arc<dyn SyncQueueQueries>,
    handlers: Arc<HandlerRegistry>,
    config: SyncQueueConfig,
}

impl QueueProcessor {
    pub fn new(
        queries: Arc<dyn SyncQueueQueries>,
        handlers: Arc<HandlerRegistry>,
        config: SyncQueueConfig,
    ) -> Self {
        Self {
            queries,
            handlers,
            config,
        }
    }

    /// Spawns the processor task and returns a handle that stops it.
    pub fn start(self) -> ProcessorHandle {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { self.run(task_cancel).await });
        ProcessorHandle { cancel, task }
    }

    async fn run(self, cancel: CancellationToken) {
        // Reconcile items orphaned in `processing` by an earlier abnormal
        // shutdown before accepting new work.
        self.sweep_stale().await;

        let mut tick = tokio::time::interval(self.config.poll_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purge_tick = tokio::time::interval(self.config.purge_interval());
        purge_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Sync queue processor started (poll interval: {}ms, batch size: {})",
            self.config.poll_interval_ms,
            self.config.batch_size
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => self.process_batch().await,
                _ = purge_tick.tick() => self.purge_completed().await,
            }
        }
        tracing::info!("Sync queue processor stopped");
    }

    pub(crate) async fn sweep_stale(&self) {
        let claimed_before = Utc::now() - self.config.stale_claim_timeout();
        match self.queries.requeue_stale_processing(claimed_before).await {
            Ok(0) => {}
            Ok(requeued) => {
                tracing::warn!("Requeued {requeued} sync item(s) orphaned in `processing`");
            }
            Err(e) => tracing::warn!("Failed to requeue stale sync items: {e}"),
        }
    }

    pub(crate) async fn process_batch(&self) {
        let batch = match self
            .queries
            .claim_due_batch(self.config.batch_size, Utc::now())
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                // Claiming failed; due items stay `pending` for the next tick.
                tracing::warn!("Failed to claim sync batch: {e}");
                return;
            }
        };
        if batch.is_empty() {
            return;
        }
        tracing::debug!("Processing {} sync item(s)", batch.len());

        // Items are independent: one failure never blocks or rolls back a
        // sibling.
        futures::future::join_all(batch.into_iter().map(|item| self.process_item(item))).await;
    }

    async fn process_item(&self, item: SyncQueueItem) {
        let outcome = match self.handlers.get(item.source) {
            Some(handler) => handler.process(&item).await,
            None => Err(Error::new(ErrorDetails::SyncHandlerMissing {
                source: item.source.to_string(),
            })),
        };

        match outcome {
            Ok(message) => {
                if let Err(e) = self.queries.complete_item(item.id).await {
                    // The item stays `processing`; the startup sweep will
                    // requeue it if we never manage to record completion.
                    tracing::warn!("Failed to record completion of sync item {}: {e}", item.id);
                    return;
                }
                tracing::info!(
                    item_id = %item.id,
                    source = %item.source,
                    "Sync item completed: {message}"
                );
                metrics::counter!("floodgate_sync_items_total", "outcome" => "completed")
                    .increment(1);
            }
            Err(error) => {
                let attempts = item.retry_count + 1;
                if attempts >= item.max_retries {
                    if let Err(e) = self.queries.fail_item(item.id, &error.to_string()).await {
                        tracing::warn!("Failed to record failure of sync item {}: {e}", item.id);
                        return;
                    }
                    tracing::warn!(
                        item_id = %item.id,
                        source = %item.source,
                        "Sync item permanently failed after {attempts} attempt(s): {error}"
                    );
                    metrics::counter!("floodgate_sync_items_total", "outcome" => "failed")
                        .increment(1);
                } else {
                    let scheduled_for = Utc::now() + retry_delay(item.retry_count);
                    if let Err(e) = self
                        .queries
                        .reschedule_item(item.id, attempts, scheduled_for, &error.to_string())
                        .await
                    {
                        tracing::warn!("Failed to reschedule sync item {}: {e}", item.id);
                        return;
                    }
                    tracing::info!(
                        item_id = %item.id,
                        source = %item.source,
                        "Sync item attempt {attempts} failed, retrying at {scheduled_for}: {error}"
                    );
                    metrics::counter!("floodgate_sync_items_total", "outcome" => "retried")
                        .increment(1);
                }
            }
        }
    }

    pub(crate) async fn purge_completed(&self) {
        let completed_before = Utc::now() - self.config.completed_retention();
        match self.queries.purge_completed(completed_before).await {
            Ok(0) => {}
            Ok(purged) => tracing::info!("Purged {purged} completed sync item(s)"),
            Err(e) => tracing::warn!("Failed to purge completed sync items: {e}"),
        }
    }
}

pub struct ProcessorHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ProcessorHandle {
    /// Stops the loop after the in-flight batch (if any) finishes.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!("Sync queue processor task failed during shutdown: {e}");
        }
    }
}
