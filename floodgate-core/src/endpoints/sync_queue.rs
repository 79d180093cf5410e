//! Webhook intake and admin inspection for the sync queue.

use axum::Extension;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData};
use crate::sync::{NewSyncQueueItem, SyncAction, SyncQueueItem, SyncSource, SyncStatus};

use super::admission::DeferredAdmission;

fn default_webhook_priority() -> i32 {
    100
}

fn default_webhook_payload() -> Value {
    json!({})
}

fn default_webhook_max_retries() -> i32 {
    3
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnqueueSyncItemPayload {
    pub action: SyncAction,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default = "default_webhook_payload")]
    pub payload: Value,
    #[serde(default = "default_webhook_priority")]
    pub priority: i32,
    #[serde(default = "default_webhook_max_retries")]
    pub max_retries: i32,
}

/// Accepts a webhook from an external system and enqueues it as a sync
/// item. When admission resolved to `block_action = queue`, the item is
/// accepted but scheduled after the rule's retry delay instead of
/// immediately.
pub async fn sync_webhook_handler(
    State(AppStateData { sync_queue, .. }): AppState,
    Path(source): Path<String>,
    deferred: Option<Extension<DeferredAdmission>>,
    Json(payload): Json<EnqueueSyncItemPayload>,
) -> Result<(StatusCode, Json<SyncQueueItem>), Error> {
    let source: SyncSource = source.parse()?;
    if payload.max_retries < 1 {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "`max_retries` must be at least 1".to_string(),
        }));
    }

    let scheduled_for = deferred.map(|Extension(deferral)| {
        Utc::now() + chrono::Duration::seconds(deferral.delay_seconds)
    });

    let item = sync_queue
        .enqueue(NewSyncQueueItem {
            source,
            action: payload.action,
            entity_type: payload.entity_type,
            entity_id: payload.entity_id,
            payload: payload.payload,
            priority: payload.priority,
            max_retries: payload.max_retries,
            scheduled_for,
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(item)))
}

fn default_list_limit() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
pub struct ListSyncItemsParams {
    pub status: Option<SyncStatus>,
    #[serde(default = "default_list_limit")]
    pub limit: u32,
}

/// Lists queue items, most recently updated first. `status=failed`
/// surfaces the dead letters.
pub async fn list_sync_items_handler(
    State(AppStateData { sync_queue, .. }): AppState,
    Query(params): Query<ListSyncItemsParams>,
) -> Result<Json<Vec<SyncQueueItem>>, Error> {
    let limit = params.limit.min(500);
    Ok(Json(sync_queue.list_items(params.status, limit).await?))
}

pub async fn get_sync_item_handler(
    State(AppStateData { sync_queue, .. }): AppState,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncQueueItem>, Error> {
    sync_queue
        .get_item(id)
        .await?
        .map(Json)
        .ok_or_else(|| Error::new(ErrorDetails::SyncItemNotFound { id }))
}
