//! Per-source ingestion handlers.
//!
//! Each handler takes a claimed queue item and pushes it to the external
//! ingestion API for its source. The contract is small: return the
//! external customer id (or an acknowledgement message) on success, or an
//! error that drives the retry state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::config::{SourceApiConfig, SourcesConfig};
use crate::error::{Error, ErrorDetails};

use super::{SyncAction, SyncQueueItem, SyncSource};

#[async_trait]
pub trait SourceHandler: Send + Sync {
    async fn process(&self, item: &SyncQueueItem) -> Result<String, Error>;
}

/// Maps each source to its handler. Sources without a configured handler
/// fail their items immediately (no external system to talk to is not a
/// transient condition the backoff schedule can fix by itself, but the
/// retries still apply in case the config is fixed mid-flight).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<SyncSource, Arc<dyn SourceHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: SyncSource, handler: Arc<dyn SourceHandler>) {
        self.handlers.insert(source, handler);
    }

    pub fn get(&self, source: SyncSource) -> Option<Arc<dyn SourceHandler>> {
        self.handlers.get(&source).cloned()
    }

    pub fn from_config(sources: &SourcesConfig) -> Result<Self, Error> {
        let mut registry = Self::new();
        if let Some(config) = &sources.shopify {
            registry.register(
                SyncSource::Shopify,
                Arc::new(ShopifyHandler::new(config)?),
            );
        }
        if let Some(config) = &sources.kajabi {
            registry.register(SyncSource::Kajabi, Arc::new(KajabiHandler::new(config)?));
        }
        if let Some(config) = &sources.social {
            registry.register(SyncSource::Social, Arc::new(SocialHandler::new(config)?));
        }
        Ok(registry)
    }
}

/// Shared HTTP plumbing for the ingestion APIs.
struct IngestClient {
    http: Client,
    base_url: Url,
    api_key: Option<SecretString>,
}

impl IngestClient {
    fn new(config: &SourceApiConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to build ingestion HTTP client: {e}"),
                })
            })?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn request(&self, source: SyncSource, method: Method, path: &str) -> Result<RequestBuilder, Error> {
        let url = self.base_url.join(path).map_err(|e| {
            Error::new(ErrorDetails::SyncHandler {
                source: source.to_string(),
                message: format!("invalid ingestion path `{path}`: {e}"),
            })
        })?;
        let mut builder = self.http.request(method, url);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }
        Ok(builder)
    }
}

fn handler_error(source: SyncSource, message: String) -> Error {
    Error::new(ErrorDetails::SyncHandler {
        source: source.to_string(),
        message,
    })
}

#[derive(Deserialize)]
struct IngestResponse {
    customer_id: Option<String>,
    id: Option<String>,
}

/// Upserts or deletes a customer record against an ingestion API that
/// speaks `POST /customers` and `DELETE /customers/{id}`.
async fn sync_customer(
    client: &IngestClient,
    source: SyncSource,
    item: &SyncQueueItem,
) -> Result<String, Error> {
    if item.entity_type != "customer" {
        return Err(handler_error(
            source,
            format!("unsupported entity type `{}`", item.entity_type),
        ));
    }

    match item.action {
        SyncAction::Delete => {
            let path = format!("customers/{}", item.entity_id);
            let response = client
                .request(source, Method::DELETE, &path)?
                .send()
                .await
                .map_err(|e| handler_error(source, e.to_string()))?;
            match response.status() {
                // Deleting an already-absent record is an idempotent
                // no-op, not a failure worth retrying.
                StatusCode::NOT_FOUND => {
                    Ok("Customer not found, deletion acknowledged".to_string())
                }
                status if status.is_success() => Ok(item.entity_id.clone()),
                status => Err(handler_error(
                    source,
                    format!("delete of `{}` returned {status}", item.entity_id),
                )),
            }
        }
        SyncAction::Create | SyncAction::Update | SyncAction::Upsert => {
            let response = client
                .request(source, Method::POST, "customers")?
                .json(&item.payload)
                .send()
                .await
                .map_err(|e| handler_error(source, e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(handler_error(
                    source,
                    format!("ingestion of `{}` returned {status}", item.entity_id),
                ));
            }
            let parsed: Option<IngestResponse> = response.json().await.ok();
            Ok(parsed
                .and_then(|r| r.customer_id.or(r.id))
                .unwrap_or_else(|| item.entity_id.clone()))
        }
    }
}

pub struct ShopifyHandler {
    client: IngestClient,
}

impl ShopifyHandler {
    pub fn new(config: &SourceApiConfig) -> Result<Self, Error> {
        Ok(Self {
            client: IngestClient::new(config)?,
        })
    }
}

#[async_trait]
impl SourceHandler for ShopifyHandler {
    async fn process(&self, item: &SyncQueueItem) -> Result<String, Error> {
        sync_customer(&self.client, SyncSource::Shopify, item).await
    }
}

pub struct KajabiHandler {
    client: IngestClient,
}

impl KajabiHandler {
    pub fn new(config: &SourceApiConfig) -> Result<Self, Error> {
        Ok(Self {
            client: IngestClient::new(config)?,
        })
    }
}

#[async_trait]
impl SourceHandler for KajabiHandler {
    async fn process(&self, item: &SyncQueueItem) -> Result<String, Error> {
        sync_customer(&self.client, SyncSource::Kajabi, item).await
    }
}

/// Social touchpoints are append-only: every mutation is recorded as a
/// new touchpoint event against the collector.
pub struct SocialHandler {
    client: IngestClient,
}

impl SocialHandler {
    pub fn new(config: &SourceApiConfig) -> Result<Self, Error> {
        Ok(Self {
            client: IngestClient::new(config)?,
        })
    }
}

#[async_trait]
impl SourceHandler for SocialHandler {
    async fn process(&self, item: &SyncQueueItem) -> Result<String, Error> {
        if item.action == SyncAction::Delete {
            // Nothing to remove from an append-only collector.
            return Ok("Touchpoint deletion acknowledged".to_string());
        }
        let response = self
            .client
            .request(SyncSource::Social, Method::POST, "touchpoints")?
            .json(&item.payload)
            .send()
            .await
            .map_err(|e| handler_error(SyncSource::Social, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(handler_error(
                SyncSource::Social,
                format!("touchpoint ingestion returned {status}"),
            ));
        }
        let parsed: Option<IngestResponse> = response.json().await.ok();
        Ok(parsed
            .and_then(|r| r.customer_id.or(r.id))
            .unwrap_or_else(|| item.entity_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncStatus;
    use axum::Router;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{delete, post};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn make_item(action: SyncAction, entity_id: &str) -> SyncQueueItem {
        let now = Utc::now();
        SyncQueueItem {
            id: Uuid::now_v7(),
            source: SyncSource::Shopify,
            action,
            entity_type: "customer".to_string(),
            entity_id: entity_id.to_string(),
            payload: json!({"email": "ada@example.com"}),
            priority: 100,
            status: SyncStatus::Processing,
            retry_count: 0,
            max_retries: 3,
            scheduled_for: now,
            error_message: None,
            claimed_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    async fn spawn_ingest_stub() -> String {
        async fn create_customer() -> impl IntoResponse {
            axum::Json(json!({"customer_id": "cus_42"}))
        }

        async fn delete_customer(Path(id): Path<String>) -> impl IntoResponse {
            if id == "known" {
                StatusCode::NO_CONTENT
            } else {
                StatusCode::NOT_FOUND
            }
        }

        let router = Router::new()
            .route("/customers", post(create_customer))
            .route("/customers/{id}", delete(delete_customer));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn handler_for(base_url: &str) -> ShopifyHandler {
        let config = SourceApiConfig {
            base_url: base_url.parse().unwrap(),
            api_key: Some("shpat_test".to_string().into()),
            timeout_seconds: 5,
        };
        ShopifyHandler::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_create_returns_external_customer_id() {
        let base_url = spawn_ingest_stub().await;
        let handler = handler_for(&base_url);

        let result = handler.process(&make_item(SyncAction::Create, "local-1")).await;
        assert_eq!(result.unwrap(), "cus_42");
    }

    #[tokio::test]
    async fn test_delete_known_customer_succeeds() {
        let base_url = spawn_ingest_stub().await;
        let handler = handler_for(&base_url);

        let result = handler.process(&make_item(SyncAction::Delete, "known")).await;
        assert_eq!(result.unwrap(), "known");
    }

    #[tokio::test]
    async fn test_delete_unknown_customer_is_idempotent_success() {
        let base_url = spawn_ingest_stub().await;
        let handler = handler_for(&base_url);

        let result = handler.process(&make_item(SyncAction::Delete, "ghost")).await;
        assert_eq!(
            result.unwrap(),
            "Customer not found, deletion acknowledged"
        );
    }

    #[tokio::test]
    async fn test_unsupported_entity_type_fails() {
        let base_url = spawn_ingest_stub().await;
        let handler = handler_for(&base_url);

        let mut item = make_item(SyncAction::Create, "local-1");
        item.entity_type = "order".to_string();
        let err = handler.process(&item).await.unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::SyncHandler { .. }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_ingest_api_fails() {
        // Port 9 (discard) is a safe never-listening target.
        let handler = handler_for("http://127.0.0.1:9/");
        let err = handler
            .process(&make_item(SyncAction::Create, "local-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::SyncHandler { .. }
        ));
    }
}
