//! Application state: explicitly constructed, dependency-injected
//! instances with a documented init/teardown lifecycle. Nothing in the
//! workspace is a process-wide singleton; the HTTP layer receives
//! everything it needs by reference through `AppStateData`.

use std::sync::Arc;

use crate::config::Config;
use crate::db::postgres::{POSTGRES_URL_ENV, PostgresConnectionInfo};
use crate::db::{RateLimitQueries, SyncQueueQueries};
use crate::error::Error;
use crate::rate_limiting::RateLimiter;
use crate::sync::handlers::HandlerRegistry;
use crate::sync::processor::{ProcessorHandle, QueueProcessor};

/// State shared with every request handler.
#[derive(Clone)]
pub struct AppStateData {
    pub config: Arc<Config>,
    pub postgres_connection_info: PostgresConnectionInfo,
    pub rate_limiter: Arc<RateLimiter>,
    pub sync_queue: Arc<dyn SyncQueueQueries>,
}

pub type AppState = axum::extract::State<AppStateData>;

/// Owns the application state plus the background processor; dropping it
/// without calling `shutdown` leaves the processor task running until the
/// runtime stops.
pub struct GatewayHandle {
    pub app_state: AppStateData,
    processor: Option<ProcessorHandle>,
}

impl GatewayHandle {
    /// Connects the store, builds the rate limiter, and starts the queue
    /// processor.
    ///
    /// Without a Postgres URL (config or `FLOODGATE_POSTGRES_URL`) the
    /// gateway still serves: admission fails open on every check and the
    /// queue processor is not started.
    pub async fn new(config: Arc<Config>) -> Result<Self, Error> {
        let postgres_url = config
            .postgres
            .url
            .clone()
            .or_else(|| std::env::var(POSTGRES_URL_ENV).ok());
        let postgres_connection_info = match postgres_url {
            Some(url) => PostgresConnectionInfo::new(&url, config.postgres.max_connections).await?,
            None => {
                tracing::warn!(
                    "No Postgres URL configured (set `postgres.url` or `{POSTGRES_URL_ENV}`); \
                     rate limits fail open and the sync queue processor is disabled"
                );
                PostgresConnectionInfo::new_disabled()
            }
        };

        let rate_limit_queries: Arc<dyn RateLimitQueries> =
            Arc::new(postgres_connection_info.clone());
        let rate_limiter = Arc::new(RateLimiter::new(
            rate_limit_queries,
            &config.rate_limiting,
        ));

        let sync_queue: Arc<dyn SyncQueueQueries> = Arc::new(postgres_connection_info.clone());
        let processor = if config.sync_queue.enabled && postgres_connection_info.is_enabled() {
            let handlers = Arc::new(HandlerRegistry::from_config(&config.sources)?);
            Some(
                QueueProcessor::new(sync_queue.clone(), handlers, config.sync_queue.clone())
                    .start(),
            )
        } else {
            None
        };

        Ok(Self {
            app_state: AppStateData {
                config,
                postgres_connection_info,
                rate_limiter,
                sync_queue,
            },
            processor,
        })
    }

    /// Stops the queue processor, waiting for its in-flight batch.
    pub async fn shutdown(self) {
        if let Some(processor) = self.processor {
            processor.shutdown().await;
        }
    }
}
