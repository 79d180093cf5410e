//! Shared helpers for unit tests.

use std::sync::Arc;

use crate::config::Config;
use crate::db::postgres::PostgresConnectionInfo;
use crate::db::{RateLimitQueries, SyncQueueQueries};
use crate::gateway_util::AppStateData;
use crate::rate_limiting::RateLimiter;

pub(crate) fn app_state_with_queries(
    rate_limit_queries: Arc<dyn RateLimitQueries>,
    sync_queue: Arc<dyn SyncQueueQueries>,
) -> AppStateData {
    let config = Arc::new(Config::default());
    let rate_limiter = Arc::new(RateLimiter::new(rate_limit_queries, &config.rate_limiting));
    AppStateData {
        config,
        postgres_connection_info: PostgresConnectionInfo::new_disabled(),
        rate_limiter,
        sync_queue,
    }
}

/// App state backed by a disabled store: admission fails open, queue
/// queries error.
pub(crate) fn unit_test_app_state() -> AppStateData {
    let postgres = PostgresConnectionInfo::new_disabled();
    app_state_with_queries(Arc::new(postgres.clone()), Arc::new(postgres))
}
