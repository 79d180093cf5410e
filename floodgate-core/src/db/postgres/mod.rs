use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, migrate};

use crate::db::HealthCheckable;
use crate::error::{Error, ErrorDetails};

pub mod rate_limiting;
pub mod sync_queue;

/// Environment variable consulted when the config file does not carry a
/// connection URL.
pub const POSTGRES_URL_ENV: &str = "FLOODGATE_POSTGRES_URL";

#[derive(Clone, Debug)]
pub enum PostgresConnectionInfo {
    Enabled { pool: PgPool },
    Disabled,
}

impl PostgresConnectionInfo {
    pub fn new_with_pool(pool: PgPool) -> Self {
        Self::Enabled { pool }
    }

    pub fn new_disabled() -> Self {
        Self::Disabled
    }

    /// Connects, runs embedded migrations, and returns an enabled
    /// connection.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::PostgresConnectionInitialization {
                    message: e.to_string(),
                })
            })?;
        migrate!("src/db/postgres/migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::PostgresMigration {
                    message: e.to_string(),
                })
            })?;
        Ok(Self::Enabled { pool })
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }

    pub(crate) fn pool(&self) -> Result<&PgPool, Error> {
        match self {
            Self::Enabled { pool } => Ok(pool),
            Self::Disabled => Err(Error::new(ErrorDetails::PostgresDisabled)),
        }
    }
}

#[async_trait]
impl HealthCheckable for PostgresConnectionInfo {
    async fn health(&self) -> Result<(), Error> {
        let pool = self.pool()?;
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(pool)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::PostgresQuery {
                    message: format!("Health check failed: {e}"),
                })
            })?;
        Ok(())
    }
}

/// Connects using `FLOODGATE_POSTGRES_URL`, runs migrations, and exits.
/// Used by the gateway's `--run-migrations-only` flag.
pub async fn manual_run_postgres_migrations() -> Result<(), Error> {
    let postgres_url = std::env::var(POSTGRES_URL_ENV).map_err(|_| {
        Error::new(ErrorDetails::PostgresConnectionInitialization {
            message: format!("Failed to read `{POSTGRES_URL_ENV}` environment variable"),
        })
    })?;
    let pool = PgPoolOptions::new()
        .connect(&postgres_url)
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::PostgresConnectionInitialization {
                message: e.to_string(),
            })
        })?;
    migrate!("src/db/postgres/migrations")
        .run(&pool)
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::PostgresMigration {
                message: e.to_string(),
            })
        })
}
