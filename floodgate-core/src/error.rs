use std::fmt::{self, Debug, Display};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use uuid::Uuid;

/// The common error type for the whole workspace.
///
/// As long as the struct member is private, we force people to use the `new`
/// method, which logs the error at the appropriate level on construction.
/// We box `ErrorDetails` per the `clippy::result_large_err` lint.
#[derive(Debug, PartialEq)]
pub struct Error(Box<ErrorDetails>);

impl Error {
    #[must_use]
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    #[must_use]
    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    #[must_use]
    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    #[must_use]
    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::new(ErrorDetails::PostgresQuery {
            message: err.to_string(),
        })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorDetails::JsonSerialization {
            message: err.to_string(),
        })
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AppState {
        message: String,
    },
    Config {
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    JsonSerialization {
        message: String,
    },
    Observability {
        message: String,
    },
    PostgresConnectionInitialization {
        message: String,
    },
    PostgresDisabled,
    PostgresMigration {
        message: String,
    },
    PostgresQuery {
        message: String,
    },
    RateLimitExceeded {
        identifier_key: String,
        retry_after_seconds: Option<i64>,
    },
    RuleNotFound {
        id: Uuid,
    },
    RuleValidation {
        message: String,
    },
    SyncHandler {
        source: String,
        message: String,
    },
    SyncHandlerMissing {
        source: String,
    },
    SyncItemNotFound {
        id: Uuid,
    },
}

impl ErrorDetails {
    /// The tracing level at which the error is logged on construction.
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AppState { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::JsonSerialization { .. }
            | ErrorDetails::Observability { .. }
            | ErrorDetails::PostgresConnectionInitialization { .. }
            | ErrorDetails::PostgresMigration { .. }
            | ErrorDetails::PostgresQuery { .. } => tracing::Level::ERROR,
            ErrorDetails::PostgresDisabled
            | ErrorDetails::RateLimitExceeded { .. }
            | ErrorDetails::SyncHandler { .. }
            | ErrorDetails::SyncHandlerMissing { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidRequest { .. }
            | ErrorDetails::RuleNotFound { .. }
            | ErrorDetails::RuleValidation { .. }
            | ErrorDetails::SyncItemNotFound { .. } => tracing::Level::DEBUG,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AppState { .. }
            | ErrorDetails::JsonSerialization { .. }
            | ErrorDetails::Observability { .. }
            | ErrorDetails::PostgresMigration { .. }
            | ErrorDetails::PostgresQuery { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::PostgresConnectionInitialization { .. }
            | ErrorDetails::PostgresDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::InvalidRequest { .. } | ErrorDetails::RuleValidation { .. } => {
                StatusCode::BAD_REQUEST
            }
            ErrorDetails::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::RuleNotFound { .. } | ErrorDetails::SyncItemNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            ErrorDetails::SyncHandler { .. } | ErrorDetails::SyncHandlerMissing { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDetails::AppState { message } => {
                write!(f, "Failed to initialize application state: {message}")
            }
            ErrorDetails::Config { message } => write!(f, "Configuration error: {message}"),
            ErrorDetails::InvalidRequest { message } => write!(f, "Invalid request: {message}"),
            ErrorDetails::JsonSerialization { message } => {
                write!(f, "JSON serialization error: {message}")
            }
            ErrorDetails::Observability { message } => {
                write!(f, "Observability error: {message}")
            }
            ErrorDetails::PostgresConnectionInitialization { message } => {
                write!(f, "Failed to initialize Postgres connection: {message}")
            }
            ErrorDetails::PostgresDisabled => {
                write!(f, "Postgres connection is disabled")
            }
            ErrorDetails::PostgresMigration { message } => {
                write!(f, "Failed to run Postgres migration: {message}")
            }
            ErrorDetails::PostgresQuery { message } => {
                write!(f, "Postgres query failed: {message}")
            }
            ErrorDetails::RateLimitExceeded {
                identifier_key,
                retry_after_seconds,
            } => match retry_after_seconds {
                Some(retry_after) => write!(
                    f,
                    "Rate limit exceeded for `{identifier_key}` (retry after {retry_after}s)"
                ),
                None => write!(f, "Rate limit exceeded for `{identifier_key}`"),
            },
            ErrorDetails::RuleNotFound { id } => {
                write!(f, "Rate limit rule `{id}` not found")
            }
            ErrorDetails::RuleValidation { message } => {
                write!(f, "Invalid rate limit rule: {message}")
            }
            ErrorDetails::SyncHandler { source, message } => {
                write!(f, "Sync handler for source `{source}` failed: {message}")
            }
            ErrorDetails::SyncHandlerMissing { source } => {
                write!(f, "No sync handler registered for source `{source}`")
            }
            ErrorDetails::SyncItemNotFound { id } => {
                write!(f, "Sync queue item `{id}` not found")
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = json!({"error": self.to_string()});
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::new_without_logging(ErrorDetails::InvalidRequest {
                message: "bad".to_string()
            })
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::new_without_logging(ErrorDetails::RateLimitExceeded {
                identifier_key: "key".to_string(),
                retry_after_seconds: Some(60),
            })
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Error::new_without_logging(ErrorDetails::RuleNotFound { id: Uuid::nil() })
                .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::new_without_logging(ErrorDetails::PostgresQuery {
                message: "oops".to_string()
            })
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_display_includes_retry_after() {
        let err = Error::new_without_logging(ErrorDetails::RateLimitExceeded {
            identifier_key: "tenant:abc".to_string(),
            retry_after_seconds: Some(30),
        });
        let message = err.to_string();
        assert!(message.contains("tenant:abc"));
        assert!(message.contains("30s"));
    }
}
