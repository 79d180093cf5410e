use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::db::HealthCheckable;
use crate::gateway_util::{AppState, AppStateData};

pub const FLOODGATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A handler for a simple liveness check
pub async fn status_handler() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        version: FLOODGATE_VERSION.to_string(),
    })
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
}

/// A health check that includes availability of the backing store.
pub async fn health_handler(
    State(AppStateData {
        postgres_connection_info,
        ..
    }): AppState,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match postgres_connection_info.health().await {
        Ok(()) => Ok(Json(json!({
            "gateway": "ok",
            "postgres": "ok",
        }))),
        Err(_) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "gateway": "ok",
                "postgres": "error",
            })),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::unit_test_app_state;

    #[tokio::test]
    async fn test_status_handler() {
        let response = status_handler().await;
        assert_eq!(response.version, FLOODGATE_VERSION);
        assert_eq!(response.status, "ok");
    }

    #[tokio::test]
    async fn should_report_error_for_disabled_postgres() {
        let state = unit_test_app_state();
        let response = health_handler(State(state)).await;
        let (status_code, error_json) = response.unwrap_err();
        assert_eq!(status_code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_json.get("gateway").unwrap(), "ok");
        assert_eq!(error_json.get("postgres").unwrap(), "error");
    }
}
