//! Admin CRUD for rate limit rules. Every mutation invalidates the
//! in-memory rule cache through the limiter.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use uuid::Uuid;

use crate::error::Error;
use crate::gateway_util::{AppState, AppStateData};
use crate::rate_limiting::{NewRateLimitRule, RateLimitRule, RateLimitRuleUpdate};

pub async fn list_rules_handler(
    State(AppStateData { rate_limiter, .. }): AppState,
) -> Result<Json<Vec<RateLimitRule>>, Error> {
    Ok(Json(rate_limiter.list_rules().await?))
}

pub async fn create_rule_handler(
    State(AppStateData { rate_limiter, .. }): AppState,
    Json(new_rule): Json<NewRateLimitRule>,
) -> Result<(StatusCode, Json<RateLimitRule>), Error> {
    let rule = rate_limiter.create_rule(new_rule).await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn get_rule_handler(
    State(AppStateData { rate_limiter, .. }): AppState,
    Path(id): Path<Uuid>,
) -> Result<Json<RateLimitRule>, Error> {
    Ok(Json(rate_limiter.get_rule(id).await?))
}

pub async fn update_rule_handler(
    State(AppStateData { rate_limiter, .. }): AppState,
    Path(id): Path<Uuid>,
    Json(update): Json<RateLimitRuleUpdate>,
) -> Result<Json<RateLimitRule>, Error> {
    Ok(Json(rate_limiter.update_rule(id, update).await?))
}

pub async fn delete_rule_handler(
    State(AppStateData { rate_limiter, .. }): AppState,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, Error> {
    rate_limiter.delete_rule(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
