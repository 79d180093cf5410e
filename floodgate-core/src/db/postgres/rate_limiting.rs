//! Postgres-backed rule store and tracking windows.
//!
//! Admission is serialized per identifier with a transaction-scoped
//! advisory lock, so the read-decide-write sequence cannot lose an
//! increment under concurrent requests: two simultaneous requests for
//! the last quota slot admit exactly one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::db::rate_limiting::{RateLimitQueries, RecordRequest, WindowReceipt};
use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::window::{self, WindowDecision, WindowState};
use crate::rate_limiting::{
    IdentifierKey, NewRateLimitRule, RateLimitRule, RateLimitRuleUpdate,
};

use super::PostgresConnectionInfo;

const RULE_COLUMNS: &str = "id, tenant_id, billing_tier, endpoint_pattern, methods, \
     max_requests, time_window_seconds, burst_allowance, algorithm, priority_level, \
     block_action, retry_after_seconds, enabled, created_at, updated_at";

/// Row shape for `api_rate_limiting_rules`. Kept separate from the domain
/// type so enum columns are parsed (and rejected) in exactly one place.
#[derive(Debug, FromRow)]
struct DbRateLimitRule {
    id: Uuid,
    tenant_id: Option<Uuid>,
    billing_tier: Option<String>,
    endpoint_pattern: String,
    methods: Vec<String>,
    max_requests: i64,
    time_window_seconds: i64,
    burst_allowance: i64,
    algorithm: String,
    priority_level: i32,
    block_action: String,
    retry_after_seconds: i64,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DbRateLimitRule> for RateLimitRule {
    type Error = Error;

    fn try_from(row: DbRateLimitRule) -> Result<Self, Error> {
        Ok(RateLimitRule {
            id: row.id,
            tenant_id: row.tenant_id,
            billing_tier: row.billing_tier,
            endpoint_pattern: row.endpoint_pattern,
            methods: row.methods,
            max_requests: row.max_requests,
            time_window_seconds: row.time_window_seconds,
            burst_allowance: row.burst_allowance,
            algorithm: row.algorithm.parse()?,
            priority_level: row.priority_level,
            block_action: row.block_action.parse()?,
            retry_after_seconds: row.retry_after_seconds,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row shape for `rate_limit_tracking`.
#[derive(Debug, FromRow)]
struct DbTrackingWindow {
    current_count: i64,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    is_blocked: bool,
    blocked_until: Option<DateTime<Utc>>,
    violation_count: i64,
    updated_at: DateTime<Utc>,
}

impl DbTrackingWindow {
    fn to_state(&self) -> WindowState {
        WindowState {
            current_count: self.current_count,
            window_start: self.window_start,
            window_end: self.window_end,
            is_blocked: self.is_blocked,
            blocked_until: self.blocked_until,
            updated_at: self.updated_at,
        }
    }
}

fn rows_to_rules(rows: Vec<DbRateLimitRule>) -> Result<Vec<RateLimitRule>, Error> {
    rows.into_iter().map(RateLimitRule::try_from).collect()
}

#[async_trait]
impl RateLimitQueries for PostgresConnectionInfo {
    async fn fetch_rules(
        &self,
        tenant_id: Option<Uuid>,
        billing_tier: &str,
    ) -> Result<Vec<RateLimitRule>, Error> {
        let pool = self.pool()?;
        let rows: Vec<DbRateLimitRule> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM api_rate_limiting_rules \
             WHERE enabled \
               AND (tenant_id IS NULL OR tenant_id = $1) \
               AND (billing_tier IS NULL OR billing_tier = $2) \
             ORDER BY priority_level ASC, id ASC"
        ))
        .bind(tenant_id)
        .bind(billing_tier)
        .fetch_all(pool)
        .await?;
        rows_to_rules(rows)
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<RateLimitRule>, Error> {
        let pool = self.pool()?;
        let row: Option<DbRateLimitRule> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM api_rate_limiting_rules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        row.map(RateLimitRule::try_from).transpose()
    }

    async fn list_rules(&self) -> Result<Vec<RateLimitRule>, Error> {
        let pool = self.pool()?;
        let rows: Vec<DbRateLimitRule> = sqlx::query_as(&format!(
            "SELECT {RULE_COLUMNS} FROM api_rate_limiting_rules \
             ORDER BY priority_level ASC, created_at ASC"
        ))
        .fetch_all(pool)
        .await?;
        rows_to_rules(rows)
    }

    async fn insert_rule(&self, rule: NewRateLimitRule) -> Result<RateLimitRule, Error> {
        let pool = self.pool()?;
        let row: DbRateLimitRule = sqlx::query_as(&format!(
            "INSERT INTO api_rate_limiting_rules \
             (id, tenant_id, billing_tier, endpoint_pattern, methods, max_requests, \
              time_window_seconds, burst_allowance, algorithm, priority_level, \
              block_action, retry_after_seconds, enabled) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             RETURNING {RULE_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(rule.tenant_id)
        .bind(&rule.billing_tier)
        .bind(&rule.endpoint_pattern)
        .bind(&rule.methods)
        .bind(rule.max_requests)
        .bind(rule.time_window_seconds)
        .bind(rule.burst_allowance)
        .bind(rule.algorithm.as_str())
        .bind(rule.priority_level)
        .bind(rule.block_action.as_str())
        .bind(rule.retry_after_seconds)
        .bind(rule.enabled)
        .fetch_one(pool)
        .await?;
        row.try_into()
    }

    async fn update_rule(
        &self,
        id: Uuid,
        update: RateLimitRuleUpdate,
    ) -> Result<RateLimitRule, Error> {
        let pool = self.pool()?;
        let row: Option<DbRateLimitRule> = sqlx::query_as(&format!(
            "UPDATE api_rate_limiting_rules SET \
               endpoint_pattern = COALESCE($2, endpoint_pattern), \
               methods = COALESCE($3, methods), \
               max_requests = COALESCE($4, max_requests), \
               time_window_seconds = COALESCE($5, time_window_seconds), \
               burst_allowance = COALESCE($6, burst_allowance), \
               algorithm = COALESCE($7, algorithm), \
               priority_level = COALESCE($8, priority_level), \
               block_action = COALESCE($9, block_action), \
               retry_after_seconds = COALESCE($10, retry_after_seconds), \
               enabled = COALESCE($11, enabled), \
               updated_at = now() \
             WHERE id = $1 \
             RETURNING {RULE_COLUMNS}"
        ))
        .bind(id)
        .bind(&update.endpoint_pattern)
        .bind(&update.methods)
        .bind(update.max_requests)
        .bind(update.time_window_seconds)
        .bind(update.burst_allowance)
        .bind(update.algorithm.map(|a| a.as_str()))
        .bind(update.priority_level)
        .bind(update.block_action.map(|a| a.as_str()))
        .bind(update.retry_after_seconds)
        .bind(update.enabled)
        .fetch_optional(pool)
        .await?;
        row.ok_or_else(|| Error::new(ErrorDetails::RuleNotFound { id }))?
            .try_into()
    }

    async fn delete_rule(&self, id: Uuid) -> Result<bool, Error> {
        let pool = self.pool()?;
        let result = sqlx::query("DELETE FROM api_rate_limiting_rules WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_request(&self, request: RecordRequest) -> Result<WindowReceipt, Error> {
        let pool = self.pool()?;
        let mut tx = pool.begin().await?;

        // Serialize admissions for this identifier+rule for the duration
        // of the transaction. The lock also covers the first-request
        // insert, which plain row locking cannot.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), hashtext($2::text))")
            .bind(request.identifier_key.as_str())
            .bind(request.rule_id)
            .execute(&mut *tx)
            .await?;

        let existing: Option<DbTrackingWindow> = sqlx::query_as(
            "SELECT current_count, window_start, window_end, is_blocked, blocked_until, \
                    violation_count, updated_at \
             FROM rate_limit_tracking \
             WHERE identifier_key = $1 AND rule_id = $2",
        )
        .bind(request.identifier_key.as_str())
        .bind(request.rule_id)
        .fetch_optional(&mut *tx)
        .await?;

        let state = existing.as_ref().map(DbTrackingWindow::to_state);
        let decision = window::decide(&request.policy, state.as_ref(), request.now);

        let receipt = match decision {
            WindowDecision::FreshWindow { bounds } => {
                sqlx::query(
                    "INSERT INTO rate_limit_tracking \
                       (identifier_key, rule_id, current_count, window_start, window_end, \
                        is_blocked, blocked_until, violation_count, updated_at) \
                     VALUES ($1, $2, 1, $3, $4, FALSE, NULL, 0, $5) \
                     ON CONFLICT (identifier_key, rule_id) DO UPDATE SET \
                       current_count = 1, \
                       window_start = excluded.window_start, \
                       window_end = excluded.window_end, \
                       is_blocked = FALSE, \
                       blocked_until = NULL, \
                       violation_count = 0, \
                       updated_at = excluded.updated_at",
                )
                .bind(request.identifier_key.as_str())
                .bind(request.rule_id)
                .bind(bounds.start)
                .bind(bounds.end)
                .bind(request.now)
                .execute(&mut *tx)
                .await?;
                WindowReceipt {
                    admitted: true,
                    current_count: 1,
                    window_start: bounds.start,
                    window_end: bounds.end,
                    blocked_until: None,
                    violation_count: 0,
                }
            }
            WindowDecision::Admit { new_count } => {
                let state = state.ok_or_else(|| {
                    Error::new(ErrorDetails::PostgresQuery {
                        message: "window admitted without a tracking row".to_string(),
                    })
                })?;
                sqlx::query(
                    "UPDATE rate_limit_tracking \
                     SET current_count = $3, updated_at = $4 \
                     WHERE identifier_key = $1 AND rule_id = $2",
                )
                .bind(request.identifier_key.as_str())
                .bind(request.rule_id)
                .bind(new_count)
                .bind(request.now)
                .execute(&mut *tx)
                .await?;
                WindowReceipt {
                    admitted: true,
                    current_count: new_count,
                    window_start: state.window_start,
                    window_end: state.window_end,
                    blocked_until: None,
                    violation_count: existing
                        .as_ref()
                        .map_or(0, |row| row.violation_count),
                }
            }
            WindowDecision::Deny | WindowDecision::DenyBlocked { .. } => {
                let state = state.ok_or_else(|| {
                    Error::new(ErrorDetails::PostgresQuery {
                        message: "window denied without a tracking row".to_string(),
                    })
                })?;
                let blocked_until = match decision {
                    WindowDecision::DenyBlocked { blocked_until } => Some(blocked_until),
                    _ => None,
                };
                WindowReceipt {
                    admitted: false,
                    current_count: state.current_count,
                    window_start: state.window_start,
                    window_end: state.window_end,
                    blocked_until,
                    violation_count: existing
                        .as_ref()
                        .map_or(0, |row| row.violation_count),
                }
            }
        };

        tx.commit().await?;
        Ok(receipt)
    }

    async fn mark_blocked(
        &self,
        identifier_key: &IdentifierKey,
        rule_id: Uuid,
        blocked_until: DateTime<Utc>,
    ) -> Result<(), Error> {
        let pool = self.pool()?;
        sqlx::query(
            "UPDATE rate_limit_tracking \
             SET is_blocked = TRUE, blocked_until = $3, \
                 violation_count = violation_count + 1, updated_at = now() \
             WHERE identifier_key = $1 AND rule_id = $2",
        )
        .bind(identifier_key.as_str())
        .bind(rule_id)
        .bind(blocked_until)
        .execute(pool)
        .await?;
        Ok(())
    }
}
