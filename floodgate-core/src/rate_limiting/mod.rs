//! Admission control: per-tenant, per-endpoint rate limiting.
//!
//! Rules live in Postgres (`api_rate_limiting_rules`) and are cached in
//! memory with a TTL; tracking windows (`rate_limit_tracking`) are owned
//! entirely by the store so concurrent requests cannot lose increments.
//! The engine itself never returns an error to callers: failures resolve
//! to an explicit fail-open admission (availability over enforcement).

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RateLimitingConfig;
use crate::db::{RateLimitQueries, RecordRequest};
use crate::error::{Error, ErrorDetails};

pub mod cache;
pub mod window;

use cache::{CompiledRule, RuleCache, RuleScope};
use window::WindowPolicy;

/// Sentinel `max_requests` value for requests no rule governs.
pub const UNRESTRICTED_MAX_REQUESTS: i64 = -1;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowAlgorithm {
    Fixed,
    Sliding,
    TokenBucket,
}

impl WindowAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowAlgorithm::Fixed => "fixed",
            WindowAlgorithm::Sliding => "sliding",
            WindowAlgorithm::TokenBucket => "token_bucket",
        }
    }
}

impl std::str::FromStr for WindowAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(WindowAlgorithm::Fixed),
            "sliding" => Ok(WindowAlgorithm::Sliding),
            "token_bucket" => Ok(WindowAlgorithm::TokenBucket),
            _ => Err(Error::new(ErrorDetails::RuleValidation {
                message: format!("unknown window algorithm `{s}`"),
            })),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockAction {
    Reject,
    Queue,
    Throttle,
}

impl BlockAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockAction::Reject => "reject",
            BlockAction::Queue => "queue",
            BlockAction::Throttle => "throttle",
        }
    }
}

impl std::str::FromStr for BlockAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(BlockAction::Reject),
            "queue" => Ok(BlockAction::Queue),
            "throttle" => Ok(BlockAction::Throttle),
            _ => Err(Error::new(ErrorDetails::RuleValidation {
                message: format!("unknown block action `{s}`"),
            })),
        }
    }
}

/// A configured rate limit rule.
///
/// `tenant_id = None` makes the rule global; `billing_tier = None` covers
/// every tier. Exactly one rule governs a given request: the matching
/// rule with the lowest `priority_level` (ties broken by id).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RateLimitRule {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub billing_tier: Option<String>,
    /// Regular expression matched against the request path.
    pub endpoint_pattern: String,
    /// HTTP methods the rule covers; empty covers all.
    pub methods: Vec<String>,
    pub max_requests: i64,
    pub time_window_seconds: i64,
    pub burst_allowance: i64,
    pub algorithm: WindowAlgorithm,
    pub priority_level: i32,
    pub block_action: BlockAction,
    pub retry_after_seconds: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RateLimitRule {
    /// The admission ceiling: nominal quota plus burst.
    pub fn limit(&self) -> i64 {
        self.max_requests + self.burst_allowance
    }

    pub fn covers_method(&self, method: &str) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method))
    }

    pub fn window_policy(&self) -> WindowPolicy {
        WindowPolicy {
            limit: self.limit(),
            max_requests: self.max_requests,
            window_seconds: self.time_window_seconds,
            algorithm: self.algorithm,
        }
    }
}

fn default_priority_level() -> i32 {
    100
}

fn default_retry_after_seconds() -> i64 {
    60
}

fn default_rule_enabled() -> bool {
    true
}

fn default_algorithm() -> WindowAlgorithm {
    WindowAlgorithm::Fixed
}

fn default_block_action() -> BlockAction {
    BlockAction::Reject
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NewRateLimitRule {
    pub tenant_id: Option<Uuid>,
    pub billing_tier: Option<String>,
    pub endpoint_pattern: String,
    #[serde(default)]
    pub methods: Vec<String>,
    pub max_requests: i64,
    pub time_window_seconds: i64,
    #[serde(default)]
    pub burst_allowance: i64,
    #[serde(default = "default_algorithm")]
    pub algorithm: WindowAlgorithm,
    #[serde(default = "default_priority_level")]
    pub priority_level: i32,
    #[serde(default = "default_block_action")]
    pub block_action: BlockAction,
    #[serde(default = "default_retry_after_seconds")]
    pub retry_after_seconds: i64,
    #[serde(default = "default_rule_enabled")]
    pub enabled: bool,
}

impl NewRateLimitRule {
    pub fn validate(&self) -> Result<(), Error> {
        if let Err(e) = regex::Regex::new(&self.endpoint_pattern) {
            return Err(Error::new(ErrorDetails::RuleValidation {
                message: format!("endpoint pattern does not compile: {e}"),
            }));
        }
        if self.max_requests < 1 {
            return Err(Error::new(ErrorDetails::RuleValidation {
                message: "`max_requests` must be at least 1".to_string(),
            }));
        }
        if self.time_window_seconds < 1 {
            return Err(Error::new(ErrorDetails::RuleValidation {
                message: "`time_window_seconds` must be at least 1".to_string(),
            }));
        }
        if self.burst_allowance < 0 {
            return Err(Error::new(ErrorDetails::RuleValidation {
                message: "`burst_allowance` must not be negative".to_string(),
            }));
        }
        if self.retry_after_seconds < 0 {
            return Err(Error::new(ErrorDetails::RuleValidation {
                message: "`retry_after_seconds` must not be negative".to_string(),
            }));
        }
        Ok(())
    }
}

/// A partial update; `None` fields are left untouched.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitRuleUpdate {
    pub endpoint_pattern: Option<String>,
    pub methods: Option<Vec<String>>,
    pub max_requests: Option<i64>,
    pub time_window_seconds: Option<i64>,
    pub burst_allowance: Option<i64>,
    pub algorithm: Option<WindowAlgorithm>,
    pub priority_level: Option<i32>,
    pub block_action: Option<BlockAction>,
    pub retry_after_seconds: Option<i64>,
    pub enabled: Option<bool>,
}

impl RateLimitRuleUpdate {
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(pattern) = &self.endpoint_pattern {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(Error::new(ErrorDetails::RuleValidation {
                    message: format!("endpoint pattern does not compile: {e}"),
                }));
            }
        }
        if self.max_requests.is_some_and(|n| n < 1) {
            return Err(Error::new(ErrorDetails::RuleValidation {
                message: "`max_requests` must be at least 1".to_string(),
            }));
        }
        if self.time_window_seconds.is_some_and(|n| n < 1) {
            return Err(Error::new(ErrorDetails::RuleValidation {
                message: "`time_window_seconds` must be at least 1".to_string(),
            }));
        }
        if self.burst_allowance.is_some_and(|n| n < 0) {
            return Err(Error::new(ErrorDetails::RuleValidation {
                message: "`burst_allowance` must not be negative".to_string(),
            }));
        }
        Ok(())
    }
}

/// The facts about an incoming request the engine needs.
pub struct RequestContext<'a> {
    pub path: &'a str,
    pub method: &'a str,
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<&'a str>,
    pub client_ip: Option<IpAddr>,
    pub billing_tier: &'a str,
}

/// Stable serialized composite identifier for a tracking window.
///
/// The key must be stable across releases (it is the tracking table's
/// lookup key), so it is generated by serializing a struct with a fixed
/// field order rather than by string formatting.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IdentifierKey(pub String);

#[derive(Serialize)]
struct IdentifierKeyHelper<'a> {
    tenant_id: Option<Uuid>,
    principal: &'a str,
    client_ip: Option<String>,
    endpoint: &'a str,
    rule_id: Uuid,
}

impl IdentifierKey {
    pub fn new(ctx: &RequestContext<'_>, rule: &RateLimitRule) -> Result<Self, Error> {
        let helper = IdentifierKeyHelper {
            tenant_id: ctx.tenant_id,
            principal: ctx.user_id.unwrap_or("guest"),
            client_ip: ctx.client_ip.map(|ip| ip.to_string()),
            endpoint: &rule.endpoint_pattern,
            rule_id: rule.id,
        };
        Ok(IdentifierKey(serde_json::to_string(&helper)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentifierKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionOutcome {
    Allowed,
    Denied,
    /// No configured rule governs the request; fail-open by absence.
    NoRuleMatched,
    /// The store or rule lookup failed; fail-open by policy.
    ErrorFailOpen,
}

impl AdmissionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionOutcome::Allowed => "allowed",
            AdmissionOutcome::Denied => "denied",
            AdmissionOutcome::NoRuleMatched => "no_rule_matched",
            AdmissionOutcome::ErrorFailOpen => "error_fail_open",
        }
    }
}

/// The result of an admission check.
#[derive(Clone, Debug, Serialize)]
pub struct RateLimitCheck {
    pub allowed: bool,
    pub outcome: AdmissionOutcome,
    pub current_count: i64,
    /// `-1` when no rule restricts the request.
    pub max_requests: i64,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub retry_after_seconds: Option<i64>,
    pub rule_applied: Option<Uuid>,
    pub block_action: Option<BlockAction>,
    pub identifier_key: Option<IdentifierKey>,
}

impl RateLimitCheck {
    fn unrestricted(outcome: AdmissionOutcome) -> Self {
        Self {
            allowed: true,
            outcome,
            current_count: 0,
            max_requests: UNRESTRICTED_MAX_REQUESTS,
            window_start: None,
            window_end: None,
            retry_after_seconds: None,
            rule_applied: None,
            block_action: None,
            identifier_key: None,
        }
    }

    pub fn remaining(&self) -> Option<i64> {
        if self.max_requests == UNRESTRICTED_MAX_REQUESTS {
            return None;
        }
        Some((self.max_requests - self.current_count).max(0))
    }
}

/// The admission decision engine.
///
/// Constructed once per process and shared by reference; holds no
/// authoritative state beyond the TTL-bounded rule cache.
pub struct RateLimiter {
    queries: Arc<dyn RateLimitQueries>,
    cache: RuleCache,
    enabled: bool,
}

impl RateLimiter {
    pub fn new(queries: Arc<dyn RateLimitQueries>, config: &RateLimitingConfig) -> Self {
        Self {
            queries,
            cache: RuleCache::new(config.rule_cache_ttl()),
            enabled: config.enabled,
        }
    }

    /// Checks whether the request is admitted. Never fails: any internal
    /// error resolves to `AdmissionOutcome::ErrorFailOpen` with
    /// `allowed = true`.
    pub async fn check_rate_limit(&self, ctx: &RequestContext<'_>) -> RateLimitCheck {
        let check = match self.try_check(ctx).await {
            Ok(check) => check,
            Err(e) => {
                tracing::warn!("Rate limit check failed, admitting request (fail-open): {e}");
                RateLimitCheck::unrestricted(AdmissionOutcome::ErrorFailOpen)
            }
        };
        metrics::counter!(
            "floodgate_admission_decisions_total",
            "outcome" => check.outcome.as_str()
        )
        .increment(1);
        check
    }

    async fn try_check(&self, ctx: &RequestContext<'_>) -> Result<RateLimitCheck, Error> {
        if !self.enabled {
            return Ok(RateLimitCheck::unrestricted(
                AdmissionOutcome::NoRuleMatched,
            ));
        }

        let rules = self.candidate_rules(ctx.tenant_id, ctx.billing_tier).await?;
        let Some(governing) = rules
            .iter()
            .filter(|r| r.matches(ctx.path, ctx.method))
            .min_by_key(|r| (r.rule.priority_level, r.rule.id))
        else {
            return Ok(RateLimitCheck::unrestricted(
                AdmissionOutcome::NoRuleMatched,
            ));
        };
        let rule = &governing.rule;

        let now = Utc::now();
        let identifier_key = IdentifierKey::new(ctx, rule)?;
        let receipt = self
            .queries
            .record_request(RecordRequest {
                identifier_key: identifier_key.clone(),
                rule_id: rule.id,
                policy: rule.window_policy(),
                now,
            })
            .await?;

        if receipt.admitted {
            return Ok(RateLimitCheck {
                allowed: true,
                outcome: AdmissionOutcome::Allowed,
                current_count: receipt.current_count,
                max_requests: rule.max_requests,
                window_start: Some(receipt.window_start),
                window_end: Some(receipt.window_end),
                retry_after_seconds: None,
                rule_applied: Some(rule.id),
                block_action: None,
                identifier_key: Some(identifier_key),
            });
        }

        // Denied: block the identifier and surface the violation for the
        // external monitoring collaborator. A failed mark does not change
        // the decision.
        let blocked_until = now + Duration::seconds(rule.retry_after_seconds);
        if let Err(e) = self
            .queries
            .mark_blocked(&identifier_key, rule.id, blocked_until)
            .await
        {
            tracing::warn!("Failed to persist rate limit block: {e}");
        }

        let retry_after_seconds = match receipt.blocked_until {
            // An earlier violation is still in force; report the remainder.
            Some(until) if until > now => (until - now).num_seconds().max(1),
            _ => rule.retry_after_seconds,
        };

        tracing::warn!(
            rule_id = %rule.id,
            identifier_key = %identifier_key,
            current_count = receipt.current_count,
            "Rate limit violation"
        );
        metrics::counter!(
            "floodgate_rate_limit_violations_total",
            "rule_id" => rule.id.to_string()
        )
        .increment(1);

        Ok(RateLimitCheck {
            allowed: false,
            outcome: AdmissionOutcome::Denied,
            current_count: receipt.current_count,
            max_requests: rule.max_requests,
            window_start: Some(receipt.window_start),
            window_end: Some(receipt.window_end),
            retry_after_seconds: Some(retry_after_seconds),
            rule_applied: Some(rule.id),
            block_action: Some(rule.block_action),
            identifier_key: Some(identifier_key),
        })
    }

    async fn candidate_rules(
        &self,
        tenant_id: Option<Uuid>,
        billing_tier: &str,
    ) -> Result<Arc<Vec<CompiledRule>>, Error> {
        let scope = RuleScope {
            tenant_id,
            billing_tier: billing_tier.to_string(),
        };
        if let Some(rules) = self.cache.get(&scope) {
            return Ok(rules);
        }

        let fetched = self.queries.fetch_rules(tenant_id, billing_tier).await?;
        let compiled: Vec<CompiledRule> = fetched
            .into_iter()
            .filter_map(|rule| match CompiledRule::compile(rule) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    tracing::warn!("Skipping rule with invalid endpoint pattern: {e}");
                    None
                }
            })
            .collect();
        let compiled = Arc::new(compiled);
        self.cache.insert(scope, compiled.clone());
        Ok(compiled)
    }

    pub async fn create_rule(&self, new_rule: NewRateLimitRule) -> Result<RateLimitRule, Error> {
        new_rule.validate()?;
        let rule = self.queries.insert_rule(new_rule).await?;
        self.cache.invalidate_all();
        Ok(rule)
    }

    pub async fn update_rule(
        &self,
        id: Uuid,
        update: RateLimitRuleUpdate,
    ) -> Result<RateLimitRule, Error> {
        update.validate()?;
        let rule = self.queries.update_rule(id, update).await?;
        self.cache.invalidate_all();
        Ok(rule)
    }

    pub async fn delete_rule(&self, id: Uuid) -> Result<(), Error> {
        if !self.queries.delete_rule(id).await? {
            return Err(Error::new(ErrorDetails::RuleNotFound { id }));
        }
        self.cache.invalidate_all();
        Ok(())
    }

    pub async fn get_rule(&self, id: Uuid) -> Result<RateLimitRule, Error> {
        self.queries
            .get_rule(id)
            .await?
            .ok_or_else(|| Error::new(ErrorDetails::RuleNotFound { id }))
    }

    pub async fn list_rules(&self) -> Result<Vec<RateLimitRule>, Error> {
        self.queries.list_rules().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{MockRateLimitQueries, WindowReceipt};
    use std::sync::atomic::{AtomicI64, Ordering};

    pub(crate) fn make_rule(max_requests: i64, window_seconds: i64, burst: i64) -> RateLimitRule {
        let now = Utc::now();
        RateLimitRule {
            id: Uuid::now_v7(),
            tenant_id: None,
            billing_tier: None,
            endpoint_pattern: ".*".to_string(),
            methods: Vec::new(),
            max_requests,
            time_window_seconds: window_seconds,
            burst_allowance: burst,
            algorithm: WindowAlgorithm::Fixed,
            priority_level: 100,
            block_action: BlockAction::Reject,
            retry_after_seconds: 60,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn ctx<'a>(tenant_id: Option<Uuid>) -> RequestContext<'a> {
        RequestContext {
            path: "/v1/sync/webhook/shopify",
            method: "POST",
            tenant_id,
            user_id: Some("user-1"),
            client_ip: Some("10.0.0.1".parse().unwrap()),
            billing_tier: "free",
        }
    }

    fn limiter(queries: MockRateLimitQueries) -> RateLimiter {
        RateLimiter::new(Arc::new(queries), &RateLimitingConfig::default())
    }

    fn admitted_receipt(count: i64, now: DateTime<Utc>) -> WindowReceipt {
        WindowReceipt {
            admitted: true,
            current_count: count,
            window_start: now,
            window_end: now + Duration::seconds(60),
            blocked_until: None,
            violation_count: 0,
        }
    }

    fn denied_receipt(count: i64, now: DateTime<Utc>) -> WindowReceipt {
        WindowReceipt {
            admitted: false,
            current_count: count,
            window_start: now,
            window_end: now + Duration::seconds(60),
            blocked_until: None,
            violation_count: 1,
        }
    }

    #[tokio::test]
    async fn test_no_matching_rule_fails_open() {
        let mut queries = MockRateLimitQueries::new();
        queries
            .expect_fetch_rules()
            .returning(|_, _| Box::pin(async { Ok(Vec::new()) }));

        let check = limiter(queries).check_rate_limit(&ctx(None)).await;
        assert!(check.allowed);
        assert_eq!(check.outcome, AdmissionOutcome::NoRuleMatched);
        assert_eq!(check.max_requests, UNRESTRICTED_MAX_REQUESTS);
        assert!(check.rule_applied.is_none());
    }

    #[tokio::test]
    async fn test_store_error_fails_open() {
        let mut queries = MockRateLimitQueries::new();
        queries.expect_fetch_rules().returning(|_, _| {
            Box::pin(async {
                Err(Error::new_without_logging(ErrorDetails::PostgresQuery {
                    message: "connection refused".to_string(),
                }))
            })
        });

        let check = limiter(queries).check_rate_limit(&ctx(None)).await;
        assert!(check.allowed);
        assert_eq!(check.outcome, AdmissionOutcome::ErrorFailOpen);
        assert_eq!(check.max_requests, UNRESTRICTED_MAX_REQUESTS);
    }

    #[tokio::test]
    async fn test_lowest_priority_level_wins() {
        let mut low_priority = make_rule(100, 60, 0);
        low_priority.priority_level = 50;
        let mut governing = make_rule(5, 60, 0);
        governing.priority_level = 1;
        let governing_id = governing.id;

        let rules = vec![low_priority, governing];
        let mut queries = MockRateLimitQueries::new();
        queries.expect_fetch_rules().returning(move |_, _| {
            let rules = rules.clone();
            Box::pin(async move { Ok(rules) })
        });
        queries
            .expect_record_request()
            .withf(move |req| req.rule_id == governing_id)
            .returning(|req| {
                let receipt = admitted_receipt(1, req.now);
                Box::pin(async move { Ok(receipt) })
            });

        let check = limiter(queries).check_rate_limit(&ctx(None)).await;
        assert!(check.allowed);
        assert_eq!(check.rule_applied, Some(governing_id));
        assert_eq!(check.max_requests, 5);
    }

    #[tokio::test]
    async fn test_priority_tie_breaks_by_rule_id() {
        let mut a = make_rule(5, 60, 0);
        a.priority_level = 10;
        let mut b = make_rule(7, 60, 0);
        b.priority_level = 10;
        let expected = a.id.min(b.id);

        let rules = vec![b, a];
        let mut queries = MockRateLimitQueries::new();
        queries.expect_fetch_rules().returning(move |_, _| {
            let rules = rules.clone();
            Box::pin(async move { Ok(rules) })
        });
        queries
            .expect_record_request()
            .withf(move |req| req.rule_id == expected)
            .returning(|req| {
                let receipt = admitted_receipt(1, req.now);
                Box::pin(async move { Ok(receipt) })
            });

        let check = limiter(queries).check_rate_limit(&ctx(None)).await;
        assert_eq!(check.rule_applied, Some(expected));
    }

    #[tokio::test]
    async fn test_quota_walk_then_denial() {
        // Rule {max_requests: 5, window: 60s, burst: 0}: five requests
        // admitted with counts 1..5, the sixth denied with the rule's
        // configured retry_after_seconds.
        let mut rule = make_rule(5, 60, 0);
        rule.retry_after_seconds = 42;
        let rules = vec![rule];

        let mut queries = MockRateLimitQueries::new();
        queries.expect_fetch_rules().returning(move |_, _| {
            let rules = rules.clone();
            Box::pin(async move { Ok(rules) })
        });
        let calls = AtomicI64::new(0);
        queries.expect_record_request().returning(move |req| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let receipt = if n <= 5 {
                admitted_receipt(n, req.now)
            } else {
                denied_receipt(5, req.now)
            };
            Box::pin(async move { Ok(receipt) })
        });
        queries
            .expect_mark_blocked()
            .returning(|_, _, _| Box::pin(async { Ok(()) }));

        let limiter = limiter(queries);
        for expected_count in 1..=5 {
            let check = limiter.check_rate_limit(&ctx(None)).await;
            assert!(check.allowed, "request {expected_count} should be admitted");
            assert_eq!(check.current_count, expected_count);
        }

        let denied = limiter.check_rate_limit(&ctx(None)).await;
        assert!(!denied.allowed);
        assert_eq!(denied.outcome, AdmissionOutcome::Denied);
        assert_eq!(denied.retry_after_seconds, Some(42));
        assert_eq!(denied.block_action, Some(BlockAction::Reject));
    }

    #[tokio::test]
    async fn test_denial_marks_identifier_blocked() {
        let rule = make_rule(1, 60, 0);
        let rule_id = rule.id;
        let rules = vec![rule];

        let mut queries = MockRateLimitQueries::new();
        queries.expect_fetch_rules().returning(move |_, _| {
            let rules = rules.clone();
            Box::pin(async move { Ok(rules) })
        });
        queries.expect_record_request().returning(|req| {
            let receipt = denied_receipt(1, req.now);
            Box::pin(async move { Ok(receipt) })
        });
        let before = Utc::now();
        queries
            .expect_mark_blocked()
            .withf(move |_, id, blocked_until| {
                *id == rule_id && *blocked_until >= before + Duration::seconds(60)
            })
            .times(1)
            .returning(|_, _, _| Box::pin(async { Ok(()) }));

        let check = limiter(queries).check_rate_limit(&ctx(None)).await;
        assert!(!check.allowed);
    }

    #[tokio::test]
    async fn test_rule_update_invalidates_cache() {
        // Two checks around an update must hit the store twice: the
        // mutation invalidates the cached lookup instead of waiting out
        // the TTL.
        let rule = make_rule(5, 60, 0);
        let rule_id = rule.id;
        let rules = vec![rule.clone()];

        let mut queries = MockRateLimitQueries::new();
        queries.expect_fetch_rules().times(2).returning(move |_, _| {
            let rules = rules.clone();
            Box::pin(async move { Ok(rules) })
        });
        queries.expect_record_request().returning(|req| {
            let receipt = admitted_receipt(1, req.now);
            Box::pin(async move { Ok(receipt) })
        });
        let mut updated = rule.clone();
        updated.max_requests = 10;
        queries.expect_update_rule().returning(move |_, _| {
            let updated = updated.clone();
            Box::pin(async move { Ok(updated) })
        });

        let limiter = limiter(queries);
        let first = limiter.check_rate_limit(&ctx(None)).await;
        assert!(first.allowed);

        limiter
            .update_rule(
                rule_id,
                RateLimitRuleUpdate {
                    max_requests: Some(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let second = limiter.check_rate_limit(&ctx(None)).await;
        assert!(second.allowed);
    }

    #[tokio::test]
    async fn test_disabled_limiter_admits_everything() {
        let queries = MockRateLimitQueries::new();
        let config = RateLimitingConfig {
            enabled: false,
            ..Default::default()
        };
        let limiter = RateLimiter::new(Arc::new(queries), &config);

        let check = limiter.check_rate_limit(&ctx(None)).await;
        assert!(check.allowed);
        assert_eq!(check.max_requests, UNRESTRICTED_MAX_REQUESTS);
    }

    #[test]
    fn test_identifier_key_is_stable() {
        let rule = make_rule(5, 60, 0);
        let a = IdentifierKey::new(&ctx(None), &rule).unwrap();
        let b = IdentifierKey::new(&ctx(None), &rule).unwrap();
        assert_eq!(a, b);

        let tenant = Uuid::now_v7();
        let c = IdentifierKey::new(&ctx(Some(tenant)), &rule).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_new_rule_validation() {
        let valid = NewRateLimitRule {
            tenant_id: None,
            billing_tier: Some("free".to_string()),
            endpoint_pattern: "^/v1/.*".to_string(),
            methods: vec!["POST".to_string()],
            max_requests: 5,
            time_window_seconds: 60,
            burst_allowance: 0,
            algorithm: WindowAlgorithm::Fixed,
            priority_level: 1,
            block_action: BlockAction::Reject,
            retry_after_seconds: 60,
            enabled: true,
        };
        assert!(valid.validate().is_ok());

        let mut bad_pattern = valid.clone();
        bad_pattern.endpoint_pattern = "([".to_string();
        assert!(bad_pattern.validate().is_err());

        let mut zero_quota = valid.clone();
        zero_quota.max_requests = 0;
        assert!(zero_quota.validate().is_err());

        let mut negative_burst = valid;
        negative_burst.burst_allowance = -1;
        assert!(negative_burst.validate().is_err());
    }
}
