use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::rate_limiting::window::WindowPolicy;
use crate::rate_limiting::{IdentifierKey, NewRateLimitRule, RateLimitRule, RateLimitRuleUpdate};

/// One admission attempt against the tracking store.
#[derive(Clone, Debug)]
pub struct RecordRequest {
    pub identifier_key: IdentifierKey,
    pub rule_id: Uuid,
    pub policy: WindowPolicy,
    pub now: DateTime<Utc>,
}

/// The post-decision state of the tracking window.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowReceipt {
    pub admitted: bool,
    pub current_count: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub violation_count: i64,
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait RateLimitQueries: Send + Sync {
    /// Enabled rules that can govern the given tenant/tier pair:
    /// tenant-specific and global rules, tier-specific and tier-agnostic.
    async fn fetch_rules(
        &self,
        tenant_id: Option<Uuid>,
        billing_tier: &str,
    ) -> Result<Vec<RateLimitRule>, Error>;

    async fn get_rule(&self, id: Uuid) -> Result<Option<RateLimitRule>, Error>;

    async fn list_rules(&self) -> Result<Vec<RateLimitRule>, Error>;

    async fn insert_rule(&self, rule: NewRateLimitRule) -> Result<RateLimitRule, Error>;

    async fn update_rule(
        &self,
        id: Uuid,
        update: RateLimitRuleUpdate,
    ) -> Result<RateLimitRule, Error>;

    /// Returns whether a rule was deleted.
    async fn delete_rule(&self, id: Uuid) -> Result<bool, Error>;

    /// Get-or-create the current window for the identifier and apply the
    /// conditional increment atomically. Two racing requests for the last
    /// quota slot must not both be admitted.
    async fn record_request(&self, request: RecordRequest) -> Result<WindowReceipt, Error>;

    /// Blocks the identifier until the given instant and bumps its
    /// violation count.
    async fn mark_blocked(
        &self,
        identifier_key: &IdentifierKey,
        rule_id: Uuid,
        blocked_until: DateTime<Utc>,
    ) -> Result<(), Error>;
}
