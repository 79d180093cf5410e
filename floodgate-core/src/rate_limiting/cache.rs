use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use regex::Regex;
use uuid::Uuid;

use super::RateLimitRule;

/// A rule with its endpoint pattern compiled once per cache fill.
#[derive(Clone, Debug)]
pub struct CompiledRule {
    pub rule: RateLimitRule,
    pattern: Regex,
}

impl CompiledRule {
    /// Compiles the rule's endpoint pattern. Rules with patterns that no
    /// longer compile (e.g. written by an older release) are skipped by
    /// the caller rather than failing the whole lookup.
    pub fn compile(rule: RateLimitRule) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&rule.endpoint_pattern)?;
        Ok(Self { rule, pattern })
    }

    pub fn matches(&self, path: &str, method: &str) -> bool {
        self.rule.enabled && self.rule.covers_method(method) && self.pattern.is_match(path)
    }
}

/// Cache scope: one entry per (tenant, billing tier) pair, holding every
/// rule that can govern that pair (tenant-specific and global).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RuleScope {
    pub tenant_id: Option<Uuid>,
    pub billing_tier: String,
}

/// TTL-bounded cache over rule lookups.
///
/// Mutations go through the rule CRUD operations, which call
/// `invalidate_all`; the TTL only bounds staleness introduced by writers
/// in other processes. Concurrent fills of the same scope overwrite each
/// other, which is acceptable for a read-mostly cache.
pub struct RuleCache {
    inner: Cache<RuleScope, Arc<Vec<CompiledRule>>>,
}

impl RuleCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(10_000)
                .build(),
        }
    }

    pub fn get(&self, scope: &RuleScope) -> Option<Arc<Vec<CompiledRule>>> {
        self.inner.get(scope)
    }

    pub fn insert(&self, scope: RuleScope, rules: Arc<Vec<CompiledRule>>) {
        self.inner.insert(scope, rules);
    }

    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiting::tests::make_rule;

    #[test]
    fn test_compiled_rule_matching() {
        let mut rule = make_rule(5, 60, 0);
        rule.endpoint_pattern = "^/v1/sync/.*".to_string();
        rule.methods = vec!["POST".to_string()];
        let compiled = CompiledRule::compile(rule).unwrap();

        assert!(compiled.matches("/v1/sync/webhook/shopify", "POST"));
        assert!(compiled.matches("/v1/sync/webhook/shopify", "post"));
        assert!(!compiled.matches("/v1/sync/webhook/shopify", "GET"));
        assert!(!compiled.matches("/v1/admin/rate-limits", "POST"));
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let mut rule = make_rule(5, 60, 0);
        rule.enabled = false;
        let compiled = CompiledRule::compile(rule).unwrap();
        assert!(!compiled.matches("/v1/sync/webhook/shopify", "POST"));
    }

    #[test]
    fn test_invalid_pattern_fails_compilation() {
        let mut rule = make_rule(5, 60, 0);
        rule.endpoint_pattern = "([unclosed".to_string();
        assert!(CompiledRule::compile(rule).is_err());
    }

    #[test]
    fn test_invalidate_all_clears_entries() {
        let cache = RuleCache::new(Duration::from_secs(300));
        let scope = RuleScope {
            tenant_id: None,
            billing_tier: "free".to_string(),
        };
        cache.insert(scope.clone(), Arc::new(Vec::new()));
        assert!(cache.get(&scope).is_some());

        cache.invalidate_all();
        assert!(cache.get(&scope).is_none());
    }
}
