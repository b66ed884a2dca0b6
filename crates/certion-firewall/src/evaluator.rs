//! Per-request firewall decision

use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::access::AccessRequests;
use crate::rate_limit::RateLimiter;
use crate::rules::FirewallRule;
use crate::store::PolicyCache;

/// Outcome of evaluating one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// `rule` is `None` when the block comes from a fail-safe path or the
    /// suspicious-activity hook rather than a stored rule
    Block {
        rule: Option<FirewallRule>,
        reason: String,
    },
    RateLimited,
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    fn fail_safe(reason: impl Into<String>) -> Self {
        Decision::Block {
            rule: None,
            reason: reason.into(),
        }
    }
}

/// Hook consulted for projects with `auto_block_suspicious` enabled.
///
/// Returns a block reason when the request should be treated as
/// suspicious. No detection heuristic ships with the firewall.
pub trait SuspiciousActivityPolicy: Send + Sync {
    fn inspect(&self, project_id: &str, ip: IpAddr, method: &str, path: &str) -> Option<String>;
}

/// Decides ALLOW / BLOCK / RATE_LIMITED for inbound requests.
///
/// Order: disabled firewall, whitelist, rate limit, suspicious-activity
/// hook, rules with access-request overrides. Any failure to read policy
/// or approvals blocks the request.
#[derive(Clone)]
pub struct FirewallEvaluator {
    policies: Arc<PolicyCache>,
    access: AccessRequests,
    limiter: Arc<RateLimiter>,
    suspicious: Option<Arc<dyn SuspiciousActivityPolicy>>,
}

impl std::fmt::Debug for FirewallEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirewallEvaluator")
            .field("policies", &self.policies)
            .field("suspicious_hook", &self.suspicious.is_some())
            .finish()
    }
}

impl FirewallEvaluator {
    pub fn new(policies: Arc<PolicyCache>, access: AccessRequests) -> Self {
        Self {
            policies,
            access,
            limiter: Arc::new(RateLimiter::default()),
            suspicious: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_suspicious_policy(mut self, policy: Arc<dyn SuspiciousActivityPolicy>) -> Self {
        self.suspicious = Some(policy);
        self
    }

    pub fn policies(&self) -> &Arc<PolicyCache> {
        &self.policies
    }

    pub fn access_requests(&self) -> &AccessRequests {
        &self.access
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn evaluate(
        &self,
        project_id: &str,
        source_ip: IpAddr,
        method: &str,
        path: &str,
    ) -> Decision {
        self.evaluate_at(project_id, source_ip, method, path, Utc::now(), Instant::now())
            .await
    }

    /// Evaluate with explicit clocks: `now` for approval expiry,
    /// `instant` for the rate-limit window
    pub async fn evaluate_at(
        &self,
        project_id: &str,
        source_ip: IpAddr,
        method: &str,
        path: &str,
        now: DateTime<Utc>,
        instant: Instant,
    ) -> Decision {
        let policy = match self.policies.policy(project_id).await {
            Ok(policy) => policy,
            Err(e) => {
                error!(project_id = %project_id, "Firewall policy unavailable: {}", e);
                return Decision::fail_safe("Firewall policy unavailable");
            }
        };

        if !policy.config.enabled {
            return Decision::Allow;
        }

        if policy.whitelist.contains(&source_ip) {
            debug!(project_id = %project_id, ip = %source_ip, "Whitelisted source");
            return Decision::Allow;
        }

        if !self.limiter.check_at(
            project_id,
            source_ip,
            policy.config.rate_limit_per_minute,
            instant,
        ) {
            warn!(
                project_id = %project_id,
                ip = %source_ip,
                limit = policy.config.rate_limit_per_minute,
                "Rate limit exceeded"
            );
            return Decision::RateLimited;
        }

        if policy.config.auto_block_suspicious {
            if let Some(hook) = &self.suspicious {
                if let Some(reason) = hook.inspect(project_id, source_ip, method, path) {
                    return Decision::Block { rule: None, reason };
                }
            }
        }

        let Some(hit) = policy.rules.first_match(method, path) else {
            return Decision::Allow;
        };

        let ip = source_ip.to_string();
        match self
            .access
            .is_approved(project_id, &ip, method, path, now)
            .await
        {
            Ok(true) => {
                debug!(
                    project_id = %project_id,
                    ip = %source_ip,
                    rule_id = hit.rule.id,
                    "Rule match overridden by approved access request"
                );
                Decision::Allow
            }
            Ok(false) => Decision::Block {
                rule: Some(hit.rule.clone()),
                reason: hit.reason,
            },
            Err(e) => {
                error!(project_id = %project_id, "Access-request lookup failed: {}", e);
                Decision::Block {
                    rule: Some(hit.rule.clone()),
                    reason: hit.reason,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MemoryAccessRequestStore;
    use crate::config::FirewallConfig;
    use crate::error::{FirewallError, FirewallResult};
    use crate::rules::{NewFirewallRule, RuleType};
    use crate::store::{MemoryRuleStore, RuleStore, DEFAULT_POLICY_TTL};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    struct Fixture {
        rules: Arc<MemoryRuleStore>,
        evaluator: FirewallEvaluator,
    }

    fn fixture() -> Fixture {
        let rules = Arc::new(MemoryRuleStore::new());
        let policies = Arc::new(PolicyCache::new(rules.clone(), Duration::ZERO));
        let access = AccessRequests::new(Arc::new(MemoryAccessRequestStore::new()));
        Fixture {
            rules,
            evaluator: FirewallEvaluator::new(policies, access),
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    async fn add(f: &Fixture, rule_type: RuleType, value: &str) -> FirewallRule {
        f.rules
            .add_rule("proj", NewFirewallRule::new(rule_type, value, None).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_delete_rule_blocks_delete_allows_get() {
        let f = fixture();
        let rule = add(&f, RuleType::Method, "DELETE").await;

        match f.evaluator.evaluate("proj", ip("1.2.3.4"), "DELETE", "/anything").await {
            Decision::Block { rule: Some(r), .. } => assert_eq!(r.id, rule.id),
            other => panic!("expected block, got {:?}", other),
        }
        assert_eq!(
            f.evaluator.evaluate("proj", ip("1.2.3.4"), "GET", "/anything").await,
            Decision::Allow
        );
    }

    #[tokio::test]
    async fn test_disabled_firewall_allows() {
        let f = fixture();
        add(&f, RuleType::Path, "/").await;
        f.rules
            .put_config(
                "proj",
                FirewallConfig {
                    enabled: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(f
            .evaluator
            .evaluate("proj", ip("1.2.3.4"), "GET", "/admin")
            .await
            .is_allow());
    }

    #[tokio::test]
    async fn test_whitelist_dominates_rules_and_rate_limit() {
        let f = fixture();
        add(&f, RuleType::Path, "/").await;
        add(&f, RuleType::Method, "GET").await;
        f.rules
            .put_config(
                "proj",
                FirewallConfig {
                    rate_limit_per_minute: 1,
                    whitelist_ips: vec!["10.0.0.0/8".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        for _ in 0..5 {
            assert!(f
                .evaluator
                .evaluate("proj", ip("10.1.2.3"), "GET", "/admin")
                .await
                .is_allow());
        }
        assert!(matches!(
            f.evaluator.evaluate("proj", ip("11.1.2.3"), "GET", "/admin").await,
            Decision::Block { .. }
        ));
    }

    #[tokio::test]
    async fn test_rate_limited_after_limit() {
        let f = fixture();
        let start = Instant::now();
        let now = Utc::now();
        for _ in 0..100 {
            assert!(f
                .evaluator
                .evaluate_at("proj", ip("5.5.5.5"), "GET", "/", now, start)
                .await
                .is_allow());
        }
        assert_eq!(
            f.evaluator
                .evaluate_at("proj", ip("5.5.5.5"), "GET", "/", now, start)
                .await,
            Decision::RateLimited
        );
        assert!(f
            .evaluator
            .evaluate_at("proj", ip("6.6.6.6"), "GET", "/", now, start)
            .await
            .is_allow());
    }

    #[tokio::test]
    async fn test_approval_window_scenario() {
        let f = fixture();
        add(&f, RuleType::Path, "/admin").await;
        let access = f.evaluator.access_requests().clone();
        let t0 = Utc::now();

        let reason = match f
            .evaluator
            .evaluate_at("proj", ip("1.2.3.4"), "GET", "/admin", t0, Instant::now())
            .await
        {
            Decision::Block { reason, .. } => reason,
            other => panic!("expected block, got {:?}", other),
        };
        let pending = access
            .record_block("proj", "1.2.3.4", "GET", "/admin", None, &reason)
            .await
            .unwrap();
        access.approve_at("proj", pending.id, 5, t0).await.unwrap();

        let minute_4 = t0 + ChronoDuration::minutes(4);
        assert!(f
            .evaluator
            .evaluate_at("proj", ip("1.2.3.4"), "GET", "/admin", minute_4, Instant::now())
            .await
            .is_allow());

        // Approval covers only the exact (ip, method, path)
        assert!(!f
            .evaluator
            .evaluate_at("proj", ip("1.2.3.4"), "POST", "/admin", minute_4, Instant::now())
            .await
            .is_allow());

        let minute_6 = t0 + ChronoDuration::minutes(6);
        assert!(matches!(
            f.evaluator
                .evaluate_at("proj", ip("1.2.3.4"), "GET", "/admin", minute_6, Instant::now())
                .await,
            Decision::Block { .. }
        ));
    }

    #[tokio::test]
    async fn test_evaluation_is_deterministic() {
        let f = fixture();
        add(&f, RuleType::Pattern, r".*\.php$").await;
        add(&f, RuleType::Path, "/wp-admin").await;

        let first = f
            .evaluator
            .evaluate("proj", ip("1.2.3.4"), "GET", "/wp-admin/index.php")
            .await;
        for _ in 0..10 {
            assert_eq!(
                f.evaluator
                    .evaluate("proj", ip("1.2.3.4"), "GET", "/wp-admin/index.php")
                    .await,
                first
            );
        }
    }

    struct FailingStore;

    #[async_trait]
    impl RuleStore for FailingStore {
        async fn list_rules(&self, _: &str) -> FirewallResult<Vec<FirewallRule>> {
            Err(FirewallError::Store("connection refused".into()))
        }
        async fn add_rule(&self, _: &str, _: NewFirewallRule) -> FirewallResult<FirewallRule> {
            Err(FirewallError::Store("connection refused".into()))
        }
        async fn delete_rule(&self, _: &str, _: i64) -> FirewallResult<()> {
            Err(FirewallError::Store("connection refused".into()))
        }
        async fn get_config(&self, _: &str) -> FirewallResult<Option<FirewallConfig>> {
            Err(FirewallError::Store("connection refused".into()))
        }
        async fn put_config(&self, _: &str, _: FirewallConfig) -> FirewallResult<FirewallConfig> {
            Err(FirewallError::Store("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_safe_to_block() {
        let policies = Arc::new(PolicyCache::new(Arc::new(FailingStore), DEFAULT_POLICY_TTL));
        let access = AccessRequests::new(Arc::new(MemoryAccessRequestStore::new()));
        let evaluator = FirewallEvaluator::new(policies, access);

        assert!(matches!(
            evaluator.evaluate("proj", ip("1.2.3.4"), "GET", "/").await,
            Decision::Block { rule: None, .. }
        ));
    }

    struct BlockDotFiles;

    impl SuspiciousActivityPolicy for BlockDotFiles {
        fn inspect(&self, _: &str, _: IpAddr, _: &str, path: &str) -> Option<String> {
            path.contains("/.").then(|| "dotfile probe".to_string())
        }
    }

    #[tokio::test]
    async fn test_suspicious_hook_only_when_enabled() {
        let f = fixture();
        let evaluator = f
            .evaluator
            .clone()
            .with_suspicious_policy(Arc::new(BlockDotFiles));

        assert!(evaluator
            .evaluate("proj", ip("1.2.3.4"), "GET", "/.env")
            .await
            .is_allow());

        f.rules
            .put_config(
                "proj",
                FirewallConfig {
                    auto_block_suspicious: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            evaluator.evaluate("proj", ip("1.2.3.4"), "GET", "/.env").await,
            Decision::Block {
                rule: None,
                reason: "dotfile probe".to_string()
            }
        );
    }
}
