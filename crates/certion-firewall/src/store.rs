//! Rule store interface and the per-project policy cache

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::FirewallConfig;
use crate::error::{FirewallError, FirewallResult};
use crate::rules::{FirewallRule, NewFirewallRule, RuleDocument, RuleSet};
use crate::whitelist::IpWhitelist;

/// How long a cached project policy is served before it is re-read
pub const DEFAULT_POLICY_TTL: Duration = Duration::from_secs(60);

/// Persistent firewall rules and configuration, per project
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list_rules(&self, project_id: &str) -> FirewallResult<Vec<FirewallRule>>;

    /// Fails with [`FirewallError::DuplicateRule`] if the project already
    /// has a rule of the same type and value
    async fn add_rule(
        &self,
        project_id: &str,
        rule: NewFirewallRule,
    ) -> FirewallResult<FirewallRule>;

    async fn delete_rule(&self, project_id: &str, rule_id: i64) -> FirewallResult<()>;

    /// `None` when the project never saved a configuration
    async fn get_config(&self, project_id: &str) -> FirewallResult<Option<FirewallConfig>>;

    async fn put_config(
        &self,
        project_id: &str,
        config: FirewallConfig,
    ) -> FirewallResult<FirewallConfig>;
}

/// Outcome of a rule import
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ImportSummary {
    pub added: usize,
    pub skipped: usize,
}

/// Validate a whole document, then add its rules, skipping duplicates
pub async fn import_rules(
    store: &dyn RuleStore,
    project_id: &str,
    document: RuleDocument,
) -> FirewallResult<ImportSummary> {
    let rules = document.into_new_rules()?;
    let mut summary = ImportSummary::default();
    for rule in rules {
        match store.add_rule(project_id, rule).await {
            Ok(_) => summary.added += 1,
            Err(FirewallError::DuplicateRule { .. }) => summary.skipped += 1,
            Err(e) => return Err(e),
        }
    }
    debug!(
        project_id = %project_id,
        "Imported firewall rules: {} added, {} skipped",
        summary.added,
        summary.skipped
    );
    Ok(summary)
}

/// In-memory rule store
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    inner: RwLock<MemoryRules>,
}

#[derive(Debug, Default)]
struct MemoryRules {
    next_id: i64,
    rules: Vec<FirewallRule>,
    configs: HashMap<String, FirewallConfig>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn list_rules(&self, project_id: &str) -> FirewallResult<Vec<FirewallRule>> {
        let inner = self.inner.read().await;
        Ok(inner
            .rules
            .iter()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn add_rule(
        &self,
        project_id: &str,
        rule: NewFirewallRule,
    ) -> FirewallResult<FirewallRule> {
        let mut inner = self.inner.write().await;
        if inner.rules.iter().any(|r| {
            r.project_id == project_id && r.rule_type == rule.rule_type() && r.value == rule.value()
        }) {
            return Err(FirewallError::DuplicateRule {
                rule_type: rule.rule_type().to_string(),
                value: rule.value().to_string(),
            });
        }
        inner.next_id += 1;
        let stored = rule.into_rule(inner.next_id, project_id, Utc::now());
        inner.rules.push(stored.clone());
        Ok(stored)
    }

    async fn delete_rule(&self, project_id: &str, rule_id: i64) -> FirewallResult<()> {
        let mut inner = self.inner.write().await;
        let before = inner.rules.len();
        inner
            .rules
            .retain(|r| !(r.project_id == project_id && r.id == rule_id));
        if inner.rules.len() == before {
            return Err(FirewallError::RuleNotFound(rule_id));
        }
        Ok(())
    }

    async fn get_config(&self, project_id: &str) -> FirewallResult<Option<FirewallConfig>> {
        Ok(self.inner.read().await.configs.get(project_id).cloned())
    }

    async fn put_config(
        &self,
        project_id: &str,
        config: FirewallConfig,
    ) -> FirewallResult<FirewallConfig> {
        self.inner
            .write()
            .await
            .configs
            .insert(project_id.to_string(), config.clone());
        Ok(config)
    }
}

/// Everything the evaluator needs about one project, compiled once
#[derive(Debug)]
pub struct ProjectPolicy {
    pub config: FirewallConfig,
    pub whitelist: IpWhitelist,
    pub rules: RuleSet,
}

impl ProjectPolicy {
    pub fn new(project_id: &str, config: FirewallConfig, rules: Vec<FirewallRule>) -> Self {
        let (whitelist, rejected) = IpWhitelist::parse_lenient(&config.whitelist_ips);
        for entry in rejected {
            warn!(project_id = %project_id, "Ignoring invalid whitelist entry '{}'", entry);
        }
        Self {
            config,
            whitelist,
            rules: RuleSet::compile(rules),
        }
    }
}

/// Read-through cache of [`ProjectPolicy`] with a fixed TTL.
///
/// Callers that change rules or configuration must [`invalidate`] the
/// project so the next request sees the change.
///
/// [`invalidate`]: PolicyCache::invalidate
pub struct PolicyCache {
    store: Arc<dyn RuleStore>,
    ttl: Duration,
    entries: DashMap<String, (Instant, Arc<ProjectPolicy>)>,
}

impl std::fmt::Debug for PolicyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl PolicyCache {
    pub fn new(store: Arc<dyn RuleStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn RuleStore> {
        &self.store
    }

    pub async fn policy(&self, project_id: &str) -> FirewallResult<Arc<ProjectPolicy>> {
        if let Some(entry) = self.entries.get(project_id) {
            let (fetched_at, policy) = entry.value();
            if fetched_at.elapsed() < self.ttl {
                return Ok(policy.clone());
            }
        }

        let config = self.store.get_config(project_id).await?.unwrap_or_default();
        let rules = self.store.list_rules(project_id).await?;
        let policy = Arc::new(ProjectPolicy::new(project_id, config, rules));

        if !self.ttl.is_zero() {
            self.entries
                .insert(project_id.to_string(), (Instant::now(), policy.clone()));
        }
        Ok(policy)
    }

    pub fn invalidate(&self, project_id: &str) {
        self.entries.remove(project_id);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
