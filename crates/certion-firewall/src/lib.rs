//! Edge firewall
//!
//! Per-project rules (method, path prefix, anchored pattern), a source-IP
//! whitelist, a sliding-window rate limiter and the access-request workflow
//! that lets operators temporarily unblock a specific `(ip, method, path)`.

pub mod access;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod rate_limit;
pub mod rules;
pub mod store;
pub mod whitelist;

pub use access::{
    AccessRequest, AccessRequestStore, AccessRequests, AccessStatus, BlockedRequest,
    MemoryAccessRequestStore, DEFAULT_APPROVAL_MINUTES, MAX_APPROVAL_MINUTES,
};
pub use config::FirewallConfig;
pub use error::{FirewallError, FirewallResult};
pub use evaluator::{Decision, FirewallEvaluator, SuspiciousActivityPolicy};
pub use rate_limit::RateLimiter;
pub use rules::{FirewallRule, NewFirewallRule, RuleDocument, RuleSet, RuleType};
pub use store::{
    import_rules, ImportSummary, MemoryRuleStore, PolicyCache, ProjectPolicy, RuleStore,
    DEFAULT_POLICY_TTL,
};
pub use whitelist::IpWhitelist;
