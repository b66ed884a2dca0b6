//! Firewall error types

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FirewallError {
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Rule already exists: {rule_type} '{value}'")]
    DuplicateRule { rule_type: String, value: String },

    #[error("Invalid whitelist entry: {0}")]
    InvalidWhitelistEntry(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Access request {0} not found")]
    AccessRequestNotFound(i64),

    #[error("Firewall rule {0} not found")]
    RuleNotFound(i64),

    #[error("Cannot {action} access request {id}: status is {status}")]
    InvalidTransition {
        id: i64,
        action: &'static str,
        status: String,
    },

    #[error("Invalid approval duration: {0} minutes (must be between 1 and 60)")]
    InvalidDuration(i64),

    #[error("Store error: {0}")]
    Store(String),
}

pub type FirewallResult<T> = Result<T, FirewallError>;
