//! Firewall rule model, validation and matching

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::{FirewallError, FirewallResult};

/// HTTP methods a `method` rule may name
pub const BLOCKABLE_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// Description attached to rules created by [`RuleDocument`] import
pub const IMPORTED_DESCRIPTION: &str = "Imported from JSON";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Method,
    Path,
    Pattern,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Method => "method",
            RuleType::Path => "path",
            RuleType::Pattern => "pattern",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = FirewallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "method" => Ok(RuleType::Method),
            "path" => Ok(RuleType::Path),
            "pattern" => Ok(RuleType::Pattern),
            other => Err(FirewallError::InvalidRule(format!(
                "Invalid rule type '{}'. Must be one of: path, method, pattern",
                other
            ))),
        }
    }
}

/// A stored firewall rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub id: i64,
    pub project_id: String,
    pub rule_type: RuleType,
    pub value: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A validated rule ready to be stored.
///
/// Only obtainable through [`NewFirewallRule::new`], so every stored rule
/// has a normalised value and, for patterns, a compilable expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFirewallRule {
    rule_type: RuleType,
    value: String,
    description: Option<String>,
}

impl NewFirewallRule {
    pub fn new(
        rule_type: RuleType,
        value: &str,
        description: Option<String>,
    ) -> FirewallResult<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(FirewallError::InvalidRule("Rule value is required".to_string()));
        }

        let value = match rule_type {
            RuleType::Path => normalize_path(value),
            RuleType::Method => {
                let method = value.to_ascii_uppercase();
                if !BLOCKABLE_METHODS.contains(&method.as_str()) {
                    return Err(FirewallError::InvalidRule(format!(
                        "Invalid HTTP method '{}'. Must be one of: {}",
                        value,
                        BLOCKABLE_METHODS.join(", ")
                    )));
                }
                method
            }
            RuleType::Pattern => {
                compile_pattern(value).map_err(|e| {
                    FirewallError::InvalidRule(format!("Invalid regex pattern '{}': {}", value, e))
                })?;
                value.to_string()
            }
        };

        let description = description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        Ok(Self {
            rule_type,
            value,
            description,
        })
    }

    pub fn rule_type(&self) -> RuleType {
        self.rule_type
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn into_rule(self, id: i64, project_id: &str, created_at: DateTime<Utc>) -> FirewallRule {
        FirewallRule {
            id,
            project_id: project_id.to_string(),
            rule_type: self.rule_type,
            value: self.value,
            description: self.description,
            created_at,
        }
    }
}

fn normalize_path(value: &str) -> String {
    if value.starts_with('/') {
        value.to_string()
    } else {
        format!("/{}", value)
    }
}

/// Patterns are anchored at the start of the path
fn compile_pattern(pattern: &str) -> Result<Regex, regex_lite::Error> {
    Regex::new(&format!("^(?:{})", pattern))
}

fn path_matches(blocked: &str, path: &str) -> bool {
    if blocked.ends_with('/') {
        return path.starts_with(blocked);
    }
    path == blocked
        || path
            .strip_prefix(blocked)
            .is_some_and(|rest| rest.starts_with('/'))
}

enum Matcher {
    Method(String),
    Path(String),
    Pattern(Regex),
}

struct CompiledRule {
    rule: FirewallRule,
    matcher: Matcher,
}

/// A rule that matched a request, with the human-readable block reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch<'a> {
    pub rule: &'a FirewallRule,
    pub reason: String,
}

/// Compiled, evaluation-ordered rules of one project.
///
/// Method rules are tested first, then path rules, then patterns, each in
/// ascending id order, so the reported rule is deterministic.
#[derive(Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleSet")
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl RuleSet {
    pub fn compile(rules: Vec<FirewallRule>) -> Self {
        let mut compiled: Vec<CompiledRule> = rules
            .into_iter()
            .filter_map(|rule| {
                let matcher = match rule.rule_type {
                    RuleType::Method => Matcher::Method(rule.value.to_ascii_uppercase()),
                    RuleType::Path => Matcher::Path(normalize_path(&rule.value)),
                    RuleType::Pattern => match compile_pattern(&rule.value) {
                        Ok(regex) => Matcher::Pattern(regex),
                        Err(e) => {
                            warn!(
                                rule_id = rule.id,
                                project_id = %rule.project_id,
                                "Skipping firewall rule with invalid pattern '{}': {}",
                                rule.value,
                                e
                            );
                            return None;
                        }
                    },
                };
                Some(CompiledRule { rule, matcher })
            })
            .collect();

        compiled.sort_by_key(|c| (c.rule.rule_type, c.rule.id));
        Self { rules: compiled }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule blocking `(method, path)`, if any
    pub fn first_match(&self, method: &str, path: &str) -> Option<RuleMatch<'_>> {
        self.rules.iter().find_map(|compiled| {
            let rule = &compiled.rule;
            let reason = match &compiled.matcher {
                Matcher::Method(blocked) if method.eq_ignore_ascii_case(blocked) => format!(
                    "HTTP method '{}' is blocked by firewall rule {}",
                    method.to_ascii_uppercase(),
                    rule.id
                ),
                Matcher::Path(blocked) if path_matches(blocked, path) => format!(
                    "Path '{}' matches blocked path '{}' (rule {})",
                    path, blocked, rule.id
                ),
                Matcher::Pattern(regex) if regex.is_match(path) => format!(
                    "Path '{}' matches blocked pattern '{}' (rule {})",
                    path, rule.value, rule.id
                ),
                _ => return None,
            };
            let reason = match &rule.description {
                Some(description) => format!("{}: {}", reason, description),
                None => reason,
            };
            Some(RuleMatch { rule, reason })
        })
    }
}

/// Flat import/export document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDocument {
    #[serde(default)]
    pub blocked_paths: Vec<String>,
    #[serde(default)]
    pub blocked_methods: Vec<String>,
    #[serde(default)]
    pub path_patterns: Vec<String>,
}

impl RuleDocument {
    pub fn from_rules(rules: &[FirewallRule]) -> Self {
        let mut doc = Self::default();
        for rule in rules {
            let target = match rule.rule_type {
                RuleType::Path => &mut doc.blocked_paths,
                RuleType::Method => &mut doc.blocked_methods,
                RuleType::Pattern => &mut doc.path_patterns,
            };
            target.push(rule.value.clone());
        }
        doc
    }

    /// Validate every entry; fails without producing anything if one is invalid
    pub fn into_new_rules(self) -> FirewallResult<Vec<NewFirewallRule>> {
        let entries = self
            .blocked_paths
            .iter()
            .map(|v| (RuleType::Path, v))
            .chain(self.blocked_methods.iter().map(|v| (RuleType::Method, v)))
            .chain(self.path_patterns.iter().map(|v| (RuleType::Pattern, v)));

        let mut rules: Vec<NewFirewallRule> = Vec::new();
        for (rule_type, value) in entries {
            let rule = NewFirewallRule::new(rule_type, value, Some(IMPORTED_DESCRIPTION.to_string()))?;
            if !rules
                .iter()
                .any(|r| r.rule_type == rule.rule_type && r.value == rule.value)
            {
                rules.push(rule);
            }
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, rule_type: RuleType, value: &str) -> FirewallRule {
        NewFirewallRule::new(rule_type, value, None)
            .unwrap()
            .into_rule(id, "proj", Utc::now())
    }

    #[test]
    fn test_rule_type_parse() {
        assert_eq!("path".parse::<RuleType>().unwrap(), RuleType::Path);
        assert_eq!("method".parse::<RuleType>().unwrap(), RuleType::Method);
        assert!("header".parse::<RuleType>().is_err());
    }

    #[test]
    fn test_path_values_are_normalized() {
        let rule = NewFirewallRule::new(RuleType::Path, "admin", None).unwrap();
        assert_eq!(rule.value(), "/admin");
    }

    #[test]
    fn test_method_validation() {
        let rule = NewFirewallRule::new(RuleType::Method, "delete", None).unwrap();
        assert_eq!(rule.value(), "DELETE");

        let err = NewFirewallRule::new(RuleType::Method, "BREW", None).unwrap_err();
        assert!(matches!(err, FirewallError::InvalidRule(_)));
    }

    #[test]
    fn test_malformed_pattern_rejected_at_creation() {
        let err = NewFirewallRule::new(RuleType::Pattern, "/api/(unclosed", None).unwrap_err();
        assert!(err.to_string().contains("Invalid regex pattern"));
    }

    #[test]
    fn test_empty_value_rejected() {
        assert!(NewFirewallRule::new(RuleType::Path, "   ", None).is_err());
    }

    #[test]
    fn test_method_rule_blocks_only_that_verb() {
        let set = RuleSet::compile(vec![rule(1, RuleType::Method, "DELETE")]);
        assert!(set.first_match("DELETE", "/anything").is_some());
        assert!(set.first_match("delete", "/anything").is_some());
        assert!(set.first_match("GET", "/anything").is_none());
    }

    #[test]
    fn test_path_rule_prefix_semantics() {
        let set = RuleSet::compile(vec![rule(1, RuleType::Path, "/admin")]);
        assert!(set.first_match("GET", "/admin").is_some());
        assert!(set.first_match("GET", "/admin/users").is_some());
        assert!(set.first_match("GET", "/administrator").is_none());
        assert!(set.first_match("GET", "/public").is_none());
    }

    #[test]
    fn test_root_path_rule_blocks_everything() {
        let set = RuleSet::compile(vec![rule(1, RuleType::Path, "/")]);
        assert!(set.first_match("GET", "/").is_some());
        assert!(set.first_match("GET", "/deep/path").is_some());
    }

    #[test]
    fn test_pattern_is_anchored_at_start() {
        let set = RuleSet::compile(vec![rule(1, RuleType::Pattern, r"/api/v\d+/internal")]);
        assert!(set.first_match("GET", "/api/v2/internal/keys").is_some());
        assert!(set.first_match("GET", "/public/api/v2/internal").is_none());
    }

    #[test]
    fn test_stored_invalid_pattern_is_skipped() {
        let broken = FirewallRule {
            id: 5,
            project_id: "proj".into(),
            rule_type: RuleType::Pattern,
            value: "(".into(),
            description: None,
            created_at: Utc::now(),
        };
        let set = RuleSet::compile(vec![broken, rule(6, RuleType::Path, "/x")]);
        assert_eq!(set.len(), 1);
        assert!(set.first_match("GET", "/x").is_some());
    }

    #[test]
    fn test_match_order_is_deterministic() {
        let set = RuleSet::compile(vec![
            rule(9, RuleType::Pattern, "/admin.*"),
            rule(7, RuleType::Path, "/admin"),
            rule(3, RuleType::Path, "/"),
            rule(8, RuleType::Method, "POST"),
        ]);

        let hit = set.first_match("POST", "/admin").unwrap();
        assert_eq!(hit.rule.id, 8);
        assert!(hit.reason.contains("HTTP method 'POST'"));

        let hit = set.first_match("GET", "/admin").unwrap();
        assert_eq!(hit.rule.id, 3);
    }

    #[test]
    fn test_reason_includes_description() {
        let r = NewFirewallRule::new(RuleType::Path, "/admin", Some("Admin area".into()))
            .unwrap()
            .into_rule(2, "proj", Utc::now());
        let set = RuleSet::compile(vec![r]);
        let hit = set.first_match("GET", "/admin/x").unwrap();
        assert_eq!(
            hit.reason,
            "Path '/admin/x' matches blocked path '/admin' (rule 2): Admin area"
        );
    }

    #[test]
    fn test_document_export_groups_by_type() {
        let doc = RuleDocument::from_rules(&[
            rule(1, RuleType::Path, "/admin"),
            rule(2, RuleType::Method, "DELETE"),
            rule(3, RuleType::Pattern, r"\.env$"),
        ]);
        assert_eq!(doc.blocked_paths, vec!["/admin"]);
        assert_eq!(doc.blocked_methods, vec!["DELETE"]);
        assert_eq!(doc.path_patterns, vec![r"\.env$"]);
    }

    #[test]
    fn test_document_import_validates_all_or_nothing() {
        let doc: RuleDocument = serde_json::from_str(
            r#"{"blocked_paths": ["admin", "/admin"], "blocked_methods": ["put"], "path_patterns": ["("]}"#,
        )
        .unwrap();
        assert!(doc.into_new_rules().is_err());

        let doc: RuleDocument =
            serde_json::from_str(r#"{"blocked_paths": ["admin", "/admin"], "blocked_methods": ["put"]}"#)
                .unwrap();
        let rules = doc.into_new_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].value(), "/admin");
        assert_eq!(rules[1].value(), "PUT");
        assert_eq!(rules[1].description(), Some(IMPORTED_DESCRIPTION));
    }
}
