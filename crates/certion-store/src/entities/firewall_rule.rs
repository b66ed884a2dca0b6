//! Per-project firewall rule

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum RuleKind {
    #[sea_orm(string_value = "path")]
    Path,
    #[sea_orm(string_value = "method")]
    Method,
    #[sea_orm(string_value = "pattern")]
    Pattern,
}

impl From<certion_firewall::RuleType> for RuleKind {
    fn from(rule_type: certion_firewall::RuleType) -> Self {
        match rule_type {
            certion_firewall::RuleType::Path => RuleKind::Path,
            certion_firewall::RuleType::Method => RuleKind::Method,
            certion_firewall::RuleType::Pattern => RuleKind::Pattern,
        }
    }
}

impl From<RuleKind> for certion_firewall::RuleType {
    fn from(kind: RuleKind) -> Self {
        match kind {
            RuleKind::Path => certion_firewall::RuleType::Path,
            RuleKind::Method => certion_firewall::RuleType::Method,
            RuleKind::Pattern => certion_firewall::RuleType::Pattern,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "firewall_rules")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub project_id: String,

    pub rule_type: RuleKind,

    /// Normalised path, upper-case method or regular expression
    #[sea_orm(column_type = "Text")]
    pub value: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for certion_firewall::FirewallRule {
    fn from(model: Model) -> Self {
        Self {
            id: i64::from(model.id),
            project_id: model.project_id,
            rule_type: model.rule_type.into(),
            value: model.value,
            description: model.description,
            created_at: model.created_at,
        }
    }
}
