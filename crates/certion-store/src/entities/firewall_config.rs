//! Per-project firewall configuration

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "firewall_configs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub project_id: String,

    pub enabled: bool,

    pub rate_limit_per_minute: i32,

    pub auto_block_suspicious: bool,

    /// JSON array of IP addresses / CIDR ranges
    #[sea_orm(column_type = "Text")]
    pub whitelist_ips: String,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
