//! Subdomain routing entries

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "routing_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub subdomain: String,

    pub project_id: String,

    pub agent_id: String,

    pub local_port: i32,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
