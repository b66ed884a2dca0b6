//! Access-request audit records for blocked requests

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum RequestStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "approved")]
    Approved,
    #[sea_orm(string_value = "rejected")]
    Rejected,
    #[sea_orm(string_value = "revoked")]
    Revoked,
}

impl From<certion_firewall::AccessStatus> for RequestStatus {
    fn from(status: certion_firewall::AccessStatus) -> Self {
        match status {
            certion_firewall::AccessStatus::Pending => RequestStatus::Pending,
            certion_firewall::AccessStatus::Approved => RequestStatus::Approved,
            certion_firewall::AccessStatus::Rejected => RequestStatus::Rejected,
            certion_firewall::AccessStatus::Revoked => RequestStatus::Revoked,
        }
    }
}

impl From<RequestStatus> for certion_firewall::AccessStatus {
    fn from(status: RequestStatus) -> Self {
        match status {
            RequestStatus::Pending => certion_firewall::AccessStatus::Pending,
            RequestStatus::Approved => certion_firewall::AccessStatus::Approved,
            RequestStatus::Rejected => certion_firewall::AccessStatus::Rejected,
            RequestStatus::Revoked => certion_firewall::AccessStatus::Revoked,
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "firewall_access_requests")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub project_id: String,

    /// Source IP of the blocked request (IPv4 or IPv6 text form)
    pub ip_address: String,

    pub method: String,

    #[sea_orm(column_type = "Text")]
    pub path: String,

    /// Rule that caused the block, if any
    pub rule_id: Option<i32>,

    #[sea_orm(column_type = "Text")]
    pub block_reason: String,

    pub status: RequestStatus,

    pub approved_until: Option<ChronoDateTimeUtc>,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for certion_firewall::AccessRequest {
    fn from(model: Model) -> Self {
        Self {
            id: i64::from(model.id),
            project_id: model.project_id,
            ip_address: model.ip_address,
            method: model.method,
            path: model.path,
            rule_id: model.rule_id.map(i64::from),
            block_reason: model.block_reason,
            status: model.status.into(),
            approved_until: model.approved_until,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}
