use async_trait::async_trait;
use certion_firewall::{
    AccessRequestStore, AccessStatus, BlockedRequest, FirewallConfig, FirewallError,
    FirewallResult, FirewallRule, NewFirewallRule, RuleStore,
};
use certion_router::{RoutingEntry, RoutingError, RoutingTable};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, NotSet, QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use tracing::debug;

use crate::entities::access_request::{self, RequestStatus};
use crate::entities::firewall_rule::{self, RuleKind};
use crate::entities::{firewall_config, routing_entry};

fn store_err(err: DbErr) -> FirewallError {
    FirewallError::Store(err.to_string())
}

fn routing_err(err: DbErr) -> RoutingError {
    RoutingError::Store(err.to_string())
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

/// Rule store, access-request store and routing table over one database
#[derive(Debug, Clone)]
pub struct DbStore {
    db: DatabaseConnection,
}

impl DbStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

async fn find_pending<C: ConnectionTrait>(
    conn: &C,
    request: &BlockedRequest,
) -> FirewallResult<Option<access_request::Model>> {
    access_request::Entity::find()
        .filter(access_request::Column::ProjectId.eq(request.project_id.as_str()))
        .filter(access_request::Column::IpAddress.eq(request.ip_address.as_str()))
        .filter(access_request::Column::Method.eq(request.method.as_str()))
        .filter(access_request::Column::Path.eq(request.path.as_str()))
        .filter(access_request::Column::Status.eq(RequestStatus::Pending.to_value()))
        .one(conn)
        .await
        .map_err(store_err)
}

#[async_trait]
impl RuleStore for DbStore {
    async fn list_rules(&self, project_id: &str) -> FirewallResult<Vec<FirewallRule>> {
        let rules = firewall_rule::Entity::find()
            .filter(firewall_rule::Column::ProjectId.eq(project_id))
            .order_by_asc(firewall_rule::Column::Id)
            .all(&self.db)
            .await
            .map_err(store_err)?;
        Ok(rules.into_iter().map(FirewallRule::from).collect())
    }

    async fn add_rule(
        &self,
        project_id: &str,
        rule: NewFirewallRule,
    ) -> FirewallResult<FirewallRule> {
        let kind = RuleKind::from(rule.rule_type());
        let duplicate = || FirewallError::DuplicateRule {
            rule_type: rule.rule_type().to_string(),
            value: rule.value().to_string(),
        };

        let existing = firewall_rule::Entity::find()
            .filter(firewall_rule::Column::ProjectId.eq(project_id))
            .filter(firewall_rule::Column::RuleType.eq(kind.to_value()))
            .filter(firewall_rule::Column::Value.eq(rule.value()))
            .one(&self.db)
            .await
            .map_err(store_err)?;
        if existing.is_some() {
            return Err(duplicate());
        }

        let model = firewall_rule::ActiveModel {
            id: NotSet,
            project_id: Set(project_id.to_string()),
            rule_type: Set(kind),
            value: Set(rule.value().to_string()),
            description: Set(rule.description().map(str::to_string)),
            created_at: Set(Utc::now()),
        };

        match model.insert(&self.db).await {
            Ok(model) => {
                debug!(project_id = %project_id, rule_id = model.id, "Firewall rule stored");
                Ok(model.into())
            }
            Err(e) if is_unique_violation(&e) => Err(duplicate()),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn delete_rule(&self, project_id: &str, rule_id: i64) -> FirewallResult<()> {
        let id = i32::try_from(rule_id).map_err(|_| FirewallError::RuleNotFound(rule_id))?;
        let result = firewall_rule::Entity::delete_many()
            .filter(firewall_rule::Column::ProjectId.eq(project_id))
            .filter(firewall_rule::Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(store_err)?;
        if result.rows_affected == 0 {
            return Err(FirewallError::RuleNotFound(rule_id));
        }
        Ok(())
    }

    async fn get_config(&self, project_id: &str) -> FirewallResult<Option<FirewallConfig>> {
        let Some(model) = firewall_config::Entity::find_by_id(project_id.to_string())
            .one(&self.db)
            .await
            .map_err(store_err)?
        else {
            return Ok(None);
        };

        let whitelist_ips: Vec<String> = serde_json::from_str(&model.whitelist_ips)
            .map_err(|e| FirewallError::Store(format!("Corrupt whitelist: {}", e)))?;

        Ok(Some(FirewallConfig {
            enabled: model.enabled,
            rate_limit_per_minute: u32::try_from(model.rate_limit_per_minute).unwrap_or(0),
            auto_block_suspicious: model.auto_block_suspicious,
            whitelist_ips,
        }))
    }

    async fn put_config(
        &self,
        project_id: &str,
        config: FirewallConfig,
    ) -> FirewallResult<FirewallConfig> {
        let whitelist_ips = serde_json::to_string(&config.whitelist_ips)
            .map_err(|e| FirewallError::Store(e.to_string()))?;
        let rate_limit = i32::try_from(config.rate_limit_per_minute)
            .map_err(|_| FirewallError::InvalidConfig("rate_limit is too large".to_string()))?;

        let model = firewall_config::ActiveModel {
            project_id: Set(project_id.to_string()),
            enabled: Set(config.enabled),
            rate_limit_per_minute: Set(rate_limit),
            auto_block_suspicious: Set(config.auto_block_suspicious),
            whitelist_ips: Set(whitelist_ips),
            updated_at: Set(Utc::now()),
        };

        firewall_config::Entity::insert(model)
            .on_conflict(
                OnConflict::column(firewall_config::Column::ProjectId)
                    .update_columns([
                        firewall_config::Column::Enabled,
                        firewall_config::Column::RateLimitPerMinute,
                        firewall_config::Column::AutoBlockSuspicious,
                        firewall_config::Column::WhitelistIps,
                        firewall_config::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(store_err)?;

        Ok(config)
    }
}

#[async_trait]
impl AccessRequestStore for DbStore {
    async fn find_or_insert_pending(
        &self,
        request: BlockedRequest,
        now: DateTime<Utc>,
    ) -> FirewallResult<(certion_firewall::AccessRequest, bool)> {
        let txn = self.db.begin().await.map_err(store_err)?;

        if let Some(existing) = find_pending(&txn, &request).await? {
            txn.commit().await.map_err(store_err)?;
            return Ok((existing.into(), false));
        }

        let model = access_request::ActiveModel {
            id: NotSet,
            project_id: Set(request.project_id.clone()),
            ip_address: Set(request.ip_address.clone()),
            method: Set(request.method.clone()),
            path: Set(request.path.clone()),
            rule_id: Set(request.rule_id.and_then(|id| i32::try_from(id).ok())),
            block_reason: Set(request.block_reason.clone()),
            status: Set(RequestStatus::Pending),
            approved_until: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match model.insert(&txn).await {
            Ok(model) => {
                txn.commit().await.map_err(store_err)?;
                Ok((model.into(), true))
            }
            Err(e) => {
                txn.rollback().await.map_err(store_err)?;
                // A concurrent block of the same request won the insert
                match find_pending(&self.db, &request).await? {
                    Some(existing) if is_unique_violation(&e) => Ok((existing.into(), false)),
                    _ => Err(store_err(e)),
                }
            }
        }
    }

    async fn get(&self, id: i64) -> FirewallResult<Option<certion_firewall::AccessRequest>> {
        let Ok(id) = i32::try_from(id) else {
            return Ok(None);
        };
        Ok(access_request::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(store_err)?
            .map(Into::into))
    }

    async fn transition(
        &self,
        id: i64,
        from: AccessStatus,
        to: AccessStatus,
        approved_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> FirewallResult<Option<certion_firewall::AccessRequest>> {
        let Ok(db_id) = i32::try_from(id) else {
            return Ok(None);
        };

        let mut update = access_request::Entity::update_many()
            .col_expr(
                access_request::Column::Status,
                Expr::value(RequestStatus::from(to).to_value()),
            )
            .col_expr(access_request::Column::UpdatedAt, Expr::value(now));
        if let Some(until) = approved_until {
            update = update.col_expr(access_request::Column::ApprovedUntil, Expr::value(until));
        }

        let result = update
            .filter(access_request::Column::Id.eq(db_id))
            .filter(access_request::Column::Status.eq(RequestStatus::from(from).to_value()))
            .exec(&self.db)
            .await
            .map_err(store_err)?;

        if result.rows_affected == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    async fn list(
        &self,
        project_id: &str,
        status: Option<AccessStatus>,
    ) -> FirewallResult<Vec<certion_firewall::AccessRequest>> {
        let mut query = access_request::Entity::find()
            .filter(access_request::Column::ProjectId.eq(project_id));
        if let Some(status) = status {
            query = query
                .filter(access_request::Column::Status.eq(RequestStatus::from(status).to_value()));
        }

        let records = query
            .order_by_desc(access_request::Column::CreatedAt)
            .order_by_desc(access_request::Column::Id)
            .all(&self.db)
            .await
            .map_err(store_err)?;
        Ok(records.into_iter().map(Into::into).collect())
    }

    async fn find_active_approval(
        &self,
        project_id: &str,
        ip_address: &str,
        method: &str,
        path: &str,
        now: DateTime<Utc>,
    ) -> FirewallResult<Option<certion_firewall::AccessRequest>> {
        Ok(access_request::Entity::find()
            .filter(access_request::Column::ProjectId.eq(project_id))
            .filter(access_request::Column::IpAddress.eq(ip_address))
            .filter(access_request::Column::Method.eq(method))
            .filter(access_request::Column::Path.eq(path))
            .filter(access_request::Column::Status.eq(RequestStatus::Approved.to_value()))
            .filter(access_request::Column::ApprovedUntil.gt(now))
            .one(&self.db)
            .await
            .map_err(store_err)?
            .map(Into::into))
    }
}

impl From<routing_entry::Model> for RoutingEntry {
    fn from(model: routing_entry::Model) -> Self {
        Self {
            subdomain: model.subdomain,
            project_id: model.project_id,
            agent_id: model.agent_id,
            local_port: u16::try_from(model.local_port).unwrap_or_default(),
        }
    }
}

#[async_trait]
impl RoutingTable for DbStore {
    async fn resolve(&self, subdomain: &str) -> Result<Option<RoutingEntry>, RoutingError> {
        Ok(routing_entry::Entity::find_by_id(subdomain.to_string())
            .one(&self.db)
            .await
            .map_err(routing_err)?
            .map(Into::into))
    }

    async fn upsert(&self, entry: RoutingEntry) -> Result<(), RoutingError> {
        let model = routing_entry::ActiveModel {
            subdomain: Set(entry.subdomain),
            project_id: Set(entry.project_id),
            agent_id: Set(entry.agent_id),
            local_port: Set(i32::from(entry.local_port)),
            created_at: Set(Utc::now()),
        };

        routing_entry::Entity::insert(model)
            .on_conflict(
                OnConflict::column(routing_entry::Column::Subdomain)
                    .update_columns([
                        routing_entry::Column::ProjectId,
                        routing_entry::Column::AgentId,
                        routing_entry::Column::LocalPort,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(routing_err)?;
        Ok(())
    }

    async fn remove(&self, subdomain: &str) -> Result<bool, RoutingError> {
        let result = routing_entry::Entity::delete_by_id(subdomain.to_string())
            .exec(&self.db)
            .await
            .map_err(routing_err)?;
        Ok(result.rows_affected > 0)
    }

    async fn list(&self) -> Result<Vec<RoutingEntry>, RoutingError> {
        Ok(routing_entry::Entity::find()
            .order_by_asc(routing_entry::Column::Subdomain)
            .all(&self.db)
            .await
            .map_err(routing_err)?
            .into_iter()
            .map(Into::into)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect, migrate};

    fn path_rule() -> firewall_rule::ActiveModel {
        firewall_rule::ActiveModel {
            id: NotSet,
            project_id: Set("proj".to_string()),
            rule_type: Set(RuleKind::Path),
            value: Set("/admin".to_string()),
            description: Set(None),
            created_at: Set(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_unique_violation_comes_from_the_sql_error_kind() {
        let db = connect("sqlite::memory:").await.unwrap();
        migrate(&db).await.unwrap();

        path_rule().insert(&db).await.unwrap();
        let err = path_rule().insert(&db).await.unwrap_err();
        assert!(is_unique_violation(&err));

        // message text alone is not enough
        assert!(!is_unique_violation(&DbErr::Custom(
            "duplicate key value violates unique constraint".to_string()
        )));
    }
}
