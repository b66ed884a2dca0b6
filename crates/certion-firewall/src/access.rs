//! Access-request records and their lifecycle
//!
//! A blocked request leaves a `pending` record behind. An operator may
//! approve it for a limited time, reject it, or later revoke an approval.
//! Expiry is never stored: an approved record whose `approved_until` has
//! passed is simply no longer honoured when checked.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{FirewallError, FirewallResult};

pub const DEFAULT_APPROVAL_MINUTES: i64 = 5;
pub const MAX_APPROVAL_MINUTES: i64 = 60;

/// Stored status of an access request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessStatus {
    Pending,
    Approved,
    Rejected,
    Revoked,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessStatus::Pending => "pending",
            AccessStatus::Approved => "approved",
            AccessStatus::Rejected => "rejected",
            AccessStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessStatus {
    type Err = FirewallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AccessStatus::Pending),
            "approved" => Ok(AccessStatus::Approved),
            "rejected" => Ok(AccessStatus::Rejected),
            "revoked" => Ok(AccessStatus::Revoked),
            other => Err(FirewallError::Store(format!(
                "Unknown access request status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub id: i64,
    pub project_id: String,
    pub ip_address: String,
    pub method: String,
    pub path: String,
    pub rule_id: Option<i64>,
    pub block_reason: String,
    pub status: AccessStatus,
    pub approved_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccessRequest {
    /// Whether this record currently grants access
    pub fn grants_access(&self, now: DateTime<Utc>) -> bool {
        self.status == AccessStatus::Approved
            && self.approved_until.is_some_and(|until| now < until)
    }

    /// Approved records past their deadline
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == AccessStatus::Approved && !self.grants_access(now)
    }
}

/// Details of a blocked request, used to open a pending record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedRequest {
    pub project_id: String,
    pub ip_address: String,
    pub method: String,
    pub path: String,
    pub rule_id: Option<i64>,
    pub block_reason: String,
}

impl BlockedRequest {
    pub fn new(
        project_id: &str,
        ip_address: &str,
        method: &str,
        path: &str,
        rule_id: Option<i64>,
        block_reason: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.to_string(),
            ip_address: ip_address.to_string(),
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            rule_id,
            block_reason: block_reason.into(),
        }
    }
}

/// Storage for access requests.
///
/// Every method is a single atomic step; the lifecycle rules live in
/// [`AccessRequests`].
#[async_trait]
pub trait AccessRequestStore: Send + Sync {
    /// Return the pending record for the request's `(project, ip, method,
    /// path)` or insert a new one. The boolean is `true` when inserted.
    async fn find_or_insert_pending(
        &self,
        request: BlockedRequest,
        now: DateTime<Utc>,
    ) -> FirewallResult<(AccessRequest, bool)>;

    async fn get(&self, id: i64) -> FirewallResult<Option<AccessRequest>>;

    /// Compare-and-set: move `id` from `from` to `to` only if its status is
    /// still `from`. Returns the updated record, or `None` when the status
    /// did not match.
    async fn transition(
        &self,
        id: i64,
        from: AccessStatus,
        to: AccessStatus,
        approved_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> FirewallResult<Option<AccessRequest>>;

    /// Records of a project, newest first
    async fn list(
        &self,
        project_id: &str,
        status: Option<AccessStatus>,
    ) -> FirewallResult<Vec<AccessRequest>>;

    /// Any approved record for `(project, ip, method, path)` with
    /// `approved_until > now`
    async fn find_active_approval(
        &self,
        project_id: &str,
        ip_address: &str,
        method: &str,
        path: &str,
        now: DateTime<Utc>,
    ) -> FirewallResult<Option<AccessRequest>>;
}

/// Access-request lifecycle operations
#[derive(Clone)]
pub struct AccessRequests {
    store: Arc<dyn AccessRequestStore>,
}

impl fmt::Debug for AccessRequests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessRequests").finish()
    }
}

impl AccessRequests {
    pub fn new(store: Arc<dyn AccessRequestStore>) -> Self {
        Self { store }
    }

    /// Record a blocked request; returns the existing pending record when
    /// one is already open for the same `(project, ip, method, path)`
    pub async fn record_block(
        &self,
        project_id: &str,
        ip_address: &str,
        method: &str,
        path: &str,
        rule_id: Option<i64>,
        reason: &str,
    ) -> FirewallResult<AccessRequest> {
        let request = BlockedRequest::new(project_id, ip_address, method, path, rule_id, reason);
        let (record, created) = self.store.find_or_insert_pending(request, Utc::now()).await?;
        if created {
            info!(
                project_id = %project_id,
                access_request_id = record.id,
                "Access request opened for {} {} {}",
                record.ip_address,
                record.method,
                record.path
            );
        } else {
            debug!(
                project_id = %project_id,
                access_request_id = record.id,
                "Repeat block while access request is pending"
            );
        }
        Ok(record)
    }

    pub async fn approve(
        &self,
        project_id: &str,
        id: i64,
        duration_minutes: i64,
    ) -> FirewallResult<AccessRequest> {
        self.approve_at(project_id, id, duration_minutes, Utc::now())
            .await
    }

    pub async fn approve_at(
        &self,
        project_id: &str,
        id: i64,
        duration_minutes: i64,
        now: DateTime<Utc>,
    ) -> FirewallResult<AccessRequest> {
        if !(1..=MAX_APPROVAL_MINUTES).contains(&duration_minutes) {
            return Err(FirewallError::InvalidDuration(duration_minutes));
        }
        let until = now + Duration::minutes(duration_minutes);
        let record = self
            .transition(
                project_id,
                id,
                "approve",
                AccessStatus::Pending,
                AccessStatus::Approved,
                Some(until),
                now,
            )
            .await?;
        info!(
            project_id = %project_id,
            access_request_id = id,
            "Access request approved until {}",
            until
        );
        Ok(record)
    }

    pub async fn reject(&self, project_id: &str, id: i64) -> FirewallResult<AccessRequest> {
        let now = Utc::now();
        let record = self
            .transition(
                project_id,
                id,
                "reject",
                AccessStatus::Pending,
                AccessStatus::Rejected,
                None,
                now,
            )
            .await?;
        info!(project_id = %project_id, access_request_id = id, "Access request rejected");
        Ok(record)
    }

    pub async fn revoke(&self, project_id: &str, id: i64) -> FirewallResult<AccessRequest> {
        self.revoke_at(project_id, id, Utc::now()).await
    }

    pub async fn revoke_at(
        &self,
        project_id: &str,
        id: i64,
        now: DateTime<Utc>,
    ) -> FirewallResult<AccessRequest> {
        let record = self
            .transition(
                project_id,
                id,
                "revoke",
                AccessStatus::Approved,
                AccessStatus::Revoked,
                Some(now),
                now,
            )
            .await?;
        info!(project_id = %project_id, access_request_id = id, "Access request revoked");
        Ok(record)
    }

    /// Revoke every approved record of the project. Returns how many were
    /// revoked; records that changed status concurrently are skipped.
    pub async fn revoke_all(&self, project_id: &str) -> FirewallResult<usize> {
        self.revoke_matching(project_id, None).await
    }

    pub async fn revoke_by_ip(&self, project_id: &str, ip_address: &str) -> FirewallResult<usize> {
        self.revoke_matching(project_id, Some(ip_address)).await
    }

    async fn revoke_matching(
        &self,
        project_id: &str,
        ip_address: Option<&str>,
    ) -> FirewallResult<usize> {
        let snapshot = self
            .store
            .list(project_id, Some(AccessStatus::Approved))
            .await?;

        let now = Utc::now();
        let mut revoked = 0;
        for record in snapshot
            .into_iter()
            .filter(|r| ip_address.map_or(true, |ip| r.ip_address == ip))
        {
            let updated = self
                .store
                .transition(
                    record.id,
                    AccessStatus::Approved,
                    AccessStatus::Revoked,
                    Some(now),
                    now,
                )
                .await?;
            if updated.is_some() {
                revoked += 1;
            }
        }

        info!(
            project_id = %project_id,
            ip_address = ip_address.unwrap_or("*"),
            "Revoked {} access approvals",
            revoked
        );
        Ok(revoked)
    }

    /// Whether an unexpired approval covers `(ip, method, path)` at `now`
    pub async fn is_approved(
        &self,
        project_id: &str,
        ip_address: &str,
        method: &str,
        path: &str,
        now: DateTime<Utc>,
    ) -> FirewallResult<bool> {
        let method = method.to_ascii_uppercase();
        Ok(self
            .store
            .find_active_approval(project_id, ip_address, &method, path, now)
            .await?
            .is_some())
    }

    pub async fn list(
        &self,
        project_id: &str,
        status: Option<AccessStatus>,
    ) -> FirewallResult<Vec<AccessRequest>> {
        self.store.list(project_id, status).await
    }

    pub async fn get(&self, project_id: &str, id: i64) -> FirewallResult<AccessRequest> {
        self.store
            .get(id)
            .await?
            .filter(|r| r.project_id == project_id)
            .ok_or(FirewallError::AccessRequestNotFound(id))
    }

    #[allow(clippy::too_many_arguments)]
    async fn transition(
        &self,
        project_id: &str,
        id: i64,
        action: &'static str,
        from: AccessStatus,
        to: AccessStatus,
        approved_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> FirewallResult<AccessRequest> {
        let current = self.get(project_id, id).await?;
        if current.status != from {
            return Err(FirewallError::InvalidTransition {
                id,
                action,
                status: current.status.to_string(),
            });
        }

        match self
            .store
            .transition(id, from, to, approved_until, now)
            .await?
        {
            Some(updated) => Ok(updated),
            None => {
                // Lost a race with another transition on the same record
                let status = self
                    .store
                    .get(id)
                    .await?
                    .map(|r| r.status.to_string())
                    .unwrap_or_else(|| "deleted".to_string());
                Err(FirewallError::InvalidTransition { id, action, status })
            }
        }
    }
}

/// In-memory access-request store
#[derive(Debug, Default)]
pub struct MemoryAccessRequestStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: i64,
    records: BTreeMap<i64, AccessRequest>,
}

impl MemoryAccessRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccessRequestStore for MemoryAccessRequestStore {
    async fn find_or_insert_pending(
        &self,
        request: BlockedRequest,
        now: DateTime<Utc>,
    ) -> FirewallResult<(AccessRequest, bool)> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.records.values().find(|r| {
            r.status == AccessStatus::Pending
                && r.project_id == request.project_id
                && r.ip_address == request.ip_address
                && r.method == request.method
                && r.path == request.path
        }) {
            return Ok((existing.clone(), false));
        }

        inner.next_id += 1;
        let record = AccessRequest {
            id: inner.next_id,
            project_id: request.project_id,
            ip_address: request.ip_address,
            method: request.method,
            path: request.path,
            rule_id: request.rule_id,
            block_reason: request.block_reason,
            status: AccessStatus::Pending,
            approved_until: None,
            created_at: now,
            updated_at: now,
        };
        inner.records.insert(record.id, record.clone());
        Ok((record, true))
    }

    async fn get(&self, id: i64) -> FirewallResult<Option<AccessRequest>> {
        Ok(self.inner.read().await.records.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: i64,
        from: AccessStatus,
        to: AccessStatus,
        approved_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> FirewallResult<Option<AccessRequest>> {
        let mut inner = self.inner.write().await;
        match inner.records.get_mut(&id) {
            Some(record) if record.status == from => {
                record.status = to;
                if approved_until.is_some() {
                    record.approved_until = approved_until;
                }
                record.updated_at = now;
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list(
        &self,
        project_id: &str,
        status: Option<AccessStatus>,
    ) -> FirewallResult<Vec<AccessRequest>> {
        let inner = self.inner.read().await;
        let mut records: Vec<AccessRequest> = inner
            .records
            .values()
            .filter(|r| r.project_id == project_id && status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(records)
    }

    async fn find_active_approval(
        &self,
        project_id: &str,
        ip_address: &str,
        method: &str,
        path: &str,
        now: DateTime<Utc>,
    ) -> FirewallResult<Option<AccessRequest>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .values()
            .find(|r| {
                r.project_id == project_id
                    && r.ip_address == ip_address
                    && r.method == method
                    && r.path == path
                    && r.grants_access(now)
            })
            .cloned())
    }
}
