//! Request and response bodies of the admin API

use certion_control::SessionInfo;
use certion_firewall::{AccessRequest, FirewallConfig, FirewallRule};
use certion_router::RoutingEntry;
use serde::{Deserialize, Serialize};

/// Error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub online_agents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub session_id: u64,
    pub state: String,
    pub remote_addr: Option<String>,
    pub in_flight: usize,
}

impl From<SessionInfo> for Agent {
    fn from(info: SessionInfo) -> Self {
        Self {
            agent_id: info.agent_id,
            session_id: info.session_id,
            state: format!("{:?}", info.state).to_lowercase(),
            remote_addr: info.remote_addr.map(|a| a.to_string()),
            in_flight: info.in_flight,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentList {
    pub agents: Vec<Agent>,
    pub total: usize,
}

// Routing

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteList {
    pub routes: Vec<RoutingEntry>,
    pub total: usize,
}

/// Create a route; the subdomain is generated from `project_name` and
/// `owner` when not given
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRouteRequest {
    pub subdomain: Option<String>,
    pub project_name: Option<String>,
    pub owner: Option<String>,
    pub project_id: String,
    pub agent_id: String,
    pub local_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRouteRequest {
    pub project_id: String,
    pub agent_id: String,
    pub local_port: u16,
}

// Firewall rules

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleList {
    pub rules: Vec<FirewallRule>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRuleRequest {
    pub rule_type: String,
    pub value: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Firewall configuration as exposed to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallConfigBody {
    pub enabled: bool,
    pub auto_block_suspicious: bool,
    /// Requests per minute per source IP
    pub rate_limit: u32,
    #[serde(default)]
    pub whitelist_ips: Vec<String>,
}

impl From<FirewallConfig> for FirewallConfigBody {
    fn from(config: FirewallConfig) -> Self {
        Self {
            enabled: config.enabled,
            auto_block_suspicious: config.auto_block_suspicious,
            rate_limit: config.rate_limit_per_minute,
            whitelist_ips: config.whitelist_ips,
        }
    }
}

impl From<FirewallConfigBody> for FirewallConfig {
    fn from(body: FirewallConfigBody) -> Self {
        Self {
            enabled: body.enabled,
            rate_limit_per_minute: body.rate_limit,
            auto_block_suspicious: body.auto_block_suspicious,
            whitelist_ips: body.whitelist_ips,
        }
    }
}

// Access requests

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessRequestQuery {
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequestList {
    pub access_requests: Vec<AccessRequest>,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApproveRequest {
    pub duration_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeByIpRequest {
    pub ip_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeSummary {
    pub revoked: usize,
}
