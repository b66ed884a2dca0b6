use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use certion_firewall::{
    import_rules, AccessRequest, AccessStatus, FirewallConfig, FirewallRule, ImportSummary,
    NewFirewallRule, RuleDocument, RuleStore, RuleType, DEFAULT_APPROVAL_MINUTES,
};
use certion_router::{generate_subdomain, validate_subdomain, RoutingEntry, RoutingTable};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ApiError, ApiResult};
use crate::models::*;
use crate::AppState;

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        online_agents: state.registry.online_agents().len(),
    })
}

/// Agents with an active tunnel session
pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<AgentList> {
    let agents: Vec<Agent> = state
        .registry
        .online_agents()
        .into_iter()
        .map(Agent::from)
        .collect();
    let total = agents.len();
    Json(AgentList { agents, total })
}

// Routing

pub async fn list_routes(State(state): State<Arc<AppState>>) -> ApiResult<Json<RouteList>> {
    let routes = state.routes.list().await?;
    let total = routes.len();
    Ok(Json(RouteList { routes, total }))
}

pub async fn create_route(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRouteRequest>,
) -> ApiResult<(StatusCode, Json<RoutingEntry>)> {
    let subdomain = match req.subdomain {
        Some(subdomain) => {
            validate_subdomain(&subdomain)?;
            if state.routes.resolve(&subdomain).await?.is_some() {
                return Err(ApiError::Conflict(format!(
                    "Subdomain '{}' is already routed",
                    subdomain
                )));
            }
            subdomain
        }
        None => {
            let taken: HashSet<String> = state
                .routes
                .list()
                .await?
                .into_iter()
                .map(|e| e.subdomain)
                .collect();
            generate_subdomain(
                req.project_name.as_deref().unwrap_or(&req.project_id),
                req.owner.as_deref().unwrap_or_default(),
                |candidate| taken.contains(candidate),
            )
        }
    };

    let entry = RoutingEntry {
        subdomain,
        project_id: req.project_id,
        agent_id: req.agent_id,
        local_port: req.local_port,
    };
    state.routes.upsert(entry.clone()).await?;
    info!(
        project_id = %entry.project_id,
        agent_id = %entry.agent_id,
        "Route created for subdomain {}",
        entry.subdomain
    );
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn update_route(
    State(state): State<Arc<AppState>>,
    Path(subdomain): Path<String>,
    Json(req): Json<UpdateRouteRequest>,
) -> ApiResult<Json<RoutingEntry>> {
    validate_subdomain(&subdomain)?;
    let entry = RoutingEntry {
        subdomain,
        project_id: req.project_id,
        agent_id: req.agent_id,
        local_port: req.local_port,
    };
    state.routes.upsert(entry.clone()).await?;
    Ok(Json(entry))
}

pub async fn delete_route(
    State(state): State<Arc<AppState>>,
    Path(subdomain): Path<String>,
) -> ApiResult<StatusCode> {
    if state.routes.remove(&subdomain).await? {
        info!("Route for subdomain {} deleted", subdomain);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!(
            "No route for subdomain '{}'",
            subdomain
        )))
    }
}

// Firewall rules

pub async fn list_rules(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<RuleList>> {
    let rules = state.rule_store().list_rules(&project_id).await?;
    let total = rules.len();
    Ok(Json(RuleList { rules, total }))
}

pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(req): Json<CreateRuleRequest>,
) -> ApiResult<(StatusCode, Json<FirewallRule>)> {
    let rule_type: RuleType = req.rule_type.trim().to_ascii_lowercase().parse()?;
    let rule = NewFirewallRule::new(rule_type, &req.value, req.description)?;
    let rule = state.rule_store().add_rule(&project_id, rule).await?;
    state.firewall.policies().invalidate(&project_id);

    info!(
        project_id = %project_id,
        rule_id = rule.id,
        "Firewall rule created: {} '{}'",
        rule.rule_type,
        rule.value
    );
    Ok((StatusCode::CREATED, Json(rule)))
}

pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path((project_id, rule_id)): Path<(String, i64)>,
) -> ApiResult<StatusCode> {
    state.rule_store().delete_rule(&project_id, rule_id).await?;
    state.firewall.policies().invalidate(&project_id);
    info!(project_id = %project_id, rule_id, "Firewall rule deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn import_rules_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(document): Json<RuleDocument>,
) -> ApiResult<Json<ImportSummary>> {
    let summary = import_rules(state.rule_store().as_ref(), &project_id, document).await?;
    state.firewall.policies().invalidate(&project_id);
    Ok(Json(summary))
}

pub async fn export_rules(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<RuleDocument>> {
    let rules = state.rule_store().list_rules(&project_id).await?;
    Ok(Json(RuleDocument::from_rules(&rules)))
}

// Firewall configuration

pub async fn get_config(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<FirewallConfigBody>> {
    let config = state
        .rule_store()
        .get_config(&project_id)
        .await?
        .unwrap_or_default();
    Ok(Json(config.into()))
}

pub async fn put_config(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(body): Json<FirewallConfigBody>,
) -> ApiResult<Json<FirewallConfigBody>> {
    let mut config = FirewallConfig::from(body);
    config.validate()?;
    let saved = state.rule_store().put_config(&project_id, config).await?;
    state.firewall.policies().invalidate(&project_id);
    info!(
        project_id = %project_id,
        enabled = saved.enabled,
        rate_limit = saved.rate_limit_per_minute,
        "Firewall configuration updated"
    );
    Ok(Json(saved.into()))
}

// Access requests

pub async fn list_access_requests(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(query): Query<AccessRequestQuery>,
) -> ApiResult<Json<AccessRequestList>> {
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") | Some("all") => None,
        Some(s) => Some(
            s.parse::<AccessStatus>()
                .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        ),
    };
    debug!(project_id = %project_id, ?status, "Listing access requests");

    let access_requests = state
        .firewall
        .access_requests()
        .list(&project_id, status)
        .await?;
    let total = access_requests.len();
    Ok(Json(AccessRequestList {
        access_requests,
        total,
    }))
}

pub async fn approve_access_request(
    State(state): State<Arc<AppState>>,
    Path((project_id, id)): Path<(String, i64)>,
    body: Option<Json<ApproveRequest>>,
) -> ApiResult<Json<AccessRequest>> {
    let duration = body
        .and_then(|Json(b)| b.duration_minutes)
        .unwrap_or(DEFAULT_APPROVAL_MINUTES);
    let record = state
        .firewall
        .access_requests()
        .approve(&project_id, id, duration)
        .await?;
    Ok(Json(record))
}

pub async fn reject_access_request(
    State(state): State<Arc<AppState>>,
    Path((project_id, id)): Path<(String, i64)>,
) -> ApiResult<Json<AccessRequest>> {
    let record = state
        .firewall
        .access_requests()
        .reject(&project_id, id)
        .await?;
    Ok(Json(record))
}

pub async fn revoke_access_request(
    State(state): State<Arc<AppState>>,
    Path((project_id, id)): Path<(String, i64)>,
) -> ApiResult<Json<AccessRequest>> {
    let record = state
        .firewall
        .access_requests()
        .revoke(&project_id, id)
        .await?;
    Ok(Json(record))
}

pub async fn revoke_all_access(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<RevokeSummary>> {
    let revoked = state
        .firewall
        .access_requests()
        .revoke_all(&project_id)
        .await?;
    Ok(Json(RevokeSummary { revoked }))
}

pub async fn revoke_access_by_ip(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(req): Json<RevokeByIpRequest>,
) -> ApiResult<Json<RevokeSummary>> {
    let ip = req.ip_address.trim();
    if ip.is_empty() {
        return Err(ApiError::BadRequest("ip_address is required".to_string()));
    }
    let revoked = state
        .firewall
        .access_requests()
        .revoke_by_ip(&project_id, ip)
        .await?;
    Ok(Json(RevokeSummary { revoked }))
}
