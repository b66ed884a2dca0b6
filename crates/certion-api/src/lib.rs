//! Operator API: routes, firewall rules and configuration, access requests
pub mod error;
pub mod handlers;
pub mod models;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post, put},
    Router,
};
use certion_control::TunnelRegistry;
use certion_firewall::{FirewallEvaluator, RuleStore};
use certion_router::RoutingTable;
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub use error::{ApiError, ApiResult};

/// Application state shared across handlers
pub struct AppState {
    pub registry: TunnelRegistry,
    pub firewall: FirewallEvaluator,
    pub routes: Arc<dyn RoutingTable>,
}

impl AppState {
    /// Rules are written through the store behind the evaluator's cache
    pub fn rule_store(&self) -> &Arc<dyn RuleStore> {
        self.firewall.policies().store()
    }
}

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Enable CORS for local dashboards
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: false,
        }
    }
}

pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let project = "/api/projects/{project_id}/firewall";

        let router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/agents", get(handlers::list_agents))
            .route(
                "/api/routes",
                get(handlers::list_routes).post(handlers::create_route),
            )
            .route(
                "/api/routes/{subdomain}",
                put(handlers::update_route).delete(handlers::delete_route),
            )
            .route(
                &format!("{project}/rules"),
                get(handlers::list_rules).post(handlers::create_rule),
            )
            .route(
                &format!("{project}/rules/import"),
                post(handlers::import_rules_handler),
            )
            .route(
                &format!("{project}/rules/export"),
                get(handlers::export_rules),
            )
            .route(
                &format!("{project}/rules/{{rule_id}}"),
                axum::routing::delete(handlers::delete_rule),
            )
            .route(
                &format!("{project}/config"),
                get(handlers::get_config).put(handlers::put_config),
            )
            .route(
                &format!("{project}/access-requests"),
                get(handlers::list_access_requests),
            )
            .route(
                &format!("{project}/access-requests/revoke-all"),
                post(handlers::revoke_all_access),
            )
            .route(
                &format!("{project}/access-requests/revoke-by-ip"),
                post(handlers::revoke_access_by_ip),
            )
            .route(
                &format!("{project}/access-requests/{{id}}/approve"),
                post(handlers::approve_access_request),
            )
            .route(
                &format!("{project}/access-requests/{{id}}/reject"),
                post(handlers::reject_access_request),
            )
            .route(
                &format!("{project}/access-requests/{{id}}/revoke"),
                post(handlers::revoke_access_request),
            )
            .with_state(self.state.clone());

        let mut router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE])
                .allow_origin(tower_http::cors::AllowOrigin::predicate(
                    |origin: &HeaderValue, _| {
                        let origin = origin.to_str().unwrap_or("");
                        origin.starts_with("http://localhost:")
                            || origin.starts_with("http://127.0.0.1:")
                    },
                ));
            router = router.layer(cors);
        }

        router
    }

    /// Serve until `shutdown` fires
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        info!("Admin API listening on {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}
