//! Edge router: public request -> routing -> firewall -> tunnel
//!
//! ```text
//! Host ──parse──> subdomain ──RoutingTable──> (project, agent)
//!                                   │
//!                         FirewallEvaluator::evaluate
//!             BLOCK ─> record access request, 403 │ RATE_LIMITED ─> 429
//!                                   │ ALLOW
//!                       registry.is_online(agent)? ── no ─> 502
//!                                   │
//!                       Multiplexer::forward, stream back
//! ```

use crate::client_ip::client_ip;
use crate::error::{EdgeBody, EdgeError};
use crate::host::{parse_host, HostTarget};
use crate::routing::RoutingTable;
use bytes::Bytes;
use certion_control::{Multiplexer, RequestBodySender, RequestHead, ResponseHead};
use certion_firewall::{Decision, FirewallEvaluator};
use certion_proto::HeaderList;
use futures::TryStreamExt;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame};
use percent_encoding::percent_decode_str;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Headers that only make sense for one hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Public domain; tunnels live at `{subdomain}.{domain}`
    pub domain: String,
    /// Take the client address from `CF-Connecting-IP` / `X-Forwarded-For`
    pub trust_forwarded_headers: bool,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            trust_forwarded_headers: false,
        }
    }
}

/// Routes public HTTP requests into agent tunnels
#[derive(Clone)]
pub struct EdgeRouter {
    config: Arc<EdgeConfig>,
    routes: Arc<dyn RoutingTable>,
    firewall: FirewallEvaluator,
    multiplexer: Multiplexer,
}

impl std::fmt::Debug for EdgeRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeRouter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EdgeRouter {
    pub fn new(
        config: EdgeConfig,
        routes: Arc<dyn RoutingTable>,
        firewall: FirewallEvaluator,
        multiplexer: Multiplexer,
    ) -> Self {
        Self {
            config: Arc::new(config),
            routes,
            firewall,
            multiplexer,
        }
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    /// Handle one public request. Never fails: edge errors become
    /// responses carrying their reason code.
    pub async fn handle<B>(&self, req: Request<B>, peer: SocketAddr, scheme: &str) -> Response<EdgeBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Display + Send,
    {
        let method = req.method().clone();
        let uri = req.uri().clone();
        match self.route(req, peer, scheme).await {
            Ok(response) => response,
            Err(e) => {
                debug!(
                    "{} {} -> {} {}",
                    method,
                    uri,
                    e.status().as_u16(),
                    e.code()
                );
                e.into_response()
            }
        }
    }

    async fn route<B>(
        &self,
        req: Request<B>,
        peer: SocketAddr,
        scheme: &str,
    ) -> Result<Response<EdgeBody>, EdgeError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Display + Send,
    {
        let host = request_host(&req)?;
        let subdomain = match parse_host(&host, &self.config.domain) {
            HostTarget::Subdomain(subdomain) => subdomain,
            HostTarget::Apex | HostTarget::Foreign => {
                return Err(EdgeError::RoutingNotFound(host));
            }
        };

        let entry = self
            .routes
            .resolve(&subdomain)
            .await
            .map_err(|e| {
                error!(subdomain = %subdomain, "Routing lookup failed: {}", e);
                EdgeError::GatewayUnavailable
            })?
            .ok_or_else(|| EdgeError::RoutingNotFound(host.clone()))?;

        let ip = client_ip(req.headers(), peer, self.config.trust_forwarded_headers);
        let method = req.method().as_str().to_string();
        let path = firewall_path(req.uri().path())?;

        match self
            .firewall
            .evaluate(&entry.project_id, ip, &method, &path)
            .await
        {
            Decision::Allow => {}
            Decision::RateLimited => return Err(EdgeError::RateLimited),
            Decision::Block { rule, reason } => {
                warn!(
                    project_id = %entry.project_id,
                    "Firewall blocked {} {} from {}: {}",
                    method,
                    path,
                    ip,
                    reason
                );
                let access_request_id = match self
                    .firewall
                    .access_requests()
                    .record_block(
                        &entry.project_id,
                        &ip.to_string(),
                        &method,
                        &path,
                        rule.as_ref().map(|r| r.id),
                        &reason,
                    )
                    .await
                {
                    Ok(record) => Some(record.id),
                    Err(e) => {
                        error!(project_id = %entry.project_id, "Failed to record blocked request: {}", e);
                        None
                    }
                };
                return Err(EdgeError::FirewallBlocked {
                    reason,
                    access_request_id,
                });
            }
        }

        if !self.multiplexer.registry().is_online(&entry.agent_id) {
            return Err(EdgeError::AgentOffline(entry.agent_id));
        }

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let head = RequestHead {
            method,
            path: path_and_query,
            headers: proxied_request_headers(req.headers(), &host, ip, scheme),
        };

        let exchange = self.multiplexer.forward(&entry.agent_id, head).await?;
        let (sender, mut events) = exchange.into_parts();
        tokio::spawn(pump_request_body(req.into_body(), sender));

        let ResponseHead { status, headers } = events.headers().await?;
        let status = StatusCode::from_u16(status)
            .map_err(|_| EdgeError::UpstreamError(format!("invalid status code {}", status)))?;

        let body = StreamBody::new(events.into_body_stream().map_ok(Frame::data));
        let mut response = Response::new(BodyExt::boxed_unsync(body));
        *response.status_mut() = status;
        *response.headers_mut() = proxied_response_headers(headers);
        Ok(response)
    }
}

/// The path as the local app will route it: percent-decoded once, with
/// empty and dot segments resolved. Rules and approvals match against this.
fn firewall_path(raw: &str) -> Result<String, EdgeError> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| EdgeError::BadRequest("request path is not valid UTF-8".to_string()))?;

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    let mut path = format!("/{}", segments.join("/"));
    if !segments.is_empty() && (decoded.ends_with('/') || decoded.ends_with("/.")) {
        path.push('/');
    }
    Ok(path)
}

fn request_host<B>(req: &Request<B>) -> Result<String, EdgeError> {
    if let Some(value) = req.headers().get(HOST) {
        return value
            .to_str()
            .map(str::to_string)
            .map_err(|_| EdgeError::BadRequest("invalid Host header".to_string()));
    }
    req.uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .ok_or_else(|| EdgeError::BadRequest("missing Host header".to_string()))
}

/// Copy the client's body into the exchange, chunk by chunk
async fn pump_request_body<B>(body: B, mut sender: RequestBodySender)
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let mut body = Box::pin(body);
    loop {
        match body.frame().await {
            None => {
                let request_id = sender.request_id();
                if let Err(e) = sender.finish().await {
                    debug!(request_id, "Request end not delivered: {}", e);
                }
                return;
            }
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                if data.is_empty() {
                    continue;
                }
                if let Err(e) = sender.send(data).await {
                    debug!("Stopped streaming request body: {}", e);
                    return;
                }
            }
            Some(Err(e)) => {
                debug!(
                    request_id = sender.request_id(),
                    "Client request body failed: {}", e
                );
                sender.abort();
                return;
            }
        }
    }
}

fn is_hop_by_hop(name: &str, connection_tokens: &[String]) -> bool {
    HOP_BY_HOP.contains(&name) || connection_tokens.iter().any(|t| t == name)
}

/// Header names listed in `Connection` are hop-by-hop as well
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Request headers as sent to the agent: hop-by-hop and Host removed,
/// `X-Forwarded-*` set
pub fn proxied_request_headers(
    headers: &HeaderMap,
    host: &str,
    client: IpAddr,
    scheme: &str,
) -> HeaderList {
    let tokens = connection_tokens(headers);
    let mut out: HeaderList = headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            name != HOST.as_str()
                && name != X_FORWARDED_PROTO
                && name != X_FORWARDED_HOST
                && name != X_FORWARDED_FOR
                && !is_hop_by_hop(name, &tokens)
        })
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect();

    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing.trim(), client),
        _ => client.to_string(),
    };
    out.push((X_FORWARDED_FOR.to_string(), forwarded_for.into_bytes()));
    out.push((X_FORWARDED_PROTO.to_string(), scheme.as_bytes().to_vec()));
    out.push((X_FORWARDED_HOST.to_string(), host.as_bytes().to_vec()));
    out
}

/// Response headers returned to the client: hop-by-hop and Content-Length
/// removed (the body is re-framed), invalid entries dropped
pub fn proxied_response_headers(headers: HeaderList) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    let connection: Vec<String> = headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case(CONNECTION.as_str()))
        .flat_map(|(_, value)| {
            String::from_utf8_lossy(value)
                .split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .collect::<Vec<_>>()
        })
        .filter(|t| !t.is_empty())
        .collect();

    for (name, value) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!("Dropping invalid response header name {:?}", name);
            continue;
        };
        if name == CONTENT_LENGTH || is_hop_by_hop(name.as_str(), &connection) {
            continue;
        }
        let Ok(value) = HeaderValue::from_bytes(&value) else {
            debug!("Dropping invalid value for response header {}", name);
            continue;
        };
        map.append(name, value);
    }
    map
}
