//! Edge routing end to end: public request -> firewall -> tunnel -> agent

use bytes::Bytes;
use certion_control::{Multiplexer, ExchangeTimeouts, TunnelRegistry};
use certion_firewall::{
    AccessRequests, FirewallConfig, FirewallEvaluator, MemoryAccessRequestStore, MemoryRuleStore,
    NewFirewallRule, PolicyCache, RuleStore, RuleType,
};
use certion_proto::TunnelFrame;
use certion_router::error::{ERROR_HEADER, FIREWALL_BLOCKED_HEADER};
use certion_router::*;
use certion_transport::{memory, FrameTransport};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const PROJECT: &str = "proj-1";
const AGENT: &str = "agent-1";

struct Harness {
    router: EdgeRouter,
    registry: TunnelRegistry,
    rules: Arc<MemoryRuleStore>,
    firewall: FirewallEvaluator,
}

async fn harness() -> Harness {
    let routes = Arc::new(MemoryRoutingTable::new());
    routes
        .upsert(RoutingEntry {
            subdomain: "blog-alice".into(),
            project_id: PROJECT.into(),
            agent_id: AGENT.into(),
            local_port: 3000,
        })
        .await
        .unwrap();

    let rules = Arc::new(MemoryRuleStore::new());
    let policies = Arc::new(PolicyCache::new(rules.clone(), Duration::from_secs(60)));
    let access = AccessRequests::new(Arc::new(MemoryAccessRequestStore::new()));
    let firewall = FirewallEvaluator::new(policies, access);

    let registry = TunnelRegistry::default();
    let multiplexer = Multiplexer::new(registry.clone(), ExchangeTimeouts::default());
    let router = EdgeRouter::new(
        EdgeConfig {
            domain: "certion.dev".into(),
            trust_forwarded_headers: false,
        },
        routes,
        firewall.clone(),
        multiplexer,
    );

    Harness {
        router,
        registry,
        rules,
        firewall,
    }
}

/// Agent that echoes the method, path and request body back
fn spawn_echo_agent(registry: &TunnelRegistry) {
    let (relay, agent) = memory::pair();
    registry.register(AGENT, Box::new(relay));
    let (mut tx, mut rx) = Box::new(agent).split();

    tokio::spawn(async move {
        let mut pending: std::collections::HashMap<u64, (String, Vec<u8>)> = Default::default();
        while let Ok(Some(frame)) = rx.recv_frame().await {
            match frame {
                TunnelFrame::RequestStart {
                    request_id,
                    method,
                    path,
                    headers,
                } => {
                    let forwarded = headers
                        .iter()
                        .find(|(n, _)| n == "x-forwarded-for")
                        .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
                        .unwrap_or_default();
                    pending.insert(request_id, (format!("{} {} {}|", method, path, forwarded), Vec::new()));
                }
                TunnelFrame::RequestBodyChunk { request_id, bytes } => {
                    if let Some((_, body)) = pending.get_mut(&request_id) {
                        body.extend_from_slice(&bytes);
                    }
                }
                TunnelFrame::RequestEnd { request_id } => {
                    let Some((line, body)) = pending.remove(&request_id) else {
                        continue;
                    };
                    let mut payload = line.into_bytes();
                    payload.extend_from_slice(&body);
                    let frames = [
                        TunnelFrame::ResponseHeaders {
                            request_id,
                            status: 201,
                            headers: vec![
                                ("content-type".into(), b"text/plain".to_vec()),
                                ("content-length".into(), payload.len().to_string().into_bytes()),
                                ("x-app".into(), b"echo".to_vec()),
                            ],
                        },
                        TunnelFrame::ResponseBodyChunk {
                            request_id,
                            bytes: payload,
                        },
                        TunnelFrame::ResponseEnd { request_id },
                    ];
                    for frame in frames {
                        if tx.send_frame(frame).await.is_err() {
                            return;
                        }
                    }
                }
                _ => {}
            }
        }
    });
}

fn peer() -> SocketAddr {
    "203.0.113.7:50000".parse().unwrap()
}

fn request(method: &str, host: &str, path: &str, body: &'static str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("host", host)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap()
}

async fn body_string(response: Response<EdgeBody>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_allowed_request_reaches_agent() {
    let h = harness().await;
    spawn_echo_agent(&h.registry);

    let response = h
        .router
        .handle(
            request("POST", "blog-alice.certion.dev", "/api/items?x=1", "hello"),
            peer(),
            "http",
        )
        .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["x-app"], "echo");
    assert!(response.headers().get("content-length").is_none());
    assert!(response.headers().get(ERROR_HEADER).is_none());
    assert_eq!(
        body_string(response).await,
        "POST /api/items?x=1 203.0.113.7|hello"
    );
}

#[tokio::test]
async fn test_unknown_subdomain_is_not_found() {
    let h = harness().await;
    spawn_echo_agent(&h.registry);

    for host in ["nope.certion.dev", "certion.dev", "example.com"] {
        let response = h
            .router
            .handle(request("GET", host, "/", ""), peer(), "http")
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", host);
        assert_eq!(response.headers()[ERROR_HEADER], "ROUTING_NOT_FOUND");
    }
}

#[tokio::test]
async fn test_offline_agent_is_bad_gateway() {
    let h = harness().await;

    let response = h
        .router
        .handle(request("GET", "blog-alice.certion.dev", "/", ""), peer(), "http")
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.headers()[ERROR_HEADER], "AGENT_OFFLINE");
}

#[tokio::test]
async fn test_blocked_request_opens_access_request_and_approval_unblocks() {
    let h = harness().await;
    spawn_echo_agent(&h.registry);
    h.rules
        .add_rule(
            PROJECT,
            NewFirewallRule::new(RuleType::Path, "/admin", Some("admin area".into())).unwrap(),
        )
        .await
        .unwrap();

    let response = h
        .router
        .handle(
            request("GET", "blog-alice.certion.dev", "/admin/users", ""),
            peer(),
            "http",
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers()[FIREWALL_BLOCKED_HEADER], "true");
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["error"], "FIREWALL_BLOCKED");
    let id = json["access_request_id"].as_i64().unwrap();

    // a repeat block reuses the pending request
    let again = h
        .router
        .handle(
            request("GET", "blog-alice.certion.dev", "/admin/users", ""),
            peer(),
            "http",
        )
        .await;
    let json: serde_json::Value = serde_json::from_str(&body_string(again).await).unwrap();
    assert_eq!(json["access_request_id"].as_i64(), Some(id));

    h.firewall
        .access_requests()
        .approve(PROJECT, id, 5)
        .await
        .unwrap();

    let allowed = h
        .router
        .handle(
            request("GET", "blog-alice.certion.dev", "/admin/users", ""),
            peer(),
            "http",
        )
        .await;
    assert_eq!(allowed.status(), StatusCode::CREATED);

    // approval is scoped to the exact path
    let other = h
        .router
        .handle(
            request("GET", "blog-alice.certion.dev", "/admin/settings", ""),
            peer(),
            "http",
        )
        .await;
    assert_eq!(other.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_rate_limited_request() {
    let h = harness().await;
    spawn_echo_agent(&h.registry);
    h.rules
        .put_config(
            PROJECT,
            FirewallConfig {
                rate_limit_per_minute: 2,
                ..FirewallConfig::default()
            },
        )
        .await
        .unwrap();

    for _ in 0..2 {
        let ok = h
            .router
            .handle(request("GET", "blog-alice.certion.dev", "/", ""), peer(), "http")
            .await;
        assert_eq!(ok.status(), StatusCode::CREATED);
    }
    let limited = h
        .router
        .handle(request("GET", "blog-alice.certion.dev", "/", ""), peer(), "http")
        .await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.headers()[ERROR_HEADER], "RATE_LIMITED");
    assert_eq!(limited.headers()["retry-after"], "60");
}

#[tokio::test]
async fn test_disconnected_agent_fails_fast() {
    let h = harness().await;
    let (relay, agent) = memory::pair();
    let handle = h.registry.register(AGENT, Box::new(relay));
    drop(agent);
    handle.closed().await;

    let response = h
        .router
        .handle(request("GET", "blog-alice.certion.dev", "/", ""), peer(), "http")
        .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.headers()[ERROR_HEADER], "AGENT_OFFLINE");
}

#[tokio::test]
async fn test_edge_server_serves_http() {
    let h = harness().await;
    spawn_echo_agent(&h.registry);

    let server = EdgeServer::bind(
        EdgeServerConfig::http("127.0.0.1:0".parse().unwrap()),
        h.router.clone(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = tokio_util::sync::CancellationToken::new();
    let task = tokio::spawn(server.run(shutdown.clone()));

    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake(hyper_util::rt::TokioIo::new(stream))
            .await
            .unwrap();
    tokio::spawn(conn);

    let response = sender
        .send_request(request("GET", "blog-alice.certion.dev", "/hi", ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"GET /hi 127.0.0.1|");

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_encoded_and_dotted_paths_cannot_slip_past_path_rules() {
    let h = harness().await;
    spawn_echo_agent(&h.registry);
    h.rules
        .add_rule(
            PROJECT,
            NewFirewallRule::new(RuleType::Path, "/admin", None).unwrap(),
        )
        .await
        .unwrap();

    for path in ["/admin", "/%61dmin", "/%2Fadmin", "//admin", "/x/../admin", "/./admin/users"] {
        let response = h
            .router
            .handle(request("GET", "blog-alice.certion.dev", path, ""), peer(), "http")
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{}", path);
    }

    let response = h
        .router
        .handle(request("GET", "blog-alice.certion.dev", "/%ff", ""), peer(), "http")
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()[ERROR_HEADER], "BAD_REQUEST");

    // the agent still receives the path exactly as the client sent it
    let response = h
        .router
        .handle(request("GET", "blog-alice.certion.dev", "/caf%C3%A9", ""), peer(), "http")
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(body_string(response).await.starts_with("GET /caf%C3%A9 "));
}
