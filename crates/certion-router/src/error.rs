//! Errors generated by the edge itself (never by the proxied application)
//!
//! Every such response carries `X-Certion-Error: <CODE>` and a JSON body
//! `{"error": CODE, "message": ...}` so operators can tell "your app
//! returned 403" apart from "the firewall blocked this".

use bytes::Bytes;
use certion_control::{ExchangeError, ForwardError};
use http::{HeaderValue, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use thiserror::Error;

/// Body type of every edge response
pub type EdgeBody = UnsyncBoxBody<Bytes, ExchangeError>;

pub const ERROR_HEADER: &str = "x-certion-error";
pub const FIREWALL_BLOCKED_HEADER: &str = "x-firewall-blocked";
pub const FIREWALL_REASON_HEADER: &str = "x-firewall-reason";
pub const FIREWALL_LOGGED_HEADER: &str = "x-firewall-request-logged";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EdgeError {
    #[error("No tunnel is routed for {0}")]
    RoutingNotFound(String),

    #[error("Agent {0} is offline")]
    AgentOffline(String),

    #[error("Forbidden: {reason}")]
    FirewallBlocked {
        reason: String,
        access_request_id: Option<i64>,
    },

    #[error("Rate limit exceeded, retry later")]
    RateLimited,

    #[error("The application did not respond in time")]
    UpstreamTimeout,

    #[error("The tunnel to the application is unavailable")]
    GatewayUnavailable,

    #[error("The application could not be reached: {0}")]
    UpstreamError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl EdgeError {
    /// Stable machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            EdgeError::RoutingNotFound(_) => "ROUTING_NOT_FOUND",
            EdgeError::AgentOffline(_) => "AGENT_OFFLINE",
            EdgeError::FirewallBlocked { .. } => "FIREWALL_BLOCKED",
            EdgeError::RateLimited => "RATE_LIMITED",
            EdgeError::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            EdgeError::GatewayUnavailable => "GATEWAY_UNAVAILABLE",
            EdgeError::UpstreamError(_) => "UPSTREAM_ERROR",
            EdgeError::BadRequest(_) => "BAD_REQUEST",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            EdgeError::RoutingNotFound(_) => StatusCode::NOT_FOUND,
            EdgeError::AgentOffline(_) => StatusCode::BAD_GATEWAY,
            EdgeError::FirewallBlocked { .. } => StatusCode::FORBIDDEN,
            EdgeError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            EdgeError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            EdgeError::GatewayUnavailable => StatusCode::BAD_GATEWAY,
            EdgeError::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            EdgeError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Only rate limiting is worth retrying as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, EdgeError::RateLimited)
    }

    pub fn into_response(self) -> Response<EdgeBody> {
        let mut body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        if let EdgeError::FirewallBlocked {
            access_request_id: Some(id),
            ..
        } = &self
        {
            body["access_request_id"] = serde_json::json!(id);
        }

        let mut response = Response::new(full_body(body.to_string()));
        *response.status_mut() = self.status();
        let headers = response.headers_mut();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(ERROR_HEADER, HeaderValue::from_static(self.code()));

        match &self {
            EdgeError::FirewallBlocked {
                reason,
                access_request_id,
            } => {
                headers.insert(FIREWALL_BLOCKED_HEADER, HeaderValue::from_static("true"));
                if let Ok(value) = HeaderValue::from_str(&header_safe(reason)) {
                    headers.insert(FIREWALL_REASON_HEADER, value);
                }
                if access_request_id.is_some() {
                    headers.insert(FIREWALL_LOGGED_HEADER, HeaderValue::from_static("true"));
                }
            }
            EdgeError::RateLimited => {
                headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static("60"));
            }
            _ => {}
        }
        response
    }
}

impl From<ForwardError> for EdgeError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::AgentOffline(agent) | ForwardError::Draining(agent) => {
                EdgeError::AgentOffline(agent)
            }
        }
    }
}

impl From<ExchangeError> for EdgeError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::UpstreamTimeout => EdgeError::UpstreamTimeout,
            ExchangeError::GatewayUnavailable | ExchangeError::Cancelled => {
                EdgeError::GatewayUnavailable
            }
            ExchangeError::AgentError(reason) => EdgeError::UpstreamError(reason),
            ExchangeError::ProtocolViolation(reason) => {
                EdgeError::UpstreamError(format!("protocol violation: {}", reason))
            }
        }
    }
}

/// A complete in-memory body
pub fn full_body(data: impl Into<Bytes>) -> EdgeBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Printable ASCII only
fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response<EdgeBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_response_carries_code() {
        let response = EdgeError::RoutingNotFound("nope.certion.dev".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[ERROR_HEADER], "ROUTING_NOT_FOUND");

        let json = body_json(response).await;
        assert_eq!(json["error"], "ROUTING_NOT_FOUND");
        assert!(json["message"].as_str().unwrap().contains("nope.certion.dev"));
    }

    #[tokio::test]
    async fn test_firewall_block_headers() {
        let response = EdgeError::FirewallBlocked {
            reason: "Method DELETE is blocked: no deletes".into(),
            access_request_id: Some(12),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[FIREWALL_BLOCKED_HEADER], "true");
        assert_eq!(response.headers()[FIREWALL_LOGGED_HEADER], "true");
        assert_eq!(
            response.headers()[FIREWALL_REASON_HEADER],
            "Method DELETE is blocked: no deletes"
        );
        let json = body_json(response).await;
        assert_eq!(json["error"], "FIREWALL_BLOCKED");
        assert_eq!(json["access_request_id"], 12);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(EdgeError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(EdgeError::RateLimited.is_retryable());
        assert_eq!(
            EdgeError::from(ExchangeError::UpstreamTimeout).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            EdgeError::from(ExchangeError::GatewayUnavailable).code(),
            "GATEWAY_UNAVAILABLE"
        );
        assert_eq!(
            EdgeError::from(ForwardError::Draining("a".into())).code(),
            "AGENT_OFFLINE"
        );
        assert!(!EdgeError::UpstreamTimeout.is_retryable());
    }

    #[test]
    fn test_header_safe() {
        assert_eq!(header_safe("a\nb\u{e9}"), "a?b?");
    }
}
