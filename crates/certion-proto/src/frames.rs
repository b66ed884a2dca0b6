//! Tunnel frame definitions

use serde::{Deserialize, Serialize};

/// Session-scoped correlation key of one exchange
pub type RequestId = u64;

/// HTTP header list as carried on the wire (order and duplicates preserved)
pub type HeaderList = Vec<(String, Vec<u8>)>;

/// Every frame that can travel over a tunnel session.
///
/// Exchange frames carry the `request_id` the relay assigned when the
/// request was forwarded; frames for one `request_id` are written by a
/// single task and therefore arrive in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelFrame {
    // Session control
    Hello {
        agent_id: String,
        auth_token: String,
        protocol_version: u32,
    },
    Welcome {
        agent_id: String,
        session_id: u64,
    },
    Rejected {
        reason: String,
    },
    Heartbeat,
    GoAway {
        reason: String,
    },

    // Relay -> agent
    RequestStart {
        request_id: RequestId,
        method: String,
        path: String,
        headers: HeaderList,
    },
    RequestBodyChunk {
        request_id: RequestId,
        #[serde(with = "serde_bytes")]
        bytes: Vec<u8>,
    },
    RequestEnd {
        request_id: RequestId,
    },
    RequestAbort {
        request_id: RequestId,
        reason: String,
    },

    // Agent -> relay
    ResponseHeaders {
        request_id: RequestId,
        status: u16,
        headers: HeaderList,
    },
    ResponseBodyChunk {
        request_id: RequestId,
        #[serde(with = "serde_bytes")]
        bytes: Vec<u8>,
    },
    ResponseEnd {
        request_id: RequestId,
    },
    ResponseError {
        request_id: RequestId,
        reason: String,
    },

    // Either direction
    WindowUpdate {
        request_id: RequestId,
        credits: u32,
    },
}

impl TunnelFrame {
    /// The exchange this frame belongs to, if any
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            TunnelFrame::RequestStart { request_id, .. }
            | TunnelFrame::RequestBodyChunk { request_id, .. }
            | TunnelFrame::RequestEnd { request_id }
            | TunnelFrame::RequestAbort { request_id, .. }
            | TunnelFrame::ResponseHeaders { request_id, .. }
            | TunnelFrame::ResponseBodyChunk { request_id, .. }
            | TunnelFrame::ResponseEnd { request_id }
            | TunnelFrame::ResponseError { request_id, .. }
            | TunnelFrame::WindowUpdate { request_id, .. } => Some(*request_id),
            TunnelFrame::Hello { .. }
            | TunnelFrame::Welcome { .. }
            | TunnelFrame::Rejected { .. }
            | TunnelFrame::Heartbeat
            | TunnelFrame::GoAway { .. } => None,
        }
    }

    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelFrame::Hello { .. } => "HELLO",
            TunnelFrame::Welcome { .. } => "WELCOME",
            TunnelFrame::Rejected { .. } => "REJECTED",
            TunnelFrame::Heartbeat => "HEARTBEAT",
            TunnelFrame::GoAway { .. } => "GOAWAY",
            TunnelFrame::RequestStart { .. } => "REQUEST_START",
            TunnelFrame::RequestBodyChunk { .. } => "REQUEST_BODY_CHUNK",
            TunnelFrame::RequestEnd { .. } => "REQUEST_END",
            TunnelFrame::RequestAbort { .. } => "REQUEST_ABORT",
            TunnelFrame::ResponseHeaders { .. } => "RESPONSE_HEADERS",
            TunnelFrame::ResponseBodyChunk { .. } => "RESPONSE_BODY_CHUNK",
            TunnelFrame::ResponseEnd { .. } => "RESPONSE_END",
            TunnelFrame::ResponseError { .. } => "RESPONSE_ERROR",
            TunnelFrame::WindowUpdate { .. } => "WINDOW_UPDATE",
        }
    }
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_only_on_exchange_frames() {
        assert_eq!(TunnelFrame::Heartbeat.request_id(), None);
        assert_eq!(
            TunnelFrame::GoAway {
                reason: "shutdown".into()
            }
            .request_id(),
            None
        );
        assert_eq!(
            TunnelFrame::ResponseEnd { request_id: 9 }.request_id(),
            Some(9)
        );
        assert_eq!(
            TunnelFrame::WindowUpdate {
                request_id: 4,
                credits: 8
            }
            .request_id(),
            Some(4)
        );
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(
            TunnelFrame::RequestAbort {
                request_id: 1,
                reason: "client gone".into()
            }
            .kind(),
            "REQUEST_ABORT"
        );
        assert_eq!(TunnelFrame::Heartbeat.kind(), "HEARTBEAT");
    }
}
