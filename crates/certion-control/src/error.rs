use thiserror::Error;

/// Errors from registry operations on a tunnel session
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Agent not connected: {0}")]
    AgentNotConnected(String),

    #[error("Session closed for agent {0}")]
    SessionClosed(String),
}

/// Why a forward could not even start
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForwardError {
    #[error("Agent offline: {0}")]
    AgentOffline(String),

    #[error("Agent {0} is draining")]
    Draining(String),
}

/// Terminal failure of one exchange
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("Upstream timed out")]
    UpstreamTimeout,

    #[error("Tunnel session closed")]
    GatewayUnavailable,

    #[error("Agent reported error: {0}")]
    AgentError(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Exchange cancelled")]
    Cancelled,
}

/// Handshake failures while accepting an agent
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Handshake timed out")]
    Timeout,

    #[error("Expected HELLO, got {0}")]
    UnexpectedFrame(&'static str),

    #[error("Unsupported protocol version {got} (expected {expected})")]
    VersionMismatch { got: u32, expected: u32 },

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Transport error: {0}")]
    Transport(#[from] certion_transport::TransportError),

    #[error("Connection closed before HELLO")]
    Closed,
}
