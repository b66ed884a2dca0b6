//! Transport abstraction layer for tunnel sessions
//!
//! The relay and the agent exchange [`TunnelFrame`]s over one persistent,
//! message-framed connection. This crate defines the transport-agnostic
//! traits for that connection so the registry and the multiplexer never
//! depend on a concrete protocol.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   Tunnel registry / agent session loop        │
//! └──────────────────────────────────────────────┘
//!                     │ FrameTransport::split()
//!          ┌──────────┴───────────┐
//!          ↓                      ↓
//!     FrameSink              FrameSource
//!   (one writer task)      (one reader task)
//! ```
//!
//! Implementations: [`StreamTransport`] (length-prefixed frames over any
//! byte stream, including the in-memory [`memory::pair`]) and the
//! WebSocket transport in `certion-transport-websocket`.

pub mod memory;
pub mod stream;
pub mod tls;

pub use stream::StreamTransport;

use async_trait::async_trait;
use certion_proto::TunnelFrame;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

impl TransportError {
    /// Whether the connection is unusable after this error.
    ///
    /// A frame that could not be decoded is skipped; everything else ends
    /// the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::MalformedFrame(_))
    }
}

impl From<certion_proto::CodecError> for TransportError {
    fn from(err: certion_proto::CodecError) -> Self {
        match err {
            certion_proto::CodecError::Io(e) => TransportError::IoError(e),
            e if e.is_fatal() => TransportError::ProtocolError(e.to_string()),
            e => TransportError::MalformedFrame(e.to_string()),
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Sending half of a tunnel connection
#[async_trait]
pub trait FrameSink: Send + Debug {
    /// Send one frame
    async fn send_frame(&mut self, frame: TunnelFrame) -> TransportResult<()>;

    /// Close the connection gracefully
    async fn close(&mut self) -> TransportResult<()>;
}

/// Receiving half of a tunnel connection
#[async_trait]
pub trait FrameSource: Send + Debug {
    /// Receive the next frame
    ///
    /// Returns `None` once the peer closed the connection. A
    /// [`TransportError::MalformedFrame`] leaves the source usable.
    async fn recv_frame(&mut self) -> TransportResult<Option<TunnelFrame>>;
}

/// One persistent tunnel connection
pub trait FrameTransport: Send + Debug {
    /// Split into independently owned halves
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>);

    /// Remote peer address, when the transport has one
    fn remote_address(&self) -> Option<SocketAddr>;

    /// Stable identifier used for logging
    fn connection_id(&self) -> String;
}

/// Accepts inbound tunnel connections
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// Accept the next connection
    async fn accept(&self) -> TransportResult<(Box<dyn FrameTransport>, SocketAddr)>;

    /// Local bound address
    fn local_addr(&self) -> TransportResult<SocketAddr>;
}
