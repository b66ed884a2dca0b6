//! Control plane for tunnel sessions
//!
//! - [`TunnelRegistry`]: one live session per agent, heartbeats,
//!   supersession and draining
//! - [`Multiplexer`]: many concurrent exchanges over one session
//! - [`TunnelHandler`]: HELLO / WELCOME handshake and the accept loop
pub mod error;
pub mod handler;
pub mod multiplexer;
pub mod registry;
pub mod session;

pub use error::{ExchangeError, ForwardError, HandshakeError, RegistryError};
pub use handler::{
    AgentAuthenticator, AllowAllAuthenticator, SharedSecretAuthenticator, TunnelHandler,
};
pub use multiplexer::{
    Exchange, ExchangeTimeouts, Multiplexer, RequestBodySender, RequestHead, ResponseEvent,
    ResponseEvents, ResponseHead,
};
pub use registry::{
    DisconnectCallback, DisconnectCallbackId, DisconnectEvent, RegistryConfig, SessionInfo,
    TunnelRegistry,
};
pub use session::{CloseReason, SessionHandle, SessionState, TunnelSession};
