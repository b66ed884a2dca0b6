//! WebSocket transport implementation using tokio-tungstenite
//!
//! Each binary WebSocket message carries exactly one encoded
//! [`certion_proto::TunnelFrame`]; WebSocket already frames messages, so no
//! length prefix is added. Works through proxies and firewalls that only
//! let HTTP(S) on port 80/443 through.

pub mod config;
pub mod connection;
pub mod listener;

pub use config::WebSocketConfig;
pub use connection::WebSocketTransport;
pub use listener::{connect, WebSocketListener};
