//! Public edge of the relay
//!
//! Maps `{subdomain}.{domain}` to a project and its agent, runs the
//! firewall, and forwards allowed requests through the agent's tunnel.
pub mod client_ip;
pub mod edge;
pub mod error;
pub mod host;
pub mod routing;
pub mod server;

pub use client_ip::client_ip;
pub use edge::{EdgeConfig, EdgeRouter};
pub use error::{EdgeBody, EdgeError};
pub use host::{generate_subdomain, normalize_subdomain, parse_host, validate_subdomain, HostTarget};
pub use routing::{MemoryRoutingTable, RoutingEntry, RoutingError, RoutingTable};
pub use server::{EdgeServer, EdgeServerConfig, EdgeServerError};
