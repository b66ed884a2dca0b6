//! Certion agent
//!
//! Runs next to a local web service, keeps one tunnel session open to the
//! relay and answers the exchanges the relay forwards to it.
//!
//! ```no_run
//! use certion_agent::{Agent, AgentConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let agent = Agent::new(AgentConfig {
//!     agent_id: "agent-1".to_string(),
//!     relay_url: "wss://relay.certion.dev/tunnel".to_string(),
//!     auth_token: "secret".to_string(),
//!     local_port: 3000,
//!     ..AgentConfig::default()
//! })?;
//! agent.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod connection;
pub mod forwarder;

pub use agent::{Agent, AgentError};
pub use config::AgentConfig;
pub use connection::SessionEnd;
pub use forwarder::{ForwarderError, LocalForwarder};
