use crate::config::AgentConfig;
use crate::connection::{self, SessionEnd};
use crate::forwarder::LocalForwarder;
use certion_transport::{FrameTransport, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Relay rejected the agent: {0}")]
    Rejected(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Relay did not answer HELLO in time")]
    HandshakeTimeout,
}

/// The tunnel agent: keeps a session with the relay open and serves its
/// exchanges from the local service
pub struct Agent {
    config: AgentConfig,
    forwarder: Arc<LocalForwarder>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        if config.agent_id.trim().is_empty() {
            return Err(AgentError::InvalidConfig(
                "Agent id cannot be empty".to_string(),
            ));
        }
        if config.local_port == 0 {
            return Err(AgentError::InvalidConfig(
                "Local port cannot be 0".to_string(),
            ));
        }
        if config.heartbeat_interval.is_zero() {
            return Err(AgentError::InvalidConfig(
                "Heartbeat interval must be positive".to_string(),
            ));
        }

        let forwarder = Arc::new(LocalForwarder::new(config.local_address()));
        Ok(Self { config, forwarder })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Connect over WebSocket and keep reconnecting with exponential
    /// backoff until `shutdown` fires. Only a rejected HELLO is fatal.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        info!(
            agent_id = %self.config.agent_id,
            relay = %self.config.relay_url,
            local = %self.forwarder.address(),
            "Starting agent"
        );

        let mut attempt = 0u32;
        loop {
            let delay = self.config.backoff(attempt);
            if !delay.is_zero() {
                info!("Waiting {:?} before reconnecting...", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return Ok(()),
                }
            }
            if shutdown.is_cancelled() {
                return Ok(());
            }

            info!("Connecting to relay... (attempt {})", attempt + 1);
            let transport =
                match certion_transport_websocket::connect(&self.config.relay_url, &self.config.websocket)
                    .await
                {
                    Ok(transport) => Box::new(transport) as Box<dyn FrameTransport>,
                    Err(e) => {
                        warn!("Failed to connect to relay: {}", e);
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                };

            match self.run_session(transport, &shutdown).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                // the session was up: start over from the shortest delay
                Ok(_) => attempt = 1,
                Err(AgentError::Rejected(reason)) => {
                    error!("Relay rejected agent {}: {}", self.config.agent_id, reason);
                    return Err(AgentError::Rejected(reason));
                }
                Err(e) => {
                    warn!("Tunnel session failed: {}", e);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Handshake and serve one session over an established transport
    pub async fn run_session(
        &self,
        transport: Box<dyn FrameTransport>,
        shutdown: &CancellationToken,
    ) -> Result<SessionEnd, AgentError> {
        let (mut sink, mut source) = transport.split();
        connection::handshake(sink.as_mut(), source.as_mut(), &self.config).await?;
        info!(
            "Tunnel is active, forwarding to http://{}",
            self.forwarder.address()
        );

        Ok(connection::run_session(sink, source, self.forwarder.clone(), &self.config, shutdown).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_config() {
        let no_id = AgentConfig {
            agent_id: " ".into(),
            ..AgentConfig::default()
        };
        assert!(matches!(Agent::new(no_id), Err(AgentError::InvalidConfig(_))));

        let no_port = AgentConfig {
            local_port: 0,
            ..AgentConfig::default()
        };
        assert!(matches!(Agent::new(no_port), Err(AgentError::InvalidConfig(_))));

        assert!(Agent::new(AgentConfig::default()).is_ok());
    }
}
