//! Agent handshake and accept loop

use crate::error::HandshakeError;
use crate::registry::TunnelRegistry;
use crate::session::SessionHandle;
use certion_proto::{TunnelFrame, PROTOCOL_VERSION};
use certion_transport::{FrameTransport, TransportListener};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Decides whether an agent may open a session
pub trait AgentAuthenticator: Send + Sync {
    fn authenticate(&self, agent_id: &str, token: &str) -> Result<(), String>;
}

/// Accepts every agent
#[derive(Debug, Clone, Default)]
pub struct AllowAllAuthenticator;

impl AgentAuthenticator for AllowAllAuthenticator {
    fn authenticate(&self, _agent_id: &str, _token: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Requires every agent to present the same secret
#[derive(Clone)]
pub struct SharedSecretAuthenticator {
    secret: String,
}

impl SharedSecretAuthenticator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for SharedSecretAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecretAuthenticator").finish_non_exhaustive()
    }
}

impl AgentAuthenticator for SharedSecretAuthenticator {
    fn authenticate(&self, _agent_id: &str, token: &str) -> Result<(), String> {
        let matches: bool = self.secret.as_bytes().ct_eq(token.as_bytes()).into();
        if matches {
            Ok(())
        } else {
            Err("invalid agent token".to_string())
        }
    }
}

/// Runs the HELLO / WELCOME handshake and registers the session
#[derive(Clone)]
pub struct TunnelHandler {
    registry: TunnelRegistry,
    authenticator: Arc<dyn AgentAuthenticator>,
    handshake_timeout: Duration,
}

impl TunnelHandler {
    pub fn new(registry: TunnelRegistry, authenticator: Arc<dyn AgentAuthenticator>) -> Self {
        Self {
            registry,
            authenticator,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    /// Handshake one connection. On failure a REJECTED frame is sent (when
    /// possible) and the transport is closed.
    pub async fn handle(
        &self,
        transport: Box<dyn FrameTransport>,
    ) -> Result<SessionHandle, HandshakeError> {
        let remote_addr = transport.remote_address();
        let connection_id = transport.connection_id();
        let (mut sink, mut source) = transport.split();

        let hello = match tokio::time::timeout(self.handshake_timeout, source.recv_frame()).await {
            Err(_) => Err(HandshakeError::Timeout),
            Ok(Err(e)) => Err(HandshakeError::Transport(e)),
            Ok(Ok(None)) => Err(HandshakeError::Closed),
            Ok(Ok(Some(frame))) => self.check_hello(frame),
        };

        match hello {
            Ok(agent_id) => {
                debug!(connection_id = %connection_id, agent_id = %agent_id, "Handshake accepted");
                Ok(self
                    .registry
                    .register_split(&agent_id, sink, source, remote_addr))
            }
            Err(e) => {
                warn!(
                    connection_id = %connection_id,
                    remote_addr = ?remote_addr,
                    "Rejecting tunnel connection: {}",
                    e
                );
                let _ = sink
                    .send_frame(TunnelFrame::Rejected {
                        reason: e.to_string(),
                    })
                    .await;
                let _ = sink.close().await;
                Err(e)
            }
        }
    }

    fn check_hello(&self, frame: TunnelFrame) -> Result<String, HandshakeError> {
        let (agent_id, auth_token, protocol_version) = match frame {
            TunnelFrame::Hello {
                agent_id,
                auth_token,
                protocol_version,
            } => (agent_id, auth_token, protocol_version),
            other => return Err(HandshakeError::UnexpectedFrame(other.kind())),
        };

        if protocol_version != PROTOCOL_VERSION {
            return Err(HandshakeError::VersionMismatch {
                got: protocol_version,
                expected: PROTOCOL_VERSION,
            });
        }
        if agent_id.trim().is_empty() {
            return Err(HandshakeError::Unauthorized("empty agent id".to_string()));
        }
        self.authenticator
            .authenticate(&agent_id, &auth_token)
            .map_err(HandshakeError::Unauthorized)?;
        Ok(agent_id)
    }

    /// Accept connections until `shutdown` fires; one task per connection
    pub async fn serve(self, listener: Arc<dyn TransportListener>, shutdown: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!("Tunnel listener ready on {}", addr),
            Err(e) => warn!("Tunnel listener address unavailable: {}", e),
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((transport, peer)) => {
                    let handler = self.clone();
                    tokio::spawn(async move {
                        debug!("Tunnel connection from {}", peer);
                        if let Err(e) = handler.handle(transport).await {
                            debug!("Handshake with {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept tunnel connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        info!("Tunnel listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_secret() {
        let auth = SharedSecretAuthenticator::new("s3cret");
        assert!(auth.authenticate("a", "s3cret").is_ok());
        assert!(auth.authenticate("a", "s3cre").is_err());
        assert!(auth.authenticate("a", "s3cret!").is_err());
        assert!(auth.authenticate("a", "S3cret").is_err());
        assert!(auth.authenticate("a", "").is_err());
        assert!(AllowAllAuthenticator.authenticate("a", "").is_ok());
    }
}
