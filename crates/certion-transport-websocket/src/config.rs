//! WebSocket transport configuration

use certion_proto::MAX_FRAME_SIZE;
use std::path::PathBuf;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig as ProtocolConfig;

/// WebSocket-specific configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Upgrade path agents connect to (e.g., "/tunnel")
    pub path: String,

    /// Server certificate path; plain `ws://` when unset
    pub server_cert_path: Option<PathBuf>,

    /// Server private key path
    pub server_key_path: Option<PathBuf>,

    /// Maximum time a peer gets to complete the upgrade
    pub handshake_timeout: Duration,

    /// Maximum message size
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: "/tunnel".to_string(),
            server_cert_path: None,
            server_key_path: None,
            handshake_timeout: Duration::from_secs(10),
            // Room for the bincode envelope around a maximum-size frame
            max_message_size: MAX_FRAME_SIZE + 1024,
        }
    }
}

impl WebSocketConfig {
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_tls(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.server_cert_path = Some(cert_path.into());
        self.server_key_path = Some(key_path.into());
        self
    }

    /// Whether an upgrade request path targets the tunnel endpoint
    pub fn matches_path(&self, path: &str) -> bool {
        path == self.path || path.strip_suffix('/') == Some(self.path.as_str())
    }

    pub(crate) fn protocol_config(&self) -> ProtocolConfig {
        let mut config = ProtocolConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_matching() {
        let config = WebSocketConfig::default();
        assert!(config.matches_path("/tunnel"));
        assert!(config.matches_path("/tunnel/"));
        assert!(!config.matches_path("/tunnels"));
        assert!(!config.matches_path("/"));
    }

    #[test]
    fn test_builder() {
        let config = WebSocketConfig::default()
            .with_path("/agents")
            .with_tls("cert.pem", "key.pem");
        assert_eq!(config.path, "/agents");
        assert_eq!(config.server_cert_path, Some(PathBuf::from("cert.pem")));
        assert!(config.matches_path("/agents"));
    }
}
