use certion_transport_websocket::WebSocketConfig;
use std::time::Duration;

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Unique identifier for this agent
    pub agent_id: String,

    /// Relay tunnel endpoint (`ws://relay:4443/tunnel` or `wss://...`)
    pub relay_url: String,

    /// Token presented in HELLO
    pub auth_token: String,

    /// Host of the local service
    pub local_host: String,

    /// Port of the local service
    pub local_port: u16,

    /// Interval between HEARTBEAT frames
    pub heartbeat_interval: Duration,

    /// Unanswered heartbeats before the relay is considered gone
    pub missed_heartbeats: u32,

    /// Maximum time to wait for WELCOME
    pub handshake_timeout: Duration,

    /// First reconnect delay; doubles up to `max_backoff`
    pub initial_backoff: Duration,

    pub max_backoff: Duration,

    pub websocket: WebSocketConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: uuid::Uuid::new_v4().to_string(),
            relay_url: "ws://localhost:4443/tunnel".to_string(),
            auth_token: String::new(),
            local_host: "127.0.0.1".to_string(),
            local_port: 3000,
            heartbeat_interval: Duration::from_secs(30),
            missed_heartbeats: 2,
            handshake_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            websocket: WebSocketConfig::default(),
        }
    }
}

impl AgentConfig {
    /// `host:port` of the local service
    pub fn local_address(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// Delay before reconnect attempt `attempt` (1-based): 1s, 2s, 4s, ... capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = AgentConfig::default();
        let delays: Vec<u64> = (0..8).map(|a| config.backoff(a).as_secs()).collect();
        assert_eq!(delays, vec![0, 1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_local_address() {
        let config = AgentConfig {
            local_port: 8080,
            ..AgentConfig::default()
        };
        assert_eq!(config.local_address(), "127.0.0.1:8080");
    }
}
