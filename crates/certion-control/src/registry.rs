//! Tunnel registry
//!
//! Tracks the single live session of every connected agent. Registering a
//! new connection for an agent supersedes (closes) the previous one before
//! the new session becomes ACTIVE.

use crate::error::RegistryError;
use crate::session::{CloseReason, SessionHandle, SessionState, TunnelSession};
use certion_proto::TunnelFrame;
use certion_transport::{FrameSink, FrameSource, FrameTransport};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Registry tuning
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Expected heartbeat cadence of agents
    pub heartbeat_interval: Duration,
    /// Consecutive missed intervals before a session is closed
    pub missed_heartbeats: u32,
    /// Capacity of each session's outbound frame queue
    pub outbound_buffer: usize,
    /// How long a draining session waits for in-flight exchanges
    pub drain_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            missed_heartbeats: 2,
            outbound_buffer: 256,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }
}

/// Passed to disconnect callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub agent_id: String,
    pub session_id: u64,
    pub reason: CloseReason,
}

pub type DisconnectCallback = Arc<dyn Fn(&DisconnectEvent) + Send + Sync>;

/// Identifies one registered disconnect callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisconnectCallbackId(u64);

/// Snapshot of one registered session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub agent_id: String,
    pub session_id: u64,
    pub state: SessionState,
    pub remote_addr: Option<SocketAddr>,
    pub in_flight: usize,
}

/// Registry of live tunnel sessions, keyed by agent id
#[derive(Clone)]
pub struct TunnelRegistry {
    sessions: Arc<DashMap<String, Arc<TunnelSession>>>,
    callbacks: Arc<DashMap<String, Vec<(u64, DisconnectCallback)>>>,
    next_callback_id: Arc<AtomicU64>,
    next_session_id: Arc<AtomicU64>,
    config: RegistryConfig,
}

impl std::fmt::Debug for TunnelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRegistry")
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish()
    }
}

impl TunnelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            callbacks: Arc::new(DashMap::new()),
            next_callback_id: Arc::new(AtomicU64::new(0)),
            next_session_id: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a connected (already authenticated) agent
    pub fn register(&self, agent_id: &str, transport: Box<dyn FrameTransport>) -> SessionHandle {
        let remote_addr = transport.remote_address();
        let (sink, source) = transport.split();
        self.register_split(agent_id, sink, source, remote_addr)
    }

    /// Register from transport halves that were already used for the handshake
    pub fn register_split(
        &self,
        agent_id: &str,
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
        remote_addr: Option<SocketAddr>,
    ) -> SessionHandle {
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let session = Arc::new(TunnelSession::new(
            agent_id.to_string(),
            session_id,
            remote_addr,
            tx,
        ));

        // WELCOME goes out before anything forwarded to the new session
        session.try_send(TunnelFrame::Welcome {
            agent_id: agent_id.to_string(),
            session_id,
        });

        // in the map before any task can observe the close, so supervise
        // always finds the entry it has to remove
        if let Some(previous) = self.sessions.insert(agent_id.to_string(), session.clone()) {
            warn!(
                agent_id = %agent_id,
                old_session_id = previous.session_id(),
                new_session_id = session_id,
                "Agent reconnected, superseding previous session"
            );
            previous.close(CloseReason::Superseded);
        }
        session.activate();

        tokio::spawn(write_loop(session.clone(), sink, rx));
        tokio::spawn(read_loop(session.clone(), source));
        tokio::spawn(heartbeat_watchdog(
            session.clone(),
            self.config.heartbeat_interval,
            self.config.heartbeat_timeout(),
        ));
        tokio::spawn(self.clone().supervise(session.clone()));

        info!(
            agent_id = %agent_id,
            session_id,
            remote_addr = ?remote_addr,
            "Agent session active"
        );

        SessionHandle::new(session)
    }

    /// Removes the session once it closes and fires disconnect callbacks
    async fn supervise(self, session: Arc<TunnelSession>) {
        session.closed().await;

        let session_id = session.session_id();
        let removed = self
            .sessions
            .remove_if(session.agent_id(), |_, current| {
                current.session_id() == session_id
            })
            .is_some();
        debug!(
            agent_id = %session.agent_id(),
            session_id,
            removed,
            "Session cleanup"
        );

        let event = DisconnectEvent {
            agent_id: session.agent_id().to_string(),
            session_id,
            reason: session.close_reason().unwrap_or(CloseReason::Requested),
        };
        let callbacks: Vec<DisconnectCallback> = self
            .callbacks
            .get(session.agent_id())
            .map(|entry| entry.value().iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(&event);
        }
    }

    pub(crate) fn session(&self, agent_id: &str) -> Option<Arc<TunnelSession>> {
        self.sessions.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn handle(&self, agent_id: &str) -> Option<SessionHandle> {
        self.session(agent_id).map(SessionHandle::new)
    }

    /// Queue a frame on the agent's session
    pub async fn send(&self, agent_id: &str, frame: TunnelFrame) -> Result<(), RegistryError> {
        let session = self
            .session(agent_id)
            .ok_or_else(|| RegistryError::AgentNotConnected(agent_id.to_string()))?;
        session.send(frame).await
    }

    /// True when the agent has an ACTIVE session
    pub fn is_online(&self, agent_id: &str) -> bool {
        self.sessions
            .get(agent_id)
            .map(|entry| entry.value().is_active())
            .unwrap_or(false)
    }

    /// Call `callback` every time a session of `agent_id` ends, until the
    /// returned id is passed to [`TunnelRegistry::remove_disconnect_callback`]
    pub fn on_disconnect<F>(&self, agent_id: &str, callback: F) -> DisconnectCallbackId
    where
        F: Fn(&DisconnectEvent) + Send + Sync + 'static,
    {
        let id = self.next_callback_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks
            .entry(agent_id.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        DisconnectCallbackId(id)
    }

    /// Unregister a disconnect callback. Returns false if it was not found.
    pub fn remove_disconnect_callback(&self, agent_id: &str, id: DisconnectCallbackId) -> bool {
        let mut removed = false;
        if let Some(mut entry) = self.callbacks.get_mut(agent_id) {
            let before = entry.len();
            entry.retain(|(cb_id, _)| *cb_id != id.0);
            removed = entry.len() != before;
        }
        self.callbacks.remove_if(agent_id, |_, list| list.is_empty());
        removed
    }

    /// Agent ids with at least one disconnect callback
    pub fn disconnect_subscriptions(&self) -> usize {
        self.callbacks.len()
    }

    /// Start draining the agent's session: no new exchanges, close once
    /// in-flight ones finish or the drain timeout passes
    pub fn drain(&self, agent_id: &str) -> bool {
        let Some(session) = self.session(agent_id) else {
            return false;
        };
        if !session.begin_drain() {
            return false;
        }
        tokio::spawn(finish_drain(session, self.config.drain_timeout));
        true
    }

    /// Drain every session and wait until all are closed
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<TunnelSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!("Draining {} tunnel session(s)", sessions.len());

        let drains = sessions.into_iter().filter_map(|session| {
            if session.begin_drain() || session.state() == SessionState::Connecting {
                Some(finish_drain(session, self.config.drain_timeout))
            } else {
                None
            }
        });
        futures::future::join_all(drains).await;
    }

    /// Agents with an ACTIVE session
    pub fn online_agents(&self) -> Vec<SessionInfo> {
        let mut agents: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| {
                let session = entry.value();
                SessionInfo {
                    agent_id: session.agent_id().to_string(),
                    session_id: session.session_id(),
                    state: session.state(),
                    remote_addr: session.remote_addr(),
                    in_flight: session.in_flight(),
                }
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Number of registered sessions (any state)
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

async fn finish_drain(session: Arc<TunnelSession>, timeout: Duration) {
    session.try_send(TunnelFrame::GoAway {
        reason: "relay is draining".to_string(),
    });
    let idle = session.wait_idle(timeout).await;
    if !idle {
        warn!(
            agent_id = %session.agent_id(),
            in_flight = session.in_flight(),
            "Drain timeout reached, closing session with exchanges in flight"
        );
    }
    session.close(CloseReason::Drained);
}

async fn write_loop(
    session: Arc<TunnelSession>,
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::Receiver<TunnelFrame>,
) {
    let cancel = session.cancel_token().clone();
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(e) = sink.send_frame(frame).await {
            warn!(agent_id = %session.agent_id(), "Failed to write frame: {}", e);
            session.close(CloseReason::TransportError(e.to_string()));
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(session: Arc<TunnelSession>, mut source: Box<dyn FrameSource>) {
    let cancel = session.cancel_token().clone();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = source.recv_frame() => next,
        };
        match next {
            Ok(Some(frame)) => session.dispatch(frame),
            Ok(None) => {
                session.close(CloseReason::TransportClosed);
                return;
            }
            Err(e) if !e.is_fatal() => {
                warn!(agent_id = %session.agent_id(), "Skipping malformed frame: {}", e);
            }
            Err(e) => {
                session.close(CloseReason::TransportError(e.to_string()));
                return;
            }
        }
    }
}

async fn heartbeat_watchdog(session: Arc<TunnelSession>, interval: Duration, timeout: Duration) {
    let cancel = session.cancel_token().clone();
    let mut ticker = tokio::time::interval((interval / 2).max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if session.since_heartbeat() >= timeout {
            warn!(
                agent_id = %session.agent_id(),
                session_id = session.session_id(),
                "No heartbeat for {:?}, closing session",
                timeout
            );
            session.close(CloseReason::HeartbeatTimeout);
            return;
        }
    }
}
