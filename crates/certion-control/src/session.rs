//! One tunnel session per connected agent
//!
//! A session owns the outbound frame queue (drained by a single writer
//! task), the map of in-flight exchanges keyed by `request_id`, and the
//! heartbeat clock. The reader task feeds every inbound frame to
//! [`TunnelSession::dispatch`], which demultiplexes without ever awaiting a
//! slow consumer.

use crate::error::{ExchangeError, RegistryError};
use certion_proto::{HeaderList, RequestId, TunnelFrame};
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Draining = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Active,
            2 => SessionState::Draining,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection from the same agent took over
    Superseded,
    HeartbeatTimeout,
    /// The agent closed the connection
    TransportClosed,
    TransportError(String),
    /// Graceful drain finished (or hit its deadline)
    Drained,
    /// Closed through a [`SessionHandle`]
    Requested,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Superseded => write!(f, "superseded by a newer session"),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CloseReason::TransportClosed => write!(f, "transport closed"),
            CloseReason::TransportError(e) => write!(f, "transport error: {}", e),
            CloseReason::Drained => write!(f, "drained"),
            CloseReason::Requested => write!(f, "closed"),
        }
    }
}

/// Event delivered from the reader task to an exchange's consumer
#[derive(Debug)]
pub(crate) enum Inbound {
    Headers { status: u16, headers: HeaderList },
    Chunk(Vec<u8>),
    End,
    Error(String),
}

/// State shared by the demultiplexer and both halves of an exchange
#[derive(Debug)]
pub(crate) struct ExchangeShared {
    pub(crate) request_id: RequestId,
    /// Credits for relay -> agent body chunks
    pub(crate) request_credits: Semaphore,
    /// Credits the agent still holds for response body chunks
    pub(crate) response_credits: AtomicI64,
    done: AtomicBool,
    failure: OnceLock<ExchangeError>,
}

impl ExchangeShared {
    pub(crate) fn new(request_id: RequestId, window: u32) -> Self {
        Self {
            request_id,
            request_credits: Semaphore::new(window as usize),
            response_credits: AtomicI64::new(window as i64),
            done: AtomicBool::new(false),
            failure: OnceLock::new(),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Mark the exchange finished. Returns true only for the first caller.
    pub(crate) fn finish(&self) -> bool {
        let first = !self.done.swap(true, Ordering::SeqCst);
        if first {
            self.request_credits.close();
        }
        first
    }

    /// Record a terminal error and finish
    pub(crate) fn fail(&self, error: ExchangeError) -> bool {
        let _ = self.failure.set(error);
        self.finish()
    }

    pub(crate) fn failure(&self) -> Option<ExchangeError> {
        self.failure.get().cloned()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ExchangeSlot {
    pub(crate) events: mpsc::Sender<Inbound>,
    pub(crate) shared: Arc<ExchangeShared>,
}

/// A live tunnel session
pub struct TunnelSession {
    agent_id: String,
    session_id: u64,
    remote_addr: Option<SocketAddr>,
    started: Instant,
    state: AtomicU8,
    outbound: mpsc::Sender<TunnelFrame>,
    exchanges: DashMap<RequestId, ExchangeSlot>,
    next_request_id: AtomicU64,
    /// Milliseconds after `started` of the last heartbeat
    last_heartbeat_ms: AtomicU64,
    cancel: CancellationToken,
    close_reason: OnceLock<CloseReason>,
    exchange_removed: Notify,
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("agent_id", &self.agent_id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .field("in_flight", &self.exchanges.len())
            .finish()
    }
}

impl TunnelSession {
    pub(crate) fn new(
        agent_id: String,
        session_id: u64,
        remote_addr: Option<SocketAddr>,
        outbound: mpsc::Sender<TunnelFrame>,
    ) -> Self {
        Self {
            agent_id,
            session_id,
            remote_addr,
            started: Instant::now(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            outbound,
            exchanges: DashMap::new(),
            next_request_id: AtomicU64::new(0),
            last_heartbeat_ms: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            close_reason: OnceLock::new(),
            exchange_removed: Notify::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Number of exchanges currently in flight
    pub fn in_flight(&self) -> usize {
        self.exchanges.len()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().cloned()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// CONNECTING -> ACTIVE
    pub(crate) fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// ACTIVE -> DRAINING
    pub(crate) fn begin_drain(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Active as u8,
                SessionState::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Close the session and fail every outstanding exchange with
    /// [`ExchangeError::GatewayUnavailable`]. Returns false if it was
    /// already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        let previous = self.state.swap(SessionState::Closed as u8, Ordering::SeqCst);
        if previous == SessionState::Closed as u8 {
            return false;
        }
        let _ = self.close_reason.set(reason.clone());

        let ids: Vec<RequestId> = self.exchanges.iter().map(|e| *e.key()).collect();
        let failed = ids.len();
        for id in ids {
            if let Some((_, slot)) = self.exchanges.remove(&id) {
                slot.shared.fail(ExchangeError::GatewayUnavailable);
            }
        }
        self.exchange_removed.notify_waiters();
        self.cancel.cancel();

        info!(
            agent_id = %self.agent_id,
            session_id = self.session_id,
            failed_exchanges = failed,
            "Tunnel session closed: {}",
            reason
        );
        true
    }

    /// Queue a frame for the writer task, waiting for room
    pub async fn send(&self, frame: TunnelFrame) -> Result<(), RegistryError> {
        if self.cancel.is_cancelled() {
            return Err(RegistryError::SessionClosed(self.agent_id.clone()));
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RegistryError::SessionClosed(self.agent_id.clone())),
            result = self.outbound.send(frame) => {
                result.map_err(|_| RegistryError::SessionClosed(self.agent_id.clone()))
            }
        }
    }

    /// Queue a frame without waiting; dropped if the queue is full
    pub(crate) fn try_send(&self, frame: TunnelFrame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                debug!(
                    agent_id = %self.agent_id,
                    "Outbound queue full, dropped {} frame",
                    frame.kind()
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) fn touch_heartbeat(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_heartbeat_ms.store(elapsed, Ordering::SeqCst);
    }

    /// Time since the last heartbeat (or since the session started)
    pub fn since_heartbeat(&self) -> Duration {
        let last = Duration::from_millis(self.last_heartbeat_ms.load(Ordering::SeqCst));
        self.started.elapsed().saturating_sub(last)
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn insert_exchange(&self, slot: ExchangeSlot) {
        self.exchanges.insert(slot.shared.request_id, slot);
    }

    pub(crate) fn remove_exchange(&self, request_id: RequestId) -> Option<ExchangeSlot> {
        let removed = self.exchanges.remove(&request_id).map(|(_, slot)| slot);
        if removed.is_some() {
            self.exchange_removed.notify_waiters();
        }
        removed
    }

    fn slot(&self, request_id: RequestId) -> Option<ExchangeSlot> {
        self.exchanges.get(&request_id).map(|slot| slot.clone())
    }

    /// Fail one exchange, remove it and tell the agent to stop
    pub(crate) fn abort_exchange(&self, request_id: RequestId, error: ExchangeError) {
        let shared = self.remove_exchange(request_id).map(|slot| slot.shared);
        if let Some(shared) = shared {
            shared.fail(error.clone());
        }
        self.try_send(TunnelFrame::RequestAbort {
            request_id,
            reason: error.to_string(),
        });
    }

    /// Wait until no exchange is in flight or the deadline passes.
    /// Returns true when the session went idle.
    pub(crate) async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.exchange_removed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.exchanges.is_empty() {
                return true;
            }

            tokio::select! {
                _ = notified => {}
                _ = self.cancel.cancelled() => return self.exchanges.is_empty(),
                _ = tokio::time::sleep_until(deadline) => return false,
            }
        }
    }

    /// Route one inbound frame. Never blocks on a consumer.
    pub(crate) fn dispatch(&self, frame: TunnelFrame) {
        match frame {
            TunnelFrame::Heartbeat => {
                self.touch_heartbeat();
                self.try_send(TunnelFrame::Heartbeat);
            }
            TunnelFrame::ResponseHeaders {
                request_id,
                status,
                headers,
            } => self.deliver(request_id, Inbound::Headers { status, headers }),
            TunnelFrame::ResponseBodyChunk { request_id, bytes } => {
                self.deliver(request_id, Inbound::Chunk(bytes))
            }
            TunnelFrame::ResponseEnd { request_id } => self.deliver(request_id, Inbound::End),
            TunnelFrame::ResponseError { request_id, reason } => {
                self.deliver(request_id, Inbound::Error(reason))
            }
            TunnelFrame::WindowUpdate {
                request_id,
                credits,
            } => match self.slot(request_id) {
                Some(slot) => slot.shared.request_credits.add_permits(credits as usize),
                None => debug!(request_id, "WINDOW_UPDATE for unknown exchange ignored"),
            },
            other => warn!(
                agent_id = %self.agent_id,
                "Unexpected {} frame from agent ignored",
                other.kind()
            ),
        }
    }

    fn deliver(&self, request_id: RequestId, event: Inbound) {
        let Some(slot) = self.slot(request_id) else {
            debug!(request_id, "Late frame for unknown exchange ignored");
            return;
        };

        if matches!(event, Inbound::Chunk(_))
            && slot.shared.response_credits.fetch_sub(1, Ordering::SeqCst) <= 0
        {
            self.violation(request_id, "response window exceeded");
            return;
        }

        let terminal = matches!(event, Inbound::End | Inbound::Error(_));
        match slot.events.try_send(event) {
            Ok(()) => {
                if terminal {
                    slot.shared.finish();
                    self.remove_exchange(request_id);
                }
            }
            Err(TrySendError::Full(_)) => self.violation(request_id, "response buffer overflow"),
            Err(TrySendError::Closed(_)) => {
                self.remove_exchange(request_id);
            }
        }
    }

    fn violation(&self, request_id: RequestId, reason: &str) {
        warn!(
            agent_id = %self.agent_id,
            request_id,
            "Protocol violation on exchange: {}",
            reason
        );
        self.abort_exchange(
            request_id,
            ExchangeError::ProtocolViolation(reason.to_string()),
        );
    }
}

/// Caller-facing handle to a registered session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session: Arc<TunnelSession>,
}

impl SessionHandle {
    pub(crate) fn new(session: Arc<TunnelSession>) -> Self {
        Self { session }
    }

    pub fn agent_id(&self) -> &str {
        self.session.agent_id()
    }

    pub fn session_id(&self) -> u64 {
        self.session.session_id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn in_flight(&self) -> usize {
        self.session.in_flight()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.session.close_reason()
    }

    /// Close immediately, failing in-flight exchanges
    pub fn close(&self) -> bool {
        self.session.close(CloseReason::Requested)
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        self.session.closed().await
    }
}
