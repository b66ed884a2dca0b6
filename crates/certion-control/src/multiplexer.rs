//! Request multiplexer
//!
//! Forwards one HTTP exchange over an agent's tunnel session. Each exchange
//! gets a session-scoped `request_id`; request and response bodies are
//! streamed in chunks of at most [`CHUNK_SIZE`] under a per-direction
//! credit window of [`INITIAL_WINDOW`] chunks.

use crate::error::{ExchangeError, ForwardError};
use crate::registry::TunnelRegistry;
use crate::session::{ExchangeShared, ExchangeSlot, Inbound, SessionState, TunnelSession};
use bytes::Bytes;
use certion_proto::{HeaderList, RequestId, TunnelFrame, CHUNK_SIZE, INITIAL_WINDOW};
use futures::Stream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Deadlines applied to every exchange
#[derive(Debug, Clone, Copy)]
pub struct ExchangeTimeouts {
    /// Time allowed between forwarding and RESPONSE_HEADERS
    pub response_headers: Duration,
    /// Maximum gap between response frames once headers arrived
    pub idle: Duration,
}

impl Default for ExchangeTimeouts {
    fn default() -> Self {
        Self {
            response_headers: Duration::from_secs(30),
            idle: Duration::from_secs(60),
        }
    }
}

/// Request line and headers of a forwarded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Path including the query string
    pub path: String,
    pub headers: HeaderList,
}

/// Status line and headers returned by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: HeaderList,
}

/// One event of a forwarded response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    Headers(ResponseHead),
    BodyChunk(Bytes),
    End,
}

/// Forwards exchanges to agents through the registry
#[derive(Debug, Clone)]
pub struct Multiplexer {
    registry: TunnelRegistry,
    timeouts: ExchangeTimeouts,
}

impl Multiplexer {
    pub fn new(registry: TunnelRegistry, timeouts: ExchangeTimeouts) -> Self {
        Self { registry, timeouts }
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub fn timeouts(&self) -> ExchangeTimeouts {
        self.timeouts
    }

    /// Forward with the multiplexer's default timeouts
    pub async fn forward(&self, agent_id: &str, head: RequestHead) -> Result<Exchange, ForwardError> {
        self.forward_with(agent_id, head, self.timeouts).await
    }

    /// Start an exchange: sends REQUEST_START and returns the request body
    /// sender and the response event stream
    pub async fn forward_with(
        &self,
        agent_id: &str,
        head: RequestHead,
        timeouts: ExchangeTimeouts,
    ) -> Result<Exchange, ForwardError> {
        let session = self
            .registry
            .session(agent_id)
            .ok_or_else(|| ForwardError::AgentOffline(agent_id.to_string()))?;
        check_accepting(&session)?;

        let request_id = session.next_request_id();
        let (events_tx, events_rx) = mpsc::channel(INITIAL_WINDOW as usize + 4);
        let shared = Arc::new(ExchangeShared::new(request_id, INITIAL_WINDOW));
        session.insert_exchange(ExchangeSlot {
            events: events_tx,
            shared: shared.clone(),
        });

        // the session may have closed between the lookup and the insert
        if let Err(e) = check_accepting(&session) {
            session.remove_exchange(request_id);
            return Err(e);
        }

        debug!(
            agent_id = %agent_id,
            request_id,
            method = %head.method,
            path = %head.path,
            "Forwarding request"
        );

        let start = TunnelFrame::RequestStart {
            request_id,
            method: head.method,
            path: head.path,
            headers: head.headers,
        };
        if session.send(start).await.is_err() {
            session.remove_exchange(request_id);
            return Err(ForwardError::AgentOffline(agent_id.to_string()));
        }

        Ok(Exchange {
            request_id,
            body: RequestBodySender {
                session: session.clone(),
                shared: shared.clone(),
                finished: false,
            },
            response: ResponseEvents {
                session,
                shared,
                events: events_rx,
                timeouts,
                header_deadline: Instant::now() + timeouts.response_headers,
                headers_seen: false,
                unacked: 0,
                terminated: false,
            },
        })
    }
}

fn check_accepting(session: &TunnelSession) -> Result<(), ForwardError> {
    match session.state() {
        SessionState::Active => Ok(()),
        SessionState::Draining => Err(ForwardError::Draining(session.agent_id().to_string())),
        SessionState::Connecting | SessionState::Closed => {
            Err(ForwardError::AgentOffline(session.agent_id().to_string()))
        }
    }
}

/// A forwarded exchange
#[derive(Debug)]
pub struct Exchange {
    pub request_id: RequestId,
    pub body: RequestBodySender,
    pub response: ResponseEvents,
}

impl Exchange {
    pub fn into_parts(self) -> (RequestBodySender, ResponseEvents) {
        (self.body, self.response)
    }
}

/// Streams the request body to the agent.
///
/// Dropping it without calling [`finish`](Self::finish) aborts the
/// exchange.
#[derive(Debug)]
pub struct RequestBodySender {
    session: Arc<TunnelSession>,
    shared: Arc<ExchangeShared>,
    finished: bool,
}

impl RequestBodySender {
    pub fn request_id(&self) -> RequestId {
        self.shared.request_id
    }

    /// Send body bytes, split into chunks and paced by the agent's credits
    pub async fn send(&mut self, data: Bytes) -> Result<(), ExchangeError> {
        for piece in data.chunks(CHUNK_SIZE) {
            if self.shared.is_done() {
                return Err(self.stopped());
            }
            let permit = self
                .shared
                .request_credits
                .acquire()
                .await
                .map_err(|_| self.stopped())?;
            permit.forget();

            trace!(request_id = self.shared.request_id, len = piece.len(), "Request chunk");
            self.session
                .send(TunnelFrame::RequestBodyChunk {
                    request_id: self.shared.request_id,
                    bytes: piece.to_vec(),
                })
                .await
                .map_err(|_| ExchangeError::GatewayUnavailable)?;
        }
        Ok(())
    }

    /// Send REQUEST_END
    pub async fn finish(mut self) -> Result<(), ExchangeError> {
        self.finished = true;
        if self.shared.is_done() {
            return match self.shared.failure() {
                Some(error) => Err(error),
                None => Ok(()),
            };
        }
        self.session
            .send(TunnelFrame::RequestEnd {
                request_id: self.shared.request_id,
            })
            .await
            .map_err(|_| ExchangeError::GatewayUnavailable)
    }

    /// Cancel the exchange (e.g. the client stopped sending its body)
    pub fn abort(mut self) {
        self.finished = true;
        if !self.shared.is_done() {
            self.session
                .abort_exchange(self.shared.request_id, ExchangeError::Cancelled);
        }
    }

    fn stopped(&self) -> ExchangeError {
        self.shared.failure().unwrap_or(ExchangeError::Cancelled)
    }
}

impl Drop for RequestBodySender {
    fn drop(&mut self) {
        if !self.finished && !self.shared.is_done() {
            debug!(
                request_id = self.shared.request_id,
                "Request body dropped before end, aborting exchange"
            );
            self.session
                .abort_exchange(self.shared.request_id, ExchangeError::Cancelled);
        }
    }
}

/// Response side of an exchange.
///
/// Dropping it before the response ended aborts the exchange and sends
/// REQUEST_ABORT to the agent.
#[derive(Debug)]
pub struct ResponseEvents {
    session: Arc<TunnelSession>,
    shared: Arc<ExchangeShared>,
    events: mpsc::Receiver<Inbound>,
    timeouts: ExchangeTimeouts,
    header_deadline: Instant,
    headers_seen: bool,
    unacked: u32,
    terminated: bool,
}

impl ResponseEvents {
    pub fn request_id(&self) -> RequestId {
        self.shared.request_id
    }

    /// Next response event. `None` once `End` or an error was returned.
    pub async fn next_event(&mut self) -> Option<Result<ResponseEvent, ExchangeError>> {
        if self.terminated {
            return None;
        }
        let result = self.poll_inbound().await;
        if matches!(result, Ok(ResponseEvent::End) | Err(_)) {
            self.terminated = true;
        }
        Some(result)
    }

    async fn poll_inbound(&mut self) -> Result<ResponseEvent, ExchangeError> {
        let deadline = if self.headers_seen {
            Instant::now() + self.timeouts.idle
        } else {
            self.header_deadline
        };

        let inbound = match tokio::time::timeout_at(deadline, self.events.recv()).await {
            Ok(Some(inbound)) => inbound,
            Ok(None) => {
                return Err(self
                    .shared
                    .failure()
                    .unwrap_or(ExchangeError::GatewayUnavailable))
            }
            Err(_) => {
                debug!(
                    agent_id = %self.session.agent_id(),
                    request_id = self.shared.request_id,
                    headers_seen = self.headers_seen,
                    "Exchange timed out"
                );
                self.session
                    .abort_exchange(self.shared.request_id, ExchangeError::UpstreamTimeout);
                return Err(ExchangeError::UpstreamTimeout);
            }
        };

        match inbound {
            Inbound::Headers { status, headers } if !self.headers_seen => {
                self.headers_seen = true;
                Ok(ResponseEvent::Headers(ResponseHead { status, headers }))
            }
            Inbound::Chunk(bytes) if self.headers_seen => {
                self.grant_credit().await;
                Ok(ResponseEvent::BodyChunk(Bytes::from(bytes)))
            }
            Inbound::End if self.headers_seen => Ok(ResponseEvent::End),
            Inbound::Error(reason) => Err(ExchangeError::AgentError(reason)),
            Inbound::Headers { .. } => Err(self.violation("duplicate RESPONSE_HEADERS")),
            Inbound::Chunk(_) | Inbound::End => {
                Err(self.violation("response body before RESPONSE_HEADERS"))
            }
        }
    }

    fn violation(&self, reason: &str) -> ExchangeError {
        let error = ExchangeError::ProtocolViolation(reason.to_string());
        if !self.shared.is_done() {
            self.session
                .abort_exchange(self.shared.request_id, error.clone());
        } else {
            self.shared.fail(error.clone());
        }
        error
    }

    async fn grant_credit(&mut self) {
        self.unacked += 1;
        if self.unacked < INITIAL_WINDOW / 2 || self.shared.is_done() {
            return;
        }
        let credits = std::mem::take(&mut self.unacked);
        self.shared
            .response_credits
            .fetch_add(credits as i64, Ordering::SeqCst);
        let _ = self
            .session
            .send(TunnelFrame::WindowUpdate {
                request_id: self.shared.request_id,
                credits,
            })
            .await;
    }

    /// Wait for the response headers
    pub async fn headers(&mut self) -> Result<ResponseHead, ExchangeError> {
        match self.next_event().await {
            Some(Ok(ResponseEvent::Headers(head))) => Ok(head),
            Some(Ok(_)) => Err(ExchangeError::ProtocolViolation(
                "expected RESPONSE_HEADERS".to_string(),
            )),
            Some(Err(e)) => Err(e),
            None => Err(ExchangeError::Cancelled),
        }
    }

    /// Body chunks until `End`; an error item truncates the body
    pub fn into_body_stream(self) -> impl Stream<Item = Result<Bytes, ExchangeError>> + Send {
        futures::stream::unfold(self, |mut events| async move {
            loop {
                match events.next_event().await? {
                    Ok(ResponseEvent::BodyChunk(bytes)) => return Some((Ok(bytes), events)),
                    Ok(ResponseEvent::End) => return None,
                    Ok(ResponseEvent::Headers(_)) => continue,
                    Err(e) => return Some((Err(e), events)),
                }
            }
        })
    }
}

impl Drop for ResponseEvents {
    fn drop(&mut self) {
        if !self.shared.is_done() {
            debug!(
                request_id = self.shared.request_id,
                "Response consumer gone, aborting exchange"
            );
            self.session
                .abort_exchange(self.shared.request_id, ExchangeError::Cancelled);
        }
    }
}
