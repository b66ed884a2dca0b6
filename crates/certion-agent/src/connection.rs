//! One tunnel session from the agent's side
//!
//! A reader task feeds relay frames into the session loop, a writer task
//! drains the outbound queue, and every exchange runs in its own task.

use crate::agent::AgentError;
use crate::config::AgentConfig;
use crate::forwarder::{ForwardJob, LocalForwarder};
use certion_proto::{RequestId, TunnelFrame, INITIAL_WINDOW, PROTOCOL_VERSION};
use certion_transport::{FrameSink, FrameSource, TransportError, TransportResult};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OUTBOUND_BUFFER: usize = 256;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The relay closed the connection
    RelayClosed,
    /// No heartbeat echo within the allowed window
    HeartbeatTimeout,
    /// Local shutdown was requested
    Shutdown,
}

#[derive(Debug)]
struct ExchangeState {
    body: Option<mpsc::Sender<Vec<u8>>>,
    credits: Arc<Semaphore>,
    cancel: CancellationToken,
}

/// Send HELLO and wait for WELCOME; returns the session id
pub(crate) async fn handshake(
    sink: &mut dyn FrameSink,
    source: &mut dyn FrameSource,
    config: &AgentConfig,
) -> Result<u64, AgentError> {
    sink.send_frame(TunnelFrame::Hello {
        agent_id: config.agent_id.clone(),
        auth_token: config.auth_token.clone(),
        protocol_version: PROTOCOL_VERSION,
    })
    .await?;

    let reply = tokio::time::timeout(config.handshake_timeout, source.recv_frame())
        .await
        .map_err(|_| AgentError::HandshakeTimeout)??;

    match reply {
        Some(TunnelFrame::Welcome {
            agent_id,
            session_id,
        }) => {
            info!(agent_id = %agent_id, session_id, "Registered with relay");
            Ok(session_id)
        }
        Some(TunnelFrame::Rejected { reason }) => Err(AgentError::Rejected(reason)),
        Some(other) => Err(AgentError::Handshake(format!(
            "expected WELCOME, got {}",
            other.kind()
        ))),
        None => Err(AgentError::Transport(TransportError::Closed)),
    }
}

/// Serve exchanges until the relay goes away or `shutdown` fires
pub(crate) async fn run_session(
    mut sink: Box<dyn FrameSink>,
    mut source: Box<dyn FrameSource>,
    forwarder: Arc<LocalForwarder>,
    config: &AgentConfig,
    shutdown: &CancellationToken,
) -> SessionEnd {
    let session_cancel = shutdown.child_token();
    let (outbound, mut outbound_rx) = mpsc::channel::<TunnelFrame>(OUTBOUND_BUFFER);
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<TransportResult<Option<TunnelFrame>>>(16);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send_frame(frame).await {
                debug!("Tunnel write failed: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });
    let reader = tokio::spawn(async move {
        loop {
            let result = source.recv_frame().await;
            let keep_reading = match &result {
                Ok(Some(_)) => true,
                Ok(None) => false,
                Err(e) => !e.is_fatal(),
            };
            if inbound_tx.send(result).await.is_err() || !keep_reading {
                break;
            }
        }
    });

    let exchanges: Arc<DashMap<RequestId, ExchangeState>> = Arc::new(DashMap::new());
    let interval = config.heartbeat_interval;
    let dead_after = interval * config.missed_heartbeats.max(1);
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_echo = Instant::now();

    let end = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break SessionEnd::Shutdown,
            _ = ticker.tick() => {
                if last_echo.elapsed() >= dead_after {
                    warn!(
                        agent_id = %config.agent_id,
                        "No heartbeat from relay for {:?}, reconnecting",
                        last_echo.elapsed()
                    );
                    break SessionEnd::HeartbeatTimeout;
                }
                if outbound.send(TunnelFrame::Heartbeat).await.is_err() {
                    break SessionEnd::RelayClosed;
                }
            }
            inbound = inbound_rx.recv() => match inbound {
                Some(Ok(Some(TunnelFrame::Heartbeat))) => last_echo = Instant::now(),
                Some(Ok(Some(frame))) => dispatch(
                    frame,
                    &exchanges,
                    &forwarder,
                    &outbound,
                    &session_cancel,
                ),
                Some(Err(e)) if !e.is_fatal() => warn!("Skipping undecodable frame: {}", e),
                Some(Err(e)) => {
                    warn!("Tunnel read failed: {}", e);
                    break SessionEnd::RelayClosed;
                }
                Some(Ok(None)) | None => break SessionEnd::RelayClosed,
            },
        }
    };

    session_cancel.cancel();
    exchanges.clear();
    reader.abort();
    writer.abort();
    info!(agent_id = %config.agent_id, "Tunnel session ended: {:?}", end);
    end
}

fn dispatch(
    frame: TunnelFrame,
    exchanges: &Arc<DashMap<RequestId, ExchangeState>>,
    forwarder: &Arc<LocalForwarder>,
    outbound: &mpsc::Sender<TunnelFrame>,
    session_cancel: &CancellationToken,
) {
    match frame {
        TunnelFrame::RequestStart {
            request_id,
            method,
            path,
            headers,
        } => {
            let (body_tx, body_rx) = mpsc::channel(INITIAL_WINDOW as usize);
            let credits = Arc::new(Semaphore::new(INITIAL_WINDOW as usize));
            let cancel = session_cancel.child_token();
            exchanges.insert(
                request_id,
                ExchangeState {
                    body: Some(body_tx),
                    credits: credits.clone(),
                    cancel: cancel.clone(),
                },
            );

            let job = ForwardJob {
                request_id,
                method,
                path,
                headers,
                body: body_rx,
                credits,
                outbound: outbound.clone(),
                cancel,
            };
            let forwarder = forwarder.clone();
            let exchanges = exchanges.clone();
            tokio::spawn(async move {
                forwarder.run(job).await;
                exchanges.remove(&request_id);
            });
        }
        TunnelFrame::RequestBodyChunk { request_id, bytes } => {
            let Some(state) = exchanges.get(&request_id) else {
                debug!(request_id, "Body chunk for unknown exchange ignored");
                return;
            };
            let Some(body) = &state.body else {
                warn!(request_id, "Body chunk after REQUEST_END ignored");
                return;
            };
            if let Err(mpsc::error::TrySendError::Full(_)) = body.try_send(bytes) {
                warn!(request_id, "Relay exceeded the request window, cancelling exchange");
                state.cancel.cancel();
                let _ = outbound.try_send(TunnelFrame::ResponseError {
                    request_id,
                    reason: "request window exceeded".to_string(),
                });
            }
        }
        TunnelFrame::RequestEnd { request_id } => {
            if let Some(mut state) = exchanges.get_mut(&request_id) {
                state.body = None;
            }
        }
        TunnelFrame::RequestAbort { request_id, reason } => {
            if let Some((_, state)) = exchanges.remove(&request_id) {
                debug!(request_id, "Relay aborted exchange: {}", reason);
                state.cancel.cancel();
            }
        }
        TunnelFrame::WindowUpdate {
            request_id,
            credits,
        } => {
            if let Some(state) = exchanges.get(&request_id) {
                state.credits.add_permits(credits as usize);
            }
        }
        TunnelFrame::GoAway { reason } => {
            info!("Relay is draining this session: {}", reason);
        }
        other => warn!("Unexpected {} frame from relay ignored", other.kind()),
    }
}
