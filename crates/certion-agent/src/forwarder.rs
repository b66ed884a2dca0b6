//! Executes proxied requests against the local service
//!
//! One HTTP/1.1 connection per exchange. The request body is streamed to
//! the local service as chunks arrive from the relay; the response is
//! streamed back in chunks of at most [`CHUNK_SIZE`] bytes, one credit per
//! chunk.

use bytes::Bytes;
use certion_proto::{HeaderList, RequestId, TunnelFrame, CHUNK_SIZE, INITIAL_WINDOW};
use http::header::{HeaderName, HeaderValue, HOST};
use http::{Method, Request, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::Frame;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type LocalBody = UnsyncBoxBody<Bytes, Infallible>;

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("Failed to connect to local service at {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Local service error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Relay connection closed")]
    RelayClosed,
}

/// One exchange handed to the forwarder by the session loop
#[derive(Debug)]
pub(crate) struct ForwardJob {
    pub request_id: RequestId,
    pub method: String,
    pub path: String,
    pub headers: HeaderList,
    /// Request body chunks; closed on REQUEST_END
    pub body: mpsc::Receiver<Vec<u8>>,
    /// Response chunks the relay is willing to accept
    pub credits: Arc<Semaphore>,
    pub outbound: mpsc::Sender<TunnelFrame>,
    pub cancel: CancellationToken,
}

/// HTTP client for the local service
#[derive(Debug, Clone)]
pub struct LocalForwarder {
    address: String,
}

impl LocalForwarder {
    /// `address` is the local service's `host:port`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Run one exchange to completion. Local failures are reported to the
    /// relay as RESPONSE_ERROR; cancellation stops silently.
    pub(crate) async fn run(&self, job: ForwardJob) {
        let request_id = job.request_id;
        let outbound = job.outbound.clone();
        let cancel = job.cancel.clone();

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(request_id, "Exchange cancelled by relay");
                return;
            }
            result = self.exchange(job) => result,
        };

        match result {
            Ok(()) => trace!(request_id, "Exchange complete"),
            Err(ForwarderError::RelayClosed) => {
                debug!(request_id, "Relay went away during exchange")
            }
            Err(e) => {
                warn!(request_id, "Forwarding to local service failed: {}", e);
                let _ = outbound
                    .send(TunnelFrame::ResponseError {
                        request_id,
                        reason: e.to_string(),
                    })
                    .await;
            }
        }
    }

    async fn exchange(&self, job: ForwardJob) -> Result<(), ForwarderError> {
        let ForwardJob {
            request_id,
            method,
            path,
            headers,
            mut body,
            credits,
            outbound,
            ..
        } = job;

        // An exchange without body must not be sent chunked
        let request_body = match body.recv().await {
            None => Empty::new().map_err(|never| match never {}).boxed_unsync(),
            Some(first) => streaming_body(request_id, first, body, outbound.clone()),
        };
        let request = self.build_request(&method, &path, headers, request_body)?;

        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            ForwarderError::ConnectionFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            }
        })?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Local connection closed: {}", e);
            }
        });

        debug!(request_id, method = %method, path = %path, "Forwarding to local service");
        let response = sender.send_request(request).await?;
        let (parts, mut response_body) = response.into_parts();

        let headers: HeaderList = parts
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();
        send(
            &outbound,
            TunnelFrame::ResponseHeaders {
                request_id,
                status: parts.status.as_u16(),
                headers,
            },
        )
        .await?;

        while let Some(frame) = response_body.frame().await {
            let Ok(data) = frame?.into_data() else {
                continue;
            };
            for piece in data.chunks(CHUNK_SIZE) {
                let permit = credits
                    .acquire()
                    .await
                    .map_err(|_| ForwarderError::RelayClosed)?;
                permit.forget();
                send(
                    &outbound,
                    TunnelFrame::ResponseBodyChunk {
                        request_id,
                        bytes: piece.to_vec(),
                    },
                )
                .await?;
            }
        }

        send(&outbound, TunnelFrame::ResponseEnd { request_id }).await
    }

    fn build_request(
        &self,
        method: &str,
        path: &str,
        headers: HeaderList,
        body: LocalBody,
    ) -> Result<Request<LocalBody>, ForwarderError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ForwarderError::InvalidRequest(format!("bad method {:?}", method)))?;
        let uri: Uri = path
            .parse()
            .map_err(|_| ForwarderError::InvalidRequest(format!("bad path {:?}", path)))?;

        let mut request = Request::new(body);
        *request.method_mut() = method;
        *request.uri_mut() = uri;

        let map = request.headers_mut();
        for (name, value) in headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => debug!("Skipping invalid request header {:?}", name),
            }
        }
        if !map.contains_key(HOST) {
            let host = HeaderValue::from_str(&self.address)
                .map_err(|_| ForwarderError::InvalidRequest("bad local address".to_string()))?;
            map.insert(HOST, host);
        }
        Ok(request)
    }
}

async fn send(outbound: &mpsc::Sender<TunnelFrame>, frame: TunnelFrame) -> Result<(), ForwarderError> {
    outbound
        .send(frame)
        .await
        .map_err(|_| ForwarderError::RelayClosed)
}

/// Request body fed by the session loop; every pulled chunk is a credit
/// returned to the relay, granted in batches of half a window
fn streaming_body(
    request_id: RequestId,
    first: Vec<u8>,
    rest: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<TunnelFrame>,
) -> LocalBody {
    let state = (Some(first), rest, outbound, 0u32);
    let chunks = futures::stream::unfold(state, move |(first, mut rest, outbound, unacked)| async move {
        let chunk = match first {
            Some(chunk) => chunk,
            None => rest.recv().await?,
        };
        let mut unacked = unacked + 1;
        if unacked >= INITIAL_WINDOW / 2 {
            let _ = outbound
                .send(TunnelFrame::WindowUpdate {
                    request_id,
                    credits: unacked,
                })
                .await;
            unacked = 0;
        }
        Some((
            Ok::<_, Infallible>(Frame::data(Bytes::from(chunk))),
            (None, rest, outbound, unacked),
        ))
    });
    StreamBody::new(chunks).boxed_unsync()
}
