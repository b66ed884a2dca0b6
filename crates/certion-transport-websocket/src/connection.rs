//! Tunnel transport over an established WebSocket

use async_trait::async_trait;
use certion_proto::{FrameCodec, TunnelFrame};
use certion_transport::{FrameSink, FrameSource, FrameTransport, TransportError, TransportResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

/// One tunnel session carried by a WebSocket
pub struct WebSocketTransport<S> {
    ws: WebSocketStream<S>,
    remote_addr: Option<SocketAddr>,
    connection_id: String,
}

impl<S> std::fmt::Debug for WebSocketTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(ws: WebSocketStream<S>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            ws,
            remote_addr,
            connection_id: format!("ws-{}", uuid::Uuid::new_v4()),
        }
    }
}

impl<S> FrameTransport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        let this = *self;
        let (sink, source) = this.ws.split();
        (
            Box::new(WebSocketSink {
                sink,
                connection_id: this.connection_id.clone(),
            }),
            Box::new(WebSocketSource {
                source,
                connection_id: this.connection_id,
            }),
        )
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}

fn map_ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        tungstenite::Error::Io(e) => TransportError::IoError(e),
        other => TransportError::ConnectionError(other.to_string()),
    }
}

struct WebSocketSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    connection_id: String,
}

impl<S> std::fmt::Debug for WebSocketSink<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSink")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send_frame(&mut self, frame: TunnelFrame) -> TransportResult<()> {
        trace!("[{}] -> {}", self.connection_id, frame.kind());
        let payload = FrameCodec::encode_payload(&frame)?;
        self.sink
            .send(Message::Binary(payload))
            .await
            .map_err(map_ws_error)
    }

    async fn close(&mut self) -> TransportResult<()> {
        match self.sink.close().await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(map_ws_error(e)),
        }
    }
}

struct WebSocketSource<S> {
    source: SplitStream<WebSocketStream<S>>,
    connection_id: String,
}

impl<S> std::fmt::Debug for WebSocketSource<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSource")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[async_trait]
impl<S> FrameSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn recv_frame(&mut self) -> TransportResult<Option<TunnelFrame>> {
        while let Some(result) = self.source.next().await {
            match result {
                Ok(Message::Binary(data)) => {
                    let frame = FrameCodec::decode_payload(&data)?;
                    trace!("[{}] <- {}", self.connection_id, frame.kind());
                    return Ok(Some(frame));
                }
                Ok(Message::Text(_)) => {
                    return Err(TransportError::MalformedFrame(
                        "unexpected text message".to_string(),
                    ));
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                    // Pong is automatically handled by tungstenite
                    continue;
                }
                Ok(Message::Close(frame)) => {
                    debug!("[{}] WebSocket closed by peer: {:?}", self.connection_id, frame);
                    return Ok(None);
                }
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return Ok(None);
                }
                Err(e) => return Err(map_ws_error(e)),
            }
        }
        Ok(None)
    }
}
