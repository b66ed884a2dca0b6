//! Length-prefixed frames over any byte stream

use async_trait::async_trait;
use certion_proto::{FrameCodec, TunnelFrame};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::trace;

use crate::{FrameSink, FrameSource, FrameTransport, TransportError, TransportResult};

/// Tunnel transport over a TCP, TLS or in-memory byte stream
pub struct StreamTransport<T> {
    framed: Framed<T, FrameCodec>,
    remote_addr: Option<SocketAddr>,
    connection_id: String,
}

impl<T> std::fmt::Debug for StreamTransport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl<T> StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(io: T, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec),
            remote_addr,
            connection_id: format!("stream-{}", uuid::Uuid::new_v4()),
        }
    }
}

impl<T> FrameTransport for StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn split(self: Box<Self>) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        let this = *self;
        let (sink, stream) = this.framed.split();
        (
            Box::new(StreamSink {
                sink,
                connection_id: this.connection_id.clone(),
            }),
            Box::new(StreamSource {
                stream,
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

struct StreamSink<T> {
    sink: SplitSink<Framed<T, FrameCodec>, TunnelFrame>,
    connection_id: String,
}

impl<T> std::fmt::Debug for StreamSink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSink")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[async_trait]
impl<T> FrameSink for StreamSink<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send_frame(&mut self, frame: TunnelFrame) -> TransportResult<()> {
        trace!("[{}] -> {}", self.connection_id, frame.kind());
        self.sink.send(frame).await.map_err(TransportError::from)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.sink.close().await.map_err(TransportError::from)
    }
}

struct StreamSource<T> {
    stream: SplitStream<Framed<T, FrameCodec>>,
    connection_id: String,
}

impl<T> std::fmt::Debug for StreamSource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSource")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[async_trait]
impl<T> FrameSource for StreamSource<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn recv_frame(&mut self) -> TransportResult<Option<TunnelFrame>> {
        match self.stream.next().await {
            None => Ok(None),
            Some(Ok(Ok(frame))) => {
                trace!("[{}] <- {}", self.connection_id, frame.kind());
                Ok(Some(frame))
            }
            Some(Ok(Err(e))) => Err(TransportError::from(e)),
            Some(Err(e)) => Err(TransportError::from(e)),
        }
    }
}
