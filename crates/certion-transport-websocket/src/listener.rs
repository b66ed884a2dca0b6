//! WebSocket listener and connector

use async_trait::async_trait;
use certion_transport::{
    tls, FrameTransport, TransportError, TransportListener, TransportResult,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info, warn};

use crate::config::WebSocketConfig;
use crate::connection::WebSocketTransport;

/// Accepts agent tunnel connections over `ws://` or `wss://`
pub struct WebSocketListener {
    tcp_listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    config: Arc<WebSocketConfig>,
}

impl std::fmt::Debug for WebSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketListener")
            .field("local_addr", &self.tcp_listener.local_addr())
            .field("tls", &self.tls_acceptor.is_some())
            .finish()
    }
}

impl WebSocketListener {
    pub async fn bind(bind_addr: SocketAddr, config: WebSocketConfig) -> TransportResult<Self> {
        let tls_acceptor = match (&config.server_cert_path, &config.server_key_path) {
            (Some(cert), Some(key)) => Some(tls::acceptor_from_pem(cert, key)?),
            (None, None) => None,
            _ => {
                return Err(TransportError::TlsError(
                    "Both certificate and key paths are required".to_string(),
                ))
            }
        };

        let tcp_listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            let port = bind_addr.port();
            let address = bind_addr.ip().to_string();
            TransportError::BindError {
                address,
                port,
                reason: e.to_string(),
            }
        })?;

        let local_addr = tcp_listener.local_addr()?;
        let scheme = if tls_acceptor.is_some() { "wss" } else { "ws" };
        info!(
            "WebSocket tunnel listener bound to {}://{}{}",
            scheme, local_addr, config.path
        );

        Ok(Self {
            tcp_listener,
            tls_acceptor,
            config: Arc::new(config),
        })
    }

    async fn upgrade<S>(
        &self,
        stream: S,
        remote_addr: SocketAddr,
    ) -> TransportResult<Box<dyn FrameTransport>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let config = self.config.clone();
        let callback = move |req: &Request, response: Response| {
            if config.matches_path(req.uri().path()) {
                Ok(response)
            } else {
                let mut error = ErrorResponse::new(None);
                *error.status_mut() = StatusCode::NOT_FOUND;
                Err(error)
            }
        };

        let handshake = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            callback,
            Some(self.config.protocol_config()),
        );
        let ws = tokio::time::timeout(self.config.handshake_timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                TransportError::ConnectionError(format!("WebSocket handshake failed: {}", e))
            })?;

        Ok(Box::new(WebSocketTransport::new(ws, Some(remote_addr))))
    }
}

#[async_trait]
impl TransportListener for WebSocketListener {
    async fn accept(&self) -> TransportResult<(Box<dyn FrameTransport>, SocketAddr)> {
        loop {
            let (tcp_stream, remote_addr) = self.tcp_listener.accept().await?;
            debug!("Incoming tunnel TCP connection from {}", remote_addr);

            let upgraded = match &self.tls_acceptor {
                Some(acceptor) => {
                    let tls_stream = match tokio::time::timeout(
                        self.config.handshake_timeout,
                        acceptor.accept(tcp_stream),
                    )
                    .await
                    {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            warn!("TLS handshake failed from {}: {}", remote_addr, e);
                            continue;
                        }
                        Err(_) => {
                            warn!("TLS handshake timed out from {}", remote_addr);
                            continue;
                        }
                    };
                    self.upgrade(tls_stream, remote_addr).await
                }
                None => self.upgrade(tcp_stream, remote_addr).await,
            };

            match upgraded {
                Ok(transport) => {
                    info!("WebSocket tunnel connection established from {}", remote_addr);
                    return Ok((transport, remote_addr));
                }
                Err(e) => {
                    warn!("WebSocket upgrade failed from {}: {}", remote_addr, e);
                    continue;
                }
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.tcp_listener.local_addr()?)
    }
}

/// Connect to a relay tunnel endpoint (`ws://host:port/tunnel` or `wss://...`)
pub async fn connect(
    url: &str,
    config: &WebSocketConfig,
) -> TransportResult<WebSocketTransport<MaybeTlsStream<TcpStream>>> {
    debug!("Connecting to tunnel endpoint {}", url);

    let (ws, _response) =
        tokio_tungstenite::connect_async_with_config(url, Some(config.protocol_config()), false)
            .await
            .map_err(|e| {
                TransportError::ConnectionError(format!("WebSocket connect to {} failed: {}", url, e))
            })?;

    let remote_addr = match ws.get_ref() {
        MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
        _ => None,
    };

    info!("WebSocket tunnel connection established to {}", url);
    Ok(WebSocketTransport::new(ws, remote_addr))
}
