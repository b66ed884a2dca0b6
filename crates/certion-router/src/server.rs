//! Public HTTP(S) listener in front of the [`EdgeRouter`]
use crate::edge::EdgeRouter;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EdgeServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct EdgeServerConfig {
    pub bind_addr: SocketAddr,
    /// `(cert.pem, key.pem)`; plain HTTP when absent
    pub tls: Option<(PathBuf, PathBuf)>,
}

impl EdgeServerConfig {
    pub fn http(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            tls: None,
        }
    }

    pub fn https(bind_addr: SocketAddr, cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            bind_addr,
            tls: Some((cert_path, key_path)),
        }
    }
}

/// A bound edge listener
pub struct EdgeServer {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    router: EdgeRouter,
}

impl EdgeServer {
    pub async fn bind(config: EdgeServerConfig, router: EdgeRouter) -> Result<Self, EdgeServerError> {
        let acceptor = match &config.tls {
            Some((cert_path, key_path)) => Some(
                certion_transport::tls::acceptor_from_pem(cert_path, key_path)
                    .map_err(|e| EdgeServerError::TlsError(e.to_string()))?,
            ),
            None => None,
        };

        let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
            EdgeServerError::BindError {
                address: config.bind_addr.ip().to_string(),
                port: config.bind_addr.port(),
                reason: e.to_string(),
            }
        })?;

        info!(
            "{} edge listening on {}",
            if acceptor.is_some() { "HTTPS" } else { "HTTP" },
            listener.local_addr()?
        );

        Ok(Self {
            listener,
            acceptor,
            router,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, EdgeServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires. In-flight connections
    /// are asked to finish their current request.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), EdgeServerError> {
        let scheme = if self.acceptor.is_some() { "https" } else { "http" };

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Edge listener on {} stopped", self.listener.local_addr()?);
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept edge connection: {}", e);
                        continue;
                    }
                },
            };
            debug!("Edge connection from {}", peer);

            let router = self.router.clone();
            let acceptor = self.acceptor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls) => serve_connection(tls, peer, scheme, router, shutdown).await,
                        Err(e) => debug!("TLS handshake with {} failed: {}", peer, e),
                    },
                    None => serve_connection(stream, peer, scheme, router, shutdown).await,
                }
            });
        }
    }
}

async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    scheme: &'static str,
    router: EdgeRouter,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let router = router.clone();
        async move { Ok::<_, Infallible>(router.handle(req, peer, scheme).await) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        debug!("Edge connection from {} ended with error: {}", peer, e);
    }
}
