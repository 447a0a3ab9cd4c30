//! Public accept loop: plain TCP or TLS (ALPN `h2` + `http/1.1`), each
//! connection served as auto-negotiated HTTP/1 or HTTP/2 with upgrade
//! support, routed into the axum app.  A `ClientMeta` extension rides on
//! every request so the dispatcher can build `X-Forwarded-*`.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::channel::CHANNEL_LOST;
use crate::config::TlsPaths;

/// Bound on waiting for inflight requests at shutdown (`T_drain`).
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Facts about the public connection a request arrived on.
#[derive(Clone, Copy, Debug)]
pub struct ClientMeta {
    pub remote_addr: SocketAddr,
    pub tls: bool,
}

impl Default for ClientMeta {
    fn default() -> Self {
        ClientMeta { remote_addr: SocketAddr::from(([0, 0, 0, 0], 0)), tls: false }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("reading TLS material: {0}")]
    Io(#[from] std::io::Error),
    #[error("no private key found in key file")]
    NoPrivateKey,
    #[error("TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Build the TLS acceptor from PEM files, advertising `h2` and `http/1.1`.
pub fn tls_acceptor(paths: &TlsPaths) -> Result<TlsAcceptor, ServeError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(&paths.cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&paths.key_path)?))?
        .ok_or(ServeError::NoPrivateKey)?;

    // Pin the ring provider: the process may have more than one crypto
    // provider compiled in, and the plain builder() refuses to choose.
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Resolves on SIGINT or SIGTERM.  Passed to [`serve`] as its `shutdown`
/// future by the edge binary; tests pass `std::future::pending()` instead.
pub async fn interrupt() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received Ctrl+C, shutting down"),
            _ = term.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C, shutting down");
    }
}

/// Accept until `shutdown` resolves, then drain live agent channels.
pub async fn serve(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    state: AppState,
    shutdown: impl Future<Output = ()>,
) {
    let router = crate::build_router(state.clone());
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        let router = router.clone();
                        let tls = tls.clone();
                        tokio::spawn(serve_connection(stream, remote_addr, tls, router));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            () = &mut shutdown => break,
        }
    }

    drain(&state).await;
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    router: Router,
) {
    let meta = ClientMeta { remote_addr, tls: tls.is_some() };
    let service = hyper::service::service_fn(move |mut req: hyper::Request<hyper::body::Incoming>| {
        req.extensions_mut().insert(meta);
        router.clone().oneshot(req)
    });

    let result = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                auto::Builder::new(TokioExecutor::new())
                    .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                    .await
            }
            Err(e) => {
                debug!(%remote_addr, error = %e, "TLS handshake failed");
                return;
            }
        },
        None => {
            auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
        }
    };
    if let Err(e) = result {
        debug!(%remote_addr, error = %e, "connection ended with error");
    }
}

/// Graceful shutdown: channels stop receiving new requests the moment the
/// registry is drained, then inflight work gets up to `DRAIN_TIMEOUT`
/// before being failed synthetically.
async fn drain(state: &AppState) {
    let channels = state.registry.drain_all().await;
    if channels.is_empty() {
        return;
    }
    info!(count = channels.len(), "draining agent channels");

    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    for channel in &channels {
        while channel.inflight().len().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    for channel in channels {
        channel.inflight().fail_all(CHANNEL_LOST).await;
    }
}
