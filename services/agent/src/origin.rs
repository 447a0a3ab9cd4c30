//! Clients toward the local origin.
//!
//! HTTP/1 requests each open a fresh connection (driven `with_upgrades` so
//! tunneled WebSockets can complete).  HTTP/2 requests share one managed
//! connection: TLS with ALPN `h2` is preferred, cleartext prior-knowledge
//! is the fallback, and reconnects are rate-limited with bounded backoff.
//! While no connection is live, callers get [`OriginError::NotConnected`]
//! immediately rather than a hang.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::Request;
use hyper::Response;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::config::AgentConfig;

/// The one request-body shape handed to either origin client.
pub type OriginBody = UnsyncBoxBody<Bytes, std::io::Error>;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    /// Display text is part of the tunnel contract: the edge surfaces it
    /// verbatim as a 502.
    #[error("Local client not connected")]
    NotConnected,
    #[error("origin TLS failed: {0}")]
    Tls(String),
    #[error("origin handshake failed: {0}")]
    Handshake(#[source] hyper::Error),
    #[error("origin request failed: {0}")]
    Request(#[source] hyper::Error),
    #[error("origin upgrade failed: {0}")]
    Upgrade(#[source] hyper::Error),
    #[error("invalid origin request: {0}")]
    Http(#[from] hyper::http::Error),
}

/// A usable HTTP/2 session plus the scheme its pseudo-headers must carry.
#[derive(Clone)]
pub struct H2Handle {
    pub send: hyper::client::conn::http2::SendRequest<OriginBody>,
    pub scheme: &'static str,
}

struct H2Slot {
    handle: Option<H2Handle>,
    next_attempt: Option<Instant>,
    backoff: Duration,
}

pub struct OriginClient {
    config: Arc<AgentConfig>,
    h2: Arc<Mutex<H2Slot>>,
}

impl OriginClient {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        OriginClient {
            config,
            h2: Arc::new(Mutex::new(H2Slot {
                handle: None,
                next_attempt: None,
                backoff: RECONNECT_BASE,
            })),
        }
    }

    /// `host:port` of the local origin, the `:authority` fallback when a
    /// tunneled request carried no Host header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.config.local_host, self.config.local_port)
    }

    // -----------------------------------------------------------------------
    // HTTP/1
    // -----------------------------------------------------------------------

    /// Open a connection and send one HTTP/1 request.  The connection task
    /// is driven with upgrade support and ends with the exchange.
    pub async fn h1_request(&self, req: Request<OriginBody>) -> Result<Response<Incoming>, OriginError> {
        let stream = TcpStream::connect((self.config.local_host.as_str(), self.config.local_port))
            .await
            .map_err(|_| OriginError::NotConnected)?;
        let (mut send, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(OriginError::Handshake)?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "origin http1 connection ended with error");
            }
        });
        send.send_request(req).await.map_err(OriginError::Request)
    }

    // -----------------------------------------------------------------------
    // HTTP/2
    // -----------------------------------------------------------------------

    /// Get the shared HTTP/2 session, connecting if permitted.  Inside the
    /// backoff window this fails fast with `NotConnected`.
    pub async fn h2_handle(&self) -> Result<H2Handle, OriginError> {
        let mut slot = self.h2.lock().await;
        if let Some(handle) = &slot.handle {
            return Ok(handle.clone());
        }
        if let Some(next) = slot.next_attempt {
            if Instant::now() < next {
                return Err(OriginError::NotConnected);
            }
        }
        match self.connect_h2().await {
            Ok(handle) => {
                info!(scheme = handle.scheme, "origin http2 connection established");
                slot.handle = Some(handle.clone());
                slot.next_attempt = None;
                slot.backoff = RECONNECT_BASE;
                Ok(handle)
            }
            Err(e) => {
                debug!(error = %e, "origin http2 connect failed");
                slot.next_attempt = Some(Instant::now() + slot.backoff);
                slot.backoff = (slot.backoff * 2).min(RECONNECT_CAP);
                Err(OriginError::NotConnected)
            }
        }
    }

    async fn connect_h2(&self) -> Result<H2Handle, OriginError> {
        match self.tls_connect().await {
            Ok(stream) => self.h2_handshake(stream, "https").await,
            Err(e) => {
                debug!(error = %e, "TLS toward origin unavailable, trying cleartext http2");
                let tcp = TcpStream::connect((self.config.local_host.as_str(), self.config.local_port))
                    .await
                    .map_err(|_| OriginError::NotConnected)?;
                self.h2_handshake(tcp, "http").await
            }
        }
    }

    async fn h2_handshake<S>(&self, io: S, scheme: &'static str) -> Result<H2Handle, OriginError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (send, conn) = hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(io))
            .await
            .map_err(OriginError::Handshake)?;

        // The driver owns the socket; when it ends the slot empties so the
        // next request reconnects.
        let slot = self.h2.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "origin http2 connection ended with error");
            }
            slot.lock().await.handle = None;
        });

        Ok(H2Handle { send, scheme })
    }

    async fn tls_connect(&self) -> Result<tokio_rustls::client::TlsStream<TcpStream>, OriginError> {
        let tcp = TcpStream::connect((self.config.local_host.as_str(), self.config.local_port))
            .await
            .map_err(|_| OriginError::NotConnected)?;

        let tls_config = client_tls_config(self.config.insecure);
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = rustls::pki_types::ServerName::try_from(self.config.local_host.clone())
            .map_err(|e| OriginError::Tls(e.to_string()))?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| OriginError::Tls(e.to_string()))
    }
}

fn client_tls_config(insecure: bool) -> rustls::ClientConfig {
    // Pin the ring provider: the process may have more than one crypto
    // provider compiled in, and the plain builder() refuses to choose.
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("ring provider supports the default protocol versions");

    let mut config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoVerification))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    config.alpn_protocols = vec![b"h2".to_vec()];
    config
}

mod danger {
    use rustls::DigitallySignedStruct;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    /// `INSECURE=true`: accept whatever certificate the local origin shows.
    #[derive(Debug)]
    pub struct NoVerification;

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
