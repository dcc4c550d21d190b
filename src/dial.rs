//! Transport dialers for upstream proxies.
//!
//! The tunnel negotiator only needs two things from a transport: the
//! byte stream itself and, when TLS is in play, the ALPN protocol the
//! handshake settled on. [`TlsDialer`] completes the handshake during
//! `dial`, so the negotiator can dispatch on [`DialedTransport::alpn`]
//! without driving TLS itself.

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::common::DnsResolver;
use crate::error::{Error, Result};
use crate::upstream::Destination;

/// Object-safe bidirectional byte stream.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TransportStream for T {}

/// A dialed transport plus the ALPN protocol negotiated on it, if any.
pub struct DialedTransport {
    pub stream: Box<dyn TransportStream>,
    /// `None` for plaintext transports and for TLS sessions where the
    /// peer selected no protocol.
    pub alpn: Option<String>,
}

impl std::fmt::Debug for DialedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialedTransport")
            .field("alpn", &self.alpn)
            .finish_non_exhaustive()
    }
}

/// Capability to open a transport to an upstream destination.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, dest: &Destination) -> Result<DialedTransport>;
}

/// Plain TCP dialer with shared DNS resolution.
pub struct TcpDialer {
    resolver: DnsResolver,
}

impl TcpDialer {
    pub fn new() -> Self {
        Self {
            resolver: DnsResolver::new(),
        }
    }

    async fn connect(&self, dest: &Destination) -> Result<TcpStream> {
        let addr = self.resolver.resolve(&dest.host, dest.port).await?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Dial(format!("connect to {}: {}", dest, e)))?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, dest: &Destination) -> Result<DialedTransport> {
        let stream = self.connect(dest).await?;
        Ok(DialedTransport {
            stream: Box::new(stream),
            alpn: None,
        })
    }
}

/// TLS dialer layered over TCP.
pub struct TlsDialer {
    inner: TcpDialer,
    connector: TlsConnector,
    sni_override: Option<String>,
}

impl TlsDialer {
    pub fn new(config: Arc<ClientConfig>, sni_override: Option<String>) -> Self {
        Self {
            inner: TcpDialer::new(),
            connector: TlsConnector::from(config),
            sni_override,
        }
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, dest: &Destination) -> Result<DialedTransport> {
        let tcp = self.inner.connect(dest).await?;

        let sni_host = self.sni_override.as_deref().unwrap_or(&dest.host);
        let server_name = ServerName::try_from(sni_host.to_string())
            .map_err(|e| Error::Tls(format!("invalid SNI hostname '{}': {}", sni_host, e)))?;

        let stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;

        let alpn = stream
            .get_ref()
            .1
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned());

        Ok(DialedTransport {
            stream: Box::new(stream),
            alpn,
        })
    }
}
