//! Shared constants and helpers: read buffer sizing, the 0-RTT first
//! payload read, and DNS resolution for the dialers.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Buffer size for copy loops and the first-payload read.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// How long to wait for an early client payload before negotiating.
///
/// The payload may never come (server-speaks-first protocols such as
/// MySQL behind the proxy), so expiry is not an error.
pub const FIRST_PAYLOAD_TIMEOUT: Duration = Duration::from_millis(100);

/// Attempts exactly one read from the local stream within
/// [`FIRST_PAYLOAD_TIMEOUT`].
///
/// Returns the captured bytes, or an empty buffer when nothing arrived
/// in time. Read errors and EOF also yield an empty buffer; they will
/// resurface in the session pump.
pub async fn read_first_payload(reader: &mut (impl AsyncRead + Unpin)) -> Bytes {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    match tokio::time::timeout(FIRST_PAYLOAD_TIMEOUT, reader.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            Bytes::from(buf)
        }
        _ => Bytes::new(),
    }
}

/// Shared DNS resolver wrapper for reuse across multiple resolutions.
pub struct DnsResolver {
    resolver: Arc<
        Mutex<
            Option<
                hickory_resolver::Resolver<hickory_resolver::name_server::TokioConnectionProvider>,
            >,
        >,
    >,
}

impl DnsResolver {
    /// Creates a new DNS resolver.
    pub fn new() -> Self {
        Self {
            resolver: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolves a hostname to a SocketAddr asynchronously.
    ///
    /// The resolver is lazily initialized and reused for subsequent
    /// resolutions. IP literals short-circuit without a lookup.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let mut resolver_guard = self.resolver.lock().await;
        if resolver_guard.is_none() {
            let resolver = hickory_resolver::Resolver::builder_tokio()
                .map_err(|e| Error::Config(format!("failed to create DNS resolver: {}", e)))?
                .build();
            *resolver_guard = Some(resolver);
        }

        let resolver = resolver_guard.as_ref().unwrap();

        let response = resolver
            .lookup_ip(host)
            .await
            .map_err(|e| Error::Dial(format!("failed to resolve '{}': {}", host, e)))?;

        response
            .iter()
            .next()
            .map(|ip| SocketAddr::new(ip, port))
            .ok_or_else(|| Error::Dial(format!("no addresses found for '{}'", host)))
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}
