//! Outbound client: composes picking, negotiation, and the session pump.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cli::{build_tls_config, Cli};
use crate::common::read_first_payload;
use crate::dial::{Dialer, TcpDialer, TlsDialer};
use crate::error::{Error, Result};
use crate::policy::{Policy, PolicyManager};
use crate::relay::run_relay;
use crate::retry::retry_exponential_backoff;
use crate::tunnel::Negotiator;
use crate::upstream::{
    parse_host_port, parse_upstream_spec, Destination, Network, RoundRobinPicker, ServerList,
};

/// Attempts per outbound request across the upstream pool.
const CONNECT_ATTEMPTS: u32 = 2;

/// Base backoff after the first failed attempt.
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Outbound HTTP tunnel client over a pool of upstream proxies.
pub struct Client {
    picker: RoundRobinPicker,
    policies: PolicyManager,
    negotiator: Negotiator,
}

impl Client {
    /// Creates a client over a non-empty server list.
    pub fn new(servers: ServerList, policies: PolicyManager) -> Self {
        Self {
            picker: RoundRobinPicker::new(servers),
            policies,
            negotiator: Negotiator::new(),
        }
    }

    /// Tunnels one local stream to `target` through an upstream proxy.
    ///
    /// Runs until both directions finish, the policy's idle timer
    /// fires, or `token` is cancelled.
    pub async fn process<R, W>(
        &self,
        target: &Destination,
        mut local_reader: R,
        local_writer: W,
        dialer: &dyn Dialer,
        token: &CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        if target.host.is_empty() {
            return Err(Error::TargetNotSpecified);
        }
        if target.network == Network::Udp {
            return Err(Error::UdpNotSupported);
        }
        let target_addr = target.net_addr();

        // 0-RTT optimization: if the payload comes very soon, it can be
        // coalesced with the CONNECT. The payload may never come (the
        // target protocol may be server-speaks-first, e.g. MySQL), so
        // an empty capture proceeds as-is.
        let first_payload = read_first_payload(&mut local_reader).await;

        let (tunnel, user_level) = retry_exponential_backoff(CONNECT_ATTEMPTS, CONNECT_BACKOFF, || {
            let first_payload = first_payload.clone();
            let target_addr = target_addr.clone();
            async move {
                let server = self.picker.pick_server();
                let user = server.pick_user();
                let level = user.map(|u| u.level);

                let mut tunnel = self
                    .negotiator
                    .negotiate(
                        server.destination(),
                        &target_addr,
                        user,
                        dialer,
                        first_payload.clone(),
                    )
                    .await?;

                // On HTTP/1.1 the first payload goes out here, as the
                // first application bytes after the CONNECT response.
                // HTTP/2 already carried it in the request body.
                if !tunnel.first_payload_sent() {
                    write_first_payload(&mut tunnel, &first_payload).await?;
                }

                Ok((tunnel, level))
            }
        })
        .await
        .map_err(|err| Error::NoAvailableDestination(Box::new(err)))?;

        let policy = self.policies.for_level(user_level.unwrap_or(0));
        run_relay(tunnel, local_reader, local_writer, policy, token).await
    }
}

async fn write_first_payload(
    tunnel: &mut (impl AsyncWrite + Unpin),
    payload: &Bytes,
) -> Result<()> {
    if payload.is_empty() {
        return Ok(());
    }
    // A failed write closes the tunnel (drop) and counts as a failed
    // attempt.
    tunnel.write_all(payload).await?;
    Ok(())
}

/// Builds the client and dialer from CLI arguments and serves the local
/// forwarder until the listener fails.
pub async fn run_client(args: &Cli) -> Result<()> {
    let mut servers = Vec::new();
    for spec in &args.upstreams {
        servers.push(parse_upstream_spec(spec)?);
    }
    let servers = ServerList::new(servers)?;

    let policies = PolicyManager::new(Policy {
        idle_timeout: args.idle_timeout,
        downlink_only_timeout: args.downlink_only_timeout,
        uplink_only_timeout: args.uplink_only_timeout,
    });

    let dialer: Arc<dyn Dialer> = if args.tls {
        let config = build_tls_config(args)?;
        Arc::new(TlsDialer::new(Arc::new(config), args.sni.clone()))
    } else {
        Arc::new(TcpDialer::new())
    };

    let (host, port) = parse_host_port(&args.target)?;
    let target = Destination::tcp(host, port);

    let client = Arc::new(Client::new(servers, policies));

    let listener = TcpListener::bind(&args.listen)
        .await
        .map_err(|e| Error::ListenFailed(format!("{}: {}", args.listen, e)))?;
    tracing::info!(listen = %args.listen, target = %target, "htunnel client listening");

    let cancel = CancellationToken::new();
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::error!(error = %err, "accept error");
                continue;
            }
        };
        tracing::debug!(%peer, "new connection");

        let client = client.clone();
        let dialer = dialer.clone();
        let target = target.clone();
        let token = cancel.child_token();
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            match client
                .process(&target, reader, writer, dialer.as_ref(), &token)
                .await
            {
                Ok(()) => tracing::debug!(%peer, "session closed"),
                Err(err) => tracing::warn!(%peer, error = %err, "session failed"),
            }
        });
    }
}
