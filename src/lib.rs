//! htunnel - outbound HTTP CONNECT tunnel proxy client.
//!
//! This crate tunnels TCP streams through a pool of upstream HTTP
//! proxies using the `CONNECT` verb, speaking HTTP/1.1 or HTTP/2 as
//! selected by TLS ALPN. HTTP/2 upstream connections are multiplexed
//! and cached per destination.

pub mod cli;
pub mod client;
pub mod common;
pub mod dial;
pub mod error;
pub mod policy;
pub mod relay;
pub mod retry;
pub mod rewrite;
pub mod tls;
pub mod tunnel;
pub mod upstream;

pub use cli::{build_tls_config, Cli, SecurityMode};
pub use client::{run_client, Client};
pub use common::{read_first_payload, DnsResolver, FIRST_PAYLOAD_TIMEOUT, READ_BUFFER_SIZE};
pub use dial::{DialedTransport, Dialer, TcpDialer, TlsDialer, TransportStream};
pub use error::{Error, ExitCode, Result};
pub use policy::{Policy, PolicyManager};
pub use relay::{run_relay, IdleTimer};
pub use retry::retry_exponential_backoff;
pub use rewrite::{apply_t5_rewrite, x_t5_auth_token};
pub use tls::{
    build_client_config_ca, build_client_config_fingerprint, build_client_config_insecure,
    compute_fingerprint, format_fingerprint, parse_fingerprint, TlsError, TlsResult,
    DEFAULT_ALPN_PROTOCOLS,
};
pub use tunnel::{Negotiator, Tunnel};
pub use upstream::{
    parse_host_port, parse_upstream_spec, Destination, Network, RoundRobinPicker, ServerList,
    ServerSpec, UserCredential,
};
