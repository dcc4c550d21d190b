//! CLI definitions for htunnel.

use clap::{builder::PossibleValuesParser, Parser};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::tls::{
    build_client_config_ca, build_client_config_fingerprint, build_client_config_insecure,
    parse_fingerprint, DEFAULT_ALPN_PROTOCOLS,
};

/// Parse a duration from a human-readable string.
fn parse_duration(s: &str) -> std::result::Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Local TCP forwarder tunneling through upstream HTTP CONNECT proxies.
#[derive(Debug, Parser)]
#[command(name = "htunnel")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (debug|info|warn|error)
    #[arg(long, default_value = "info", value_parser = PossibleValuesParser::new(["debug", "info", "warn", "error"]))]
    pub log_level: String,

    /// Local TCP listen address (e.g., 127.0.0.1:1080)
    #[arg(long)]
    pub listen: String,

    /// Target reached through the tunnel (host:port)
    #[arg(long)]
    pub target: String,

    /// Upstream proxy, `[user:pass@]host:port` (repeat for a pool)
    #[arg(long = "upstream", required = true)]
    pub upstreams: Vec<String>,

    /// Connect to upstreams over TLS; ALPN selects HTTP/1.1 or HTTP/2
    #[arg(long, default_value_t = false)]
    pub tls: bool,

    /// TLS SNI hostname override
    #[arg(long)]
    pub sni: Option<String>,

    /// Root CA certificate file path
    #[arg(long)]
    pub ca: Option<PathBuf>,

    /// Disable certificate verification (development only)
    #[arg(long, default_value_t = false)]
    pub insecure_skip_verify: bool,

    /// Upstream certificate fingerprint (SHA-256 hex)
    #[arg(long)]
    pub fingerprint: Option<String>,

    /// Idle timeout while both directions are open
    #[arg(long, value_parser = parse_duration, default_value = "300s")]
    pub idle_timeout: Duration,

    /// Remaining budget once the uplink has finished
    #[arg(long, value_parser = parse_duration, default_value = "5s")]
    pub downlink_only_timeout: Duration,

    /// Remaining budget once the downlink has finished
    #[arg(long, value_parser = parse_duration, default_value = "2s")]
    pub uplink_only_timeout: Duration,
}

/// Security mode for upstream TLS verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityMode {
    /// CA certificate validation (default or custom CA).
    Ca,
    /// Certificate fingerprint validation.
    Fingerprint,
    /// No verification (insecure, development only).
    None,
}

impl SecurityMode {
    /// Determines the security mode from arguments.
    pub fn from_args(args: &Cli) -> Self {
        if args.insecure_skip_verify {
            SecurityMode::None
        } else if args.fingerprint.is_some() {
            SecurityMode::Fingerprint
        } else {
            SecurityMode::Ca
        }
    }
}

/// Builds the upstream TLS client configuration from arguments.
pub fn build_tls_config(args: &Cli) -> Result<rustls::ClientConfig> {
    match SecurityMode::from_args(args) {
        SecurityMode::None => build_client_config_insecure(DEFAULT_ALPN_PROTOCOLS)
            .map_err(|e| Error::Tls(e.to_string())),
        SecurityMode::Fingerprint => {
            let fp_str = args.fingerprint.as_deref().unwrap();
            let fingerprint =
                parse_fingerprint(fp_str).map_err(|e| Error::Tls(e.to_string()))?;
            build_client_config_fingerprint(&fingerprint, DEFAULT_ALPN_PROTOCOLS)
                .map_err(|e| Error::Tls(e.to_string()))
        }
        SecurityMode::Ca => build_client_config_ca(args.ca.as_deref(), DEFAULT_ALPN_PROTOCOLS)
            .map_err(|e| Error::Tls(e.to_string())),
    }
}
