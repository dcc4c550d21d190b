//! htunnel - local TCP forwarder over upstream HTTP CONNECT proxies.

use clap::Parser;
use htunnel::{run_client, Cli};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Initialize the crypto provider
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        tracing::warn!(
            "failed to install default crypto provider (may already be installed): {:?}",
            e
        );
    }

    let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
    if let Err(e) = runtime.block_on(run_client(&cli)) {
        tracing::error!(error = %e, "client error");
        std::process::exit(e.exit_code().into());
    }
}
