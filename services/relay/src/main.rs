//! tlsrelay
//!
//! TLS-terminating TCP relay sidecar.
//!
//! This service:
//! - Accepts TLS connections on every configured listen port
//! - Dials the backend host on the mapped port for each connection
//! - Copies bytes both ways until either side closes
//! - Exits on SIGINT/SIGTERM without draining sessions

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tlsrelay::config::Config;
use tlsrelay::ProxySupervisor;

fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to configured log level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let result = runtime.block_on(run(config));

    // Blocking work such as in-flight backend DNS lookups must not hold up exit.
    runtime.shutdown_background();
    result
}

async fn run(config: Config) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "TLS proxy version {}", env!("CARGO_PKG_VERSION"));

    for var in &config.defaulted {
        info!(var, "Missing or empty {}, using default", var);
    }
    info!(
        target_host = %config.target,
        listeners = config.mappings.len(),
        cert_file = %config.cert_file.display(),
        key_file = %config.key_file.display(),
        listen_host = %config.listen_host,
        debug = config.debug,
        "Configuration loaded"
    );

    let supervisor = ProxySupervisor::from_config(&config).context("failed to load TLS credential")?;
    supervisor.run().await.context("failed to install signal handlers")?;

    info!("Shutdown complete");
    Ok(())
}
