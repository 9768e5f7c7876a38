//! Waddle pub/sub daemon.
//!
//! Hosts one XEP-0060 service per configured domain over in-memory storage
//! and exchanges stanzas on stdin/stdout.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use waddle_pubsub::{
    DiscoRegistry, InMemoryPubSubStorage, PubSubComponents, PubSubRepository, StanzaSender,
};

mod config;
mod shell;
mod telemetry;

use config::{LogFormat, ServerConfig};

const OUTBOUND_CAPACITY: usize = 4096;

/// Waddle pub/sub daemon
#[derive(Parser)]
#[command(name = "waddle-pubsubd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format, overriding the configuration
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    telemetry::init(&config.log)?;

    info!("Waddle pub/sub starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    config.log_config();

    let storage = Arc::new(InMemoryPubSubStorage::new());
    let repository = Arc::new(PubSubRepository::with_max_items(
        storage,
        config.default_max_items,
    ));
    let disco = Arc::new(DiscoRegistry::new());
    let (out, outbound) = StanzaSender::channel(OUTBOUND_CAPACITY);

    let components = PubSubComponents::start(&config.pubsub, repository, disco, out)
        .context("Failed to start pub/sub services")?;
    for host in components.hosts() {
        info!(%host, "Serving pub/sub host");
    }

    let writer = tokio::spawn(shell::run_output(outbound, tokio::io::stdout()));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal.cancel();
        }
    });

    let input =
        shell::run_input(&components, BufReader::new(tokio::io::stdin()), shutdown.clone()).await;
    if shutdown.is_cancelled() {
        components.shutdown().await;
    } else {
        // Input ended on its own; answer what is still queued.
        components.drain().await;
    }

    match writer.await {
        Ok(Ok(written)) => info!(written, "Outbound stream closed"),
        Ok(Err(e)) => warn!(error = %e, "Failed writing outbound stanzas"),
        Err(e) => warn!(error = %e, "Outbound writer task failed"),
    }

    input.map(|_| ())
}
