//! Runledger - thread store, checkpoints, tool scheduling and memory
//! extraction for agent runs

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runledger=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting Runledger v{}", env!("CARGO_PKG_VERSION"));

    runledger::cli::run()?;

    Ok(())
}
