use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod sandbox;
mod tools;

use crate::config::Config;
use crate::sandbox::ContainerPool;

#[derive(Parser)]
#[command(name = "codebox")]
#[command(
    author,
    version,
    about = "Docker-backed code execution sandbox with persistent container pooling"
)]
struct Cli {
    /// Do not warm the persistent container at startup
    #[arg(long)]
    no_persistent: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging. Frames go to stdout, so logs must go to stderr.
    let filter = if cli.verbose {
        EnvFilter::new("codebox=debug")
    } else {
        EnvFilter::new("codebox=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let config = Config::load(&cwd)?;

    let pool = ContainerPool::connect(config.sandbox)
        .await
        .context("Failed to set up container pool")?;

    match pool.ping().await {
        Ok(()) => {
            info!(gpu = pool.gpu_available(), "container engine connected");
            if !cli.no_persistent {
                match pool.warm().await {
                    Ok(container_id) => {
                        info!(container = %container_id, "persistent container ready");
                    }
                    Err(e) => warn!("could not warm persistent container: {e}"),
                }
            }
        }
        // Keep serving: every request will surface the engine error itself.
        Err(e) => warn!("container engine unreachable: {e}"),
    }

    serve(Arc::new(pool)).await
}

/// Reads one JSON tool call per stdin line, dispatches them concurrently,
/// and writes one JSON response per stdout line. Returns once stdin closes
/// and all in-flight requests have finished.
async fn serve(pool: Arc<ContainerPool>) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut in_flight = JoinSet::new();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let pool = Arc::clone(&pool);
        in_flight.spawn(async move {
            let response = match serde_json::from_str::<tools::ToolCall>(&line) {
                Ok(call) => tools::dispatch(&pool, call).await,
                Err(e) => tools::invalid_request(&e.to_string()),
            };
            // println! locks stdout per call, keeping frames whole.
            println!("{response}");
        });
    }

    while in_flight.join_next().await.is_some() {}
    info!("input closed, shutting down");
    Ok(())
}
