//! sses-server: encrypted symptom/medication search server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use sses::adapters::bfv::BfvEngine;
use sses::server::{Server, ServerContext};
use sses::ServerConfig;

#[derive(Parser)]
#[command(name = "sses-server")]
#[command(about = "Privacy-preserving symptom/medication search server")]
#[command(version)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// CSV table datasets are built from
    #[arg(short, long)]
    source_table: Option<PathBuf>,

    /// Directory holding list.txt and the per-key datasets
    #[arg(short, long)]
    dataset_dir: Option<PathBuf>,

    /// Key directory (default: <dataset-dir>/keys)
    #[arg(long)]
    key_dir: Option<PathBuf>,

    /// Maximum number of queued queries
    #[arg(short = 'q', long)]
    max_queries: Option<usize>,

    /// Maximum number of held results
    #[arg(short = 'r', long)]
    max_results: Option<usize>,

    /// Seconds a result may wait for its client before eviction
    #[arg(short = 'l', long)]
    max_result_lifetime: Option<u64>,

    /// Number of Calc Workers
    #[arg(short = 't', long)]
    workers: Option<usize>,

    /// Chunk threads per query
    #[arg(long)]
    threads_per_query: Option<usize>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(source_table) = self.source_table {
            config.source_table = source_table;
        }
        if let Some(dataset_dir) = self.dataset_dir {
            config.dataset_dir = dataset_dir;
        }
        if self.key_dir.is_some() {
            config.key_dir = self.key_dir;
        }
        if let Some(max_queries) = self.max_queries {
            config.max_concurrent_queries = max_queries;
        }
        if let Some(max_results) = self.max_results {
            config.max_results = max_results;
        }
        if let Some(lifetime) = self.max_result_lifetime {
            config.max_result_lifetime_secs = lifetime;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(threads) = self.threads_per_query {
            config.threads_per_query = threads;
        }
        Ok(config.validate()?)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = sses::logging::init("logs/sses-server.log").context("Failed to open log file")?;

    let config = args.into_config()?;
    tracing::info!(
        port = config.port,
        source_table = %config.source_table.display(),
        dataset_dir = %config.dataset_dir.display(),
        key_dir = %config.key_dir().display(),
        max_queries = config.max_concurrent_queries,
        max_results = config.max_results,
        max_result_lifetime_secs = config.max_result_lifetime_secs,
        workers = config.workers,
        "Starting sses-server"
    );

    let ctx = ServerContext::new(Arc::new(BfvEngine::new()), &config)
        .context("Failed to initialise server state")?;
    let server = Server::bind(("0.0.0.0", config.port), Arc::new(ctx))
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    server.run()?;

    tracing::info!("sses-server shutdown complete.");
    Ok(())
}
