use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ilake_core::PipelineConfig;
use ilake_ingest::HttpPageSource;
use ilake_storage::FsObjectStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ilake-cli")]
#[command(about = "Incident lakehouse pipeline command-line interface")]
struct Cli {
    /// Pipeline configuration file.
    #[arg(long, default_value = "config/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Paginate the incident API and land a bronze run.
    Ingest,
    /// Merge the latest bronze run into the silver dataset.
    Transform,
}

fn load_config(path: &PathBuf) -> Result<PipelineConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let store = FsObjectStore::new(&config.storage.root_dir, &config.storage.bucket);

    match cli.command {
        Commands::Ingest => {
            let endpoint_url = config.source.endpoint_url();
            let source = HttpPageSource::new(
                endpoint_url.clone(),
                Duration::from_secs(config.runtime.http_timeout_secs),
                config.runtime.use_env_proxy,
            )?;
            let summary = ilake_ingest::run_ingestion(
                &store,
                &source,
                &endpoint_url,
                config.source.page_size,
                config.source.max_records,
                &config.storage.prefix_root,
            )
            .await?;
            println!(
                "successfully ingested {} records from endpoint {}",
                summary.record_count, summary.endpoint_url
            );
            println!("bronze raw json written to: {}", summary.output_uri);
        }
        Commands::Transform => {
            let summary =
                ilake_transform::run_transform(&store, &config.storage.prefix_root).await?;
            println!(
                "successfully transformed {} records into the silver layer",
                summary.new_rows
            );
            println!(
                "silver parquet written to: {} (final rows: {})",
                summary.output_uri, summary.final_rows
            );
        }
    }

    Ok(())
}
