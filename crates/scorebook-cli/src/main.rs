use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scorebook_core::UserId;
use scorebook_engine::{
    initialise_folder_chart_lookup, update_chart_ranking, Catalog, ConvertedScore, EngineConfig,
    ImportPipeline,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "scorebook-cli")]
#[command(about = "Import rhythm game scores and maintain derived stats")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import a JSON batch of converted scores for one user.
    Import {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        scores: PathBuf,
        /// YAML catalogue of songs, charts, folders, goals and subscriptions to load first.
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
    /// Flush and rebuild the folder chart lookup.
    RebuildFolders,
    /// Re-rank every PB on one chart.
    Rerank {
        #[arg(long)]
        chart: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let pipeline = ImportPipeline::open(EngineConfig::from_env()).await?;

    match cli.command {
        Commands::Import {
            user,
            scores,
            catalog,
        } => {
            if let Some(path) = catalog {
                let report = Catalog::from_yaml_path(&path)
                    .await?
                    .load_into(pipeline.database())
                    .await?;
                info!(?report, "loaded catalogue");
            }

            let raw = tokio::fs::read(&scores)
                .await
                .with_context(|| format!("reading {}", scores.display()))?;
            let batch: Vec<ConvertedScore> = serde_json::from_slice(&raw)
                .with_context(|| format!("parsing score batch {}", scores.display()))?;

            let summary = pipeline.import_batch(user, batch).await?;
            let report_path = pipeline.write_reports(&summary).await?;
            println!(
                "import complete: import_id={} inserted={} duplicates={} errors={} pbs={} report={}",
                summary.import_id,
                summary.inserted.len(),
                summary.duplicates.len(),
                summary.errors.len(),
                summary.personal_bests,
                report_path.display()
            );
        }
        Commands::RebuildFolders => {
            let rows = initialise_folder_chart_lookup(pipeline.database()).await?;
            println!("folder lookup rebuilt: rows={rows}");
        }
        Commands::Rerank { chart } => {
            let changed = update_chart_ranking(pipeline.database(), &chart).await?;
            println!("rerank complete: chart={chart} changed={changed}");
        }
    }

    let stored = pipeline.save_state().await?;
    info!(path = %stored.path.display(), hash = %stored.content_hash, bytes = stored.byte_size, "saved state");
    Ok(())
}
