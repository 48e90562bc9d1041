use std::path::{Path, PathBuf};

use alertsync_adapters::read_document_file;
use alertsync_core::LayerSchema;
use alertsync_storage::FeatureStore;
use alertsync_sync::{
    build_scheduler, inspect_document, report_recent_runs, DocumentSource, PipelineProfile,
    PipelineRegistry, SyncConfig, SyncPipeline,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "alertsync")]
#[command(about = "Publishes early-warning alert documents to hosted feature layers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled pipeline, or a single one.
    Sync {
        #[arg(long)]
        pipeline: Option<String>,
        /// Read the source document from disk instead of fetching it. Requires --pipeline.
        #[arg(long, requires = "pipeline")]
        file: Option<PathBuf>,
    },
    /// Parse and assemble a local document without writing to the feature layer.
    Inspect {
        #[arg(long)]
        pipeline: String,
        #[arg(long)]
        file: PathBuf,
        /// Layer descriptor JSON; fetched from the layer when omitted.
        #[arg(long)]
        schema: Option<PathBuf>,
    },
    /// Run pipelines on ALERTSYNC_SYNC_CRON until interrupted.
    Schedule,
    /// Summarize recent run reports as markdown.
    Report {
        #[arg(short = 'n', long, default_value = "5")]
        runs: usize,
    },
}

fn find_profile<'a>(registry: &'a PipelineRegistry, pipeline_id: &str) -> Result<&'a PipelineProfile> {
    match registry.get(pipeline_id) {
        Some(profile) => Ok(profile),
        None => bail!("unknown pipeline {pipeline_id:?}"),
    }
}

fn read_schema(path: &Path) -> Result<LayerSchema> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        pipeline: None,
        file: None,
    }) {
        Commands::Sync {
            pipeline: None,
            ..
        } => {
            let summary = SyncPipeline::new(config)?.run_once().await?;
            println!(
                "sync complete: run_id={} pipelines={} reports={}",
                summary.run_id,
                summary.pipelines.len(),
                summary.reports_dir
            );
            for report in &summary.pipelines {
                let (added, failed) = report
                    .sync
                    .as_ref()
                    .map(|s| (s.added_count, s.failed_count))
                    .unwrap_or_default();
                println!(
                    "  {}: {:?} added={} failed={}",
                    report.pipeline_id, report.status, added, failed
                );
            }
        }
        Commands::Sync {
            pipeline: Some(pipeline_id),
            file,
        } => {
            let pipeline = SyncPipeline::new(config)?;
            let registry = pipeline.load_registry().await?;
            let profile = find_profile(&registry, &pipeline_id)?;
            let source = file.map(DocumentSource::LocalFile).unwrap_or(DocumentSource::Remote);
            let report = pipeline
                .run_pipeline(Uuid::new_v4(), profile, &source)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Inspect {
            pipeline: pipeline_id,
            file,
            schema,
        } => {
            let pipeline = SyncPipeline::new(config)?;
            let registry = pipeline.load_registry().await?;
            let profile = find_profile(&registry, &pipeline_id)?;
            let schema = match schema {
                Some(path) => read_schema(&path)?,
                None => pipeline.feature_store_for(profile)?.schema().await?,
            };
            let bytes = read_document_file(&file)?;
            let outcome = inspect_document(profile, &bytes, schema)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Schedule => {
            let cron = config.sync_cron.clone();
            let mut sched = build_scheduler(config).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_runs(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}
