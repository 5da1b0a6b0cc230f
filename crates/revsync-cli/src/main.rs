use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use revsync_adapters::FileFetcher;
use revsync_sync::{
    merge_files, run_sync_all, SourceRegistry, SyncConfig, SyncOverrides, SyncPipeline,
    SyncRunSummary,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "revsync")]
#[command(about = "Incremental product review sync")]
struct Cli {
    /// Directory holding datasets and the state file (overrides REVSYNC_DATA_DIR).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Print machine-readable JSON instead of a summary line.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one incremental sync cycle for a product URL.
    Sync {
        url: String,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        spider: Option<String>,
        #[arg(long)]
        project_dir: Option<PathBuf>,
        #[arg(long)]
        max_reviews: Option<usize>,
        /// Replay an already-fetched dataset instead of running the fetch program.
        #[arg(long)]
        from_file: Option<PathBuf>,
    },
    /// Sync every enabled source in sources.yaml, one after another.
    SyncAll,
    /// List stored watermarks.
    Status,
    /// Delete the watermark for a URL so the next sync is a full fetch.
    Reset { url: String },
    /// Print the identity key and spider for a URL without syncing.
    Key { url: String },
    /// Merge two dataset files offline; state is not touched.
    Merge {
        existing: PathBuf,
        new: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    init_tracing(&config.log_level);
    tracing::debug!(command = ?cli.command, data_dir = %config.data_dir.display(), "starting");

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, mut config: SyncConfig) -> Result<()> {
    match cli.command {
        Commands::Sync {
            url,
            output,
            spider,
            project_dir,
            max_reviews,
            from_file,
        } => {
            if project_dir.is_some() {
                config.project_dir = project_dir;
            }
            let mut pipeline = SyncPipeline::new(config)?;
            if let Some(path) = from_file {
                pipeline = pipeline.with_fetcher(Box::new(FileFetcher::new(path)));
            }
            let overrides = SyncOverrides {
                output,
                spider,
                max_reviews,
            };
            let summary = pipeline
                .run_once(&url, &overrides)
                .await
                .with_context(|| format!("syncing {url}"))?;
            print_summary(&summary, cli.json)?;
        }
        Commands::SyncAll => {
            let registry = SourceRegistry::load(&config.workspace_root)?;
            let mut pipeline = SyncPipeline::new(config)?;
            let outcomes = run_sync_all(&mut pipeline, &registry).await;

            let mut failed = 0usize;
            for outcome in &outcomes {
                match &outcome.outcome {
                    Ok(summary) => print_summary(summary, cli.json)?,
                    Err(err) => {
                        failed += 1;
                        eprintln!("failed: url={} kind={} error={err}", outcome.url, err.kind());
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} sources failed", outcomes.len());
            }
        }
        Commands::Status => {
            let pipeline = SyncPipeline::new(config)?;
            let entries = pipeline.watermarks().entries();
            if cli.json {
                let map: BTreeMap<String, _> = entries
                    .iter()
                    .map(|(key, wm)| (key.to_string(), wm))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else if entries.is_empty() {
                println!("no watermarks recorded");
            } else {
                for (key, wm) in entries {
                    println!(
                        "{key}: latest_date={} review_id={} total_reviews={} last_scrape_time={}",
                        wm.latest_date
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "-".into()),
                        wm.review_id
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| "-".into()),
                        wm.total_reviews,
                        wm.last_scrape_time.to_rfc3339(),
                    );
                }
            }
        }
        Commands::Reset { url } => {
            let mut pipeline = SyncPipeline::new(config)?;
            if pipeline.reset(&url)? {
                println!("watermark removed for {url}");
            } else {
                println!("no watermark recorded for {url}");
            }
        }
        Commands::Key { url } => {
            let resolved = revsync_adapters::SourceIdentity::new().resolve(&url)?;
            let output = config.output_path(&resolved.key);
            if cli.json {
                let value = serde_json::json!({
                    "key": resolved.key,
                    "domain": resolved.domain,
                    "product_id": resolved.product_id,
                    "spider": resolved.spider,
                    "normalized_url": resolved.normalized_url,
                    "output": output,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!(
                    "key={} spider={} output={}",
                    resolved.key,
                    resolved.spider,
                    output.display()
                );
            }
        }
        Commands::Merge {
            existing,
            new,
            output,
        } => {
            let report = merge_files(&existing, &new, output.as_deref())?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for warning in &report.warnings {
                    eprintln!("warning: {warning}");
                }
                println!(
                    "merged: existing={} new={} merged={} new_added={} strategy={} output={}",
                    report.result.existing_count,
                    report.result.new_count,
                    report.result.merged_count,
                    report.result.new_added_count,
                    report.strategy,
                    report.output_path.display()
                );
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &SyncRunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    for warning in &summary.warnings {
        eprintln!("warning: {}: {warning}", summary.source_key);
    }
    let average = summary
        .ingest
        .average_rating
        .map(|r| format!("{r:.2}"))
        .unwrap_or_else(|| "-".into());
    println!(
        "sync complete: run_id={} source={} existing={} new={} merged={} new_added={} strategy={} avg_rating={} output={}",
        summary.run_id,
        summary.source_key,
        summary.merge.existing_count,
        summary.merge.new_count,
        summary.merge.merged_count,
        summary.merge.new_added_count,
        summary.strategy,
        average,
        summary.output_path.display()
    );
    Ok(())
}
