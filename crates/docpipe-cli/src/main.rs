use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use docpipe_core::QueryWindow;
use docpipe_sync::{Pipeline, PipelineConfig, RunReport};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "docpipe")]
#[command(about = "Monthly bibliographic metadata pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one window (defaults to the previous calendar month).
    Run {
        #[arg(long, requires = "end")]
        start: Option<NaiveDate>,
        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,
    },
    /// Run every elapsed monthly window since the configured start date.
    Backfill {
        /// Re-run windows that already have a successful report.
        #[arg(long)]
        force: bool,
    },
    /// Catch up, then run the monthly job until interrupted.
    Schedule,
    /// Convert an existing raw store into an output table.
    Transform { source: PathBuf, dest: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        start: None,
        end: None,
    }) {
        Commands::Run { start, end } => {
            let pipeline = Pipeline::new(PipelineConfig::from_env()?)?;
            let window = match (start, end) {
                (Some(start), Some(end)) => {
                    if end < start {
                        bail!("--end {end} is before --start {start}");
                    }
                    pipeline.window_for(start, end)
                }
                _ => QueryWindow::previous_month(
                    Utc::now().date_naive(),
                    pipeline.config().search_terms.clone(),
                ),
            };
            let report = pipeline.run_window(window).await?;
            print_report(&report);
            report.into_result()?;
        }
        Commands::Backfill { force } => {
            let pipeline = Pipeline::new(PipelineConfig::from_env()?)?;
            let reports = pipeline.backfill(Utc::now().date_naive(), force).await?;
            if reports.is_empty() {
                println!("backfill: nothing to do");
            }
            reports.iter().for_each(print_report);
            let failed = reports.iter().filter(|r| !r.is_success()).count();
            if failed > 0 {
                bail!("{failed} of {} backfill windows failed", reports.len());
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(Pipeline::new(PipelineConfig::from_env()?)?);
            pipeline.serve_schedule().await?;
        }
        Commands::Transform { source, dest } => {
            let rows = docpipe_transform::transform(&source, &dest)
                .with_context(|| format!("transforming {}", source.display()))?;
            println!("transform complete: rows={rows} output={}", dest.display());
        }
    }

    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "run {}: window={} status={:?} extract_flag={} rows={} table={}",
        report.run_id,
        report.window,
        report.status,
        report
            .extract_flag
            .map(|f| f.to_string())
            .unwrap_or_else(|| "-".into()),
        report
            .rows
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".into()),
        report.output_table.display()
    );
}
