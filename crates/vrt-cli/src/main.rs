use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use vrt_storage::{FailureClass, HistoryBackend, HistoryStore, StoreError};
use vrt_sync::{
    export_history_parquet, history_stats, render_stats_text, render_summary_text, track_snapshot, write_reports,
    HistoryMerger, TrackerConfig, TrackerPipeline,
};

#[derive(Debug, Parser)]
#[command(name = "vrt-cli")]
#[command(about = "Vienna rent tracker: scrape, clean and merge daily listing snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// scrape → clean → track → report
    Run {
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
    },
    /// Fetch listing pages into the raw snapshot
    Scrape,
    /// Extract features from the raw snapshot into the clean snapshot
    Clean,
    /// Merge the clean snapshot into the history table
    Track {
        #[arg(long)]
        snapshot: Option<PathBuf>,
        #[arg(long)]
        history: Option<PathBuf>,
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
    },
    /// Print history statistics without modifying it
    Stats {
        #[arg(long)]
        history: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Export the history table as Parquet with a manifest
    Export {
        #[arg(long)]
        history: Option<PathBuf>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    let class = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<StoreError>())
        .map(StoreError::class);
    match class {
        Some(FailureClass::InputMalformed) => 2,
        Some(FailureClass::HistoryCorrupt) => 3,
        Some(FailureClass::WriteFailure) => 4,
        Some(FailureClass::Io) | None => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vrt=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Commands::Run { date: None })).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = TrackerConfig::from_env()?;

    match command {
        Commands::Run { date } => {
            let pipeline = TrackerPipeline::new(config)?;
            let summary = pipeline.run_once(date.unwrap_or_else(today)).await?;
            print!("{}", render_summary_text(&summary.track.summary));
            println!(
                "run complete: scraped={} cleaned={} input={} reports={}",
                summary.scrape.listings, summary.clean.clean_rows, summary.track.input, summary.reports_dir
            );
        }
        Commands::Scrape => {
            let outcome = TrackerPipeline::new(config)?.scrape().await?;
            println!(
                "scrape complete: source={} listings={} failed_pages={}/{} raw={}",
                outcome.source_id, outcome.listings, outcome.pages_failed, outcome.pages_requested, outcome.raw_path
            );
        }
        Commands::Clean => {
            let outcome = TrackerPipeline::new(config)?.clean()?;
            println!(
                "clean complete: rows={} with_price={} with_district={} clean={}",
                outcome.clean_rows, outcome.with_price, outcome.with_district, outcome.clean_path
            );
        }
        Commands::Track {
            snapshot,
            history,
            date,
        } => {
            let snapshot = snapshot.unwrap_or_else(|| config.clean_snapshot_path());
            let store = HistoryStore::new(history.unwrap_or_else(|| config.history_path.clone()));
            let merger = HistoryMerger::new(config.merge);
            let outcome = track_snapshot(&snapshot, &store, &merger, date.unwrap_or_else(today))?;
            print!("{}", render_summary_text(&outcome.summary));
            let reports_dir = write_reports(&config.reports_dir, &outcome.summary, &outcome.insights).await?;
            info!(reports = %reports_dir.display(), saved = outcome.saved, "track complete");
        }
        Commands::Stats { history, json } => {
            let store = HistoryStore::new(history.unwrap_or(config.history_path));
            let stats = history_stats(&store.load()?);
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print!("{}", render_stats_text(&stats));
            }
        }
        Commands::Export { history, out } => {
            let store = HistoryStore::new(history.unwrap_or(config.history_path));
            let table = store.load()?;
            let out = out.unwrap_or_else(|| config.reports_dir.join("export"));
            let manifest = export_history_parquet(&table, &out)?;
            println!("export complete: rows={} manifest={}", table.len(), manifest.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_exit_codes() {
        let corrupt = anyhow::Error::new(StoreError::HistoryCorrupt {
            path: "history.csv".into(),
            reason: "zero-byte file".into(),
        })
        .context("merging into history");
        assert_eq!(exit_code_for(&corrupt), 3);

        let other = anyhow::anyhow!("all 5 pages from willhaben failed");
        assert_eq!(exit_code_for(&other), 1);
    }

    #[test]
    fn dates_parse_strictly() {
        assert_eq!(parse_date("2026-01-13"), Ok(NaiveDate::from_ymd_opt(2026, 1, 13).unwrap()));
        assert!(parse_date("13.01.2026").is_err());
    }

    #[test]
    fn cli_parses_track_overrides() {
        let cli = Cli::try_parse_from(["vrt-cli", "track", "--history", "h.csv", "--date", "2026-01-14"]).unwrap();
        match cli.command {
            Some(Commands::Track { history, date, snapshot }) => {
                assert_eq!(history, Some(PathBuf::from("h.csv")));
                assert_eq!(date, NaiveDate::from_ymd_opt(2026, 1, 14));
                assert!(snapshot.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
