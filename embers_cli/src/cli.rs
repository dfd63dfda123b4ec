use clap::{Args, Parser, Subcommand};
use embers_core::loader::models::{LoadRunStatus, RunTrigger, Watermark};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "embers",
    version,
    about = "Incremental loader for San Francisco fire incidents"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run one load (default if no subcommand given).
    Run(RunArgs),

    /// Create run-state tables and the target table.
    Migrate,

    /// Inspect or override the stored watermark.
    Watermark {
        #[command(subcommand)]
        action: WatermarkAction,
    },

    /// Print recent runs as JSON lines, newest first.
    Runs {
        #[arg(long, default_value = "20")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,

        /// Only runs with this status (running, succeeded, failed).
        #[arg(long, value_parser = parse_status)]
        status: Option<LoadRunStatus>,
    },

    /// Print current configuration (redacted secrets).
    Config,
}

#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Ignore the stored watermark and reload complete history.
    #[arg(long, conflicts_with = "since")]
    pub full_refresh: bool,

    /// Reload records strictly newer than this timestamp.
    #[arg(long, value_parser = parse_watermark)]
    pub since: Option<Watermark>,

    /// Read records from a JSON array file instead of the Socrata API.
    #[arg(long)]
    pub from_file: Option<PathBuf>,
}

impl RunArgs {
    pub fn trigger(&self) -> RunTrigger {
        match (self.full_refresh, self.since) {
            (true, _) => RunTrigger::FullRefresh,
            (false, Some(since)) => RunTrigger::Backfill { since },
            (false, None) => RunTrigger::Incremental,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum WatermarkAction {
    /// Print the stored watermark.
    Show,
    /// Overwrite the stored watermark (may move it backwards).
    Set {
        #[arg(value_parser = parse_watermark)]
        value: Watermark,
    },
    /// Delete the stored watermark; the next run reloads complete history.
    Clear,
}

fn parse_watermark(raw: &str) -> Result<Watermark, String> {
    Watermark::parse(raw).map_err(|e| e.to_string())
}

fn parse_status(raw: &str) -> Result<LoadRunStatus, String> {
    LoadRunStatus::parse_str(raw)
        .ok_or_else(|| format!("unknown run status {raw:?} (running, succeeded, failed)"))
}
