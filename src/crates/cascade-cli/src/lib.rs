//! # cascade-cli
//!
//! Operator tool for the checkpoint tree written by cascade runs. It reads
//! summaries and item records, records an item outcome under the key's lock,
//! inspects lock markers and prunes old versions.

use anyhow::{bail, Context, Result};
use cascade_checkpoint::{
    CheckpointManager, CheckpointSettings, CommandLog, FileLocker, ItemState, ItemStatus, Summary,
};
use clap::{ArgAction, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "cascade-state")]
#[command(about = "Inspect and maintain cascade checkpoints", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// State root (falls back to XDG_STATE_HOME/cascade, then the user cache dir)
    #[arg(long, global = true, value_name = "PATH", env = "CASCADE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the run summary for a module version
    Show {
        module: String,
        version: String,
        /// Print the raw JSON record
        #[arg(long)]
        json: bool,
    },

    /// List per-repository item records
    Items {
        module: String,
        version: String,
        /// Print the raw JSON records
        #[arg(long)]
        json: bool,
    },

    /// Record one repository's outcome while holding the lock
    Record {
        module: String,
        version: String,
        #[arg(long)]
        repo: String,
        #[arg(long)]
        branch: String,
        /// completed, manual-review, failed or skipped
        #[arg(long, value_parser = parse_status)]
        status: ItemStatus,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long = "commit", value_name = "HASH")]
        commit_hash: Option<String>,
        #[arg(long)]
        pr_url: Option<String>,
        /// Command to append to the item's log
        #[arg(long = "log-command", value_name = "COMMAND")]
        log_command: Option<String>,
        /// Output of --log-command
        #[arg(long = "log-output", value_name = "TEXT", requires = "log_command", default_value = "")]
        log_output: String,
    },

    /// Print the lock marker for a module version
    Lock { module: String, version: String },

    /// Remove all but the newest versions of a module
    Prune {
        module: String,
        /// Versions to keep (defaults to CASCADE_RETENTION_KEEP, else 5)
        #[arg(long)]
        keep: Option<usize>,
    },
}

fn parse_status(raw: &str) -> std::result::Result<ItemStatus, String> {
    raw.parse().map_err(|e: cascade_checkpoint::ValidationError| e.to_string())
}

impl Cli {
    /// Settings from the environment with command-line overrides applied
    pub fn settings(&self) -> Result<CheckpointSettings> {
        let settings = CheckpointSettings::from_env().context("invalid checkpoint configuration")?;
        Ok(match &self.state_dir {
            Some(dir) => settings.with_state_root(dir.clone()),
            None => settings,
        })
    }

    /// Default `tracing` filter directive for the verbosity flag
    pub fn log_directive(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

/// Execute one command, writing its report to `out`
pub async fn run<W: Write>(
    command: Commands,
    settings: &CheckpointSettings,
    out: &mut W,
    cancel: CancellationToken,
) -> Result<()> {
    let manager = CheckpointManager::from_settings(settings);

    match command {
        Commands::Show {
            module,
            version,
            json,
        } => {
            let summary = match manager.load_summary(&module, &version).await {
                Ok(summary) => summary,
                Err(e) if e.is_not_found() => {
                    bail!("no checkpoint recorded for {}@{}", module.trim(), version.trim())
                }
                Err(e) => return Err(e.into()),
            };
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&summary)?)?;
            } else {
                write_summary(out, &summary)?;
            }
        }

        Commands::Items {
            module,
            version,
            json,
        } => {
            let items = manager.load_item_states(&module, &version).await?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&items)?)?;
            } else if items.is_empty() {
                writeln!(out, "no items recorded for {}@{}", module.trim(), version.trim())?;
            } else {
                for item in &items {
                    write_item(out, item)?;
                }
            }
        }

        Commands::Record {
            module,
            version,
            repo,
            branch,
            status,
            reason,
            commit_hash,
            pr_url,
            log_command,
            log_output,
        } => {
            let mut item = ItemState::new(repo, branch, status).with_reason(reason);
            if let Some(hash) = commit_hash {
                item = item.with_commit_hash(hash);
            }
            if let Some(url) = pr_url {
                item = item.with_pr_url(url);
            }
            if let Some(command) = log_command {
                item = item.with_command_log(CommandLog::new(command, log_output));
            }

            let guard = manager
                .locker()
                .acquire_with_cancel(&cancel, &module, &version)
                .await
                .with_context(|| format!("locking {}@{}", module.trim(), version.trim()))?;
            let saved = manager.save_item_state(&module, &version, &item).await;
            guard.release()?;
            let saved = saved?;

            writeln!(
                out,
                "recorded {} as {} (attempt {})",
                saved.repo, saved.status, saved.attempts
            )?;
        }

        Commands::Lock { module, version } => {
            let locker = FileLocker::from_settings(settings);
            match locker.read_marker(&module, &version)? {
                Some(marker) => write!(out, "{}", marker)?,
                None => writeln!(out, "unlocked")?,
            }
        }

        Commands::Prune { module, keep } => {
            let keep = keep.unwrap_or(settings.retention_keep);
            let removed = manager.prune(&module, keep).await?;
            if removed.is_empty() {
                writeln!(out, "nothing to prune")?;
            }
            for version in removed {
                writeln!(out, "removed {}", version)?;
            }
        }
    }

    Ok(())
}

fn write_summary<W: Write>(out: &mut W, summary: &Summary) -> Result<()> {
    let counts = summary.status_counts();
    writeln!(out, "module:   {}", summary.module)?;
    writeln!(out, "version:  {}", summary.version)?;
    writeln!(out, "started:  {}", summary.start_time.to_rfc3339())?;
    match summary.end_time {
        Some(end) => writeln!(out, "finished: {}", end.to_rfc3339())?,
        None => writeln!(out, "finished: in progress")?,
    }
    writeln!(out, "retries:  {}", summary.retry_count)?;
    writeln!(
        out,
        "items:    {} (completed {}, manual-review {}, failed {}, skipped {})",
        counts.total(),
        counts.completed,
        counts.manual_review,
        counts.failed,
        counts.skipped
    )?;
    for item in &summary.items {
        write!(out, "  ")?;
        write_item(out, item)?;
    }
    if let Some(skipped) = summary.skipped_up_to_date.as_ref().filter(|s| !s.is_empty()) {
        writeln!(out, "up to date: {}", skipped.join(", "))?;
    }
    Ok(())
}

fn write_item<W: Write>(out: &mut W, item: &ItemState) -> Result<()> {
    write!(out, "{:<13} {:>3}  {}  {}", item.status, item.attempts, item.repo, item.branch)?;
    if let Some(url) = &item.pr_url {
        write!(out, "  {}", url)?;
    }
    if !item.reason.is_empty() {
        write!(out, "  ({})", item.reason)?;
    }
    writeln!(out)?;
    Ok(())
}
