//! dsvn-wcadmin: working copy maintenance tool for dsvn.
//!
//! # Usage
//!
//! ```bash
//! # Finish interrupted operations and release stale locks
//! dsvn-wcadmin cleanup ./wc
//!
//! # Replay pending logs of one directory
//! dsvn-wcadmin run-logs ./wc/src
//!
//! # Migrate admin areas to the newest format
//! dsvn-wcadmin upgrade ./wc
//!
//! # Inspect entries and local modifications
//! dsvn-wcadmin entries ./wc --json
//! dsvn-wcadmin status ./wc
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dsvn_wc::{AdminArea, Event, EventAction, NodeKind, Schedule, WcAccess, WcOptions, THIS_DIR};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dsvn-wcadmin")]
#[command(author = "DSvn Contributors")]
#[command(version = "0.1.0")]
#[command(about = "DSvn working copy maintenance tool", long_about = None)]
struct Cli {
    /// Working copy options file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Recursively finish interrupted work and break stale locks
    Cleanup { path: PathBuf },

    /// Replay the pending logs of a directory
    RunLogs { path: PathBuf },

    /// Migrate admin areas to the configured format
    Upgrade { path: PathBuf },

    /// Remove a directory's lock file
    Unlock { path: PathBuf },

    /// List the entries of a directory
    Entries {
        path: PathBuf,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show modification and conflict flags
    Status { path: PathBuf },

    /// Print the admin area format of a directory
    Format { path: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let options = match &cli.config {
        Some(path) => WcOptions::load(path).with_context(|| format!("Failed to load options from {}", path.display()))?,
        None => WcOptions::default(),
    };
    debug!("Options: {:?}", options);

    match cli.command {
        Commands::Cleanup { path } => cmd_cleanup(&resolve(&path)?, options),
        Commands::RunLogs { path } => cmd_run_logs(&resolve(&path)?, options),
        Commands::Upgrade { path } => cmd_upgrade(&resolve(&path)?, options),
        Commands::Unlock { path } => cmd_unlock(&resolve(&path)?),
        Commands::Entries { path, json } => cmd_entries(&resolve(&path)?, json),
        Commands::Status { path } => cmd_status(&resolve(&path)?, options),
        Commands::Format { path } => cmd_format(&resolve(&path)?, &options),
    }
}

fn resolve(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).with_context(|| format!("Cannot access {}", path.display()))
}

fn session(options: WcOptions) -> WcAccess {
    WcAccess::new(options).with_event_sink(|event: &Event| {
        let label = match event.action {
            EventAction::LockBroken => "Broke lock",
            EventAction::LogsReplayed => "Replayed logs",
            EventAction::Upgraded => "Upgraded",
            EventAction::Removed => "Removed",
            EventAction::KeptModified => "Kept modified",
            EventAction::Restored => "Restored",
            EventAction::Resolved => "Resolved",
            EventAction::Committed => "Committed",
        };
        println!("{:<14} {}", label, event.path.display());
    })
}

fn cmd_cleanup(path: &Path, options: WcOptions) -> Result<()> {
    let mut access = session(options);
    access
        .cleanup(path)
        .with_context(|| format!("Cleanup of {} failed", path.display()))?;
    info!("Cleanup of {} finished", path.display());
    Ok(())
}

fn cmd_run_logs(path: &Path, options: WcOptions) -> Result<()> {
    let mut access = session(options);
    access.open(path, true, true, Some(0))?;
    access
        .run_logs(path)
        .with_context(|| format!("Log replay in {} failed", path.display()))?;
    access.close()?;
    Ok(())
}

fn cmd_upgrade(path: &Path, options: WcOptions) -> Result<()> {
    let target = options.target_generation;
    let mut access = session(WcOptions {
        auto_upgrade: false,
        ..options
    });
    access.open(path, true, false, None)?;

    let mut upgraded = 0;
    for dir in access.open_paths() {
        if access.upgrade(&dir)? {
            upgraded += 1;
        }
    }
    access.close()?;
    println!("{} director{} upgraded to format {}", upgraded, if upgraded == 1 { "y" } else { "ies" }, target);
    Ok(())
}

fn cmd_unlock(path: &Path) -> Result<()> {
    let mut area = AdminArea::open(path)?;
    area.lock(true)?;
    if !area.unlock()? {
        bail!(
            "{} has unfinished logs; run 'dsvn-wcadmin cleanup' instead",
            path.display()
        );
    }
    println!("Unlocked {}", path.display());
    Ok(())
}

fn cmd_entries(path: &Path, json: bool) -> Result<()> {
    let mut area = AdminArea::open(path)?;
    let entries = area.entries(true)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in entries {
        let name = if entry.name == THIS_DIR { "." } else { entry.name.as_str() };
        let revision = entry.revision.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
        let mut flags = Vec::new();
        if entry.deleted {
            flags.push("deleted");
        }
        if entry.absent {
            flags.push("absent");
        }
        if entry.incomplete {
            flags.push("incomplete");
        }
        if entry.copied {
            flags.push("copied");
        }
        println!(
            "{:<6} {:<8} {:>8}  {:<30} {}",
            entry.kind.as_str().unwrap_or("none"),
            entry.schedule.as_str().unwrap_or("normal"),
            revision,
            name,
            flags.join(",")
        );
    }
    Ok(())
}

fn cmd_status(path: &Path, options: WcOptions) -> Result<()> {
    let mut access = WcAccess::new(WcOptions {
        auto_upgrade: false,
        ..options
    });
    access.open(path, false, false, None)?;

    for dir in access.open_paths() {
        let area = access.retrieve(&dir)?;
        for entry in area.entries(false)? {
            if entry.is_dir() && !entry.is_this_dir() {
                continue;
            }
            let text = if entry.kind == NodeKind::File && area.has_text_conflict(&entry.name)? {
                'C'
            } else if entry.kind == NodeKind::File && area.has_text_modifications(&entry.name, false, false, false)? {
                'M'
            } else {
                match entry.schedule {
                    Schedule::Add => 'A',
                    Schedule::Delete => 'D',
                    Schedule::Replace => 'R',
                    Schedule::Normal => ' ',
                }
            };
            let props = if area.has_prop_conflict(&entry.name)? {
                'C'
            } else if area.has_prop_modifications(&entry.name)? {
                'M'
            } else {
                ' '
            };
            if text == ' ' && props == ' ' {
                continue;
            }
            println!("{}{}      {}", text, props, area.path(&entry.name).display());
        }
    }
    Ok(())
}

fn cmd_format(path: &Path, options: &WcOptions) -> Result<()> {
    let area = AdminArea::open(path)?.with_options(options.clone());
    let generation = area.generation();
    println!("{}: format {}", path.display(), generation.number());
    if area.needs_upgrade() {
        println!("  upgrade available to format {}", options.target_generation.number());
    }
    Ok(())
}
