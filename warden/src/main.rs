//! Risk-tiered admission control for autonomous tasks.
//!
//! Runs heartbeat cycles over `.warden/state/tasks.json`, plus the operator
//! commands for scoring, snapshots, rollback and quarantine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use warden::commands::{Workspace, decide_task, read_task_file, score_task};
use warden::core::risk::explain;
use warden::core::router::Profile;
use warden::core::types::Task;
use warden::error::PipelineError;
use warden::exit_codes;
use warden::io::paths::{InitOptions, WardenPaths, init_warden};
use warden::logging;

#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "Risk-tiered admission control for autonomous task execution"
)]
struct Cli {
    /// Project root containing `.warden/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.warden/` with default config and empty state.
    Init {
        /// Overwrite existing warden-owned files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one heartbeat cycle over pending tasks.
    Cycle {
        /// Simulate commits and write nothing back.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the risk score and its contributing factors.
    Score {
        #[command(flatten)]
        target: TaskTarget,
    },
    /// Print the routing decision for a task.
    Decide {
        #[command(flatten)]
        target: TaskTarget,
        /// Route as if the sandbox had scored this.
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
        sandbox_score: Option<u8>,
    },
    /// Append a pending task.
    Enqueue {
        #[arg(long = "type")]
        task_type: String,
        /// Task payload as a JSON object.
        #[arg(long)]
        payload: String,
    },
    /// Queue a fresh copy of an escalated, failed or rolled-back task.
    Requeue { task_id: String },
    /// List snapshots, newest first.
    Snapshots {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Restore live state from a snapshot.
    Rollback { snapshot_id: String },
    /// Compare live state against a snapshot.
    Verify { snapshot_id: String },
    /// Apply the snapshot retention policy.
    Gc,
    /// Inspect or release quarantined resources.
    Quarantine {
        #[command(subcommand)]
        command: QuarantineCommand,
    },
}

#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct TaskTarget {
    /// Task id in the task table.
    #[arg(long)]
    id: Option<String>,
    /// Standalone task JSON file.
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum QuarantineCommand {
    List,
    Clear { resource: String },
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            match err.downcast_ref::<PipelineError>() {
                Some(PipelineError::RollbackFailure(_)) => exit_codes::ROLLBACK_FAILED,
                _ => exit_codes::INVALID,
            }
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Cycle { dry_run } => cmd_cycle(root, dry_run).await,
        Command::Score { target } => cmd_score(root, &target),
        Command::Decide {
            target,
            sandbox_score,
        } => cmd_decide(root, &target, sandbox_score),
        Command::Enqueue { task_type, payload } => {
            let id = Workspace::open(root)?.enqueue(&task_type, &payload)?;
            println!("{id}");
            Ok(exit_codes::OK)
        }
        Command::Requeue { task_id } => {
            let id = Workspace::open(root)?.requeue(&task_id)?;
            println!("{id}");
            Ok(exit_codes::OK)
        }
        Command::Snapshots { limit } => cmd_snapshots(root, limit),
        Command::Rollback { snapshot_id } => cmd_rollback(root, &snapshot_id),
        Command::Verify { snapshot_id } => cmd_verify(root, &snapshot_id),
        Command::Gc => {
            let collected = Workspace::open(root)?.gc()?;
            println!("collected {} snapshot(s)", collected.len());
            for id in collected {
                println!("  {id}");
            }
            Ok(exit_codes::OK)
        }
        Command::Quarantine { command } => cmd_quarantine(root, command),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_warden(root, &InitOptions { force })?;
    println!("initialized {}", paths.warden_dir.display());
    Ok(exit_codes::OK)
}

async fn cmd_cycle(root: &Path, dry_run: bool) -> Result<i32> {
    let workspace = Workspace::open(root)?;
    let outcome = workspace.heartbeat()?.run_cycle(dry_run).await?;
    let summary = &outcome.summary;
    if summary.halted {
        println!("cycle {}: halted (kill-switch engaged)", summary.cycle_id);
        return Ok(outcome.exit_code());
    }
    for report in &outcome.reports {
        println!(
            "{}  {:<16} {:<15} {}",
            report.task_id, report.task_type, report.final_status, report.rationale
        );
    }
    println!(
        "cycle {}{}: discovered {}, succeeded {}, failed {}, escalated {}, blocked {}, rolled back {}, rollback failed {}, deferred {}",
        summary.cycle_id,
        if dry_run { " (dry run)" } else { "" },
        summary.discovered,
        summary.succeeded,
        summary.failed,
        summary.escalated,
        summary.blocked,
        summary.rolled_back,
        summary.rollback_failed,
        summary.deferred,
    );
    if summary.write_back_failures > 0 {
        println!(
            "  {} task status(es) could not be written back and stay pending",
            summary.write_back_failures
        );
    }
    Ok(outcome.exit_code())
}

fn load_target(root: &Path, target: &TaskTarget) -> Result<Task> {
    match (&target.id, &target.file) {
        (Some(id), _) => Workspace::open(root)?.task(id),
        (None, Some(file)) => read_task_file(file),
        (None, None) => Err(anyhow!("either --id or --file is required")),
    }
}

fn cmd_score(root: &Path, target: &TaskTarget) -> Result<i32> {
    let task = load_target(root, target)?;
    print!("{}", explain(&score_task(&task)));
    Ok(exit_codes::OK)
}

fn cmd_decide(root: &Path, target: &TaskTarget, sandbox_score: Option<u8>) -> Result<i32> {
    let task = load_target(root, target)?;
    let profile = if WardenPaths::new(root).warden_dir.is_dir() {
        Workspace::open(root)?.profile()?.clone()
    } else {
        Profile::autonomous()
    };
    let (assessment, decision) = decide_task(&task, sandbox_score, &profile);
    println!(
        "task {}: risk {} ({}) -> {}",
        task.id, assessment.score, assessment.level, decision.outcome
    );
    println!("  {}", decision.rationale);
    if let Some(threshold) = decision.sandbox_threshold {
        println!("  sandbox threshold: {threshold}");
    }
    if let Some(target) = &decision.escalation_target {
        println!("  escalation target: {target}");
    }
    Ok(exit_codes::OK)
}

fn cmd_snapshots(root: &Path, limit: Option<usize>) -> Result<i32> {
    let snapshots = Workspace::open(root)?.snapshots(limit)?;
    if snapshots.is_empty() {
        println!("no snapshots");
    }
    for snapshot in snapshots {
        println!(
            "{}  {}  task {}  {} resource(s)",
            snapshot.id,
            snapshot.created_at.to_rfc3339(),
            snapshot.task_id,
            snapshot.resources.len()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_rollback(root: &Path, snapshot_id: &str) -> Result<i32> {
    let report = Workspace::open(root)?.rollback(snapshot_id)?;
    println!(
        "restored {} resource(s) from {}",
        report.restored.len(),
        report.snapshot_id
    );
    for resource in &report.restored {
        println!("  {resource}");
    }
    Ok(exit_codes::OK)
}

fn cmd_verify(root: &Path, snapshot_id: &str) -> Result<i32> {
    let report = Workspace::open(root)?.verify(snapshot_id)?;
    let rendered = serde_json::to_string_pretty(&report).context("serialize verify report")?;
    println!("{rendered}");
    if report.matches {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::DRIFT)
    }
}

fn cmd_quarantine(root: &Path, command: QuarantineCommand) -> Result<i32> {
    let workspace = Workspace::open(root)?;
    match command {
        QuarantineCommand::List => {
            let entries = workspace.quarantined()?;
            if entries.is_empty() {
                println!("no quarantined resources");
            }
            for entry in entries {
                println!(
                    "{}  task {}  snapshot {}  since {}  {}",
                    entry.resource,
                    entry.task_id,
                    entry.snapshot_id,
                    entry.since.to_rfc3339(),
                    entry.reason
                );
            }
        }
        QuarantineCommand::Clear { resource } => {
            workspace.clear_quarantine(&resource)?;
            println!("released {resource}");
        }
    }
    Ok(exit_codes::OK)
}
