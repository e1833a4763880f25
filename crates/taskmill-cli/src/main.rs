use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use taskmill_core::{StoreKind, TaskmillConfig};
use taskmill_scheduler::{
    EntityRecordLoader, LocalRecordLoader, RecordLoader, Scheduler, SchedulerDaemon, StoredRecord,
};
use tracing::{info, warn};

mod tasks;

#[derive(Parser)]
#[command(name = "taskmill")]
#[command(about = "Run recurring tasks and keep a durable record of every run")]
#[command(version)]
struct Cli {
    /// Config file. Falls back to $TASKMILL_CONFIG, then ~/.taskmill/taskmill.toml
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Evaluate every task once and exit
    Tick,
    /// Tick on a fixed cadence until interrupted
    Daemon {
        /// Seconds between ticks (overrides scheduler.tick_secs)
        #[arg(long)]
        every: Option<u64>,
    },
    /// Show the stored record of every task
    Status {
        /// Print rows as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show when each configured task is next eligible to run
    Next,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskmill=info,taskmill_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: explicit path > TASKMILL_CONFIG env > ~/.taskmill/taskmill.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("TASKMILL_CONFIG").ok());
    let config = TaskmillConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        TaskmillConfig::default()
    });

    match cli.command {
        Cmd::Tick => tick(&config),
        Cmd::Daemon { every } => daemon(&config, every).await,
        Cmd::Status { json } => status(&config, json),
        Cmd::Next => next(&config),
    }
}

fn tick(config: &TaskmillConfig) -> anyhow::Result<()> {
    let scheduler = build_scheduler(config)?;
    let loader = open_loader(config)?;
    let report = scheduler
        .run(loader.as_ref())
        .context("tick aborted: record store write failed")?;

    if let Some(reason) = &report.blocked {
        println!("tick blocked: {reason}");
        return Ok(());
    }
    for task in &report.tasks {
        let recovered = if task.recovered { " (recovered stale run)" } else { "" };
        println!("{:<24} {:?}{recovered}", task.identity.as_str(), task.outcome);
    }
    println!(
        "{} evaluated, {} ran, {} failed, {} skipped",
        report.tasks.len(),
        report.ran(),
        report.failed(),
        report.skipped()
    );
    Ok(())
}

async fn daemon(config: &TaskmillConfig, every: Option<u64>) -> anyhow::Result<()> {
    let secs = every.unwrap_or(config.scheduler.tick_secs);
    anyhow::ensure!(secs > 0, "tick interval must be greater than zero");

    let scheduler = build_scheduler(config)?;
    let loader = open_loader(config)?;
    let daemon = SchedulerDaemon::new(scheduler, loader, Duration::from_secs(secs));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(daemon.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("interrupt received, stopping after the current tick");

    // signal the loop to stop
    let _ = shutdown_tx.send(true);
    let ticks = handle.await?;
    info!(ticks, "daemon stopped");
    Ok(())
}

fn status(config: &TaskmillConfig, json: bool) -> anyhow::Result<()> {
    if config.scheduler.store == StoreKind::Local {
        println!("local store keeps no records between runs; nothing to show");
        return Ok(());
    }
    let loader = open_entity(config)?;
    let rows = loader.list_records()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("no records yet");
        return Ok(());
    }
    println!(
        "{:<24} {:<9} {:<20} {:>10}  MESSAGE",
        "IDENTITY", "STATUS", "LAST RUN", "DURATION"
    );
    for row in &rows {
        print_row(row);
    }
    Ok(())
}

fn print_row(row: &StoredRecord) {
    let duration = row
        .execute_duration
        .map(|d| format!("{d:.2}s"))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<24} {:<9} {:<20} {:>10}  {}",
        row.identity,
        row.status.to_string(),
        format_ts(row.execution_time),
        duration,
        row.message.payload().unwrap_or("")
    );
}

fn next(config: &TaskmillConfig) -> anyhow::Result<()> {
    let scheduler = build_scheduler(config)?;
    let loader = open_loader(config)?;
    let now = scheduler.now();

    for task in scheduler.tasks() {
        let last = loader
            .get_record(task.as_ref())?
            .map_or(0, |r| r.last_execution_time());
        let time = task.definition().time();
        let next = time
            .next_run_date(now, last, None)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S %:z").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!("{:<24} {:<28} {}", task.identity().as_str(), next, time.describe());
    }
    Ok(())
}

fn build_scheduler(config: &TaskmillConfig) -> anyhow::Result<Scheduler> {
    if config.tasks.is_empty() {
        warn!("no tasks configured");
    }
    tasks::build_scheduler(Scheduler::new(), &config.tasks).context("invalid task configuration")
}

fn open_loader(config: &TaskmillConfig) -> anyhow::Result<Box<dyn RecordLoader>> {
    let loader: Box<dyn RecordLoader> = match config.scheduler.store {
        StoreKind::Local => Box::new(LocalRecordLoader::new()),
        StoreKind::Entity => Box::new(open_entity(config)?),
    };
    Ok(loader)
}

fn open_entity(config: &TaskmillConfig) -> anyhow::Result<EntityRecordLoader> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening record store");
    EntityRecordLoader::open(db_path).with_context(|| format!("cannot open {db_path}"))
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

fn format_ts(ts: i64) -> String {
    if ts <= 0 {
        return "never".to_string();
    }
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
