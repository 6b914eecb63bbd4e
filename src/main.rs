//! # Warden — background task scheduler
//!
//! Usage:
//!   warden run                          # Scheduler loop + admin API
//!   warden list                         # Tasks and their state
//!   warden history <task> --limit 20    # Recent runs
//!   warden trigger <task>               # Run once now (through the lease)
//!   warden set-schedule <task> "0 3 * * 0"
//!   warden validate "@every 15m" --count 5

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;
use warden_core::WardenConfig;
use warden_scheduler::{
    EngineConfig, SchedulerAdmin, SchedulerDb, SchedulerEngine, SystemClock, TaskRegistry,
    builtin, schedule, units,
};

#[derive(Parser)]
#[command(name = "warden", version, about = "⏰ Warden — persistent, lease-safe task scheduler")]
struct Cli {
    /// Config file (default: $WARDEN_CONFIG or ~/.warden/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop and the admin API until Ctrl-C
    Run {
        /// Don't start the admin API even if enabled in config
        #[arg(long)]
        no_gateway: bool,
    },
    /// List registered tasks and their state
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show recent runs of a task
    History {
        task: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Enable a task (recomputes next_run from now)
    Enable { task: String },
    /// Disable a task
    Disable { task: String },
    /// Run a task once now and wait for it to finish
    Trigger { task: String },
    /// Override a task's schedule
    SetSchedule { task: String, schedule: String },
    /// Check a schedule expression and print its next occurrences
    Validate {
        schedule: String,
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose {
        "warden=debug,warden_scheduler=debug,warden_gateway=debug,tower_http=debug"
    } else {
        "warden=info,warden_scheduler=info,warden_gateway=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<WardenConfig> {
    let config = match path {
        Some(p) => WardenConfig::load_from(p),
        None => WardenConfig::load(),
    };
    config.context("failed to load configuration")
}

/// Open the store, build the registry and seed missing task rows.
fn build_engine(config: &WardenConfig) -> Result<Arc<SchedulerEngine>> {
    let sched = &config.scheduler;
    let db_path = sched.resolved_db_path();
    let db = Arc::new(SchedulerDb::open(&db_path)?.with_history_limit(sched.history_limit));
    let clock = Arc::new(SystemClock);

    let mut definitions = units::definitions_from_config(&config.tasks)?;
    let mut names: Vec<String> = definitions.iter().map(|d| d.name.clone()).collect();
    names.push(builtin::RETENTION_TASK.to_string());
    definitions.push(builtin::retention_task(
        db.clone(),
        clock.clone(),
        sched.history_retention_days,
        &sched.retention_schedule,
        names,
    ));

    let registry = Arc::new(TaskRegistry::new(definitions)?);
    let engine_config = EngineConfig::from_config(sched)?;
    tracing::debug!(db = %db_path.display(), holder = %engine_config.holder_id, "opening scheduler");
    let engine = Arc::new(SchedulerEngine::new(registry, db, clock, engine_config));
    let seeded = engine.seed()?;
    if seeded > 0 {
        tracing::info!("🌱 Seeded {seeded} new task(s)");
    }
    Ok(engine)
}

fn fmt_time(t: Option<chrono::DateTime<chrono::Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".into())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Validate { schedule: expr, count } => validate(&config, &expr, count),
        command => run_command(&config, command).await,
    }
}

fn validate(config: &WardenConfig, expr: &str, count: usize) -> Result<()> {
    let tz = schedule::parse_timezone(&config.scheduler.timezone)?;
    schedule::validate(expr)?;
    println!("✅ '{expr}' is valid ({tz})");
    for at in schedule::upcoming(expr, chrono::Utc::now(), tz, count)? {
        println!("   {}", at.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S %Z"));
    }
    Ok(())
}

async fn run_command(config: &WardenConfig, command: Command) -> Result<()> {
    let engine = build_engine(config)?;
    let admin = SchedulerAdmin::new(engine.clone());

    match command {
        Command::Run { no_gateway } => {
            let loop_shutdown = Arc::new(Notify::new());
            let scheduler = tokio::spawn(warden_scheduler::spawn_scheduler(engine.clone(), loop_shutdown.clone()));

            let gateway_shutdown = Arc::new(Notify::new());
            let gateway = if config.gateway.enabled && !no_gateway {
                let gw_config = config.gateway.clone();
                let gw_admin = admin.clone();
                let shutdown = gateway_shutdown.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = warden_gateway::start(&gw_config, gw_admin, shutdown).await {
                        tracing::error!("admin API stopped: {e}");
                    }
                }))
            } else {
                None
            };

            tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
            tracing::info!("received Ctrl-C, shutting down");
            gateway_shutdown.notify_one();
            loop_shutdown.notify_one();
            if let Some(gateway) = gateway {
                gateway.await.ok();
            }
            scheduler.await.context("scheduler task failed")?;
        }
        Command::List { json } => {
            let tasks = admin.list_tasks()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
                return Ok(());
            }
            println!(
                "{:<24} {:<13} {:<16} {:<8} {:<19} {:<19} LAST RESULT",
                "NAME", "CATEGORY", "SCHEDULE", "ENABLED", "LAST RUN", "NEXT RUN"
            );
            for task in tasks {
                let Some(state) = task.state else {
                    println!("{:<24} {:<13} (not seeded)", task.name, task.category.as_str());
                    continue;
                };
                println!(
                    "{:<24} {:<13} {:<16} {:<8} {:<19} {:<19} {}",
                    task.name,
                    task.category.as_str(),
                    state.schedule,
                    state.enabled,
                    fmt_time(state.last_run),
                    fmt_time(Some(state.next_run)),
                    state.last_result.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::History { task, limit, json } => {
            let runs = admin.get_history(&task, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
                return Ok(());
            }
            if runs.is_empty() {
                println!("No runs recorded for '{task}'.");
            }
            for run in runs {
                println!(
                    "{}  {:<10} {:<16} {}",
                    fmt_time(Some(run.started_at)),
                    run.trigger_kind.as_str(),
                    run.outcome.as_str(),
                    run.detail.as_deref().unwrap_or(""),
                );
            }
        }
        Command::Enable { task } => {
            if admin.enable(&task)? {
                println!("▶️  '{task}' enabled");
            } else {
                println!("'{task}' was already enabled");
            }
        }
        Command::Disable { task } => {
            if admin.disable(&task)? {
                println!("⏸️  '{task}' disabled");
            } else {
                println!("'{task}' was already disabled");
            }
        }
        Command::Trigger { task } => {
            let record = admin.trigger(&task)?.await.context("run panicked")??;
            println!(
                "{} '{}' {} in {}ms{}",
                if record.outcome == warden_scheduler::RunOutcome::Success { "✅" } else { "❌" },
                task,
                record.outcome,
                (record.finished_at - record.started_at).num_milliseconds(),
                record.detail.map(|d| format!(": {d}")).unwrap_or_default(),
            );
        }
        Command::SetSchedule { task, schedule: expr } => {
            let state = admin.update_schedule(&task, &expr)?;
            println!("🗓️  '{task}' now runs on '{}'; next run {}", state.schedule, fmt_time(Some(state.next_run)));
        }
        Command::Validate { schedule: expr, count } => validate(config, &expr, count)?,
    }

    Ok(())
}
