//! # Tally Collector
//!
//! Daemon that keeps one attendance terminal and the Tally database in
//! agreement.
//!
//! ## Commands
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        tally-collector                                  │
//! │                                                                         │
//! │  run          attendance every N s  +  user sync every M s             │
//! │  daily        attendance at HH:MM   +  user sync every M s             │
//! │  pull         one attendance cycle, JSON report on stdout              │
//! │  sync-users   one provisioning cycle, JSON report on stdout            │
//! │  health       storage probe and migration status                       │
//! │                                                                         │
//! │  Ctrl-C / SIGTERM cancels every sleep and backoff; in-flight cycles    │
//! │  finish first.                                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tally_db::{Database, DbConfig};
use tally_sync::terminal::ZkConnector;
use tally_sync::{
    drive, AttendancePuller, BackoffController, CollectorConfig, ProvisioningWorker, Schedule,
    TerminalBroker,
};

/// Attendance terminal sync daemon.
#[derive(Parser)]
#[command(name = "tally-collector")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to collector.toml
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull attendance on an interval and provision users continuously
    Run,

    /// Pull attendance once a day and provision users continuously
    Daily,

    /// Run one attendance cycle and print its report
    Pull,

    /// Run one provisioning cycle and print its report
    SyncUsers,

    /// Check storage and migrations
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = CollectorConfig::load(cli.config).context("Failed to load configuration")?;
    let db = open_database(&config).await?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let result = execute(cli.command, &config, &db, cancel).await;

    db.close().await;
    result
}

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` overrides the default filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn open_database(config: &CollectorConfig) -> anyhow::Result<Database> {
    let path = &config.database.path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let db_config = DbConfig::new(path)
        .max_connections(config.database.max_connections)
        .min_connections(1);
    Database::new(db_config)
        .await
        .with_context(|| format!("Failed to open database at {}", path.display()))
}

async fn execute(
    command: Command,
    config: &CollectorConfig,
    db: &Database,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let broker = TerminalBroker::new(Arc::new(ZkConnector::new(config.zk_options())));
    let retry = BackoffController::new(config.retry.policy(), cancel.clone());

    let puller = AttendancePuller::new(db.clone(), broker.clone(), retry.clone())
        .resolve_user_names(config.terminal.resolve_user_names);
    let worker = ProvisioningWorker::new(db.clone(), broker, retry, config.user_sync.batch_size);

    match command {
        Command::Health => health(db).await?,
        Command::Pull => {
            let report = drive(&puller, Schedule::Once, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::SyncUsers => {
            let report = drive(&worker, Schedule::Once, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Run | Command::Daily => {
            let attendance_schedule = match command {
                Command::Daily => Schedule::Daily {
                    hour: config.attendance.daily_hour,
                    minute: config.attendance.daily_minute,
                },
                _ => Schedule::Interval(config.pull_interval()),
            };
            info!(
                terminal = %puller_address(config),
                schedule = ?attendance_schedule,
                user_sync_every = ?config.user_sync_interval(),
                "Collector started"
            );

            let attendance = tokio::spawn({
                let cancel = cancel.clone();
                async move { drive(&puller, attendance_schedule, &cancel).await }
            });
            let user_sync = tokio::spawn({
                let cancel = cancel.clone();
                let schedule = Schedule::Interval(config.user_sync_interval());
                async move { drive(&worker, schedule, &cancel).await }
            });

            let (attendance, user_sync) = tokio::join!(attendance, user_sync);
            attendance.context("Attendance loop panicked")??;
            user_sync.context("User sync loop panicked")??;
            info!("Collector stopped");
        }
    }

    Ok(())
}

fn puller_address(config: &CollectorConfig) -> String {
    format!("{}:{}", config.terminal.address, config.terminal.port)
}

async fn health(db: &Database) -> anyhow::Result<()> {
    let healthy = db.health_check().await;
    let (total, applied) = db.migration_status().await?;

    let status = serde_json::json!({
        "storage": if healthy { "ok" } else { "unavailable" },
        "migrations_total": total,
        "migrations_applied": applied,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);

    if !healthy {
        bail!("Storage probe failed");
    }
    if applied < total {
        bail!("{} migration(s) pending", total - applied);
    }
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, finishing in-flight cycles...");
}
