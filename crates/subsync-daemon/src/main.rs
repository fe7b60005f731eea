//! subsync entry point.
//!
//! Loads configuration, wires the SQLite repository, the snapshot file, the
//! interval file and the reload command into a [`SyncCycle`], then either
//! runs one cycle (`once`) or loops until Ctrl-C / SIGTERM (`run`, default).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use subsync_config::{load_layered_yaml, DaemonConfig, SettingsFileInterval};
use subsync_daemon::{run_loop, CommandReloadTrigger, ReloadOutcome, SyncCycle};
use subsync_db::{db_path_from_env_or, SqliteTrafficRepository};
use subsync_reconcile::ProtocolAllowList;
use subsync_snapshot::FileSnapshotStore;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "subsync")]
#[command(about = "Keeps usage of clients sharing a subscription in sync", long_about = None)]
struct Cli {
    /// Layered YAML config paths in merge order (base -> overrides)
    #[arg(long = "config", global = true)]
    config_paths: Vec<PathBuf>,

    /// Fetch and reconcile, log the planned writes, change nothing
    #[arg(long, global = true, default_value_t = false)]
    dry_run: bool,

    #[command(subcommand)]
    cmd: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run cycles until interrupted (default)
    Run,
    /// Run exactly one cycle; exit non-zero if it was abandoned
    Once,
}

type Cycle =
    SyncCycle<SqliteTrafficRepository, FileSnapshotStore, SettingsFileInterval, CommandReloadTrigger>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();
    let cfg = load_layered_yaml(&cli.config_paths).context("load config failed")?;
    let mut cycle = build_cycle(&cfg, cli.dry_run);

    match cli.cmd.unwrap_or(Commands::Run) {
        Commands::Once => {
            let report = cycle.run_cycle().await?;
            if let ReloadOutcome::Failed(reason) = &report.reload {
                warn!(%reason, "cycle completed but reload failed");
            }
            info!(?report, "single cycle done");
        }
        Commands::Run => {
            let summary = run_loop(&mut cycle, cfg.error_backoff(), shutdown_signal()).await;
            info!(cycles = summary.cycles, failed = summary.failed, "stopped");
        }
    }

    Ok(())
}

fn build_cycle(cfg: &DaemonConfig, dry_run: bool) -> Cycle {
    let db_path = db_path_from_env_or(&cfg.db_path);
    info!(
        db = %db_path.display(),
        snapshot = %cfg.snapshot_path.display(),
        settings = %cfg.settings_path.display(),
        policy = cfg.reload.policy.as_str(),
        dry_run,
        "subsync starting"
    );

    let repo = SqliteTrafficRepository::connect_lazy(&db_path, cfg.db_busy_timeout());
    let snapshots = FileSnapshotStore::new(&cfg.snapshot_path, cfg.default_interval());
    let interval = SettingsFileInterval::new(&cfg.settings_path, cfg.default_interval());
    let reload = CommandReloadTrigger::new(cfg.reload.command.clone());

    SyncCycle::new(repo, snapshots, interval, reload)
        .with_protocols(ProtocolAllowList::new(&cfg.protocols))
        .with_policy(cfg.reload.policy)
        .dry_run(dry_run)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Resolves on Ctrl-C, or on SIGTERM where available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
