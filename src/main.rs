#![forbid(unsafe_code)]

//! `issue-autopilot` daemon binary.
//!
//! Loads configuration, opens the session store, starts the retention
//! service, and runs the scheduling loop until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use issue_autopilot::config::GlobalConfig;
use issue_autopilot::orchestrator::scheduler::Daemon;
use issue_autopilot::orchestrator::status;
use issue_autopilot::persistence::session_repo::SessionRepo;
use issue_autopilot::persistence::{db, retention};
use issue_autopilot::tracker::gitlab::GitlabTracker;
use issue_autopilot::{AppError, ExecutionMode, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "issue-autopilot",
    about = "Label-driven GitLab agent scheduler",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Project path (`group/repo`); overrides the configured default.
    #[arg(long)]
    project: Option<String>,

    /// Resume stored agent sessions when humans comment.
    #[arg(long)]
    memory: bool,

    /// Log intended actions without touching the tracker, workspace or agent.
    #[arg(long, conflicts_with = "semi_dry_run")]
    dry_run: bool,

    /// Prepare workspaces but never run the agent or mutate the tracker.
    #[arg(long)]
    semi_dry_run: bool,

    /// Print stored sessions and exit.
    #[arg(long)]
    status: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    config.apply_env_overrides();
    if let Some(project) = args.project {
        config.gitlab.project = Some(project);
    }
    if args.memory {
        config.daemon.memory = true;
    }
    if args.dry_run {
        config.mode = ExecutionMode::DryRun;
    } else if args.semi_dry_run {
        config.mode = ExecutionMode::SemiDryRun;
    }

    let db_path = config.db_path()?;
    let db = Arc::new(db::connect(&db_path).await?);
    let store = SessionRepo::new(Arc::clone(&db));
    info!(path = %db_path.display(), "session store opened");

    if args.status {
        let records = store.list_all().await?;
        print!("{}", status::render(&[], &records, Utc::now()));
        return Ok(());
    }

    let project = config
        .gitlab
        .project
        .clone()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| {
            AppError::Config("no project path: pass --project or set gitlab.project".into())
        })?;

    config.load_credentials().await?;
    let tracker = Arc::new(GitlabTracker::new(
        &config.gitlab.url,
        &config.gitlab.token,
        &project,
    )?);
    info!(project = %project, mode = config.mode.tag(), "configuration loaded");

    let retention_window = config.daemon.retention();
    let daemon = Daemon::new(tracker, config, store.clone())?;
    let ct = daemon.cancellation_token();

    let retention_handle = retention::spawn_retention_task(store, retention_window, ct.clone());
    info!("retention service started");

    let signal_ct = ct.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_ct.cancel();
    });

    let outcome = daemon.run().await;
    if let Err(err) = &outcome {
        error!(%err, "daemon loop failed");
    }

    ct.cancel();
    let _ = retention_handle.await;
    db.close().await;
    info!("issue-autopilot shut down");

    outcome
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
