#![forbid(unsafe_code)]

//! `camfleet-agent`: recording agent binary.
//!
//! Registers with the coordinator, restores journaled sessions, then
//! polls for commands and supervises capture processes until a shutdown
//! signal arrives. Failing to register is fatal.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use camfleet::orchestrator::coordinator::CoordinatorClient;
use camfleet::orchestrator::runner::{self, Cadence};
use camfleet::orchestrator::session_manager::SessionManager;
use camfleet::orchestrator::supervisor::CommandSupervisor;
use camfleet::orchestrator::uploader::UploadPipeline;
use camfleet::persistence::db;
use camfleet::persistence::recording_repo::RecordingRepo;
use camfleet::{AgentConfig, AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "camfleet-agent", about = "Camera fleet recording agent", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured device identifier.
    #[arg(long)]
    device_id: Option<String>,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to build tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "agent stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = AgentConfig::load_from_path(&args.config)?;
    if let Some(device_id) = args.device_id {
        config.device_id = device_id;
        config.validate()?;
    }
    config.load_credentials().await?;

    tokio::fs::create_dir_all(&config.temp_dir)
        .await
        .map_err(|err| AppError::Config(format!("cannot create temp_dir: {err}")))?;

    let cameras: Vec<&str> = config.cameras.keys().map(String::as_str).collect();
    info!(
        device_id = %config.device_id,
        version = %config.version,
        coordinator = %config.central_server,
        cameras = ?cameras,
        "camfleet agent starting"
    );
    let config = Arc::new(config);

    // ── Register ────────────────────────────────────────
    let client = CoordinatorClient::new(&config)?;
    client.register(&config).await.map_err(|err| {
        error!(%err, "registration failed");
        err
    })?;

    // ── Restore sessions ────────────────────────────────
    let journal_db = Arc::new(db::connect(&config.journal_path()).await?);
    let supervisor = Arc::new(CommandSupervisor::new(config.capture.clone()));
    let uploads = UploadPipeline::new(Arc::new(client.clone()));
    let mut manager = SessionManager::new(Arc::clone(&config), supervisor, uploads)
        .with_journal(RecordingRepo::new(journal_db));
    if let Err(err) = manager.restore().await {
        warn!(%err, "could not restore journaled sessions");
    }

    // ── Poll until shutdown ─────────────────────────────
    let ct = CancellationToken::new();
    let cadence = Cadence {
        check_interval: config.check_interval(),
        error_backoff: config.error_backoff(),
    };

    let signal_ct = ct.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_ct.cancel();
    });

    runner::run(&mut manager, &client, cadence, ct).await;

    info!("camfleet agent shut down");
    Ok(())
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
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
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
