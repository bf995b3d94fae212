#![forbid(unsafe_code)]

//! `agent-relay`: Slack relay server binary.
//!
//! Bootstraps configuration, the orchestrator actor, the inactivity
//! watchdog, the Slack Socket Mode integration and the agent-facing HTTP
//! API used by `agent-relay-ctl`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_relay::api::{self, ApiState};
use agent_relay::config::GlobalConfig;
use agent_relay::orchestrator::slot::ExecutionSlot;
use agent_relay::orchestrator::spawner::CliLauncher;
use agent_relay::orchestrator::watchdog::{ActivityClock, Watchdog};
use agent_relay::orchestrator::{Engine, EngineDeps, EngineSettings};
use agent_relay::persistence::context::ContextPreamble;
use agent_relay::persistence::session_store::SessionStore;
use agent_relay::slack::{SlackBridge, SlackService};
use agent_relay::{transcription, AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-relay", about = "Slack relay for a resumable agent CLI", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the workspace root the agent runs in.
    #[arg(long)]
    workspace: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;

    if let Some(ws) = args.workspace {
        let canonical = ws
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
        config.default_workspace_root = canonical;
    }

    config.load_credentials().await?;
    let config = Arc::new(config);
    info!(
        workspace = %config.workspace_root().display(),
        session_file = %config.session_file().display(),
        "configuration loaded"
    );

    // ── Build components ────────────────────────────────
    let ct = CancellationToken::new();
    let store = SessionStore::new(config.session_file());
    if let Some(id) = store.read() {
        info!(session_id = id, "resuming stored session on next message");
    }
    let slot = ExecutionSlot::new(config.interrupt_grace());
    let clock = ActivityClock::new(config.watchdog.thresholds_seconds.len());
    let slack = SlackService::new(&config.slack)?;

    let deps = EngineDeps {
        chat: slack.clone(),
        launcher: Arc::new(CliLauncher::from_config(&config)),
        transcriber: transcription::from_config(&config.transcription),
        slot,
        store: store.clone(),
        context: ContextPreamble::new(config.context_file()),
        clock: Arc::clone(&clock),
    };
    let (engine, handle) = Engine::new(EngineSettings::from_config(&config), deps);

    // ── Start background tasks ──────────────────────────
    let watchdog_handle = config.watchdog.enabled.then(|| {
        Watchdog::new(
            clock,
            store,
            config
                .watchdog
                .thresholds_seconds
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
            Duration::from_secs(config.watchdog.poll_interval_seconds),
            engine.watchdog_sender(),
            ct.clone(),
        )
        .spawn()
    });

    let engine_handle = tokio::spawn(engine.run(ct.clone()));

    let socket_handle = slack.start_socket_mode(SlackBridge {
        orchestrator: handle.clone(),
        service: Arc::clone(&slack),
        config: Arc::clone(&config),
        channel_id: config.slack.channel_id.clone(),
        download_dir: config.download_dir(),
    });

    let api_ct = ct.clone();
    let api_state = ApiState {
        orchestrator: handle,
    };
    let http_port = config.http_port;
    let api_handle = tokio::spawn(async move {
        if let Err(err) = api::serve(api_state, http_port, api_ct).await {
            error!(%err, "http api failed");
        }
    });

    info!(http_port, "agent-relay ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    // The engine stops any running agent before it returns.
    if let Err(err) = engine_handle.await {
        error!(%err, "orchestrator task failed");
    }
    let _ = api_handle.await;
    if let Some(watchdog) = watchdog_handle {
        let _ = watchdog.await;
    }
    socket_handle.abort();
    info!("agent-relay shut down");

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
