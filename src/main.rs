use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use healthlog::agent::Agent;
use healthlog::clock;
use healthlog::config::Config;
use healthlog::lock::{InstanceLock, LockError};

/// Periodic host health logger: disk metrics, command events and write integrity.
#[derive(Parser)]
#[command(name = "healthlog", about)]
struct Cli {
    /// Path to the YAML configuration file. Built-in defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Run a single cycle and exit.
    #[arg(long)]
    once: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("healthlog {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    // Initialize tracing.
    let level = cli.log_level.as_deref().unwrap_or(cfg.log_level.as_str());
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting healthlog",
    );

    let lock = match InstanceLock::acquire(&cfg.lock.path, cfg.lock.stale_after, clock::now()) {
        Ok(lock) => lock,
        Err(LockError::Held { path, age_secs }) => {
            tracing::info!(
                path = %path.display(),
                age_secs,
                "another instance is running, exiting"
            );
            return Ok(());
        }
        Err(e) => return Err(e).context("acquiring instance lock"),
    };

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg, lock, cli.once).await })
}

async fn run(cfg: Config, lock: InstanceLock, once: bool) -> Result<()> {
    let cancel = CancellationToken::new();

    // Set up signal handling.
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_cancel.cancel();
    });

    let agent = Agent::new(&cfg, lock)?;

    if !cfg.startup_delay.is_zero() {
        tracing::info!(
            seconds = cfg.startup_delay.as_secs(),
            "waiting before the first cycle"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("healthlog stopped before the first cycle");
                return Ok(());
            }
            _ = tokio::time::sleep(cfg.startup_delay) => {}
        }
    }

    agent.run(cancel, once).await?;

    tracing::info!("healthlog stopped");

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                if ctrl_c.await.is_ok() {
                    tracing::info!("received SIGINT, shutting down");
                }
                return;
            }
        };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
