//! enrollment-worker: headless enrollment session reconciler.
//!
//! Connects to the push stream and the event log, optionally starts a
//! session for one member, and logs every session change until SIGINT or
//! SIGTERM (or until the session ends, with `--exit-on-terminal`).

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use enrollsync_core::config::{load_dotenv, Config};
use enrollsync_engine::{Collaborators, EngineError, EnrollmentEngine, SessionChange};

// ── CLI ─────────────────────────────────────────────────────────────

/// Enrollment worker: reconciles push and polled enrollment events.
#[derive(Parser, Debug)]
#[command(name = "enrollment-worker", version, about)]
struct Cli {
    /// Config profile (`{PROFILE}_{KEY}` env overrides).
    #[arg(long, env = "ENROLL_PROFILE", default_value = "")]
    profile: String,

    /// Member to enroll. Without it the worker only observes.
    #[arg(long)]
    member_id: Option<String>,

    /// Display name sent to the device.
    #[arg(long, default_value = "")]
    member_name: String,

    /// Exit once the session reaches a terminal state.
    #[arg(long)]
    exit_on_terminal: bool,

    /// Print the resolved config as JSON and exit.
    #[arg(long)]
    print_config: bool,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::for_profile(&cli.profile);

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config.redacted_summary())?);
        return Ok(());
    }
    config.log_summary();

    let collaborators = Collaborators::http(&config.api)?;
    let engine = EnrollmentEngine::start(&config, collaborators);
    let handle = engine.handle();
    let facade = engine.facade();
    let mut changes = handle.subscribe();

    if let Some(member_id) = &cli.member_id {
        let session = handle.start_session(member_id, &cli.member_name).await?;
        info!(
            member_id = %session.actor_id,
            attempt_id = %session.attempt_id,
            "enrollment requested"
        );
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                match signal {
                    Ok(()) => info!("shutdown signal received"),
                    Err(e) => warn!(error = %e, "signal listener failed, shutting down"),
                }
                if handle.snapshot().status.is_active() {
                    match handle.cancel_session().await {
                        Ok(outcome) => info!(member_id = %outcome.session.actor_id, "session cancelled"),
                        Err(e) => warn!(error = %e, "cancel on shutdown"),
                    }
                }
                break;
            }
            change = changes.recv() => match change {
                Ok(change) => {
                    report(&change);
                    if change.requires_refresh() {
                        facade.refresh().await;
                    }
                    if cli.exit_on_terminal && change.entered_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change listener lagged");
                }
                Err(RecvError::Closed) => {
                    error!("coordinator stopped unexpectedly");
                    break;
                }
            },
        }
    }

    engine.shutdown().await;
    info!("enrollment-worker exited cleanly");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let terminate = sigterm.recv();
    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate => Ok(()),
    }
}

fn report(change: &SessionChange) {
    let current = &change.current;
    let step = current.session.as_ref().and_then(|s| s.current_step.as_deref());
    info!(
        from = %change.previous.status,
        to = %current.status,
        member_id = current.actor_id().unwrap_or("-"),
        step = step.unwrap_or("-"),
        "session changed"
    );

    if let Some(failure) = current.session.as_ref().and_then(EngineError::from_terminal) {
        warn!(error = %failure, "enrollment did not complete");
    }
}
