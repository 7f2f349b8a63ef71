mod brain;
mod dom;
mod face;
mod hands;
mod prefs;
mod types;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, anyhow};
use clap::Parser;
use dotenvy::dotenv;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use types::{Decision, Hold, LongRunningSighting, TICK_INTERVAL};

/// Watches a chat page in a real Chrome and sends "continue" whenever an
/// assistant response stabilizes while still looking unfinished.
#[derive(Parser, Debug)]
#[command(name = "auto-continuer")]
struct Args {
    /// Chat page to open when a fresh browser is launched.
    #[arg(long)]
    url: Option<String>,

    /// DevTools endpoint of an already-running Chrome to attach to.
    #[arg(long, default_value = "http://127.0.0.1:9222")]
    attach: String,

    /// Override the persisted attempt cap for this run (clamped to 1-100).
    #[arg(long)]
    max_continues: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut store = prefs::Store::open_default()?;
    if let Some(max) = args.max_continues {
        store.set_max(max);
        store.save()?;
    }

    let state = face::start_server(store).await?;
    face::spawn_hotkey_listener(state.clone());

    info!("launching browser");
    let attach = args.attach.clone();
    let session = tokio::task::spawn_blocking(move || hands::BrowserSession::launch(&attach))
        .await
        .map_err(|e| anyhow!("browser launch panicked: {e}"))??;
    let session = Arc::new(session);

    if let Some(url) = args.url {
        let nav = session.clone();
        tokio::task::spawn_blocking(move || nav.navigate(&url))
            .await
            .map_err(|e| anyhow!("navigation panicked: {e}"))??;
    }

    run_loop(session, state).await
}

/// The controller loop: one fixed tick per second, each tick running
/// read -> stabilize -> gate -> decide, and emitting at most one
/// continuation. The blocking DevTools traffic stays off the async runtime.
async fn run_loop(session: Arc<hands::BrowserSession>, state: Arc<face::AppState>) -> Result<()> {
    let (_, max) = state.snapshot();
    let mut monitor = brain::Monitor::new(max);
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("monitoring loop started");
    loop {
        ticker.tick().await;

        let (enabled, max) = state.snapshot();
        monitor.set_max(max);
        monitor.set_enabled(enabled);
        if !enabled {
            continue;
        }

        let tab = session.tab.clone();
        let obs = match tokio::task::spawn_blocking(move || dom::observe(&tab)).await {
            Ok(obs) => obs,
            Err(e) => {
                warn!("observation task failed: {e}");
                continue;
            }
        };

        match monitor.assess(&obs, Instant::now()) {
            Decision::Hold(hold) => state.publish_status(hold.status()),
            Decision::Continue { reason } => {
                state.publish_status(reason.status());

                // Final recheck of the extended-processing affordance before
                // any side effects.
                let tab = session.tab.clone();
                let sighting =
                    tokio::task::spawn_blocking(move || dom::probe_long_running(&tab))
                        .await
                        .unwrap_or_default();
                if sighting == LongRunningSighting::Active {
                    monitor.note_long_running(Instant::now());
                    state.publish_status(Hold::LongRunning.status());
                    continue;
                }

                // The counter moves before delivery: it tracks
                // attempts-initiated, not attempts-confirmed.
                let made = monitor.begin_attempt(Instant::now());
                state.record_attempt(made);

                let tab = session.tab.clone();
                match tokio::task::spawn_blocking(move || hands::send_continue(&tab)).await {
                    Ok(Ok(hands::EmitOutcome::Clicked)) => {
                        monitor.mark_waiting(Instant::now());
                        info!(attempt = made, "continue sent");
                        state.publish_status("Waiting for response...");
                    }
                    Ok(Ok(hands::EmitOutcome::InputMissing)) => {
                        warn!(attempt = made, "no input field found");
                        state.publish_status("No input field found");
                    }
                    Ok(Ok(hands::EmitOutcome::SendMissing)) => {
                        warn!(attempt = made, "no send button found");
                        state.publish_status("No send button found");
                    }
                    Ok(Err(e)) => {
                        warn!(attempt = made, "continue delivery failed: {e:#}");
                        state.publish_status("Error sending continue");
                    }
                    Err(e) => {
                        warn!(attempt = made, "continue task panicked: {e}");
                        state.publish_status("Error sending continue");
                    }
                }
            }
        }
    }
}
