//! Periodic driver loop
//!
//! Starts a pipeline cycle on every tick. A slow cycle does not delay the
//! next one; overlapping cycles share the orchestrator's claims and worker
//! pool, so they never work on the same entry twice.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::orchestrator::{CycleSummary, Orchestrator};

/// Run cycles every `interval` until shutdown is signalled
///
/// In-flight cycles are awaited before returning; their download polls
/// stop at the shutdown signal and resume on the next start.
pub async fn run(orchestrator: Orchestrator, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles: JoinSet<anyhow::Result<CycleSummary>> = JoinSet::new();

    info!("Polling feeds every {}s", interval.as_secs());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let orchestrator = orchestrator.clone();
                cycles.spawn(async move { orchestrator.run_cycle().await });
            }
            Some(joined) = cycles.join_next(), if !cycles.is_empty() => log_cycle(joined),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    if !cycles.is_empty() {
        info!("Waiting for {} running cycle(s) to stop", cycles.len());
    }
    while let Some(joined) = cycles.join_next().await {
        log_cycle(joined);
    }
    info!("Tracker stopped");
}

fn log_cycle(joined: Result<anyhow::Result<CycleSummary>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(summary)) if summary.new_entries > 0 => {
            info!(
                "Cycle found {} new entries, advanced {}",
                summary.new_entries, summary.processed
            )
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!("Cycle failed: {:?}", e),
        Err(e) => error!("Cycle task panicked: {:?}", e),
    }
}
