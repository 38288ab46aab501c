//! Background refresh loop.
//!
//! Keeps the cache warm so interactive reads almost never pay collection
//! latency. Each tick forces a refresh through the same single-flight path
//! readers use, so a tick never stacks a second collection on top of one
//! already running.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::cache::SnapshotCache;

/// Run until cancelled. A refresh already in flight when the token fires
/// finishes on its own driver task; nothing is aborted mid-cycle.
pub async fn run_refresh_loop(cache: SnapshotCache, period: Duration, shutdown: CancellationToken) {
    info!(period_secs = period.as_secs(), "background refresher started");

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; startup warming is handled
    // separately, so skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("background refresher stopped");
                return;
            }
            _ = ticker.tick() => {
                match cache.force_refresh().await {
                    Ok(snapshot) => {
                        debug!(generation = snapshot.generation, stale = snapshot.stale, "background refresh completed");
                    }
                    Err(e) => warn!(error = %e, "background refresh failed"),
                }
            }
        }
    }
}
