//! In-process scheduler: periodic fleet passes without an external cron

use log::{error, info, warn};
use salesync::FleetDriver;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Upper bound on the wait between passes, so user requests are picked up
/// even with long sync intervals
const MAX_TICK: Duration = Duration::from_secs(60);

pub fn tick_for(sync_interval_secs: u64) -> Duration {
    Duration::from_secs(sync_interval_secs.max(1)).min(MAX_TICK)
}

/// Run fleet passes every `tick` until `shutdown` flips to true or its
/// sender is dropped
pub async fn run(fleet: Arc<FleetDriver>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
    info!("Scheduler started (tick {:?})", tick);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(tick) => {
                let fleet = fleet.clone();
                match tokio::task::spawn_blocking(move || fleet.run_due()).await {
                    Ok(Ok(summary)) if summary.is_total_failure() => {
                        warn!("Scheduled pass failed for every account: {:?}", summary.errors);
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!("Scheduled pass failed: {}", e),
                    Err(e) => error!("Scheduled pass panicked: {}", e),
                }
            }
        }
    }
    info!("Scheduler stopped");
}
