//! Periodic database health check.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::Database;

/// Ping the pool every `period` until `cancel` fires.
///
/// Failures are logged; the checker keeps running so it notices recovery.
pub fn spawn_health_checker(
    db: Database,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(period_secs = period.as_secs(), "Database health checker started");

        let mut timer = tokio::time::interval(period);
        // First tick completes immediately; the pool was just verified on open.
        timer.tick().await;
        let mut healthy = true;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = timer.tick() => {
                    match db.ping().await {
                        Ok(()) => {
                            if !healthy {
                                info!("Database connection recovered");
                            }
                            healthy = true;
                            debug!("Database health check OK");
                        }
                        Err(e) => {
                            healthy = false;
                            warn!(error = %e, "Database health check failed");
                        }
                    }
                }
            }
        }

        debug!("Database health checker stopped");
    })
}
