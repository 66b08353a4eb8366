//! Background recovery sweep: replays spilled samples once the queue drains.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::IngestionStage;

/// Run [`IngestionStage::sweep_once`] every `interval` until cancelled.
///
/// Store access is blocking, so each pass runs on the blocking pool.
pub async fn run_sweep_loop(
    stage: Arc<IngestionStage>,
    interval: Duration,
    ttl: Duration,
    shutdown: CancellationToken,
) {
    info!(interval_ms = interval.as_millis() as u64, "overflow sweep started");
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let stage = stage.clone();
        let expire_before = Utc::now()
            .checked_sub_signed(ttl)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        match tokio::task::spawn_blocking(move || stage.sweep_once(expire_before)).await {
            Ok(Ok(report)) if report.replayed > 0 || report.expired > 0 => {
                debug!(replayed = report.replayed, expired = report.expired, "sweep pass");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %e, "overflow sweep failed"),
            Err(e) => error!(error = %e, "overflow sweep task panicked"),
        }
    }
    info!("overflow sweep stopped");
}
