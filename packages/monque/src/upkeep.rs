//! Periodic maintenance: lease heartbeats, stale-lease recovery, and the
//! retention sweep.
//!
//! None of these tasks affect correctness when they fail; they log, emit an
//! error event, and continue on their next tick. Recovery correctness rests
//! on `locked_at`, not on heartbeats.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::events::JobEvent;
use crate::monque::{to_chrono, Core};

/// Refresh `last_heartbeat` on every lease this instance holds.
pub(crate) async fn heartbeat_loop(core: Arc<Core>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(core.config.heartbeat_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await; // Skip the immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match core.store.heartbeat(&core.config.instance_id).await {
            Ok(count) if count > 0 => {
                debug!(count, "refreshed job leases");
            }
            Ok(_) => {}
            Err(err) => {
                error!(error = %err, "heartbeat failed");
                core.events.emit(JobEvent::Errored {
                    error: err.to_string(),
                    job_id: None,
                    incomplete_jobs: Vec::new(),
                });
            }
        }
    }
}

/// Return expired leases to pending. Runs at half the lock timeout; the
/// startup pass in `init()` already covered anything that went stale while
/// the instance was down.
pub(crate) async fn recovery_loop(core: Arc<Core>, cancel: CancellationToken) {
    let period = (core.config.lock_timeout / 2).max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let cutoff = Utc::now() - to_chrono(core.config.lock_timeout);
        match core.store.recover_stale(cutoff).await {
            Ok(count) if count > 0 => {
                info!(count, "recovered stale jobs");
                core.events.emit(JobEvent::StaleRecovered { count });
            }
            Ok(_) => {}
            Err(err) => {
                error!(error = %err, "stale job recovery failed");
                core.events.emit(JobEvent::Errored {
                    error: err.to_string(),
                    job_id: None,
                    incomplete_jobs: Vec::new(),
                });
            }
        }
    }
}

/// Age-based sweep of terminal records. Only spawned when retention is
/// configured.
pub(crate) async fn retention_loop(core: Arc<Core>, cancel: CancellationToken) {
    let Some(retention) = core.config.retention.clone() else {
        return;
    };
    let mut interval = tokio::time::interval(retention.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let now = Utc::now();
        let completed_before = retention.completed.map(|age| now - to_chrono(age));
        let failed_before = retention.failed.map(|age| now - to_chrono(age));

        match core.store.sweep(completed_before, failed_before).await {
            Ok(removed) if removed > 0 => {
                info!(removed, "swept aged terminal jobs");
            }
            Ok(_) => {}
            Err(err) => {
                error!(error = %err, "retention sweep failed");
                core.events.emit(JobEvent::Errored {
                    error: err.to_string(),
                    job_id: None,
                    incomplete_jobs: Vec::new(),
                });
            }
        }
    }
}
