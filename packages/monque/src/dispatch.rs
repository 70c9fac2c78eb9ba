//! Claim engine and dispatch loop.
//!
//! One loop per instance: it wakes on the polling interval or on a debounced
//! kick from the change listener, then attempts claims for every registered
//! worker until slots or eligible jobs run out. The store's atomic claim is
//! the only serialization point; under contention exactly one instance wins
//! any given record.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::events::JobEvent;
use crate::monque::Core;
use crate::processor;

/// Poll-and-claim loop. The first tick fires immediately, so startup always
/// begins with a claim cycle.
pub(crate) async fn run(core: Arc<Core>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(core.config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {},
            _ = core.kick.notified() => {},
        }
        claim_cycle(&core, &cancel).await;
    }

    debug!("dispatch loop stopped");
}

/// Attempt claims for every registered worker, bounded by per-worker slots
/// and the optional instance-wide cap. Aborts as soon as shutdown starts,
/// even mid-attempt.
pub(crate) async fn claim_cycle(core: &Arc<Core>, cancel: &CancellationToken) {
    for worker in core.registry.workers() {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            if let Some(cap) = core.config.instance_concurrency {
                if core.registry.total_active() >= cap {
                    return;
                }
            }
            if worker.active_count() >= worker.concurrency {
                break;
            }

            let claimed = core
                .store
                .claim_one(
                    &worker.name,
                    &core.config.instance_id,
                    core.config.heartbeat_interval,
                )
                .await;

            match claimed {
                Ok(Some(job)) => {
                    if cancel.is_cancelled() {
                        // The claim landed after shutdown began. Leave the
                        // record processing; lease recovery returns it.
                        warn!(job_id = %job.id, "claim landed during shutdown; leaving for lease recovery");
                        return;
                    }
                    core.registry.begin(&worker, job.id);
                    tokio::spawn(processor::process(
                        Arc::clone(core),
                        Arc::clone(&worker),
                        job,
                    ));
                }
                Ok(None) => break,
                Err(err) => {
                    error!(worker = %worker.name, error = %err, "failed to claim job");
                    core.events.emit(JobEvent::Errored {
                        error: err.to_string(),
                        job_id: None,
                        incomplete_jobs: Vec::new(),
                    });
                    break;
                }
            }
        }
    }
}
