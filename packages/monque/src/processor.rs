//! Executes claimed jobs and applies the resulting state transitions.
//!
//! Handler failures become recorded attempts with exponential backoff;
//! panicking handlers are contained the same way and additionally reported
//! as unexpected errors. Store failures while recording an outcome never
//! crash the scheduler: the lease eventually expires and another instance
//! recovers the job.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::events::JobEvent;
use crate::job::{backoff_delay, run_at_after, Job};
use crate::monque::Core;
use crate::registry::Worker;
use crate::store::FailureUpdate;

/// Run one claimed job to completion and release its slot.
pub(crate) async fn process(core: Arc<Core>, worker: Arc<Worker>, job: Job) {
    let job_id = job.id;
    let started = Instant::now();

    core.events.emit(JobEvent::Started { job: job.clone() });
    debug!(job_id = %job_id, name = %job.name, "job started");

    // A spawned task contains handler panics as JoinErrors.
    let handler = Arc::clone(&worker.handler);
    let handler_job = job.clone();
    let outcome = tokio::spawn(async move { handler.execute(handler_job).await }).await;

    match outcome {
        Ok(Ok(())) => {
            complete_job(&core, &job, started.elapsed().as_millis() as u64).await;
        }
        Ok(Err(err)) => {
            fail_job(&core, &job, format!("{err:#}")).await;
        }
        Err(join_err) => {
            let reason = if join_err.is_panic() {
                format!("handler panicked: {join_err}")
            } else {
                format!("handler task failed: {join_err}")
            };
            core.events.emit(JobEvent::Errored {
                error: reason.clone(),
                job_id: Some(job_id),
                incomplete_jobs: Vec::new(),
            });
            error!(job_id = %job_id, name = %job.name, error = %reason, "unexpected handler error");
            fail_job(&core, &job, reason).await;
        }
    }

    core.registry.finish(&worker, job_id);
}

/// Success path: recurring jobs go back to pending at their next occurrence
/// with counters reset; one-time jobs complete, keeping `fail_count` as a
/// historical record.
async fn complete_job(core: &Arc<Core>, job: &Job, duration_ms: u64) {
    let instance_id = core.config.instance_id.as_str();

    let result = if job.is_recurring() {
        // Reference time is "now": a handler that runs late shifts the
        // schedule forward by its tardiness.
        match job.next_occurrence(Utc::now()) {
            Ok(Some(next_run_at)) => {
                core.store
                    .complete_recurring(job.id, instance_id, next_run_at)
                    .await
            }
            Ok(None) => {
                warn!(job_id = %job.id, "recurring job has no future occurrence; completing");
                core.store.complete(job.id, instance_id).await
            }
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "stored cron no longer parses; completing");
                core.store.complete(job.id, instance_id).await
            }
        }
    } else {
        core.store.complete(job.id, instance_id).await
    };

    match result {
        Ok(Some(updated)) => {
            debug!(job_id = %job.id, name = %job.name, duration_ms, "job completed");
            core.events.emit(JobEvent::Completed {
                job: updated,
                duration_ms,
            });
        }
        Ok(None) => {
            warn!(job_id = %job.id, "lease lost before completion could be recorded");
        }
        Err(err) => {
            error!(job_id = %job.id, error = %err, "failed to record job completion");
            core.events.emit(JobEvent::Errored {
                error: err.to_string(),
                job_id: Some(job.id),
                incomplete_jobs: Vec::new(),
            });
        }
    }
}

/// Failure path: either schedule a retry with exponential backoff or mark
/// the job terminally failed.
async fn fail_job(core: &Arc<Core>, job: &Job, reason: String) {
    let new_fail_count = job.fail_count + 1;
    // Computed against the fail count at the moment of failure; observers
    // must not re-derive this from the updated record.
    let will_retry = new_fail_count < core.config.max_retries;

    let retry_at = if will_retry {
        let delay = backoff_delay(
            new_fail_count,
            core.config.base_retry_interval,
            core.config.max_backoff_delay,
        );
        Some(run_at_after(Utc::now(), delay))
    } else {
        None
    };

    let update = FailureUpdate {
        fail_count: new_fail_count,
        fail_reason: reason.clone(),
        retry_at,
    };

    match core
        .store
        .fail(job.id, core.config.instance_id.as_str(), update)
        .await
    {
        Ok(Some(updated)) => {
            warn!(
                job_id = %job.id,
                name = %job.name,
                fail_count = new_fail_count,
                will_retry,
                error = %reason,
                "job failed"
            );
            core.events.emit(JobEvent::Failed {
                job: updated,
                error: reason,
                will_retry,
            });
        }
        Ok(None) => {
            warn!(job_id = %job.id, "lease lost before failure could be recorded");
        }
        Err(err) => {
            error!(job_id = %job.id, error = %err, "failed to record job failure");
            core.events.emit(JobEvent::Errored {
                error: err.to_string(),
                job_id: Some(job.id),
                incomplete_jobs: Vec::new(),
            });
        }
    }
}
