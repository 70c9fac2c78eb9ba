//! Operator operations and read queries.
//!
//! Single-job transitions read the record, validate its source state, then
//! perform a conditional atomic update whose filter re-checks the source
//! status. A missing post-image means another actor transitioned the job
//! concurrently and the operation fails with a state error. Bulk variants
//! apply the same logic per record, collecting failures instead of aborting,
//! and emit one batched event.

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{MonqueError, Result};
use crate::events::JobEvent;
use crate::job::{Job, JobStatus};
use crate::monque::Monque;
use crate::pagination::{Cursor, CursorPageOptions, JobPage, PageDirection};
use crate::store::{JobFilter, QueueStats, Transition};

/// Page size used when bulk operations iterate their filter.
const BULK_PAGE_SIZE: usize = 100;

/// Options for [`Monque::get_jobs`].
#[derive(Debug, Clone, TypedBuilder)]
pub struct GetJobsOptions {
    /// Restrict to a worker name.
    #[builder(default, setter(strip_option, into))]
    pub name: Option<String>,

    /// Restrict to any of these statuses. Empty means all.
    #[builder(default)]
    pub statuses: Vec<JobStatus>,

    #[builder(default = 100)]
    pub limit: usize,

    #[builder(default = 0)]
    pub skip: usize,
}

impl Default for GetJobsOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl GetJobsOptions {
    fn filter(&self) -> JobFilter {
        JobFilter {
            name: self.name.clone(),
            statuses: self.statuses.clone(),
        }
    }
}

/// Outcome of a bulk operation: how many records were transitioned, and
/// which ones could not be.
#[derive(Debug, Default)]
pub struct BulkResult {
    pub count: u64,
    pub errors: Vec<BulkError>,
}

/// One record a bulk operation had to skip.
#[derive(Debug)]
pub struct BulkError {
    pub job_id: Uuid,
    pub error: MonqueError,
}

impl Monque {
    // ------------------------------------------------------------------
    // Single-job transitions
    // ------------------------------------------------------------------

    /// Cancel a pending job. Cancelling an already-cancelled job is a no-op
    /// that returns the existing record.
    pub async fn cancel_job(&self, id: Uuid) -> Result<Job> {
        self.ensure_initialized()?;
        let job = self.fetch_required(id).await?;
        match job.status {
            JobStatus::Cancelled => Ok(job),
            JobStatus::Pending => {
                match self
                    .core()
                    .store
                    .transition(id, &[JobStatus::Pending], Transition::Cancel)
                    .await?
                {
                    Some(updated) => {
                        info!(job_id = %id, name = %updated.name, "job cancelled");
                        self.core()
                            .events
                            .emit(JobEvent::Cancelled { job: updated.clone() });
                        Ok(updated)
                    }
                    None => Err(MonqueError::job_state(
                        "Job status changed during cancel attempt",
                    )),
                }
            }
            other => Err(MonqueError::job_state(format!(
                "Cannot cancel job {id} in {other} state"
            ))),
        }
    }

    /// Return a failed or cancelled job to the queue, eligible immediately,
    /// with its failure counters cleared.
    pub async fn retry_job(&self, id: Uuid) -> Result<Job> {
        self.ensure_initialized()?;
        let job = self.fetch_required(id).await?;
        match job.status {
            JobStatus::Failed | JobStatus::Cancelled => {
                match self
                    .core()
                    .store
                    .transition(
                        id,
                        &[JobStatus::Failed, JobStatus::Cancelled],
                        Transition::Retry,
                    )
                    .await?
                {
                    Some(updated) => {
                        info!(job_id = %id, name = %updated.name, "job retried");
                        self.core()
                            .events
                            .emit(JobEvent::Retried { job: updated.clone() });
                        Ok(updated)
                    }
                    None => Err(MonqueError::job_state(
                        "Job status changed during retry attempt",
                    )),
                }
            }
            other => Err(MonqueError::job_state(format!(
                "Cannot retry job {id} in {other} state"
            ))),
        }
    }

    /// Move a pending job to a new run time.
    pub async fn reschedule_job(&self, id: Uuid, run_at: DateTime<Utc>) -> Result<Job> {
        self.ensure_initialized()?;
        let job = self.fetch_required(id).await?;
        match job.status {
            JobStatus::Pending => {
                match self
                    .core()
                    .store
                    .transition(id, &[JobStatus::Pending], Transition::Reschedule { run_at })
                    .await?
                {
                    Some(updated) => {
                        debug!(job_id = %id, run_at = %run_at, "job rescheduled");
                        Ok(updated)
                    }
                    None => Err(MonqueError::job_state(
                        "Job status changed during reschedule attempt",
                    )),
                }
            }
            other => Err(MonqueError::job_state(format!(
                "Cannot reschedule job {id} in {other} state"
            ))),
        }
    }

    /// Remove a job record in any state. Returns whether a record was
    /// deleted.
    pub async fn delete_job(&self, id: Uuid) -> Result<bool> {
        self.ensure_initialized()?;
        let deleted = self.core().store.delete(id).await?;
        if deleted {
            info!(job_id = %id, "job deleted");
            self.core().events.emit(JobEvent::Deleted { job_id: id });
        }
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Bulk operations
    // ------------------------------------------------------------------

    /// Cancel every pending job matching the filter. Records in other states
    /// are reported in the result's `errors`, never aborting the operation.
    pub async fn cancel_jobs(&self, filter: &JobFilter) -> Result<BulkResult> {
        self.ensure_initialized()?;
        let mut result = BulkResult::default();
        let mut cancelled_ids = Vec::new();

        let candidates = self.collect_matching(filter).await?;
        for job in candidates {
            match job.status {
                // Idempotent, like the single-job operation.
                JobStatus::Cancelled => continue,
                JobStatus::Pending => {
                    match self
                        .core()
                        .store
                        .transition(job.id, &[JobStatus::Pending], Transition::Cancel)
                        .await?
                    {
                        Some(_) => {
                            result.count += 1;
                            cancelled_ids.push(job.id);
                        }
                        None => result.errors.push(BulkError {
                            job_id: job.id,
                            error: MonqueError::job_state(
                                "Job status changed during cancel attempt",
                            ),
                        }),
                    }
                }
                other => result.errors.push(BulkError {
                    job_id: job.id,
                    error: MonqueError::job_state(format!(
                        "Cannot cancel job {} in {other} state",
                        job.id
                    )),
                }),
            }
        }

        info!(count = result.count, errors = result.errors.len(), "bulk cancel finished");
        self.core().events.emit(JobEvent::BulkCancelled {
            job_ids: cancelled_ids,
            count: result.count,
        });
        Ok(result)
    }

    /// Retry every failed or cancelled job matching the filter.
    pub async fn retry_jobs(&self, filter: &JobFilter) -> Result<BulkResult> {
        self.ensure_initialized()?;
        let mut result = BulkResult::default();
        let mut retried_ids = Vec::new();

        let candidates = self.collect_matching(filter).await?;
        for job in candidates {
            match job.status {
                JobStatus::Failed | JobStatus::Cancelled => {
                    match self
                        .core()
                        .store
                        .transition(
                            job.id,
                            &[JobStatus::Failed, JobStatus::Cancelled],
                            Transition::Retry,
                        )
                        .await?
                    {
                        Some(_) => {
                            result.count += 1;
                            retried_ids.push(job.id);
                        }
                        None => result.errors.push(BulkError {
                            job_id: job.id,
                            error: MonqueError::job_state(
                                "Job status changed during retry attempt",
                            ),
                        }),
                    }
                }
                other => result.errors.push(BulkError {
                    job_id: job.id,
                    error: MonqueError::job_state(format!(
                        "Cannot retry job {} in {other} state",
                        job.id
                    )),
                }),
            }
        }

        info!(count = result.count, errors = result.errors.len(), "bulk retry finished");
        self.core().events.emit(JobEvent::BulkRetried {
            job_ids: retried_ids,
            count: result.count,
        });
        Ok(result)
    }

    /// Delete every job matching the filter in one statement.
    pub async fn delete_jobs(&self, filter: &JobFilter) -> Result<u64> {
        self.ensure_initialized()?;
        let count = self.core().store.delete_many(filter).await?;
        info!(count, "bulk delete finished");
        self.core().events.emit(JobEvent::BulkDeleted { count });
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Fetch a job by id.
    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        self.ensure_initialized()?;
        self.core().store.find(id).await
    }

    /// Filtered listing ordered by `next_run_at` ascending.
    pub async fn get_jobs(&self, options: GetJobsOptions) -> Result<Vec<Job>> {
        self.ensure_initialized()?;
        self.core()
            .store
            .list(&options.filter(), options.limit, options.skip)
            .await
    }

    /// Key-set paginated listing over job ids.
    pub async fn get_jobs_with_cursor(&self, options: CursorPageOptions) -> Result<JobPage> {
        self.ensure_initialized()?;
        let anchor = options
            .cursor
            .as_deref()
            .map(Cursor::decode)
            .transpose()?
            .map(|cursor| cursor.id);
        let backward = options.direction == PageDirection::Backward;
        let rows = self
            .core()
            .store
            .page_by_id(&options.filter, anchor, options.limit + 1, backward)
            .await?;
        Ok(JobPage::assemble(
            rows,
            options.limit,
            options.direction,
            anchor.is_some(),
        ))
    }

    /// Aggregated queue statistics, optionally restricted to one name.
    pub async fn get_queue_stats(&self, name: Option<&str>) -> Result<QueueStats> {
        self.ensure_initialized()?;
        self.core().store.stats(name).await
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn fetch_required(&self, id: Uuid) -> Result<Job> {
        self.core()
            .store
            .find(id)
            .await?
            .ok_or_else(|| MonqueError::job_state(format!("Job {id} not found")))
    }

    /// Cursor-iterate every record matching the filter.
    async fn collect_matching(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut anchor: Option<Uuid> = None;
        loop {
            let page = self
                .core()
                .store
                .page_by_id(filter, anchor, BULK_PAGE_SIZE, false)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            anchor = Some(last.id);
            let full_page = page.len() == BULK_PAGE_SIZE;
            jobs.extend(page);
            if !full_page {
                break;
            }
        }
        Ok(jobs)
    }
}
