//! Producer API: enqueue immediate, delayed, and recurring jobs.

use chrono::{DateTime, Utc};
use tracing::debug;
use typed_builder::TypedBuilder;

use crate::error::{MonqueError, Result};
use crate::job::{parse_cron, Job};
use crate::monque::Monque;

/// Options for [`Monque::enqueue`].
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct EnqueueOptions {
    /// Earliest execution time. Defaults to now.
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,

    /// Deduplication key, scoped with the job name: at most one pending or
    /// processing job per `(name, unique_key)`.
    #[builder(default, setter(strip_option, into))]
    pub unique_key: Option<String>,
}

/// Options for [`Monque::schedule`].
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct ScheduleOptions {
    /// Deduplication key, scoped with the job name.
    #[builder(default, setter(strip_option, into))]
    pub unique_key: Option<String>,
}

impl Monque {
    /// Enqueue a job for execution at `run_at` (default: immediately).
    ///
    /// With a `unique_key`, a second enqueue while the first job is still
    /// pending or processing returns the existing record instead of creating
    /// a duplicate.
    pub async fn enqueue(
        &self,
        name: &str,
        data: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<Job> {
        self.ensure_initialized()?;

        let mut job = Job::builder()
            .name(name)
            .data(data)
            .next_run_at(options.run_at.unwrap_or_else(Utc::now))
            .build();
        job.unique_key = options.unique_key;

        let job = if job.unique_key.is_some() {
            self.core().store.insert_unique(job).await?
        } else {
            self.core().store.insert(job).await?
        };
        debug!(job_id = %job.id, name = %job.name, next_run_at = %job.next_run_at, "job enqueued");
        Ok(job)
    }

    /// Enqueue a job for immediate execution.
    pub async fn now(&self, name: &str, data: serde_json::Value) -> Result<Job> {
        self.enqueue(name, data, EnqueueOptions::default()).await
    }

    /// Create a recurring job from a cron expression.
    ///
    /// The expression is validated up front; the first run lands on its next
    /// fire time. Fails with [`MonqueError::InvalidCron`] on a malformed
    /// expression.
    pub async fn schedule(
        &self,
        cron: &str,
        name: &str,
        data: serde_json::Value,
        options: ScheduleOptions,
    ) -> Result<Job> {
        self.ensure_initialized()?;

        let schedule = parse_cron(cron)?;
        let first_run_at =
            schedule
                .after(&Utc::now())
                .next()
                .ok_or_else(|| MonqueError::InvalidCron {
                    expression: cron.to_string(),
                })?;

        let mut job = Job::builder()
            .name(name)
            .data(data)
            .next_run_at(first_run_at)
            .repeat_interval(cron.to_string())
            .build();
        job.unique_key = options.unique_key;

        let job = if job.unique_key.is_some() {
            self.core().store.insert_unique(job).await?
        } else {
            self.core().store.insert(job).await?
        };
        debug!(
            job_id = %job.id,
            name = %job.name,
            cron = %cron,
            next_run_at = %job.next_run_at,
            "recurring job scheduled"
        );
        Ok(job)
    }
}
