//! Storage seam between the scheduler core and the database.
//!
//! The `JobStore` trait abstracts everything the core needs from the store:
//! atomic claims, conditional state transitions, bulk updates, filtered
//! reads, stats, and an optional change-notification stream.
//!
//! - Production: [`PostgresJobStore`](crate::PostgresJobStore)
//! - Testing: [`MemoryJobStore`](crate::testing::MemoryJobStore)
//!
//! Every mutation that can race (claim, complete, fail, operator
//! transitions) is a single conditional update whose filter encodes the
//! expected source state; the store is the only serialization point in the
//! system.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::job::{Job, JobStatus};

/// Filter over job records shared by queries and bulk operations.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Restrict to a worker name.
    pub name: Option<String>,
    /// Restrict to any of these statuses. Empty means all.
    pub statuses: Vec<JobStatus>,
}

impl JobFilter {
    /// Filter by worker name.
    pub fn name(name: impl Into<String>) -> Self {
        JobFilter {
            name: Some(name.into()),
            statuses: Vec::new(),
        }
    }

    /// Filter by a single status.
    pub fn status(status: JobStatus) -> Self {
        JobFilter {
            name: None,
            statuses: vec![status],
        }
    }

    /// Add a status to the filter.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    /// Whether a record matches this filter.
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(name) = &self.name {
            if &job.name != name {
                return false;
            }
        }
        self.statuses.is_empty() || self.statuses.contains(&job.status)
    }
}

/// Operator-initiated conditional transitions.
#[derive(Debug, Clone)]
pub enum Transition {
    /// `pending -> cancelled`.
    Cancel,
    /// `failed | cancelled -> pending`, eligible immediately, counters reset.
    Retry,
    /// `pending -> pending` with a new run time.
    Reschedule { run_at: DateTime<Utc> },
}

/// Outcome persisted by a failed attempt.
#[derive(Debug, Clone)]
pub struct FailureUpdate {
    /// New cumulative failure count.
    pub fail_count: i32,
    /// Error message from the handler.
    pub fail_reason: String,
    /// When to retry. `None` means the attempt was terminal and the job
    /// moves to `failed`.
    pub retry_at: Option<DateTime<Utc>>,
}

/// Aggregated queue statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Average `updated_at - locked_at` over completed records that still
    /// carry `locked_at`, in milliseconds.
    pub avg_processing_ms: Option<f64>,
}

/// Kind of change observed on the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
}

/// A change notification from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobChange {
    pub op: ChangeOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

impl JobChange {
    /// Whether this change should trigger a claim cycle: a fresh insert, or
    /// an update that put a job back into `pending`.
    pub fn wakes_dispatch(&self) -> bool {
        match self.op {
            ChangeOp::Insert => true,
            ChangeOp::Update => self.status == Some(JobStatus::Pending),
        }
    }
}

/// Stream of change notifications. Ends or errors when the underlying
/// subscription drops; the listener reconnects with backoff.
pub type JobChangeStream = BoxStream<'static, Result<JobChange>>;

/// Abstract store operations the scheduler core relies on.
///
/// All operations are asynchronous and may fail with
/// [`MonqueError::Connection`](crate::MonqueError::Connection).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create the schema and indexes idempotently.
    async fn prepare(&self) -> Result<()>;

    /// Insert a record as-is.
    async fn insert(&self, job: Job) -> Result<Job>;

    /// Insert with `(name, unique_key)` deduplication: if a pending or
    /// processing record with the same key exists, it is returned unchanged
    /// instead of inserting.
    async fn insert_unique(&self, job: Job) -> Result<Job>;

    /// Fetch a record by id.
    async fn find(&self, id: Uuid) -> Result<Option<Job>>;

    /// Atomically claim the oldest eligible pending job for `name`, moving it
    /// to `processing` with lease fields set. Returns `None` when nothing is
    /// eligible. Exactly one concurrent caller wins any given record.
    async fn claim_one(
        &self,
        name: &str,
        instance_id: &str,
        heartbeat_interval: Duration,
    ) -> Result<Option<Job>>;

    /// Finish a one-time job successfully: `processing -> completed`, lease
    /// fields and `fail_reason` cleared, `fail_count` preserved. Conditional
    /// on the caller still holding the lease; returns the post-image or
    /// `None` if the lease was lost.
    async fn complete(&self, id: Uuid, instance_id: &str) -> Result<Option<Job>>;

    /// Finish a recurring job successfully: back to `pending` at
    /// `next_run_at`, `fail_count` reset to zero, lease fields and
    /// `fail_reason` cleared. Same lease condition as [`complete`].
    ///
    /// [`complete`]: JobStore::complete
    async fn complete_recurring(
        &self,
        id: Uuid,
        instance_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// Record a failed attempt. With `retry_at` set the job returns to
    /// `pending`; otherwise it becomes terminally `failed`. Same lease
    /// condition as [`complete`](JobStore::complete).
    async fn fail(&self, id: Uuid, instance_id: &str, update: FailureUpdate)
        -> Result<Option<Job>>;

    /// Refresh `last_heartbeat` on every processing job this instance holds.
    /// Returns the number of records touched.
    async fn heartbeat(&self, instance_id: &str) -> Result<u64>;

    /// Return processing jobs whose lease predates `cutoff` to `pending`,
    /// clearing lease fields. Returns the number of records recovered.
    async fn recover_stale(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Delete completed records older than `completed_before` and failed
    /// records older than `failed_before` (by `updated_at`).
    async fn sweep(
        &self,
        completed_before: Option<DateTime<Utc>>,
        failed_before: Option<DateTime<Utc>>,
    ) -> Result<u64>;

    /// Conditionally transition a single record. The filter includes the
    /// expected source statuses; `None` means no record matched (wrong state
    /// or a concurrent transition) and the caller decides how to report it.
    async fn transition(
        &self,
        id: Uuid,
        expected: &[JobStatus],
        transition: Transition,
    ) -> Result<Option<Job>>;

    /// Delete a record in any state. Returns whether a record was removed.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Delete every record matching the filter.
    async fn delete_many(&self, filter: &JobFilter) -> Result<u64>;

    /// Filtered listing ordered by `next_run_at` ascending.
    async fn list(&self, filter: &JobFilter, limit: usize, skip: usize) -> Result<Vec<Job>>;

    /// Key-set page ordered by `id`. Forward returns ids greater than the
    /// anchor ascending; backward returns ids less than the anchor in
    /// descending order (callers reverse for presentation).
    async fn page_by_id(
        &self,
        filter: &JobFilter,
        anchor: Option<Uuid>,
        limit: usize,
        backward: bool,
    ) -> Result<Vec<Job>>;

    /// Aggregated stats, optionally restricted to one worker name.
    async fn stats(&self, name: Option<&str>) -> Result<QueueStats>;

    /// Subscribe to change notifications. Implementations without a
    /// notification mechanism return `supports_watch() == false` and are
    /// served by polling alone.
    async fn watch(&self) -> Result<JobChangeStream>;

    /// Whether [`watch`](JobStore::watch) is expected to work.
    fn supports_watch(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_name_and_status() {
        let job = Job::builder().name("send-email").build();
        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter::name("send-email").matches(&job));
        assert!(!JobFilter::name("other").matches(&job));
        assert!(JobFilter::status(JobStatus::Pending).matches(&job));
        assert!(!JobFilter::status(JobStatus::Failed).matches(&job));
        assert!(JobFilter::status(JobStatus::Failed)
            .with_status(JobStatus::Pending)
            .matches(&job));
    }

    #[test]
    fn inserts_wake_dispatch() {
        let change = JobChange {
            op: ChangeOp::Insert,
            id: None,
            name: None,
            status: Some(JobStatus::Pending),
        };
        assert!(change.wakes_dispatch());
    }

    #[test]
    fn only_pending_updates_wake_dispatch() {
        let mut change = JobChange {
            op: ChangeOp::Update,
            id: None,
            name: None,
            status: Some(JobStatus::Completed),
        };
        assert!(!change.wakes_dispatch());
        change.status = Some(JobStatus::Pending);
        assert!(change.wakes_dispatch());
        change.status = None;
        assert!(!change.wakes_dispatch());
    }

    #[test]
    fn change_payload_roundtrips_through_json() {
        let change = JobChange {
            op: ChangeOp::Insert,
            id: Some(Uuid::new_v4()),
            name: Some("send-email".into()),
            status: Some(JobStatus::Pending),
        };
        let json = serde_json::to_string(&change).unwrap();
        let back: JobChange = serde_json::from_str(&json).unwrap();
        assert_eq!(back.op, ChangeOp::Insert);
        assert_eq!(back.name.as_deref(), Some("send-email"));
    }
}
