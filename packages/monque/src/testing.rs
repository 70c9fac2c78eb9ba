//! In-memory test doubles.
//!
//! [`MemoryJobStore`] implements [`JobStore`] with the same conditional
//! semantics as the Postgres store, serialized under a single lock, so the
//! full scheduler can be exercised in tests without a database. Change
//! notifications are delivered over an in-process broadcast channel, which
//! makes the change-notification dispatch path testable as well.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{MonqueError, Result};
use crate::job::{Job, JobStatus};
use crate::store::{
    ChangeOp, FailureUpdate, JobChange, JobChangeStream, JobFilter, JobStore, QueueStats,
    Transition,
};

/// In-memory [`JobStore`] for tests.
///
/// Cloneable via `Arc`; multiple scheduler instances sharing one
/// `Arc<MemoryJobStore>` behave like multiple processes sharing one
/// collection.
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    changes: broadcast::Sender<JobChange>,
    /// Countdown of claims to fail with a connection error (test hook).
    claim_errors: AtomicUsize,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            jobs: Mutex::new(HashMap::new()),
            changes,
            claim_errors: AtomicUsize::new(0),
        }
    }

    /// Snapshot of every record.
    pub fn jobs(&self) -> Vec<Job> {
        self.lock().values().cloned().collect()
    }

    /// Snapshot of one record.
    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.lock().get(&id).cloned()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Overwrite a record in place (test seeding).
    pub fn put(&self, job: Job) {
        self.lock().insert(job.id, job);
    }

    /// Make the next `count` claims fail with a connection error.
    pub fn induce_claim_errors(&self, count: usize) {
        self.claim_errors.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, change: JobChange) {
        let _ = self.changes.send(change);
    }

    fn change_for(op: ChangeOp, job: &Job) -> JobChange {
        JobChange {
            op,
            id: Some(job.id),
            name: Some(job.name.clone()),
            status: Some(job.status),
        }
    }

    fn clear_lease(job: &mut Job) {
        job.locked_at = None;
        job.claimed_by = None;
        job.last_heartbeat = None;
        job.heartbeat_interval_ms = None;
    }

    fn holds_lease(job: &Job, instance_id: &str) -> bool {
        job.status == JobStatus::Processing && job.claimed_by.as_deref() == Some(instance_id)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn insert(&self, job: Job) -> Result<Job> {
        let change = Self::change_for(ChangeOp::Insert, &job);
        self.lock().insert(job.id, job.clone());
        self.publish(change);
        Ok(job)
    }

    async fn insert_unique(&self, job: Job) -> Result<Job> {
        let key = match &job.unique_key {
            Some(key) => key.clone(),
            None => return self.insert(job).await,
        };
        let change = Self::change_for(ChangeOp::Insert, &job);
        {
            let mut jobs = self.lock();
            if let Some(existing) = jobs.values().find(|j| {
                j.name == job.name
                    && j.unique_key.as_deref() == Some(key.as_str())
                    && matches!(j.status, JobStatus::Pending | JobStatus::Processing)
            }) {
                return Ok(existing.clone());
            }
            jobs.insert(job.id, job.clone());
        }
        self.publish(change);
        Ok(job)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn claim_one(
        &self,
        name: &str,
        instance_id: &str,
        heartbeat_interval: Duration,
    ) -> Result<Option<Job>> {
        if self.claim_errors.load(Ordering::SeqCst) > 0 {
            self.claim_errors.fetch_sub(1, Ordering::SeqCst);
            return Err(MonqueError::connection("induced claim failure"));
        }

        let now = Utc::now();
        let mut jobs = self.lock();
        let candidate = jobs
            .values()
            .filter(|j| {
                j.name == name
                    && j.status == JobStatus::Pending
                    && j.next_run_at <= now
                    && j.claimed_by.is_none()
            })
            .min_by_key(|j| (j.next_run_at, j.id))
            .map(|j| j.id);

        let Some(job) = candidate.and_then(|id| jobs.get_mut(&id)) else {
            return Ok(None);
        };
        job.status = JobStatus::Processing;
        job.claimed_by = Some(instance_id.to_string());
        job.locked_at = Some(now);
        job.last_heartbeat = Some(now);
        job.heartbeat_interval_ms = Some(heartbeat_interval.as_millis() as i64);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: Uuid, instance_id: &str) -> Result<Option<Job>> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !Self::holds_lease(job, instance_id) {
            return Ok(None);
        }
        job.status = JobStatus::Completed;
        job.fail_reason = None;
        Self::clear_lease(job);
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn complete_recurring(
        &self,
        id: Uuid,
        instance_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let updated = {
            let mut jobs = self.lock();
            let Some(job) = jobs.get_mut(&id) else {
                return Ok(None);
            };
            if !Self::holds_lease(job, instance_id) {
                return Ok(None);
            }
            job.status = JobStatus::Pending;
            job.next_run_at = next_run_at;
            job.fail_count = 0;
            job.fail_reason = None;
            Self::clear_lease(job);
            job.updated_at = Utc::now();
            job.clone()
        };
        self.publish(Self::change_for(ChangeOp::Update, &updated));
        Ok(Some(updated))
    }

    async fn fail(
        &self,
        id: Uuid,
        instance_id: &str,
        update: FailureUpdate,
    ) -> Result<Option<Job>> {
        let updated = {
            let mut jobs = self.lock();
            let Some(job) = jobs.get_mut(&id) else {
                return Ok(None);
            };
            if !Self::holds_lease(job, instance_id) {
                return Ok(None);
            }
            job.fail_count = update.fail_count;
            job.fail_reason = Some(update.fail_reason);
            match update.retry_at {
                Some(retry_at) => {
                    job.status = JobStatus::Pending;
                    job.next_run_at = retry_at;
                }
                None => job.status = JobStatus::Failed,
            }
            Self::clear_lease(job);
            job.updated_at = Utc::now();
            job.clone()
        };
        if updated.status == JobStatus::Pending {
            self.publish(Self::change_for(ChangeOp::Update, &updated));
        }
        Ok(Some(updated))
    }

    async fn heartbeat(&self, instance_id: &str) -> Result<u64> {
        let now = Utc::now();
        let mut count = 0;
        for job in self.lock().values_mut() {
            if Self::holds_lease(job, instance_id) {
                job.last_heartbeat = Some(now);
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn recover_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let now = Utc::now();
        let mut count = 0;
        {
            let mut jobs = self.lock();
            for job in jobs.values_mut() {
                let stale = job.status == JobStatus::Processing
                    && job.locked_at.is_some_and(|locked| locked < cutoff);
                if stale {
                    job.status = JobStatus::Pending;
                    Self::clear_lease(job);
                    job.updated_at = now;
                    count += 1;
                }
            }
        }
        if count > 0 {
            self.publish(JobChange {
                op: ChangeOp::Update,
                id: None,
                name: None,
                status: Some(JobStatus::Pending),
            });
        }
        Ok(count)
    }

    async fn sweep(
        &self,
        completed_before: Option<DateTime<Utc>>,
        failed_before: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, job| {
            let expired = match job.status {
                JobStatus::Completed => {
                    completed_before.is_some_and(|cutoff| job.updated_at < cutoff)
                }
                JobStatus::Failed => failed_before.is_some_and(|cutoff| job.updated_at < cutoff),
                _ => false,
            };
            !expired
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: &[JobStatus],
        transition: Transition,
    ) -> Result<Option<Job>> {
        let updated = {
            let mut jobs = self.lock();
            let Some(job) = jobs.get_mut(&id) else {
                return Ok(None);
            };
            if !expected.contains(&job.status) {
                return Ok(None);
            }
            match transition {
                Transition::Cancel => {
                    job.status = JobStatus::Cancelled;
                    Self::clear_lease(job);
                }
                Transition::Retry => {
                    job.status = JobStatus::Pending;
                    job.next_run_at = Utc::now();
                    job.fail_count = 0;
                    job.fail_reason = None;
                    Self::clear_lease(job);
                }
                Transition::Reschedule { run_at } => {
                    job.next_run_at = run_at;
                }
            }
            job.updated_at = Utc::now();
            job.clone()
        };
        if updated.status == JobStatus::Pending {
            self.publish(Self::change_for(ChangeOp::Update, &updated));
        }
        Ok(Some(updated))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.lock().remove(&id).is_some())
    }

    async fn delete_many(&self, filter: &JobFilter) -> Result<u64> {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, job| !filter.matches(job));
        Ok((before - jobs.len()) as u64)
    }

    async fn list(&self, filter: &JobFilter, limit: usize, skip: usize) -> Result<Vec<Job>> {
        let mut matched: Vec<Job> = self
            .lock()
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        matched.sort_by_key(|j| (j.next_run_at, j.id));
        Ok(matched.into_iter().skip(skip).take(limit).collect())
    }

    async fn page_by_id(
        &self,
        filter: &JobFilter,
        anchor: Option<Uuid>,
        limit: usize,
        backward: bool,
    ) -> Result<Vec<Job>> {
        let mut matched: Vec<Job> = self
            .lock()
            .values()
            .filter(|j| filter.matches(j))
            .filter(|j| match anchor {
                None => true,
                Some(anchor) if backward => j.id < anchor,
                Some(anchor) => j.id > anchor,
            })
            .cloned()
            .collect();
        matched.sort_by_key(|j| j.id);
        if backward {
            matched.reverse();
        }
        matched.truncate(limit);
        Ok(matched)
    }

    async fn stats(&self, name: Option<&str>) -> Result<QueueStats> {
        let jobs = self.lock();
        let mut stats = QueueStats::default();
        let mut durations = Vec::new();
        for job in jobs.values() {
            if name.is_some_and(|n| n != job.name) {
                continue;
            }
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => {
                    stats.completed += 1;
                    if let Some(locked_at) = job.locked_at {
                        durations.push((job.updated_at - locked_at).num_milliseconds() as f64);
                    }
                }
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        if !durations.is_empty() {
            stats.avg_processing_ms = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        Ok(stats)
    }

    async fn watch(&self) -> Result<JobChangeStream> {
        let mut rx = self.changes.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(change) => yield Ok(change),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
