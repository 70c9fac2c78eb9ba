//! PostgreSQL-backed job store.
//!
//! Claims are single-row `UPDATE ... RETURNING` statements over a
//! `FOR UPDATE SKIP LOCKED` subselect, so concurrent instances never hand the
//! same record to two workers. Deduplication is enforced by a partial unique
//! index over `(name, unique_key)` restricted to live statuses. Change
//! notifications ride `LISTEN/NOTIFY`; every write that makes a job runnable
//! publishes to the table's channel, and the polling loop remains the safety
//! net for anything a notification misses.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{MonqueError, Result};
use crate::job::{Job, JobStatus};
use crate::store::{
    ChangeOp, FailureUpdate, JobChange, JobChangeStream, JobFilter, JobStore, QueueStats,
    Transition,
};

/// Server-side time limit for the stats aggregation.
const STATS_TIMEOUT_MS: u64 = 30_000;

/// Column list shared by every `SELECT`/`RETURNING`.
const COLUMNS: &str = "id, name, data, status, next_run_at, fail_count, fail_reason, \
     repeat_interval, unique_key, locked_at, claimed_by, last_heartbeat, \
     heartbeat_interval_ms, created_at, updated_at";

/// PostgreSQL implementation of [`JobStore`].
pub struct PostgresJobStore {
    pool: PgPool,
    table: String,
    channel: String,
}

impl PostgresJobStore {
    /// Create a store over `pool` using `table` for job records.
    ///
    /// The table name must be a plain identifier; it is interpolated into
    /// SQL statements.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if !is_valid_identifier(&table) {
            return Err(MonqueError::connection(format!(
                "invalid table name {table:?}"
            )));
        }
        let channel = format!("{table}_changes");
        Ok(Self {
            pool,
            table,
            channel,
        })
    }

    /// The `LISTEN/NOTIFY` channel this store publishes changes on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Best-effort change notification. The write has already committed;
    /// polling covers anything a lost notification misses.
    async fn notify(&self, change: &JobChange) {
        let payload = match serde_json::to_string(change) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        if let Err(err) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(&payload)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(error = %err, "failed to publish change notification");
        }
    }

    fn change_for(op: ChangeOp, job: &Job) -> JobChange {
        JobChange {
            op,
            id: Some(job.id),
            name: Some(job.name.clone()),
            status: Some(job.status),
        }
    }

    async fn find_live_by_key(&self, name: &str, unique_key: &str) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} \
             WHERE name = $1 AND unique_key = $2 AND status IN ('pending', 'processing') \
             LIMIT 1",
            table = self.table,
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(name)
            .bind(unique_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn insert_row(&self, job: &Job, on_conflict: &str) -> Result<Option<Job>> {
        let sql = format!(
            "INSERT INTO {table} ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             {on_conflict} \
             RETURNING {COLUMNS}",
            table = self.table,
        );
        let inserted = sqlx::query_as::<_, Job>(&sql)
            .bind(job.id)
            .bind(&job.name)
            .bind(&job.data)
            .bind(job.status)
            .bind(job.next_run_at)
            .bind(job.fail_count)
            .bind(&job.fail_reason)
            .bind(&job.repeat_interval)
            .bind(&job.unique_key)
            .bind(job.locked_at)
            .bind(&job.claimed_by)
            .bind(job.last_heartbeat)
            .bind(job.heartbeat_interval_ms)
            .bind(job.created_at)
            .bind(job.updated_at)
            .fetch_optional(&self.pool)
            .await?;
        Ok(inserted)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn prepare(&self) -> Result<()> {
        let table = &self.table;

        // Enum type creation has no IF NOT EXISTS; swallow the duplicate.
        sqlx::query(
            "DO $$ BEGIN \
                 CREATE TYPE monque_job_status AS ENUM \
                     ('pending', 'processing', 'completed', 'failed', 'cancelled'); \
             EXCEPTION WHEN duplicate_object THEN NULL; \
             END $$",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} ( \
                 id UUID PRIMARY KEY, \
                 name TEXT NOT NULL, \
                 data JSONB NOT NULL DEFAULT 'null'::jsonb, \
                 status monque_job_status NOT NULL DEFAULT 'pending', \
                 next_run_at TIMESTAMPTZ NOT NULL, \
                 fail_count INTEGER NOT NULL DEFAULT 0, \
                 fail_reason TEXT, \
                 repeat_interval TEXT, \
                 unique_key TEXT, \
                 locked_at TIMESTAMPTZ, \
                 claimed_by TEXT, \
                 last_heartbeat TIMESTAMPTZ, \
                 heartbeat_interval_ms BIGINT, \
                 created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(), \
                 updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW() \
             )"
        ))
        .execute(&self.pool)
        .await?;

        let indexes = [
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_poll_idx \
                 ON {table} (status, next_run_at)"
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {table}_live_key_idx \
                 ON {table} (name, unique_key) \
                 WHERE unique_key IS NOT NULL AND status IN ('pending', 'processing')"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_name_status_idx \
                 ON {table} (name, status)"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_claimed_by_idx \
                 ON {table} (claimed_by, status)"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_claim_idx \
                 ON {table} (status, next_run_at, claimed_by)"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {table}_recovery_idx \
                 ON {table} (status, locked_at, last_heartbeat)"
            ),
        ];
        for statement in indexes {
            sqlx::query(&statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn insert(&self, job: Job) -> Result<Job> {
        let inserted = self
            .insert_row(&job, "")
            .await?
            .ok_or_else(|| MonqueError::connection("insert returned no row"))?;
        self.notify(&Self::change_for(ChangeOp::Insert, &inserted))
            .await;
        Ok(inserted)
    }

    async fn insert_unique(&self, job: Job) -> Result<Job> {
        let Some(unique_key) = job.unique_key.clone() else {
            return self.insert(job).await;
        };

        // Fast path: a live record with this key already exists.
        if let Some(existing) = self.find_live_by_key(&job.name, &unique_key).await? {
            return Ok(existing);
        }

        // The partial unique index arbitrates the race; DO NOTHING means a
        // concurrent producer won and we read their record back.
        let on_conflict = "ON CONFLICT (name, unique_key) \
             WHERE unique_key IS NOT NULL AND status IN ('pending', 'processing') \
             DO NOTHING";
        if let Some(inserted) = self.insert_row(&job, on_conflict).await? {
            self.notify(&Self::change_for(ChangeOp::Insert, &inserted))
                .await;
            return Ok(inserted);
        }

        self.find_live_by_key(&job.name, &unique_key)
            .await?
            .ok_or_else(|| {
                MonqueError::connection(format!(
                    "lost dedup race for ({}, {unique_key}) and found no live record",
                    job.name
                ))
            })
    }

    async fn find(&self, id: Uuid) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} WHERE id = $1",
            table = self.table
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn claim_one(
        &self,
        name: &str,
        instance_id: &str,
        heartbeat_interval: Duration,
    ) -> Result<Option<Job>> {
        let sql = format!(
            "UPDATE {table} \
             SET status = 'processing', \
                 claimed_by = $2, \
                 locked_at = NOW(), \
                 last_heartbeat = NOW(), \
                 heartbeat_interval_ms = $3, \
                 updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM {table} \
                 WHERE name = $1 \
                   AND status = 'pending' \
                   AND next_run_at <= NOW() \
                   AND claimed_by IS NULL \
                 ORDER BY next_run_at ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}",
            table = self.table,
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(name)
            .bind(instance_id)
            .bind(heartbeat_interval.as_millis() as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn complete(&self, id: Uuid, instance_id: &str) -> Result<Option<Job>> {
        let sql = format!(
            "UPDATE {table} \
             SET status = 'completed', \
                 fail_reason = NULL, \
                 locked_at = NULL, \
                 claimed_by = NULL, \
                 last_heartbeat = NULL, \
                 heartbeat_interval_ms = NULL, \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'processing' AND claimed_by = $2 \
             RETURNING {COLUMNS}",
            table = self.table,
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn complete_recurring(
        &self,
        id: Uuid,
        instance_id: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let sql = format!(
            "UPDATE {table} \
             SET status = 'pending', \
                 next_run_at = $3, \
                 fail_count = 0, \
                 fail_reason = NULL, \
                 locked_at = NULL, \
                 claimed_by = NULL, \
                 last_heartbeat = NULL, \
                 heartbeat_interval_ms = NULL, \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'processing' AND claimed_by = $2 \
             RETURNING {COLUMNS}",
            table = self.table,
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .bind(instance_id)
            .bind(next_run_at)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(job) = &job {
            self.notify(&Self::change_for(ChangeOp::Update, job)).await;
        }
        Ok(job)
    }

    async fn fail(
        &self,
        id: Uuid,
        instance_id: &str,
        update: FailureUpdate,
    ) -> Result<Option<Job>> {
        let job = match update.retry_at {
            Some(retry_at) => {
                let sql = format!(
                    "UPDATE {table} \
                     SET status = 'pending', \
                         next_run_at = $3, \
                         fail_count = $4, \
                         fail_reason = $5, \
                         locked_at = NULL, \
                         claimed_by = NULL, \
                         last_heartbeat = NULL, \
                         heartbeat_interval_ms = NULL, \
                         updated_at = NOW() \
                     WHERE id = $1 AND status = 'processing' AND claimed_by = $2 \
                     RETURNING {COLUMNS}",
                    table = self.table,
                );
                sqlx::query_as::<_, Job>(&sql)
                    .bind(id)
                    .bind(instance_id)
                    .bind(retry_at)
                    .bind(update.fail_count)
                    .bind(&update.fail_reason)
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "UPDATE {table} \
                     SET status = 'failed', \
                         fail_count = $3, \
                         fail_reason = $4, \
                         locked_at = NULL, \
                         claimed_by = NULL, \
                         last_heartbeat = NULL, \
                         heartbeat_interval_ms = NULL, \
                         updated_at = NOW() \
                     WHERE id = $1 AND status = 'processing' AND claimed_by = $2 \
                     RETURNING {COLUMNS}",
                    table = self.table,
                );
                sqlx::query_as::<_, Job>(&sql)
                    .bind(id)
                    .bind(instance_id)
                    .bind(update.fail_count)
                    .bind(&update.fail_reason)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        if let Some(job) = &job {
            if job.status == JobStatus::Pending {
                self.notify(&Self::change_for(ChangeOp::Update, job)).await;
            }
        }
        Ok(job)
    }

    async fn heartbeat(&self, instance_id: &str) -> Result<u64> {
        let sql = format!(
            "UPDATE {table} \
             SET last_heartbeat = NOW(), updated_at = NOW() \
             WHERE claimed_by = $1 AND status = 'processing'",
            table = self.table,
        );
        let result = sqlx::query(&sql)
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn recover_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let sql = format!(
            "UPDATE {table} \
             SET status = 'pending', \
                 locked_at = NULL, \
                 claimed_by = NULL, \
                 last_heartbeat = NULL, \
                 heartbeat_interval_ms = NULL, \
                 updated_at = NOW() \
             WHERE status = 'processing' AND locked_at < $1",
            table = self.table,
        );
        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        let count = result.rows_affected();
        if count > 0 {
            self.notify(&JobChange {
                op: ChangeOp::Update,
                id: None,
                name: None,
                status: Some(JobStatus::Pending),
            })
            .await;
        }
        Ok(count)
    }

    async fn sweep(
        &self,
        completed_before: Option<DateTime<Utc>>,
        failed_before: Option<DateTime<Utc>>,
    ) -> Result<u64> {
        let mut removed = 0;
        if let Some(cutoff) = completed_before {
            let sql = format!(
                "DELETE FROM {table} WHERE status = 'completed' AND updated_at < $1",
                table = self.table,
            );
            removed += sqlx::query(&sql)
                .bind(cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        if let Some(cutoff) = failed_before {
            let sql = format!(
                "DELETE FROM {table} WHERE status = 'failed' AND updated_at < $1",
                table = self.table,
            );
            removed += sqlx::query(&sql)
                .bind(cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        Ok(removed)
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: &[JobStatus],
        transition: Transition,
    ) -> Result<Option<Job>> {
        let expected = status_list(expected);
        let job = match transition {
            Transition::Cancel => {
                let sql = format!(
                    "UPDATE {table} \
                     SET status = 'cancelled', \
                         locked_at = NULL, \
                         claimed_by = NULL, \
                         last_heartbeat = NULL, \
                         heartbeat_interval_ms = NULL, \
                         updated_at = NOW() \
                     WHERE id = $1 AND status IN ({expected}) \
                     RETURNING {COLUMNS}",
                    table = self.table,
                );
                sqlx::query_as::<_, Job>(&sql)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            Transition::Retry => {
                let sql = format!(
                    "UPDATE {table} \
                     SET status = 'pending', \
                         next_run_at = NOW(), \
                         fail_count = 0, \
                         fail_reason = NULL, \
                         locked_at = NULL, \
                         claimed_by = NULL, \
                         last_heartbeat = NULL, \
                         heartbeat_interval_ms = NULL, \
                         updated_at = NOW() \
                     WHERE id = $1 AND status IN ({expected}) \
                     RETURNING {COLUMNS}",
                    table = self.table,
                );
                sqlx::query_as::<_, Job>(&sql)
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            Transition::Reschedule { run_at } => {
                let sql = format!(
                    "UPDATE {table} \
                     SET next_run_at = $2, updated_at = NOW() \
                     WHERE id = $1 AND status IN ({expected}) \
                     RETURNING {COLUMNS}",
                    table = self.table,
                );
                sqlx::query_as::<_, Job>(&sql)
                    .bind(id)
                    .bind(run_at)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        if let Some(job) = &job {
            if job.status == JobStatus::Pending {
                self.notify(&Self::change_for(ChangeOp::Update, job)).await;
            }
        }
        Ok(job)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let sql = format!("DELETE FROM {table} WHERE id = $1", table = self.table);
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_many(&self, filter: &JobFilter) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {table} WHERE ($1::text IS NULL OR name = $1){statuses}",
            table = self.table,
            statuses = status_clause(&filter.statuses),
        );
        let result = sqlx::query(&sql)
            .bind(&filter.name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list(&self, filter: &JobFilter, limit: usize, skip: usize) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} \
             WHERE ($1::text IS NULL OR name = $1){statuses} \
             ORDER BY next_run_at ASC, id ASC \
             LIMIT $2 OFFSET $3",
            table = self.table,
            statuses = status_clause(&filter.statuses),
        );
        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(&filter.name)
            .bind(limit as i64)
            .bind(skip as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn page_by_id(
        &self,
        filter: &JobFilter,
        anchor: Option<Uuid>,
        limit: usize,
        backward: bool,
    ) -> Result<Vec<Job>> {
        let (comparison, order) = if backward {
            ("id < $2", "DESC")
        } else {
            ("id > $2", "ASC")
        };
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} \
             WHERE ($1::text IS NULL OR name = $1){statuses} \
               AND ($2::uuid IS NULL OR {comparison}) \
             ORDER BY id {order} \
             LIMIT $3",
            table = self.table,
            statuses = status_clause(&filter.statuses),
        );
        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(&filter.name)
            .bind(anchor)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn stats(&self, name: Option<&str>) -> Result<QueueStats> {
        let sql = format!(
            "SELECT \
                 COUNT(*) AS total, \
                 COUNT(*) FILTER (WHERE status = 'pending') AS pending, \
                 COUNT(*) FILTER (WHERE status = 'processing') AS processing, \
                 COUNT(*) FILTER (WHERE status = 'completed') AS completed, \
                 COUNT(*) FILTER (WHERE status = 'failed') AS failed, \
                 COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled, \
                 (AVG(EXTRACT(EPOCH FROM (updated_at - locked_at)) * 1000.0) \
                     FILTER (WHERE status = 'completed' AND locked_at IS NOT NULL) \
                 )::float8 AS avg_processing_ms \
             FROM {table} \
             WHERE ($1::text IS NULL OR name = $1)",
            table = self.table,
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {STATS_TIMEOUT_MS}"))
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_one(&mut *tx)
            .await
            .map_err(|err| {
                if is_statement_timeout(&err) {
                    MonqueError::AggregationTimeout {
                        limit_ms: STATS_TIMEOUT_MS,
                    }
                } else {
                    err.into()
                }
            })?;
        tx.commit().await?;

        Ok(QueueStats {
            total: row.try_get::<i64, _>("total")? as u64,
            pending: row.try_get::<i64, _>("pending")? as u64,
            processing: row.try_get::<i64, _>("processing")? as u64,
            completed: row.try_get::<i64, _>("completed")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            cancelled: row.try_get::<i64, _>("cancelled")? as u64,
            avg_processing_ms: row.try_get::<Option<f64>, _>("avg_processing_ms")?,
        })
    }

    async fn watch(&self) -> Result<JobChangeStream> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;

        let stream = async_stream::stream! {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<JobChange>(notification.payload()) {
                            Ok(change) => yield Ok(change),
                            Err(err) => {
                                tracing::debug!(error = %err, "ignoring malformed change payload");
                            }
                        }
                    }
                    Err(err) => {
                        yield Err(MonqueError::from(err));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// `'a', 'b', 'c'` literal list for an `IN` clause. Values come from the
/// status enum, never from user input.
fn status_list(statuses: &[JobStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// ` AND status IN (...)` fragment, empty when the filter allows all.
fn status_clause(statuses: &[JobStatus]) -> String {
    if statuses.is_empty() {
        String::new()
    } else {
        format!(" AND status IN ({})", status_list(statuses))
    }
}

fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_statement_timeout(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("57014"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_validation() {
        assert!(is_valid_identifier("monque_jobs"));
        assert!(is_valid_identifier("jobs2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2jobs"));
        assert!(!is_valid_identifier("jobs; DROP TABLE jobs"));
        assert!(!is_valid_identifier("jobs-prod"));
    }

    #[test]
    fn status_clause_builds_literal_lists() {
        assert_eq!(status_clause(&[]), "");
        assert_eq!(
            status_clause(&[JobStatus::Failed, JobStatus::Cancelled]),
            " AND status IN ('failed', 'cancelled')"
        );
    }
}
