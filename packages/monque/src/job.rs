//! Job model and lifecycle helpers.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{MonqueError, Result};

/// Lifecycle state of a job record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "monque_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Stable lowercase name, matching the persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the job can never run again without an operator transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persistent work item targeting a named worker.
///
/// Lease fields (`locked_at`, `claimed_by`, `last_heartbeat`,
/// `heartbeat_interval_ms`) are only present while the job is processing;
/// `NULL` and "absent" mean the same thing.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    /// Primary key. V7 UUIDs are time-ordered, so the id doubles as the
    /// key-set pagination cursor.
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    /// Worker routing key (e.g. `"send-email"`).
    pub name: String,

    /// Opaque payload handed to the worker.
    #[builder(default = serde_json::Value::Null)]
    pub data: serde_json::Value,

    #[builder(default)]
    pub status: JobStatus,

    /// Earliest time the job is eligible to execute.
    #[builder(default = Utc::now())]
    pub next_run_at: DateTime<Utc>,

    /// Number of prior failed attempts.
    #[builder(default = 0)]
    pub fail_count: i32,

    /// Error message from the most recent failure; cleared on success.
    #[builder(default, setter(strip_option))]
    pub fail_reason: Option<String>,

    /// Cron expression; presence marks the job as recurring.
    #[builder(default, setter(strip_option))]
    pub repeat_interval: Option<String>,

    /// Deduplication key, scoped with `name`.
    #[builder(default, setter(strip_option))]
    pub unique_key: Option<String>,

    /// When the current lease was acquired. Authoritative for staleness.
    #[builder(default, setter(strip_option))]
    pub locked_at: Option<DateTime<Utc>>,

    /// Instance currently holding the lease.
    #[builder(default, setter(strip_option))]
    pub claimed_by: Option<String>,

    /// Liveness signal from the claimant (observability only).
    #[builder(default, setter(strip_option))]
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Heartbeat period the claimant uses (observability only).
    #[builder(default, setter(strip_option))]
    pub heartbeat_interval_ms: Option<i64>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Check if this is a recurring job.
    pub fn is_recurring(&self) -> bool {
        self.repeat_interval.is_some()
    }

    /// Whether the job currently carries a lease.
    pub fn is_leased(&self) -> bool {
        self.claimed_by.is_some() && self.locked_at.is_some()
    }

    /// Next occurrence after `reference` computed from `repeat_interval`.
    ///
    /// Returns `None` for one-time jobs or expressions with no future fire
    /// time.
    pub fn next_occurrence(&self, reference: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match &self.repeat_interval {
            None => Ok(None),
            Some(expr) => {
                let schedule = parse_cron(expr)?;
                Ok(schedule.after(&reference).next())
            }
        }
    }
}

/// Parse a cron expression, accepting the classic 5-field form.
///
/// The underlying parser works at seconds resolution; 5-field expressions
/// are normalized by prefixing a zero seconds field.
pub(crate) fn parse_cron(expression: &str) -> Result<Schedule> {
    let normalized = match expression.split_whitespace().count() {
        5 => format!("0 {expression}"),
        _ => expression.to_string(),
    };
    Schedule::from_str(&normalized).map_err(|_| MonqueError::InvalidCron {
        expression: expression.to_string(),
    })
}

/// Delay before retry number `fail_count`.
///
/// `2^fail_count * base`, saturating instead of overflowing, bounded by
/// `cap` when configured and by what a timestamp can still represent
/// otherwise.
pub(crate) fn backoff_delay(fail_count: i32, base: Duration, cap: Option<Duration>) -> Duration {
    const MAX_DELAY_MS: u64 = i64::MAX as u64;

    let base_ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
    let factor = if (0..63).contains(&fail_count) {
        1u64 << fail_count
    } else {
        u64::MAX
    };
    let mut delay_ms = factor.saturating_mul(base_ms).min(MAX_DELAY_MS);
    if let Some(cap) = cap {
        delay_ms = delay_ms.min(cap.as_millis().min(u128::from(u64::MAX)) as u64);
    }
    Duration::from_millis(delay_ms)
}

/// Add a delay to a timestamp without panicking near the representable end.
pub(crate) fn run_at_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let millis = delay.as_millis().min(i64::MAX as u128) as i64;
    now.checked_add_signed(chrono::Duration::milliseconds(millis))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
