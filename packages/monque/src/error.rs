//! Structured error types for the scheduler.
//!
//! `MonqueError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` ever crosses the public API boundary.**
//!
//! - `anyhow` is internal transport (ergonomic for job handlers)
//! - handler failures are persisted as `fail_reason` and surfaced through
//!   `JobEvent::Failed`, never thrown at callers
//! - everything the public API returns is a `MonqueError` variant

use thiserror::Error;
use uuid::Uuid;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MonqueError>;

/// Errors surfaced by the scheduler's public API.
#[derive(Debug, Error)]
pub enum MonqueError {
    /// The store could not be reached, or the scheduler was used before
    /// `init()` established the schema.
    #[error("job store unavailable: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// A cron expression failed to parse.
    #[error("invalid cron expression {expression:?} (expected e.g. \"0 * * * *\")")]
    InvalidCron { expression: String },

    /// A pagination cursor could not be decoded.
    #[error("invalid pagination cursor {cursor:?}")]
    InvalidCursor { cursor: String },

    /// The stats aggregation exceeded its server-side time limit.
    #[error("queue stats aggregation exceeded {limit_ms} ms")]
    AggregationTimeout { limit_ms: u64 },

    /// A state transition's precondition no longer held, either because the
    /// job was in the wrong state or because another actor transitioned it
    /// concurrently.
    #[error("{message}")]
    JobState { message: String },

    /// A worker was registered twice for the same name without `replace`.
    #[error("worker {name:?} is already registered (pass replace to override)")]
    WorkerRegistration { name: String },

    /// The shutdown drain exceeded its budget. Emitted on `JobEvent::Errored`,
    /// never returned from `stop()`.
    #[error("shutdown drain timed out with {} job(s) still running", incomplete_jobs.len())]
    ShutdownTimeout { incomplete_jobs: Vec<Uuid> },
}

impl MonqueError {
    /// Shorthand for a connection error without an underlying driver error.
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        MonqueError::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Shorthand for a transition-race error.
    pub(crate) fn job_state(message: impl Into<String>) -> Self {
        MonqueError::JobState {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for MonqueError {
    fn from(source: sqlx::Error) -> Self {
        MonqueError::Connection {
            message: source.to_string(),
            source: Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_cron_names_the_expression() {
        let err = MonqueError::InvalidCron {
            expression: "not a cron".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("not a cron"));
        assert!(msg.contains("0 * * * *"));
    }

    #[test]
    fn shutdown_timeout_counts_jobs() {
        let err = MonqueError::ShutdownTimeout {
            incomplete_jobs: vec![Uuid::new_v4(), Uuid::new_v4()],
        };
        assert!(err.to_string().contains("2 job(s)"));
    }

    #[test]
    fn sqlx_errors_become_connection_errors() {
        let err: MonqueError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, MonqueError::Connection { .. }));
    }

    #[test]
    fn job_state_passes_message_through() {
        let err = MonqueError::job_state("Job status changed during cancel attempt");
        assert_eq!(
            err.to_string(),
            "Job status changed during cancel attempt"
        );
    }
}
