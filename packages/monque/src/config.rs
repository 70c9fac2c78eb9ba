//! Scheduler configuration.

use std::time::Duration;

use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Configuration for a scheduler instance.
///
/// All options have defaults; `MonqueConfig::default()` is a working
/// configuration.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use monque::MonqueConfig;
///
/// let config = MonqueConfig::builder()
///     .poll_interval(Duration::from_millis(500))
///     .max_retries(5)
///     .build();
/// assert_eq!(config.table_name, "monque_jobs");
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct MonqueConfig {
    /// Table that holds the job records.
    #[builder(default = "monque_jobs".to_string(), setter(into))]
    pub table_name: String,

    /// How often the polling safety net scans for ready jobs.
    #[builder(default = Duration::from_millis(1000))]
    pub poll_interval: Duration,

    /// Maximum attempts before a job is marked failed.
    #[builder(default = 10)]
    pub max_retries: i32,

    /// Base for the exponential retry backoff.
    #[builder(default = Duration::from_millis(1000))]
    pub base_retry_interval: Duration,

    /// Optional ceiling on the retry backoff delay.
    #[builder(default, setter(strip_option))]
    pub max_backoff_delay: Option<Duration>,

    /// How long `stop()` waits for active handlers to drain.
    #[builder(default = Duration::from_secs(30))]
    pub shutdown_timeout: Duration,

    /// Default slot count per registered worker.
    #[builder(default = 5)]
    pub worker_concurrency: usize,

    /// Optional cap on concurrently running jobs across all workers of this
    /// instance.
    #[builder(default, setter(strip_option))]
    pub instance_concurrency: Option<usize>,

    /// Age after which a processing job's lease is considered stale.
    #[builder(default = Duration::from_secs(1800))]
    pub lock_timeout: Duration,

    /// Identifier stored in `claimed_by` while this instance holds a lease.
    #[builder(default = default_instance_id(), setter(into))]
    pub instance_id: String,

    /// Period of the lease heartbeat. Recommended at most half of
    /// `lock_timeout`.
    #[builder(default = Duration::from_secs(30))]
    pub heartbeat_interval: Duration,

    /// Recover stale leases during `init()`.
    #[builder(default = true)]
    pub recover_stale_jobs: bool,

    /// Optional age-based sweep of terminal records.
    #[builder(default, setter(strip_option))]
    pub retention: Option<RetentionConfig>,
}

impl Default for MonqueConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Age-based retention sweep for terminal job records.
#[derive(Debug, Clone, TypedBuilder)]
pub struct RetentionConfig {
    /// Delete completed jobs older than this (by `updated_at`).
    #[builder(default, setter(strip_option))]
    pub completed: Option<Duration>,

    /// Delete failed jobs older than this (by `updated_at`).
    #[builder(default, setter(strip_option))]
    pub failed: Option<Duration>,

    /// How often the sweep runs.
    #[builder(default = Duration::from_secs(3600))]
    pub interval: Duration,
}

fn default_instance_id() -> String {
    format!("monque-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MonqueConfig::default();
        assert_eq!(config.table_name, "monque_jobs");
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.base_retry_interval, Duration::from_millis(1000));
        assert!(config.max_backoff_delay.is_none());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.worker_concurrency, 5);
        assert!(config.instance_concurrency.is_none());
        assert_eq!(config.lock_timeout, Duration::from_secs(1800));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(config.recover_stale_jobs);
        assert!(config.retention.is_none());
    }

    #[test]
    fn instance_ids_are_unique_per_instance() {
        let a = MonqueConfig::default();
        let b = MonqueConfig::default();
        assert!(a.instance_id.starts_with("monque-"));
        assert_ne!(a.instance_id, b.instance_id);
    }

    #[test]
    fn retention_interval_defaults_to_an_hour() {
        let retention = RetentionConfig::builder()
            .completed(Duration::from_secs(86_400))
            .build();
        assert_eq!(retention.interval, Duration::from_secs(3600));
        assert!(retention.failed.is_none());
    }
}
