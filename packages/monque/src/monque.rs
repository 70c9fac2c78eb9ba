//! The scheduler instance: wiring, lifecycle, and public entry points.
//!
//! ```text
//! Monque
//!     │
//!     ├─► dispatch loop ── claim (atomic, per worker slot) ──► processor
//!     │        ▲                                                  │
//!     │        │ kick (debounced)                                 ├─► complete / fail / backoff
//!     ├─► change listener (LISTEN, reconnect, poll fallback)      └─► events
//!     ├─► heartbeat loop (lease refresh)
//!     ├─► recovery loop (stale leases ─► pending)
//!     └─► retention loop (age-based sweep)
//! ```
//!
//! Every periodic task selects on one shared `CancellationToken`; `stop()`
//! cancels it, then waits for active handlers to drain within the shutdown
//! budget.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::MonqueConfig;
use crate::dispatch;
use crate::error::{MonqueError, Result};
use crate::events::{EventBus, JobEvent};
use crate::listener;
use crate::postgres::PostgresJobStore;
use crate::registry::{JobHandler, WorkerOptions, WorkerRegistry};
use crate::store::JobStore;
use crate::upkeep;

/// Lifecycle state of a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

/// Shared state behind every task of one scheduler instance.
pub(crate) struct Core {
    pub store: Arc<dyn JobStore>,
    pub config: MonqueConfig,
    pub registry: WorkerRegistry,
    pub events: EventBus,
    /// Wakes the dispatch loop outside its polling cadence.
    pub kick: Notify,
    /// Coalesces change notifications into one debounced poll.
    pub debounce_pending: AtomicBool,
    state: Mutex<SchedulerState>,
    run: Mutex<Option<RunHandles>>,
}

struct RunHandles {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// A distributed job scheduler instance.
///
/// Cheap to clone; clones share the same instance.
///
/// # Example
///
/// ```ignore
/// let monque = Monque::new(pool, MonqueConfig::default())?;
/// monque.register("send-email", |job: Job| async move {
///     send(job.data).await
/// })?;
/// monque.start().await?;
/// monque.now("send-email", json!({"to": "a@example.com"})).await?;
/// ```
#[derive(Clone)]
pub struct Monque {
    core: Arc<Core>,
}

impl Monque {
    /// Create an instance backed by PostgreSQL.
    pub fn new(pool: PgPool, config: MonqueConfig) -> Result<Self> {
        let store = PostgresJobStore::new(pool, config.table_name.clone())?;
        Ok(Self::with_store(Arc::new(store), config))
    }

    /// Create an instance over any [`JobStore`] implementation.
    pub fn with_store(store: Arc<dyn JobStore>, config: MonqueConfig) -> Self {
        let registry = WorkerRegistry::new(config.worker_concurrency);
        Monque {
            core: Arc::new(Core {
                store,
                config,
                registry,
                events: EventBus::new(),
                kick: Notify::new(),
                debounce_pending: AtomicBool::new(false),
                state: Mutex::new(SchedulerState::Uninitialized),
                run: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &MonqueConfig {
        &self.core.config
    }

    pub fn state(&self) -> SchedulerState {
        *self.core.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.core.events.subscribe()
    }

    /// The event bus, for wiring long-lived observers.
    pub fn events(&self) -> &EventBus {
        &self.core.events
    }

    /// Register a worker under `name` with default options.
    pub fn register<H>(&self, name: &str, handler: H) -> Result<()>
    where
        H: JobHandler + 'static,
    {
        self.register_with(name, handler, WorkerOptions::default())
    }

    /// Register a worker with explicit concurrency / replacement options.
    pub fn register_with<H>(&self, name: &str, handler: H, options: WorkerOptions) -> Result<()>
    where
        H: JobHandler + 'static,
    {
        self.core.registry.register(name, Arc::new(handler), options)
    }

    /// Whether a worker is registered under `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.core.registry.is_registered(name)
    }

    /// Prepare the store (schema, indexes) and recover stale leases.
    ///
    /// Idempotent; `start()` calls this when needed.
    pub async fn init(&self) -> Result<()> {
        if self.state() != SchedulerState::Uninitialized {
            return Ok(());
        }

        self.core.store.prepare().await?;

        if self.core.config.recover_stale_jobs {
            let cutoff = Utc::now() - to_chrono(self.core.config.lock_timeout);
            let count = self.core.store.recover_stale(cutoff).await?;
            if count > 0 {
                info!(count, "recovered stale jobs at startup");
                self.core.events.emit(JobEvent::StaleRecovered { count });
            }
        }

        self.set_state(SchedulerState::Initialized);
        Ok(())
    }

    /// Start dispatching: polling, change listening, heartbeats, recovery,
    /// and retention. Idempotent while running.
    pub async fn start(&self) -> Result<()> {
        if self.state() == SchedulerState::Uninitialized {
            self.init().await?;
        }
        {
            let mut state = self.core.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == SchedulerState::Running {
                return Ok(());
            }
            *state = SchedulerState::Running;
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(dispatch::run(
            Arc::clone(&self.core),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(upkeep::heartbeat_loop(
            Arc::clone(&self.core),
            cancel.clone(),
        )));
        if self.core.config.recover_stale_jobs {
            tasks.push(tokio::spawn(upkeep::recovery_loop(
                Arc::clone(&self.core),
                cancel.clone(),
            )));
        }
        if self.core.config.retention.is_some() {
            tasks.push(tokio::spawn(upkeep::retention_loop(
                Arc::clone(&self.core),
                cancel.clone(),
            )));
        }
        if self.core.store.supports_watch() {
            tasks.push(tokio::spawn(listener::run(
                Arc::clone(&self.core),
                cancel.clone(),
            )));
        }

        *self.core.run.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(RunHandles { cancel, tasks });

        info!(
            instance_id = %self.core.config.instance_id,
            poll_interval_ms = self.core.config.poll_interval.as_millis() as u64,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop dispatching and drain active handlers.
    ///
    /// Waits up to `shutdown_timeout` for running jobs to finish. On timeout
    /// a [`JobEvent::Errored`] carrying the incomplete job ids is emitted and
    /// the records are left `processing` for lease recovery. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let handles = {
            let mut state = self.core.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != SchedulerState::Running {
                return Ok(());
            }
            *state = SchedulerState::Stopped;
            self.core.run.lock().unwrap_or_else(|e| e.into_inner()).take()
        };
        let Some(RunHandles { cancel, tasks }) = handles else {
            return Ok(());
        };

        cancel.cancel();
        for task in tasks {
            let _ = task.await;
        }

        let deadline = tokio::time::Instant::now() + self.core.config.shutdown_timeout;
        while self.core.registry.total_active() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let incomplete = self.core.registry.active_job_ids();
        if !incomplete.is_empty() {
            let err = MonqueError::ShutdownTimeout {
                incomplete_jobs: incomplete.clone(),
            };
            warn!(count = incomplete.len(), "shutdown drain timed out");
            self.core.events.emit(JobEvent::Errored {
                error: err.to_string(),
                job_id: None,
                incomplete_jobs: incomplete,
            });
        }

        info!(instance_id = %self.core.config.instance_id, "scheduler stopped");
        Ok(())
    }

    /// Start, then stop gracefully on Ctrl-C.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        self.start().await?;
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        self.stop().await
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Producer and operator calls require an initialized store.
    pub(crate) fn ensure_initialized(&self) -> Result<()> {
        match self.state() {
            SchedulerState::Uninitialized => Err(MonqueError::connection(
                "scheduler is not initialized; call init() first",
            )),
            _ => Ok(()),
        }
    }

    fn set_state(&self, state: SchedulerState) {
        *self.core.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryJobStore;

    fn memory_instance() -> Monque {
        Monque::with_store(Arc::new(MemoryJobStore::new()), MonqueConfig::default())
    }

    #[tokio::test]
    async fn lifecycle_walks_through_the_states() {
        let monque = memory_instance();
        assert_eq!(monque.state(), SchedulerState::Uninitialized);
        monque.init().await.unwrap();
        assert_eq!(monque.state(), SchedulerState::Initialized);
        monque.start().await.unwrap();
        assert_eq!(monque.state(), SchedulerState::Running);
        monque.stop().await.unwrap();
        assert_eq!(monque.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn start_initializes_on_demand() {
        let monque = memory_instance();
        monque.start().await.unwrap();
        assert_eq!(monque.state(), SchedulerState::Running);
        monque.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let monque = memory_instance();
        monque.start().await.unwrap();
        monque.stop().await.unwrap();
        monque.stop().await.unwrap();
        monque.stop().await.unwrap();
        assert_eq!(monque.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let monque = memory_instance();
        monque.stop().await.unwrap();
        assert_eq!(monque.state(), SchedulerState::Uninitialized);
    }

    #[tokio::test]
    async fn producer_calls_require_init() {
        let monque = memory_instance();
        let err = monque
            .now("send-email", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MonqueError::Connection { .. }));
    }

    #[tokio::test]
    async fn uninitialized_instances_recover_stale_jobs_on_init() {
        use crate::job::{Job, JobStatus};

        let store = Arc::new(MemoryJobStore::new());
        let mut stale = Job::builder().name("a").build();
        stale.status = JobStatus::Processing;
        stale.claimed_by = Some("dead-instance".into());
        stale.locked_at = Some(Utc::now() - chrono::Duration::hours(2));
        store.put(stale.clone());

        let monque = Monque::with_store(store.clone(), MonqueConfig::default());
        let mut events = monque.subscribe();
        monque.init().await.unwrap();

        assert!(matches!(
            events.try_recv(),
            Ok(JobEvent::StaleRecovered { count: 1 })
        ));
        assert_eq!(store.job(stale.id).unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn recovery_respects_the_config_flag() {
        use crate::job::{Job, JobStatus};

        let store = Arc::new(MemoryJobStore::new());
        let mut stale = Job::builder().name("a").build();
        stale.status = JobStatus::Processing;
        stale.claimed_by = Some("dead-instance".into());
        stale.locked_at = Some(Utc::now() - chrono::Duration::hours(2));
        store.put(stale.clone());

        let config = MonqueConfig::builder().recover_stale_jobs(false).build();
        let monque = Monque::with_store(store.clone(), config);
        monque.init().await.unwrap();

        assert_eq!(store.job(stale.id).unwrap().status, JobStatus::Processing);
    }
}
