//! Worker registry: routes job names to handlers and tracks what is running.
//!
//! The registry is owned by a single scheduler instance; the collection is
//! the only cross-process shared resource. Dispatch only needs three things
//! from here: the registered names, how many slots each worker has free, and
//! somewhere to account a claimed job until its handler finishes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{MonqueError, Result};
use crate::job::Job;

/// Handler for claimed jobs.
///
/// Implemented automatically for `Fn(Job) -> Future<Output = anyhow::Result<()>>`
/// closures, so plain async closures register directly:
///
/// ```
/// use monque::JobHandler;
///
/// fn assert_handler(_: impl JobHandler) {}
/// assert_handler(|job: monque::Job| async move {
///     println!("running {}", job.name);
///     anyhow::Ok(())
/// });
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run the job. Returning an error records a failed attempt; the
    /// scheduler handles retries and backoff.
    async fn execute(&self, job: Job) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    async fn execute(&self, job: Job) -> anyhow::Result<()> {
        (self)(job).await
    }
}

/// Options for registering a worker.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct WorkerOptions {
    /// Slot count for this worker. Defaults to the instance-wide
    /// `worker_concurrency`.
    #[builder(default, setter(strip_option))]
    pub concurrency: Option<usize>,

    /// Replace an existing registration instead of failing.
    #[builder(default)]
    pub replace: bool,
}

/// A registered worker.
pub(crate) struct Worker {
    pub name: String,
    pub handler: Arc<dyn JobHandler>,
    pub concurrency: usize,
    active: Mutex<HashSet<Uuid>>,
}

impl Worker {
    /// Jobs currently executing for this worker.
    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Instance-local registry of workers and their running jobs.
pub(crate) struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<Worker>>>,
    global_active: AtomicUsize,
    default_concurrency: usize,
}

impl WorkerRegistry {
    pub fn new(default_concurrency: usize) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            global_active: AtomicUsize::new(0),
            default_concurrency,
        }
    }

    /// Register a handler under `name`. Registering a name twice fails
    /// unless `options.replace` is set.
    pub fn register(
        &self,
        name: &str,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
    ) -> Result<()> {
        let mut workers = self.workers.write().unwrap_or_else(|e| e.into_inner());
        if workers.contains_key(name) && !options.replace {
            return Err(MonqueError::WorkerRegistration {
                name: name.to_string(),
            });
        }
        workers.insert(
            name.to_string(),
            Arc::new(Worker {
                name: name.to_string(),
                handler,
                concurrency: options.concurrency.unwrap_or(self.default_concurrency),
                active: Mutex::new(HashSet::new()),
            }),
        );
        Ok(())
    }

    /// Snapshot of registered workers, in registration-independent order.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.workers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Account a claimed job against its worker.
    pub fn begin(&self, worker: &Worker, job_id: Uuid) {
        if worker.lock_active().insert(job_id) {
            self.global_active.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Release a job's slot. Safe to call once per claimed job, in every
    /// exit path.
    pub fn finish(&self, worker: &Worker, job_id: Uuid) {
        if worker.lock_active().remove(&job_id) {
            self.global_active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Jobs currently executing across all workers.
    pub fn total_active(&self) -> usize {
        self.global_active.load(Ordering::SeqCst)
    }

    /// Ids of every job currently executing.
    pub fn active_job_ids(&self) -> Vec<Uuid> {
        self.workers()
            .iter()
            .flat_map(|w| w.lock_active().iter().copied().collect::<Vec<_>>())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> Arc<dyn JobHandler> {
        Arc::new(|_job: Job| async move { anyhow::Ok(()) })
    }

    fn lookup(registry: &WorkerRegistry, name: &str) -> Arc<Worker> {
        registry
            .workers()
            .into_iter()
            .find(|w| w.name == name)
            .unwrap()
    }

    #[test]
    fn register_then_lookup() {
        let registry = WorkerRegistry::new(5);
        registry
            .register("send-email", noop_handler(), WorkerOptions::default())
            .unwrap();
        assert!(registry.is_registered("send-email"));
        let worker = lookup(&registry, "send-email");
        assert_eq!(worker.concurrency, 5);
        assert_eq!(worker.active_count(), 0);
    }

    #[test]
    fn duplicate_registration_fails_without_replace() {
        let registry = WorkerRegistry::new(5);
        registry
            .register("send-email", noop_handler(), WorkerOptions::default())
            .unwrap();
        let err = registry
            .register("send-email", noop_handler(), WorkerOptions::default())
            .unwrap_err();
        assert!(matches!(err, MonqueError::WorkerRegistration { .. }));
    }

    #[test]
    fn replace_overrides_the_registration() {
        let registry = WorkerRegistry::new(5);
        registry
            .register("send-email", noop_handler(), WorkerOptions::default())
            .unwrap();
        registry
            .register(
                "send-email",
                noop_handler(),
                WorkerOptions::builder().concurrency(2).replace(true).build(),
            )
            .unwrap();
        assert_eq!(lookup(&registry, "send-email").concurrency, 2);
    }

    #[test]
    fn per_worker_concurrency_overrides_the_default() {
        let registry = WorkerRegistry::new(5);
        registry
            .register(
                "bulk-import",
                noop_handler(),
                WorkerOptions::builder().concurrency(1).build(),
            )
            .unwrap();
        assert_eq!(lookup(&registry, "bulk-import").concurrency, 1);
    }

    #[test]
    fn begin_and_finish_track_global_active() {
        let registry = WorkerRegistry::new(5);
        registry
            .register("a", noop_handler(), WorkerOptions::default())
            .unwrap();
        registry
            .register("b", noop_handler(), WorkerOptions::default())
            .unwrap();
        let a = lookup(&registry, "a");
        let b = lookup(&registry, "b");

        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();
        registry.begin(&a, job_a);
        registry.begin(&b, job_b);
        assert_eq!(registry.total_active(), 2);
        assert_eq!(a.active_count(), 1);
        assert_eq!(registry.active_job_ids().len(), 2);

        registry.finish(&a, job_a);
        // Double-finish must not underflow the counter.
        registry.finish(&a, job_a);
        assert_eq!(registry.total_active(), 1);

        registry.finish(&b, job_b);
        assert_eq!(registry.total_active(), 0);
    }
}
