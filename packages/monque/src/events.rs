//! Job lifecycle events and the broadcast bus they flow over.
//!
//! # Guarantees
//!
//! - **Fire-and-forget**: emission never blocks the scheduler and never fails
//! - **At-most-once delivery**: slow receivers may observe `Lagged`
//! - **In-memory only**: events are not persisted and not replayed

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::Job;

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 1024;

/// Job lifecycle events.
///
/// These events represent facts about the job lifecycle, not commands.
/// Observers subscribe via [`EventBus::subscribe`]; nothing in the core
/// waits on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// A handler is about to run a claimed job.
    Started { job: Job },

    /// A handler finished successfully.
    Completed { job: Job, duration_ms: u64 },

    /// A handler returned an error.
    ///
    /// `will_retry` is computed from the fail count at the moment of failure,
    /// not from the later-updated record.
    Failed {
        job: Job,
        error: String,
        will_retry: bool,
    },

    /// An internal failure that is not a handler failure: store errors during
    /// claim/complete/fail, periodic task failures, panicking handlers, or an
    /// exhausted shutdown drain (`incomplete_jobs` lists what was still
    /// running).
    Errored {
        error: String,
        job_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        incomplete_jobs: Vec<Uuid>,
    },

    /// A pending job was cancelled by an operator.
    Cancelled { job: Job },

    /// A failed or cancelled job was returned to the queue.
    Retried { job: Job },

    /// A single job record was removed.
    Deleted { job_id: Uuid },

    /// Batched operator cancellation.
    BulkCancelled { job_ids: Vec<Uuid>, count: u64 },

    /// Batched operator retry.
    BulkRetried { job_ids: Vec<Uuid>, count: u64 },

    /// Batched deletion.
    BulkDeleted { count: u64 },

    /// Stale leases were recovered back to pending.
    StaleRecovered { count: u64 },

    /// The change-notification stream is live.
    ListenerConnected,

    /// The change-notification stream was closed on shutdown.
    ListenerClosed,

    /// The change-notification stream reported an error.
    ListenerError { error: String },

    /// Reconnection was exhausted; the scheduler continues polling-only.
    ListenerFallback { reason: String },
}

/// Broadcast bus for [`JobEvent`]s.
///
/// # Example
///
/// ```
/// use monque::{EventBus, JobEvent};
/// use uuid::Uuid;
///
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
/// bus.emit(JobEvent::Deleted { job_id: Uuid::new_v4() });
/// assert!(matches!(rx.try_recv(), Ok(JobEvent::Deleted { .. })));
/// ```
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers (fire-and-forget).
    ///
    /// Returns the number of receivers that observed the event.
    pub fn emit(&self, event: JobEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
