//! Postgres-backed distributed job scheduler.
//!
//! Producers enqueue named jobs (immediate, delayed, or recurring via cron)
//! into a shared table. One or more scheduler instances cooperatively claim,
//! execute, retry, and finalize those jobs with at most one concurrent
//! execution per job and exponential-backoff retries. Crashed instances are
//! recovered through timeout-based lease expiry; execution is at-least-once.
//!
//! # Architecture
//!
//! ```text
//! enqueue/now/schedule ──► jobs table ◄── claim (UPDATE … SKIP LOCKED)
//!                              │                    │
//!               NOTIFY ◄───────┘                    ▼
//!                 │                            processor ──► complete
//!                 ▼                                │         fail + backoff
//!          change listener ── debounce ──► dispatch loop     reschedule (cron)
//!                 │                             ▲
//!                 └── reconnect/backoff         └── polling safety net
//! ```
//!
//! # Example
//!
//! ```ignore
//! use monque::{Monque, MonqueConfig, Job};
//! use serde_json::json;
//!
//! let pool = sqlx::PgPool::connect(&std::env::var("DATABASE_URL")?).await?;
//! let monque = Monque::new(pool, MonqueConfig::default())?;
//!
//! monque.register("send-email", |job: Job| async move {
//!     println!("sending to {}", job.data["to"]);
//!     Ok(())
//! })?;
//!
//! monque.start().await?;
//! monque.now("send-email", json!({"to": "a@example.com"})).await?;
//! monque.schedule("0 * * * *", "hourly-report", json!({}), Default::default()).await?;
//!
//! monque.stop().await?;
//! ```

mod config;
mod dispatch;
mod error;
mod events;
mod job;
mod listener;
mod manager;
mod monque;
mod pagination;
mod postgres;
mod processor;
mod registry;
mod scheduler;
mod store;
mod upkeep;

pub mod testing;

pub use config::{MonqueConfig, RetentionConfig};
pub use error::{MonqueError, Result};
pub use events::{EventBus, JobEvent};
pub use job::{Job, JobStatus};
pub use manager::{BulkError, BulkResult, GetJobsOptions};
pub use monque::{Monque, SchedulerState};
pub use pagination::{Cursor, CursorPageOptions, JobPage, PageDirection};
pub use postgres::PostgresJobStore;
pub use registry::{JobHandler, WorkerOptions};
pub use scheduler::{EnqueueOptions, ScheduleOptions};
pub use store::{
    ChangeOp, FailureUpdate, JobChange, JobChangeStream, JobFilter, JobStore, QueueStats,
    Transition,
};
