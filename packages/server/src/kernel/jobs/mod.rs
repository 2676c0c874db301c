//! Job infrastructure: model, durable store, lifecycle events, retry
//! bookkeeping, and the per-pipeline worker runtime.
//!
//! # Architecture
//!
//! ```text
//! Worker.submit(id, data)
//!     │
//!     ├─► JobStore.insert {queued}        (durable)
//!     ├─► JobEvents.job_created           (bus + activity feed)
//!     └─► dispatch loop ─► handler ─► completed / failed / retried
//!                                          │
//!                                          └─► RetryController verdict
//! ```

pub mod events;
mod job;
mod retry;
mod store;
mod worker;

pub use events::JobEvents;
pub use job::{GitMeta, Job, JobFailure, JobPatch, JobStatus};
pub use retry::{
    original_id, RetryAlert, RetryController, RetryDecision, RetryMetrics, RetryPolicy,
    ABSOLUTE_MAX_ATTEMPTS,
};
pub use store::{JobQuery, JobStore, QueryTab, StatusCounts, StoreError};
pub use worker::{
    JobContext, JobHandler, Worker, WorkerConfig, WorkerError, WorkerMetrics,
};
