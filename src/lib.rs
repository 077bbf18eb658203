//! A fault-tolerant, reusable process-based worker pool.
//!
//! [`Pool`](pool::Pool) runs a fixed (or resizable) number of worker
//! processes, submits tasks to them through a pair of queues, and collects
//! results back onto per-job [`PendingJob`](pending::PendingJob) handles. If
//! a worker or either internal handler thread dies unexpectedly, the pool
//! fails every outstanding job uniformly and moves to a permanent `BROKEN`
//! state rather than silently losing work or hanging.
//!
//! The controller (this crate's core) is generic over a [`Backend`]:
//! [`thread_backend`] provides a fast in-process stand-in for tests,
//! [`process_backend`] spawns real child processes speaking a small
//! length-prefixed protocol over stdin/stdout.

pub mod backend;
pub mod error;
pub mod framing;
pub mod pending;
pub mod pool;
pub mod process_backend;
pub mod queue;
pub mod registry;
pub mod thread_backend;
pub mod worker;

pub use backend::{Backend, ResultEnvelope, TaskEnvelope};
pub use error::{AbortedWorkerError, CrashReason, JobFailure, PoolError, PoolResult, TerminatedPoolError};
pub use pending::{ChunkOutcome, PendingJob};
pub use pool::{Pool, PoolState};
pub use registry::get_pool;
pub use worker::{ProcessWorker, WorkerHandle};
