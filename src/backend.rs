//! The worker-spawning collaborator the pool is generic over.
//!
//! The serialization format, the inter-process transport, and the worker's
//! task-execution loop all live behind this trait rather than in the
//! controller. [`crate::thread_backend`] and [`crate::process_backend`]
//! provide two concrete, testable implementations.

use crate::queue::Queue;
use crate::worker::WorkerHandle;
use std::io;
use std::sync::Arc;

pub type JobId = u64;

/// One chunk of a submitted job, addressed by job id and chunk index so the
/// result-handler can route it back to the right [`PendingJob`](crate::pending::PendingJob).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskEnvelope<Task> {
    pub job_id: JobId,
    pub chunk: usize,
    pub task: Task,
}

/// The matching result for one [`TaskEnvelope`]. `outcome` is `Err` when the
/// task itself failed in an ordinary way (as opposed to the worker crashing,
/// which the pool detects independently and never routes through here).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResultEnvelope<Output> {
    pub job_id: JobId,
    pub chunk: usize,
    pub outcome: Result<Output, String>,
}

/// Spawns and wires up worker processes (or process-like stand-ins).
///
/// A backend only has to know how to start one worker given the shared
/// task-in and result-out queues; the pool handles counting, reaping,
/// crash detection, and resizing.
pub trait Backend: Send + Sync + 'static {
    type Worker: WorkerHandle;
    type Task: Send + 'static;
    type Output: Send + Clone + 'static;

    fn spawn_worker(
        &self,
        in_q: &Arc<Queue<TaskEnvelope<Self::Task>>>,
        out_q: &Arc<Queue<ResultEnvelope<Self::Output>>>,
    ) -> io::Result<Self::Worker>;
}
