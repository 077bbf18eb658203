//! Error types surfaced by the pool and its queue-pair collaborator.

use std::fmt;

/// Why the controller uniformly failed every pending job and moved to
/// [`BROKEN`](crate::pool::PoolState::Broken).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrashReason {
    /// A worker process exited with a non-zero code or was killed by a
    /// signal. The code is `std::process::ExitStatus`-style: negative for a
    /// signal, positive for a normal non-zero exit.
    WorkerCrash { exitcode: i32 },
    /// The task-handler thread died, typically because a task could not be
    /// encoded onto the task-in queue.
    TaskHandlerCrashed,
    /// The result-handler thread died, typically because a result could not
    /// be decoded off the result-out queue.
    ResultHandlerCrashed,
}

impl fmt::Display for CrashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkerCrash { exitcode } if *exitcode < 0 => write!(
                f,
                "a process was killed during the execution of a job (signal {})",
                -exitcode
            ),
            Self::WorkerCrash { exitcode } => write!(
                f,
                "a process was killed during the execution of a job (exit code {exitcode})"
            ),
            Self::ResultHandlerCrashed => write!(
                f,
                "the result handler crashed; this is probably due to a result deserialization error"
            ),
            Self::TaskHandlerCrashed => write!(
                f,
                "the task handler crashed; this is probably due to a task serialization error"
            ),
        }
    }
}

/// Delivered to every remaining chunk of every job that was in flight when a
/// worker or helper thread crashed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbortedWorkerError {
    reason: CrashReason,
}

impl AbortedWorkerError {
    pub(crate) fn new(reason: CrashReason) -> Self {
        Self { reason }
    }

    pub fn reason(&self) -> CrashReason {
        self.reason
    }

    /// The worker's exit code, if this abort was caused by a worker crash
    /// rather than a helper-thread crash.
    pub fn exitcode(&self) -> Option<i32> {
        match self.reason {
            CrashReason::WorkerCrash { exitcode } => Some(exitcode),
            CrashReason::TaskHandlerCrashed | CrashReason::ResultHandlerCrashed => None,
        }
    }
}

impl fmt::Display for AbortedWorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aborted worker error: {}", self.reason)
    }
}

impl std::error::Error for AbortedWorkerError {}

/// Delivered to every remaining chunk of every job that was in flight when
/// `terminate()` was called on a non-broken pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TerminatedPoolError;

impl fmt::Display for TerminatedPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the pool was terminated before the job could complete")
    }
}

impl std::error::Error for TerminatedPoolError {}

/// The failure half of a pending-job chunk outcome (see
/// [`PendingJob::fulfil`](crate::pending::PendingJob::fulfil)).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobFailure {
    AbortedWorker(AbortedWorkerError),
    Terminated(TerminatedPoolError),
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AbortedWorker(err) => err.fmt(f),
            Self::Terminated(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for JobFailure {}

/// Errors raised synchronously by the queue-pair collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The bounded queue has no free capacity.
    Full,
    /// The channel's peer has gone away.
    Disconnected,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "queue is full"),
            Self::Disconnected => write!(f, "queue is disconnected"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Errors returned synchronously from pool operations (`submit`, `resize`).
#[derive(Debug)]
pub enum PoolError {
    /// `submit` was called while `state != RUN`.
    Closed,
    /// Any operation other than `terminate` was attempted on a
    /// [`BROKEN`](crate::pool::PoolState::Broken) pool.
    Broken,
    /// `resize` was called with `n < 1`.
    InvalidArgument(String),
    /// `submit` was rejected because a `resize` is currently draining
    /// pending jobs.
    Draining,
    /// The underlying queue-pair collaborator reported an error.
    Queue(QueueError),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "pool is closed"),
            Self::Broken => write!(f, "pool is broken"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Draining => write!(f, "pool is draining for a resize"),
            Self::Queue(err) => write!(f, "queue error: {err}"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<QueueError> for PoolError {
    fn from(err: QueueError) -> Self {
        Self::Queue(err)
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
