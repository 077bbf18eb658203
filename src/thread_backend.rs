//! An in-process [`Backend`] whose "worker processes" are real OS threads
//! sharing memory with the controller. Used for fast, deterministic tests of
//! the pool's lifecycle, crash-cleanup, and resize protocols, where the
//! actual IPC transport (exercised instead by [`crate::process_backend`])
//! would only add latency and flakiness.
//!
//! `ThreadWorker::terminate` only flips a cooperative stop flag; waking a
//! worker blocked on the shared queue is the controller's job (it pushes one
//! sentinel per worker being terminated, which works the same way for a
//! process-backed worker's bridging thread). The flag lets an already-idle
//! worker that picks up the next task notice the request and exit promptly
//! instead of racing for one of those sentinels.

use crate::backend::{Backend, ResultEnvelope, TaskEnvelope};
use crate::queue::Queue;
use crate::worker::WorkerHandle;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const STILL_RUNNING: i32 = i32::MIN;

pub struct ThreadWorker {
    synthetic_pid: u32,
    stop: Arc<AtomicBool>,
    exitcode: Arc<AtomicI32>,
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for ThreadWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadWorker").field("pid", &self.synthetic_pid).finish()
    }
}

impl WorkerHandle for ThreadWorker {
    fn pid(&self) -> u32 {
        self.synthetic_pid
    }

    fn exitcode(&mut self) -> Option<i32> {
        match &self.handle {
            Some(handle) if handle.is_finished() => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                Some(self.exitcode.load(Ordering::Acquire))
            }
            Some(_) => None,
            None => Some(self.exitcode.load(Ordering::Acquire)),
        }
    }

    fn terminate(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A [`Backend`] that executes tasks with a plain closure on a dedicated
/// thread per worker, instead of spawning a real process.
pub struct ClosureBackend<Task, Output> {
    execute: Arc<dyn Fn(Task) -> Result<Output, String> + Send + Sync>,
    next_pid: AtomicU32,
}

impl<Task, Output> ClosureBackend<Task, Output> {
    pub fn new(execute: impl Fn(Task) -> Result<Output, String> + Send + Sync + 'static) -> Self {
        Self {
            execute: Arc::new(execute),
            next_pid: AtomicU32::new(1),
        }
    }
}

impl<Task, Output> fmt::Debug for ClosureBackend<Task, Output> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureBackend").finish_non_exhaustive()
    }
}

impl<Task, Output> Backend for ClosureBackend<Task, Output>
where
    Task: Send + 'static,
    Output: Send + Clone + 'static,
{
    type Worker = ThreadWorker;
    type Task = Task;
    type Output = Output;

    fn spawn_worker(
        &self,
        in_q: &Arc<Queue<TaskEnvelope<Task>>>,
        out_q: &Arc<Queue<ResultEnvelope<Output>>>,
    ) -> io::Result<Self::Worker> {
        let synthetic_pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        let exitcode = Arc::new(AtomicI32::new(STILL_RUNNING));

        let handle = thread::Builder::new()
            .name(format!("rpool-worker-{synthetic_pid}"))
            .spawn({
                let in_q = Arc::clone(in_q);
                let out_q = Arc::clone(out_q);
                let execute = Arc::clone(&self.execute);
                let stop = Arc::clone(&stop);
                let exitcode = Arc::clone(&exitcode);
                move || worker_loop(in_q, out_q, execute, stop, exitcode)
            })?;

        Ok(ThreadWorker {
            synthetic_pid,
            stop,
            exitcode,
            handle: Some(handle),
        })
    }
}

fn worker_loop<Task, Output>(
    in_q: Arc<Queue<TaskEnvelope<Task>>>,
    out_q: Arc<Queue<ResultEnvelope<Output>>>,
    execute: Arc<dyn Fn(Task) -> Result<Output, String> + Send + Sync>,
    stop: Arc<AtomicBool>,
    exitcode: Arc<AtomicI32>,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match in_q.recv() {
            Some(envelope) => {
                let outcome = execute(envelope.task);
                let _ = out_q.push(Some(ResultEnvelope {
                    job_id: envelope.job_id,
                    chunk: envelope.chunk,
                    outcome,
                }));
            }
            None => break,
        }
    }));
    exitcode.store(if outcome.is_ok() { 0 } else { 1 }, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_executes_and_reports_clean_exit() {
        let backend = ClosureBackend::new(|x: u32| Ok::<u32, String>(x * x));
        let in_q: Arc<Queue<TaskEnvelope<u32>>> = Arc::new(Queue::bounded(4));
        let out_q: Arc<Queue<ResultEnvelope<u32>>> = Arc::new(Queue::bounded(4));
        let mut worker = backend.spawn_worker(&in_q, &out_q).unwrap();
        assert!(worker.is_alive());

        in_q.push(Some(TaskEnvelope { job_id: 0, chunk: 0, task: 6 })).unwrap();
        let result = out_q.recv().unwrap();
        assert_eq!(result.outcome, Ok(36));

        // `terminate` only flips the cooperative flag; waking a worker idle
        // on `in_q` is normally the pool's job, so this test does it itself.
        worker.terminate();
        in_q.push(None).unwrap();
        worker.join();
        assert_eq!(worker.exitcode(), Some(0));
    }

    #[test]
    fn panicking_task_crashes_the_worker_with_nonzero_exit() {
        let backend = ClosureBackend::new(|_: u32| -> Result<u32, String> { panic!("boom") });
        let in_q: Arc<Queue<TaskEnvelope<u32>>> = Arc::new(Queue::bounded(4));
        let out_q: Arc<Queue<ResultEnvelope<u32>>> = Arc::new(Queue::bounded(4));
        let mut worker = backend.spawn_worker(&in_q, &out_q).unwrap();
        in_q.push(Some(TaskEnvelope { job_id: 0, chunk: 0, task: 1 })).unwrap();
        worker.join();
        assert_eq!(worker.exitcode(), Some(1));
    }

    #[test]
    fn each_spawned_worker_gets_a_distinct_synthetic_pid() {
        let backend = ClosureBackend::new(|x: u32| Ok::<u32, String>(x));
        let in_q: Arc<Queue<TaskEnvelope<u32>>> = Arc::new(Queue::bounded(4));
        let out_q: Arc<Queue<ResultEnvelope<u32>>> = Arc::new(Queue::bounded(4));

        let mut first = backend.spawn_worker(&in_q, &out_q).unwrap();
        let mut second = backend.spawn_worker(&in_q, &out_q).unwrap();
        assert_ne!(first.pid(), second.pid());

        first.terminate();
        second.terminate();
        in_q.push(None).unwrap();
        in_q.push(None).unwrap();
        first.join();
        second.join();
    }
}
