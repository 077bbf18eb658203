//! The pool controller: the state machine, crash-cleanup, resize, and
//! shutdown protocols. This is the module the rest of the crate exists to
//! support.

use crate::backend::{Backend, JobId, ResultEnvelope, TaskEnvelope};
use crate::error::{AbortedWorkerError, CrashReason, JobFailure, PoolError, PoolResult};
use crate::pending::{ChunkOutcome, PendingJob};
use crate::queue::Queue;
use crate::worker::WorkerHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// The pool's lifecycle state: `Run` accepts work, `Close` drains what's
/// queued but refuses new submissions, `Terminate` is final and clean, and
/// `Broken` is final and marks an unrecovered crash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    Run,
    Close,
    Terminate,
    Broken,
}

const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(50);
const RESIZE_DRAIN_POLL: Duration = Duration::from_millis(100);
const RESIZE_CONVERGE_POLL: Duration = Duration::from_millis(5);
const HELP_STUFF_FINISH_TIMEOUT: Duration = Duration::from_millis(100);
const BROKEN_DRAIN_TRIES: u32 = 1000;
const BROKEN_DRAIN_INTERVAL: Duration = Duration::from_millis(1);

pub fn logical_cpu_count() -> usize {
    thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1)
}

/// One of the pool's three background threads (worker-handler, task-handler,
/// result-handler), bundled with the flag the controller uses to ask it to
/// wind down and the id needed to avoid joining itself.
struct HelperThread {
    handle: JoinHandle<()>,
    thread_id: ThreadId,
    terminate_requested: Arc<AtomicBool>,
}

impl HelperThread {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    fn request_terminate(&self) {
        self.terminate_requested.store(true, Ordering::Release);
    }

    /// Joins unless the caller *is* this thread, in which case joining would
    /// deadlock; the handle is simply dropped and the OS thread detaches.
    fn join_unless_self(self) {
        if thread::current().id() == self.thread_id {
            drop(self.handle);
        } else {
            let _ = self.handle.join();
        }
    }
}

struct MaintainedState<W> {
    state: PoolState,
    workers: Vec<W>,
}

/// A reusable, fault-tolerant worker pool generic over its [`Backend`].
pub struct Pool<B: Backend> {
    backend: Arc<B>,
    nproc: AtomicUsize,
    maintained: Mutex<MaintainedState<B::Worker>>,
    pending: Mutex<HashMap<JobId, Arc<PendingJob<B::Output>>>>,
    next_job_id: AtomicU64,
    draining: AtomicBool,

    task_queue: Queue<TaskEnvelope<B::Task>>,
    in_q: Arc<Queue<TaskEnvelope<B::Task>>>,
    out_q: Arc<Queue<ResultEnvelope<B::Output>>>,

    worker_handler: Mutex<Option<HelperThread>>,
    task_handler: Mutex<Option<HelperThread>>,
    result_handler: Mutex<Option<HelperThread>>,
    shutdown_once: Once,

    /// Test-only failure injection: lets integration tests deterministically
    /// reproduce a task-handler/result-handler crash without needing a real
    /// serialization failure, since that machinery lives in the backend
    /// rather than in these generic forwarding threads.
    task_poison: Mutex<Option<Arc<dyn Fn(&B::Task) -> bool + Send + Sync>>>,
    result_poison: Mutex<Option<Arc<dyn Fn(&B::Output) -> bool + Send + Sync>>>,
}

impl<B: Backend> Pool<B> {
    pub fn new(backend: B, nproc: NonZeroUsize) -> PoolResult<Arc<Self>> {
        let backend = Arc::new(backend);
        let capacity = nproc.get().saturating_mul(4).max(16);
        let in_q = Arc::new(Queue::bounded(capacity));
        let out_q = Arc::new(Queue::bounded(capacity));
        let task_queue = Queue::bounded(capacity);

        let worker_role = Arc::new(AtomicBool::new(false));
        let task_role = Arc::new(AtomicBool::new(false));
        let result_role = Arc::new(AtomicBool::new(false));

        let pool = Arc::new_cyclic(|weak: &Weak<Self>| {
            let worker_handle = spawn_named("worker-handler", {
                let pool = weak.clone();
                let role = worker_role.clone();
                move || run_worker_handler(pool, role)
            });
            let task_handle = spawn_named("task-handler", {
                let pool = weak.clone();
                move || run_task_handler(pool)
            });
            let result_handle = spawn_named("result-handler", {
                let pool = weak.clone();
                move || run_result_handler(pool)
            });

            Self {
                backend,
                nproc: AtomicUsize::new(nproc.get()),
                maintained: Mutex::new(MaintainedState {
                    state: PoolState::Run,
                    workers: Vec::new(),
                }),
                pending: Mutex::new(HashMap::new()),
                next_job_id: AtomicU64::new(0),
                draining: AtomicBool::new(false),
                task_queue,
                in_q,
                out_q,
                worker_handler: Mutex::new(Some(HelperThread {
                    thread_id: worker_handle.thread().id(),
                    handle: worker_handle,
                    terminate_requested: worker_role,
                })),
                task_handler: Mutex::new(Some(HelperThread {
                    thread_id: task_handle.thread().id(),
                    handle: task_handle,
                    terminate_requested: task_role,
                })),
                result_handler: Mutex::new(Some(HelperThread {
                    thread_id: result_handle.thread().id(),
                    handle: result_handle,
                    terminate_requested: result_role,
                })),
                shutdown_once: Once::new(),
                task_poison: Mutex::new(None),
                result_poison: Mutex::new(None),
            }
        });

        {
            let mut guard = pool.maintained.lock();
            pool.repopulate_locked(&mut guard, nproc.get());
        }

        Ok(pool)
    }

    pub fn state(&self) -> PoolState {
        self.maintained.lock().state
    }

    /// Runs one maintenance pass immediately instead of waiting for the
    /// worker-handler thread's next periodic tick. Callers that are about to
    /// make a decision based on `state()` (such as the singleton registry)
    /// should call this first so a crash that already happened is reflected
    /// before they act on a stale `Run`.
    pub fn maintain(self: &Arc<Self>) {
        self.maintenance_pass();
    }

    pub fn nproc(&self) -> usize {
        self.nproc.load(Ordering::Acquire)
    }

    /// Only meaningful before the first task is submitted; lets tests
    /// reproduce a task-handler crash deterministically.
    pub fn set_task_poison(&self, check: impl Fn(&B::Task) -> bool + Send + Sync + 'static) {
        *self.task_poison.lock() = Some(Arc::new(check));
    }

    /// Only meaningful before the first task is submitted; lets tests
    /// reproduce a result-handler crash deterministically.
    pub fn set_result_poison(&self, check: impl Fn(&B::Output) -> bool + Send + Sync + 'static) {
        *self.result_poison.lock() = Some(Arc::new(check));
    }

    /// Submits one job. A single task makes a `Single` pending job; more than
    /// one makes a `Chunked` one whose chunks may complete out of order.
    pub fn submit<I>(self: &Arc<Self>, tasks: I) -> PoolResult<Arc<PendingJob<B::Output>>>
    where
        I: IntoIterator<Item = B::Task>,
        I::IntoIter: ExactSizeIterator,
    {
        let tasks = tasks.into_iter();
        let length = tasks.len();
        if length == 0 {
            return Err(PoolError::InvalidArgument(
                "a job must contain at least one task".into(),
            ));
        }

        match self.maintained.lock().state {
            PoolState::Run => {}
            PoolState::Broken => return Err(PoolError::Broken),
            PoolState::Close | PoolState::Terminate => return Err(PoolError::Closed),
        }
        if self.draining.load(Ordering::Acquire) {
            return Err(PoolError::Draining);
        }

        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let job = Arc::new(if length == 1 {
            PendingJob::single()
        } else {
            PendingJob::chunked(length)
        });
        self.pending.lock().insert(job_id, job.clone());

        for (chunk, task) in tasks.enumerate() {
            if let Err(err) = self.task_queue.push(Some(TaskEnvelope { job_id, chunk, task })) {
                return Err(err.into());
            }
        }

        Ok(job)
    }

    /// Transitions `RUN -> CLOSE`: no new submissions, but jobs already
    /// queued keep draining until `terminate()` is called.
    pub fn close(self: &Arc<Self>) -> PoolResult<()> {
        let mut guard = self.maintained.lock();
        match guard.state {
            PoolState::Run => {
                guard.state = PoolState::Close;
                Ok(())
            }
            PoolState::Close => Ok(()),
            PoolState::Terminate | PoolState::Broken => Err(PoolError::Closed),
        }
    }

    /// Grows or shrinks the pool to `n` worker processes (or the logical CPU
    /// count if `None`).
    pub fn resize(self: &Arc<Self>, n: Option<usize>) -> PoolResult<()> {
        let n = n.unwrap_or_else(logical_cpu_count);
        if n < 1 {
            return Err(PoolError::InvalidArgument("processes must be at least 1".into()));
        }
        if n == self.nproc.load(Ordering::Acquire) {
            return Ok(());
        }

        let pending_count = self.pending.lock().len();
        if pending_count > 0 {
            log::warn!(
                "resizing a pool with {pending_count} pending job(s); submissions are rejected until the resize completes"
            );
        }
        self.draining.store(true, Ordering::Release);
        while !self.pending.lock().is_empty() {
            thread::sleep(RESIZE_DRAIN_POLL);
        }

        self.nproc.store(n, Ordering::Release);

        let current = self.maintained.lock().workers.len();
        if current > n {
            for _ in 0..(current - n) {
                let _ = self.in_q.push(None);
            }
        }

        loop {
            self.maintenance_pass();
            let guard = self.maintained.lock();
            if guard.workers.len() == n || guard.state != PoolState::Run {
                break;
            }
            drop(guard);
            thread::sleep(RESIZE_CONVERGE_POLL);
        }

        self.draining.store(false, Ordering::Release);
        Ok(())
    }

    /// From `RUN`/`CLOSE`, runs the sentinel-based shutdown protocol exactly
    /// once. From `BROKEN`, performs a bounded drain-and-wait instead.
    pub fn terminate(self: &Arc<Self>) {
        if self.state() == PoolState::Broken {
            self.drain_and_wait(BROKEN_DRAIN_TRIES, BROKEN_DRAIN_INTERVAL);
            return;
        }
        let this = Arc::clone(self);
        self.shutdown_once.call_once(move || this.shutdown_inner());
    }

    fn shutdown_inner(self: &Arc<Self>) {
        if let Some(h) = self.worker_handler.lock().as_ref() {
            h.request_terminate();
        }
        if let Some(h) = self.task_handler.lock().as_ref() {
            h.request_terminate();
        }
        let _ = self.task_queue.push(None);

        self.help_stuff_finish(&self.in_q);
        self.help_stuff_finish(&self.out_q);

        let result_alive = self
            .result_handler
            .lock()
            .as_ref()
            .is_some_and(HelperThread::is_alive);
        debug_assert!(
            result_alive || self.pending.lock().is_empty(),
            "result handler is gone but jobs are still pending"
        );

        if let Some(h) = self.result_handler.lock().as_ref() {
            h.request_terminate();
        }
        let _ = self.out_q.push(None);

        if let Some(h) = self.worker_handler.lock().take() {
            h.join_unless_self();
        }

        {
            let mut guard = self.maintained.lock();
            for worker in guard.workers.iter_mut() {
                if worker.exitcode().is_none() {
                    worker.terminate();
                }
            }
            // One sentinel per worker: the only way to guarantee every
            // worker (or, for a process-backed worker, its bridging thread)
            // currently idle-blocked on `in_q` wakes up, since the shared
            // queue has no way to address one specific reader.
            for _ in 0..guard.workers.len() {
                let _ = self.in_q.push(None);
            }
        }

        if let Some(h) = self.task_handler.lock().take() {
            h.join_unless_self();
        }
        if let Some(h) = self.result_handler.lock().take() {
            h.join_unless_self();
        }

        // The result handler is already joined above, so no concurrent
        // `pool.fulfil` can race this bulk-fail. Clear the map afterward
        // regardless — `pool.fulfil`'s own removal is gated on a condition a
        // bulk-failed job never reaches.
        let failure = JobFailure::Terminated(crate::error::TerminatedPoolError);
        {
            let mut pending = self.pending.lock();
            for job in pending.values() {
                job.fail_remaining(failure);
            }
            pending.clear();
        }

        let mut guard = self.maintained.lock();
        for worker in guard.workers.iter_mut() {
            worker.join();
        }
        guard.state = PoolState::Terminate;
    }

    /// Attempts the read-lock with a short timeout, then drains whatever is
    /// readable on `queue` for as long as the task-handler is still alive.
    /// Used to unstick a task-handler blocked writing into a full `in_q`, and
    /// symmetrically to unstick any writer blocked on `out_q`.
    fn help_stuff_finish<T>(&self, queue: &Queue<T>) {
        if !queue.read_lock().acquire(HELP_STUFF_FINISH_TIMEOUT) {
            log::debug!("queue read lock timed out while finishing shutdown; pool may have crashed");
        }
        loop {
            let task_alive = self
                .task_handler
                .lock()
                .as_ref()
                .is_some_and(HelperThread::is_alive);
            if !task_alive || !queue.has_readable() {
                break;
            }
            queue.drain_one();
        }
    }

    /// Bounded drain-and-wait used when `terminate()` is called on an
    /// already-[`BROKEN`](PoolState::Broken) pool: crash-cleanup already
    /// requested everything stop, this just waits for it to actually happen.
    fn drain_and_wait(self: &Arc<Self>, tries: u32, interval: Duration) {
        for _ in 0..tries {
            let workers_done = {
                let mut guard = self.maintained.lock();
                guard.workers.iter_mut().all(|w| w.exitcode().is_some())
            };
            let task_dead = self
                .task_handler
                .lock()
                .as_ref()
                .map_or(true, |h| !h.is_alive());
            let result_dead = self
                .result_handler
                .lock()
                .as_ref()
                .map_or(true, |h| !h.is_alive());
            if workers_done && task_dead && result_dead {
                return;
            }
            thread::sleep(interval);
        }
        self.log_drain_stragglers();
    }

    fn log_drain_stragglers(&self) {
        let mut guard = self.maintained.lock();
        for worker in guard.workers.iter_mut() {
            if worker.exitcode().is_none() {
                log::warn!(
                    "terminate on a broken pool timed out: worker pid {} is still alive",
                    worker.pid()
                );
            }
        }
        drop(guard);
        if self.task_handler.lock().as_ref().is_some_and(HelperThread::is_alive) {
            log::warn!("terminate on a broken pool timed out: task handler thread is still alive");
        }
        if self.result_handler.lock().as_ref().is_some_and(HelperThread::is_alive) {
            log::warn!("terminate on a broken pool timed out: result handler thread is still alive");
        }
    }

    /// Reaps exited workers, checks the helper threads are alive, and either
    /// runs crash-cleanup or repopulates back up to `nproc`. Idempotent; safe
    /// to call from the worker-handler loop and from `resize`.
    fn maintenance_pass(self: &Arc<Self>) {
        let mut guard = self.maintained.lock();
        if guard.state == PoolState::Broken {
            return;
        }

        let mut crashed = None;
        let mut i = 0;
        while i < guard.workers.len() {
            match guard.workers[i].exitcode() {
                None => i += 1,
                Some(0) => {
                    guard.workers[i].join();
                    guard.workers.remove(i);
                }
                Some(exitcode) => {
                    guard.workers[i].join();
                    guard.workers.remove(i);
                    crashed = Some(CrashReason::WorkerCrash { exitcode });
                    break;
                }
            }
        }

        if crashed.is_none() {
            let result_alive = self
                .result_handler
                .lock()
                .as_ref()
                .is_some_and(HelperThread::is_alive);
            let task_alive = self
                .task_handler
                .lock()
                .as_ref()
                .is_some_and(HelperThread::is_alive);
            if !result_alive {
                crashed = Some(CrashReason::ResultHandlerCrashed);
            } else if !task_alive {
                crashed = Some(CrashReason::TaskHandlerCrashed);
            }
        }

        if let Some(reason) = crashed {
            self.crash_cleanup_locked(&mut guard, reason);
            return;
        }

        let nproc = self.nproc.load(Ordering::Acquire);
        if guard.state == PoolState::Run && guard.workers.len() < nproc {
            self.repopulate_locked(&mut guard, nproc);
        }
    }

    fn repopulate_locked(self: &Arc<Self>, guard: &mut MaintainedState<B::Worker>, nproc: usize) {
        while guard.workers.len() < nproc {
            match self.backend.spawn_worker(&self.in_q, &self.out_q) {
                Ok(worker) => guard.workers.push(worker),
                Err(err) => {
                    log::error!("failed to spawn worker: {err}");
                    break;
                }
            }
        }
    }

    /// The crash-cleanup protocol, run while already holding `maintained`.
    fn crash_cleanup_locked(self: &Arc<Self>, guard: &mut MaintainedState<B::Worker>, reason: CrashReason) {
        if guard.state == PoolState::Broken {
            return;
        }

        let _ = self.task_queue.force_sentinel();

        if let Some(h) = self.worker_handler.lock().as_ref() {
            h.request_terminate();
        }

        for worker in guard.workers.iter() {
            worker.terminate();
        }
        for _ in 0..guard.workers.len() {
            let _ = self.in_q.push(None);
        }

        let failure = JobFailure::AbortedWorker(AbortedWorkerError::new(reason));
        {
            // A legitimate result for a sibling chunk may still be in flight
            // through `pool.fulfil` concurrently with this bulk-fail;
            // `Record::fulfil` treats whichever of the two reaches a given
            // slot first as authoritative and no-ops the other. Clearing the
            // map here (rather than relying on `pool.fulfil`'s own removal,
            // which a bulk-failed job never reaches) keeps `pending` from
            // holding stale entries that would spin a later `resize`'s drain
            // loop forever.
            let mut pending = self.pending.lock();
            for job in pending.values() {
                job.fail_remaining(failure);
            }
            pending.clear();
        }

        if let Some(h) = self.result_handler.lock().as_ref() {
            h.request_terminate();
        }
        let _ = self.out_q.force_sentinel();

        guard.state = PoolState::Broken;
        log::warn!("pool broken: {reason}");
    }
}

fn spawn_named(name: &str, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("failed to spawn pool helper thread")
}

fn run_worker_handler<B: Backend>(pool: Weak<Pool<B>>, role: Arc<AtomicBool>) {
    loop {
        if role.load(Ordering::Acquire) {
            return;
        }
        let Some(pool) = pool.upgrade() else { return };
        pool.maintenance_pass();
        drop(pool);
        thread::sleep(MAINTENANCE_INTERVAL);
    }
}

/// Moves jobs from the internal task queue onto the shared `in_q` the
/// backend's workers read from, blocking (and thus applying backpressure)
/// when `in_q` is full.
fn run_task_handler<B: Backend>(pool: Weak<Pool<B>>) {
    loop {
        let Some(pool) = pool.upgrade() else { return };
        match pool.task_queue.recv() {
            Some(envelope) => {
                let poisoned = pool
                    .task_poison
                    .lock()
                    .as_ref()
                    .is_some_and(|check| check(&envelope.task));
                if poisoned {
                    panic!("task could not be handed off to a worker");
                }
                let _ = pool.in_q.send_blocking(Some(envelope));
            }
            None => {
                let _ = pool.in_q.push(None);
                return;
            }
        }
    }
}

/// Routes results off the shared `out_q` back to the pending job they belong
/// to, removing the pending record once its last chunk is delivered.
fn run_result_handler<B: Backend>(pool: Weak<Pool<B>>) {
    loop {
        let Some(pool) = pool.upgrade() else { return };
        match pool.out_q.recv() {
            Some(envelope) => {
                let poisoned = envelope
                    .outcome
                    .as_ref()
                    .ok()
                    .and_then(|value| pool.result_poison.lock().as_ref().map(|check| check(value)))
                    .unwrap_or(false);
                if poisoned {
                    panic!("result could not be decoded from a worker");
                }
                pool.fulfil(envelope);
            }
            None => return,
        }
    }
}

impl<B: Backend> Pool<B> {
    fn fulfil(self: &Arc<Self>, envelope: ResultEnvelope<B::Output>) {
        let job = self.pending.lock().get(&envelope.job_id).cloned();
        let Some(job) = job else { return };
        // Crash-cleanup may have already force-failed this job (and, on a
        // racing worker, be in the middle of doing so for this very chunk);
        // `Record::fulfil` is a no-op for an already-filled slot, so this is
        // just avoiding the pointless work, not needed for correctness.
        if job.is_terminal() {
            return;
        }

        let outcome = match envelope.outcome {
            Ok(value) => ChunkOutcome::Ok(value),
            Err(message) => ChunkOutcome::TaskFailed(message),
        };
        job.fulfil(envelope.chunk, outcome);

        if job.is_terminal() {
            self.pending.lock().remove(&envelope.job_id);
        }
    }
}
