//! The queue-pair collaborator: an ordered, sentinel-terminable transport
//! between the controller and the worker processes.
//!
//! Real multiprocessing queues are backed by OS pipes guarded by a
//! reader-side lock and a writer-side lock, because multiple processes may
//! share the same underlying file descriptor. This module reproduces just
//! the slice of that contract the controller depends on: non-blocking poll,
//! blocking recv, a timed read-lock, and a write-lock slot that
//! crash-cleanup is allowed to neutralize.

use crate::error::QueueError;
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Guards ordered reads off a [`Queue`]. Acquiring it before draining avoids
/// racing a healthy reader; failing to acquire it within the timeout means
/// the reader is most likely dead and permanently holding it, in which case
/// the caller should drain anyway (see `help_stuff_finish` in `pool.rs`).
#[derive(Debug, Default)]
pub struct ReadLock(Mutex<()>);

impl ReadLock {
    fn new() -> Self {
        Self(Mutex::new(()))
    }

    /// Returns `true` if the lock was acquired within `timeout`.
    pub fn acquire(&self, timeout: Duration) -> bool {
        self.0.try_lock_for(timeout).is_some()
    }
}

/// One direction of the queue pair: a bounded, ordered FIFO of frames of
/// type `T`. `None` is the sentinel — once observed by a reader, the queue
/// is considered end-of-stream.
pub struct Queue<T> {
    sender: Sender<Option<T>>,
    receiver: Receiver<Option<T>>,
    read_lock: ReadLock,
    write_neutralized: AtomicBool,
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("len", &self.receiver.len())
            .field("write_neutralized", &self.is_write_neutralized())
            .finish()
    }
}

impl<T> Queue<T> {
    pub fn bounded(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Self {
            sender,
            receiver,
            read_lock: ReadLock::new(),
            write_neutralized: AtomicBool::new(false),
        }
    }

    pub fn read_lock(&self) -> &ReadLock {
        &self.read_lock
    }

    pub fn is_write_neutralized(&self) -> bool {
        self.write_neutralized.load(Ordering::Acquire)
    }

    /// Pushes a frame (or the `None` sentinel) onto the queue.
    pub fn push(&self, item: Option<T>) -> Result<(), QueueError> {
        self.sender.try_send(item).map_err(|err| match err {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Disconnected(_) => QueueError::Disconnected,
        })
    }

    /// Blocks until there is room, then pushes a frame (or sentinel). This is
    /// the path normal task forwarding takes, so that a full queue applies
    /// real backpressure to whichever thread is feeding it.
    pub fn send_blocking(&self, item: Option<T>) -> Result<(), QueueError> {
        self.sender.send(item).map_err(|_| QueueError::Disconnected)
    }

    /// Crash-only: pushes the `None` sentinel while bypassing the normal
    /// write-lock bookkeeping, so a sentinel can still be delivered even if
    /// the write lock is believed to be permanently held by a dead writer.
    /// Per the design notes, this must never be called outside a
    /// crash-cleanup path.
    pub fn force_sentinel(&self) -> Result<(), QueueError> {
        self.write_neutralized.store(true, Ordering::Release);
        self.push(None)
    }

    /// Non-blocking poll. `Ok(None)` means nothing is available right now;
    /// `Ok(Some(None))` means the sentinel was read.
    pub fn try_recv(&self) -> Result<Option<Option<T>>, QueueError> {
        match self.receiver.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(QueueError::Disconnected),
        }
    }

    /// Blocks until a frame is available. Returns `None` on the sentinel
    /// *or* on disconnection, so callers never hang once the writer side is
    /// gone.
    pub fn recv(&self) -> Option<T> {
        self.receiver.recv().ok().flatten()
    }

    /// Returns `true` if a frame (possibly the sentinel) is immediately
    /// readable.
    pub fn has_readable(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Reads and discards one readable frame without decoding it, mirroring
    /// the external queue's `recv_bytes`. Returns `false` if nothing was
    /// readable.
    pub fn drain_one(&self) -> bool {
        self.receiver.try_recv().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_recv_round_trips() {
        let q: Queue<u32> = Queue::bounded(4);
        q.push(Some(7)).unwrap();
        assert_eq!(q.recv(), Some(7));
    }

    #[test]
    fn sentinel_recv_returns_none() {
        let q: Queue<u32> = Queue::bounded(4);
        q.push(None).unwrap();
        assert_eq!(q.recv(), None);
    }

    #[test]
    fn full_queue_rejects_push() {
        let q: Queue<u32> = Queue::bounded(1);
        q.push(Some(1)).unwrap();
        assert_eq!(q.push(Some(2)), Err(QueueError::Full));
    }

    #[test]
    fn force_sentinel_bypasses_capacity_bookkeeping_flag() {
        let q: Queue<u32> = Queue::bounded(4);
        assert!(!q.is_write_neutralized());
        q.force_sentinel().unwrap();
        assert!(q.is_write_neutralized());
        assert_eq!(q.recv(), None);
    }

    #[test]
    fn disconnected_receiver_side_reports_error() {
        let (sender, receiver) = crossbeam_channel::bounded::<Option<u32>>(1);
        drop(receiver);
        let err = sender.try_send(Some(1)).unwrap_err();
        assert!(matches!(err, TrySendError::Disconnected(_)));
    }

    #[test]
    fn read_lock_can_be_acquired_when_uncontended() {
        let lock = ReadLock::new();
        assert!(lock.acquire(Duration::from_millis(10)));
    }

    #[test]
    fn read_lock_times_out_when_held() {
        let lock = ReadLock::new();
        let _guard = lock.0.lock();
        assert!(!lock.acquire(Duration::from_millis(10)));
    }
}
