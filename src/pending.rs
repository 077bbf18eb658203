//! The pending-job record: the controller-side bookkeeping for one
//! submitted job, single-valued or chunked.

use crate::error::JobFailure;
use parking_lot::{Condvar, Mutex};

/// The outcome of one chunk: either the task's own result, a normal error
/// the task returned, or a pool-level abort.
#[derive(Debug)]
pub enum ChunkOutcome<T> {
    Ok(T),
    TaskFailed(String),
    Aborted(JobFailure),
}

impl<T> ChunkOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

/// The shared engine behind both [`PendingJob::Single`] and
/// [`PendingJob::Chunked`]: `length` slots, an `index` of how many have been
/// delivered in order, and a condvar for `wait`.
#[derive(Debug)]
struct Record<T> {
    length: usize,
    index: Mutex<usize>,
    slots: Mutex<Vec<Option<ChunkOutcome<T>>>>,
    delivered: Mutex<Vec<ChunkOutcome<T>>>,
    terminal: Condvar,
}

impl<T> Record<T> {
    fn new(length: usize) -> Self {
        assert!(length >= 1, "a pending job must expect at least one chunk");
        Self {
            length,
            index: Mutex::new(0),
            slots: Mutex::new((0..length).map(|_| None).collect()),
            delivered: Mutex::new(Vec::with_capacity(length)),
            terminal: Condvar::new(),
        }
    }

    /// A slot that's already filled is left alone: a legitimate result and a
    /// crash-cleanup abort can race to fulfil the same chunk (the result
    /// arriving on `out_q` just as a sibling worker's crash is detected), and
    /// whichever got here first wins rather than panicking the loser.
    fn fulfil(&self, i: usize, outcome: ChunkOutcome<T>) {
        assert!(i < self.length, "chunk index {i} out of range");
        let newly_filled = {
            let mut slots = self.slots.lock();
            if slots[i].is_none() {
                slots[i] = Some(outcome);
                true
            } else {
                false
            }
        };
        if newly_filled {
            self.advance();
        }
    }

    /// Delivers every contiguous run of filled slots starting at `index`,
    /// so out-of-order chunk arrivals are buffered until their turn.
    fn advance(&self) {
        let mut index = self.index.lock();
        let mut slots = self.slots.lock();
        let mut delivered = self.delivered.lock();
        while *index < self.length {
            match slots[*index].take() {
                Some(outcome) => {
                    delivered.push(outcome);
                    *index += 1;
                }
                None => break,
            }
        }
        if *index == self.length {
            self.terminal.notify_all();
        }
    }

    fn index(&self) -> usize {
        *self.index.lock()
    }

    fn is_terminal(&self) -> bool {
        self.index() == self.length
    }

    /// Blocks until every chunk has been delivered, then returns them in
    /// order.
    fn wait(&self) -> Vec<ChunkOutcome<T>>
    where
        T: Clone,
    {
        let mut index = self.index.lock();
        while *index != self.length {
            self.terminal.wait(&mut index);
        }
        self.delivered.lock().clone()
    }
}

impl<T: Clone> Clone for ChunkOutcome<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Ok(v) => Self::Ok(v.clone()),
            Self::TaskFailed(msg) => Self::TaskFailed(msg.clone()),
            Self::Aborted(err) => Self::Aborted(*err),
        }
    }
}

/// A controller-side future-in-waiting backing one submitted job. Single for
/// `apply`-style jobs, chunked for `map`-style jobs with more than one
/// result chunk.
#[derive(Debug)]
pub enum PendingJob<T> {
    Single(Record<T>),
    Chunked(Record<T>),
}

impl<T> PendingJob<T> {
    pub fn single() -> Self {
        Self::Single(Record::new(1))
    }

    pub fn chunked(length: usize) -> Self {
        Self::Chunked(Record::new(length))
    }

    fn record(&self) -> &Record<T> {
        match self {
            Self::Single(record) | Self::Chunked(record) => record,
        }
    }

    pub fn length(&self) -> usize {
        self.record().length
    }

    pub fn index(&self) -> usize {
        self.record().index()
    }

    pub fn is_terminal(&self) -> bool {
        self.record().is_terminal()
    }

    pub fn fulfil(&self, i: usize, outcome: ChunkOutcome<T>) {
        self.record().fulfil(i, outcome);
    }

    /// Repeatedly fulfils the next undelivered chunk with a clone of
    /// `failure` until the job is terminal — the rule crash-cleanup and
    /// shutdown both use to fail every chunk still outstanding.
    pub fn fail_remaining(&self, failure: JobFailure)
    where
        T: Clone,
    {
        while !self.is_terminal() {
            let i = self.index();
            self.fulfil(i, ChunkOutcome::Aborted(failure));
        }
    }

    pub fn wait(&self) -> Vec<ChunkOutcome<T>>
    where
        T: Clone,
    {
        self.record().wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TerminatedPoolError;

    #[test]
    fn single_job_terminal_after_one_fulfilment() {
        let job = PendingJob::single();
        assert!(!job.is_terminal());
        job.fulfil(0, ChunkOutcome::Ok(42));
        assert!(job.is_terminal());
        assert_eq!(job.index(), 1);
    }

    #[test]
    fn chunked_job_buffers_out_of_order_chunks() {
        let job: PendingJob<u32> = PendingJob::chunked(3);
        job.fulfil(2, ChunkOutcome::Ok(2));
        assert_eq!(job.index(), 0, "chunk 2 must wait for 0 and 1");
        job.fulfil(0, ChunkOutcome::Ok(0));
        assert_eq!(job.index(), 1);
        job.fulfil(1, ChunkOutcome::Ok(1));
        assert_eq!(job.index(), 3);
        assert!(job.is_terminal());
    }

    #[test]
    fn kth_chunk_fulfilled_has_index_k_minus_one() {
        let job: PendingJob<u32> = PendingJob::chunked(4);
        for k in 1..=4 {
            job.fulfil(k - 1, ChunkOutcome::Ok(k as u32));
            assert_eq!(job.index(), k);
        }
    }

    #[test]
    fn fail_remaining_fills_every_chunk_with_the_same_failure() {
        let job: PendingJob<u32> = PendingJob::chunked(3);
        job.fulfil(0, ChunkOutcome::Ok(0));
        job.fail_remaining(JobFailure::Terminated(TerminatedPoolError));
        assert!(job.is_terminal());
        let delivered = job.wait();
        assert_eq!(delivered.len(), 3);
        assert!(delivered[0].is_success());
        assert!(!delivered[1].is_success());
        assert!(!delivered[2].is_success());
    }

    #[test]
    fn fulfilling_a_chunk_twice_keeps_the_first_outcome() {
        let job = PendingJob::single();
        job.fulfil(0, ChunkOutcome::Ok(1));
        job.fulfil(0, ChunkOutcome::Ok(2));
        let delivered = job.wait();
        assert!(matches!(delivered[0], ChunkOutcome::Ok(1)));
    }
}
