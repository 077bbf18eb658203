//! A [`Backend`] whose workers are real child processes speaking the
//! length-prefixed postcard protocol in [`crate::framing`] over stdin and
//! stdout. This is the "process-based" half of the pool's name: the
//! controller's in-process `Queue<T>` can't cross a process boundary by
//! itself, so each worker gets a pair of bridging threads that move frames
//! between the shared queue and the child's pipes.
//!
//! The bridging threads are plumbing internal to this backend, not part of
//! the core's three named helper threads; they are not tracked or joined by
//! the pool. Each one exits on its own shortly after its child process does
//! (`write` fails once the pipe breaks; `read` returns EOF), so they never
//! outlive the worker they serve by more than a few bytes' worth of I/O.

use crate::backend::{Backend, ResultEnvelope, TaskEnvelope};
use crate::framing::{read_frame, write_frame};
use crate::queue::Queue;
use crate::worker::ProcessWorker;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

pub struct ProcessBackend<Task, Output> {
    worker_bin: PathBuf,
    _marker: PhantomData<fn(Task) -> Output>,
}

impl<Task, Output> ProcessBackend<Task, Output> {
    pub fn new(worker_bin: impl Into<PathBuf>) -> Self {
        Self {
            worker_bin: worker_bin.into(),
            _marker: PhantomData,
        }
    }
}

impl<Task, Output> std::fmt::Debug for ProcessBackend<Task, Output> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessBackend").field("worker_bin", &self.worker_bin).finish()
    }
}

impl<Task, Output> Backend for ProcessBackend<Task, Output>
where
    Task: Serialize + Send + 'static,
    Output: DeserializeOwned + Send + Clone + 'static,
{
    type Worker = ProcessWorker;
    type Task = Task;
    type Output = Output;

    fn spawn_worker(
        &self,
        in_q: &Arc<Queue<TaskEnvelope<Task>>>,
        out_q: &Arc<Queue<ResultEnvelope<Output>>>,
    ) -> io::Result<Self::Worker> {
        let mut command = Command::new(&self.worker_bin);
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::inherit());
        let mut child = command.spawn()?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let mut stdout = child.stdout.take().expect("piped stdout");

        let writer_in_q = Arc::clone(in_q);
        thread::spawn(move || loop {
            match writer_in_q.recv() {
                Some(envelope) => {
                    if write_frame(&mut stdin, &envelope).is_err() {
                        break;
                    }
                }
                None => break,
            }
            // Dropping `stdin` at loop end closes the pipe, which is the
            // worker's own end-of-input signal.
        });

        let reader_out_q = Arc::clone(out_q);
        thread::spawn(move || loop {
            match read_frame::<ResultEnvelope<Output>>(&mut stdout) {
                Ok(Some(envelope)) => {
                    if reader_out_q.push(Some(envelope)).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        });

        Ok(ProcessWorker::from_child(child))
    }
}
