//! The worker-process collaborator: `pid`, `exitcode`, `terminate`, `join`,
//! `is_alive`.

use std::fmt;
use std::io;
use std::process::{Child, Command};

/// A handle to a long-lived worker. Implementations own the resource (OS
/// process, thread, whatever) and must make `exitcode`/`is_alive` reflect
/// reality without blocking.
pub trait WorkerHandle: Send + fmt::Debug {
    /// Operating-system process id (or an equivalent stand-in).
    fn pid(&self) -> u32;

    /// `None` while the worker is alive. `Some(0)` for a clean exit,
    /// `Some(n)` with `n < 0` for death by signal `-n`, `Some(n)` with
    /// `n > 0` for a non-zero exit.
    fn exitcode(&mut self) -> Option<i32>;

    /// Requests termination (SIGTERM-equivalent). Does not block.
    fn terminate(&self);

    /// Blocks until the worker has exited.
    fn join(&mut self);

    fn is_alive(&mut self) -> bool {
        self.exitcode().is_none()
    }
}

/// A worker backed by a real child process, terminated with `SIGTERM` and
/// reaped with `waitpid` (via [`Child::wait`]).
pub struct ProcessWorker {
    child: Child,
}

impl fmt::Debug for ProcessWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessWorker")
            .field("pid", &self.child.id())
            .finish()
    }
}

impl ProcessWorker {
    /// Spawns `command` as a new worker process.
    pub fn spawn(mut command: Command) -> io::Result<Self> {
        Ok(Self {
            child: command.spawn()?,
        })
    }

    /// Wraps a [`Child`] that has already been spawned, e.g. by a backend
    /// that needs to take its stdin/stdout pipes before handing the rest of
    /// the process off to this handle.
    pub fn from_child(child: Child) -> Self {
        Self { child }
    }
}

impl WorkerHandle for ProcessWorker {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn exitcode(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(exit_status_to_code(status)),
            Ok(None) => None,
            // An unreadable status is treated as a crash rather than hung
            // forever as "still alive".
            Err(_) => Some(1),
        }
    }

    fn terminate(&self) {
        // SAFETY: `kill` with a valid pid and a standard signal number is
        // always safe to call; at worst the process has already exited and
        // the call is a harmless no-op (ESRCH).
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
        }
    }

    fn join(&mut self) {
        let _ = self.child.wait();
    }
}

fn exit_status_to_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(signal) => -signal,
        None => status.code().unwrap_or(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleepy_worker() -> ProcessWorker {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        ProcessWorker::spawn(cmd).unwrap()
    }

    #[test]
    fn freshly_spawned_worker_is_alive() {
        let mut worker = sleepy_worker();
        assert!(worker.is_alive());
        worker.terminate();
        worker.join();
    }

    #[test]
    fn terminate_then_join_yields_signal_exitcode() {
        let mut worker = sleepy_worker();
        worker.terminate();
        worker.join();
        assert_eq!(worker.exitcode(), Some(-libc::SIGTERM));
    }

    #[test]
    fn clean_exit_reports_zero() {
        let cmd = Command::new("true");
        let mut worker = ProcessWorker::spawn(cmd).unwrap();
        worker.join();
        assert_eq!(worker.exitcode(), Some(0));
    }

    #[test]
    fn nonzero_exit_is_reported_as_positive() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 7"]);
        let mut worker = ProcessWorker::spawn(cmd).unwrap();
        worker.join();
        assert_eq!(worker.exitcode(), Some(7));
    }
}
