use std::io;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
#[cfg(unix)]
use nix::unistd::Pid;

use crate::app::error::ErrorKind;
use crate::app::models::OperationId;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug)]
pub enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
    Failed(io::Error),
}

/// One spawned OS process and, on unix, the process group it leads.
///
/// The worker thread that spawned it holds the only strong reference; the
/// cancellation controller sees it through a `Weak`. The child is reaped only
/// under the mutex, so a signal is never sent to a recycled pid or group.
/// Signals go to the whole group: wrappers like `sh -c` or a Python client
/// must not leave helpers behind holding the output pipes.
#[derive(Debug)]
pub struct ProcessHandle {
    operation_id: OperationId,
    pid: u32,
    started_at: Instant,
    child: Mutex<Child>,
    reaped: AtomicBool,
    cancel_requested: AtomicBool,
}

impl ProcessHandle {
    pub fn spawn(command: &mut Command, operation_id: OperationId) -> io::Result<Arc<Self>> {
        #[cfg(unix)]
        command.process_group(0);
        let child = command.spawn()?;
        Ok(Arc::new(Self {
            operation_id,
            pid: child.id(),
            started_at: Instant::now(),
            child: Mutex::new(child),
            reaped: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        }))
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.reaped.load(Ordering::SeqCst)
    }

    fn lock_child(&self) -> io::Result<MutexGuard<'_, Child>> {
        self.child
            .lock()
            .map_err(|_| io::Error::other("process handle lock poisoned"))
    }

    pub fn take_pipes(&self) -> io::Result<(Option<ChildStdout>, Option<ChildStderr>)> {
        let mut guard = self.lock_child()?;
        Ok((guard.stdout.take(), guard.stderr.take()))
    }

    pub fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        let mut guard = self.lock_child()?;
        let status = guard.try_wait()?;
        if status.is_some() {
            self.reaped.store(true, Ordering::SeqCst);
        }
        Ok(status)
    }

    /// Graceful stop (SIGTERM to the group on unix, `TerminateProcess` elsewhere).
    /// Returns `false` when the process had already exited.
    pub fn terminate(&self) -> io::Result<bool> {
        let mut guard = self.lock_child()?;
        if self.reaped.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if let Some(_status) = guard.try_wait()? {
            self.reaped.store(true, Ordering::SeqCst);
            return Ok(false);
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        signal_group(&mut guard, self.pid, GroupSignal::Terminate)?;
        Ok(true)
    }

    /// Immediate kill, for callers escalating after the grace period.
    pub fn kill(&self) -> io::Result<bool> {
        let mut guard = self.lock_child()?;
        if self.reaped.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if let Some(_status) = guard.try_wait()? {
            self.reaped.store(true, Ordering::SeqCst);
            return Ok(false);
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        signal_group(&mut guard, self.pid, GroupSignal::Kill)?;
        Ok(true)
    }

    /// Polls until exit or `deadline`; on expiry the process is killed and reaped.
    pub fn wait_until(&self, deadline: Option<Instant>) -> WaitOutcome {
        loop {
            match self.try_wait() {
                Ok(Some(status)) => return WaitOutcome::Exited(status),
                Ok(None) => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        if let Ok(mut guard) = self.lock_child() {
                            let _ = signal_group(&mut guard, self.pid, GroupSignal::Kill);
                            let _ = guard.wait();
                            self.reaped.store(true, Ordering::SeqCst);
                        }
                        return WaitOutcome::TimedOut;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return WaitOutcome::Failed(err),
            }
        }
    }

    /// Maps a finished wait onto the result fields: `(exit_code, error_kind)`.
    pub fn classify_exit(&self, outcome: WaitOutcome) -> (Option<i32>, Option<ErrorKind>) {
        match outcome {
            WaitOutcome::TimedOut => (None, Some(ErrorKind::Timeout)),
            WaitOutcome::Failed(err) => (
                None,
                Some(ErrorKind::Other(format!("Failed to poll command: {err}"))),
            ),
            WaitOutcome::Exited(status) => {
                let code = status.code();
                if self.cancel_requested() {
                    return (code, Some(ErrorKind::Cancelled));
                }
                match code {
                    Some(code) => (Some(code), None),
                    None => (None, Some(ErrorKind::Other(describe_signal_exit(&status)))),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Caller holds the child lock and has checked it is not reaped, so the
/// group id (the leader's pid) is still ours.
#[cfg(unix)]
fn signal_group(_child: &mut Child, pid: u32, which: GroupSignal) -> io::Result<()> {
    let Ok(raw) = i32::try_from(pid) else {
        return Err(io::Error::other("pid out of range"));
    };
    let sig = match which {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match signal::killpg(Pid::from_raw(raw), sig) {
        Ok(()) => Ok(()),
        // Group already gone; the waiter will reap the leader.
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(err) => Err(io::Error::other(err)),
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: u32, _which: GroupSignal) -> io::Result<()> {
    child.kill()
}

#[cfg(unix)]
fn describe_signal_exit(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => format!("terminated by signal {sig}"),
        None => "process exited without an exit code".to_string(),
    }
}

#[cfg(not(unix))]
fn describe_signal_exit(_status: &ExitStatus) -> String {
    "process exited without an exit code".to_string()
}
