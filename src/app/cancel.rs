use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{info, warn};

use crate::app::error::AppError;
use crate::app::models::OperationId;
use crate::app::process::handle::ProcessHandle;

#[derive(Debug, Default)]
struct Slot {
    /// Name of the running top-level operation or sequence.
    active: Option<String>,
    armed: Option<(OperationId, Weak<ProcessHandle>)>,
    cancel_pending: bool,
}

/// The single "current cancellable process" slot.
///
/// A top-level operation (or a whole sequence) is *active* from submission
/// until its terminal result is dispatched; while active, the process it is
/// currently running is *armed*. Cloning shares the slot.
#[derive(Debug, Clone, Default)]
pub struct CancellationController {
    slot: Arc<Mutex<Slot>>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Busy guard: at most one top-level operation at a time.
    pub fn begin(&self, name: &str, trace_id: &str) -> Result<(), AppError> {
        let mut slot = self.slot();
        if let Some(current) = &slot.active {
            return Err(AppError::busy(
                format!("Another operation is already running: {current}"),
                trace_id,
            ));
        }
        slot.active = Some(name.to_string());
        slot.armed = None;
        slot.cancel_pending = false;
        Ok(())
    }

    pub fn finish(&self) {
        let mut slot = self.slot();
        slot.active = None;
        slot.armed = None;
        slot.cancel_pending = false;
    }

    pub fn is_active(&self) -> bool {
        self.slot().active.is_some()
    }

    /// Publishes `handle` as the cancellable process, superseding any previous
    /// one without signalling it. Returns `true` when a cancel arrived before
    /// the process existed; the caller then terminates it right away.
    pub fn arm(&self, handle: &Arc<ProcessHandle>) -> bool {
        let mut slot = self.slot();
        slot.armed = Some((handle.operation_id(), Arc::downgrade(handle)));
        slot.cancel_pending
    }

    /// Clears the armed handle if it still belongs to `operation_id`.
    pub fn disarm(&self, operation_id: OperationId) {
        let mut slot = self.slot();
        if slot
            .armed
            .as_ref()
            .is_some_and(|(armed_id, _)| *armed_id == operation_id)
        {
            slot.armed = None;
        }
    }

    pub fn armed_operation(&self) -> Option<OperationId> {
        self.slot().armed.as_ref().map(|(id, _)| *id)
    }

    pub fn cancel_pending(&self) -> bool {
        self.slot().cancel_pending
    }

    /// Graceful termination of the armed process. Never force-kills.
    ///
    /// Returns `false` (and does nothing) when no top-level operation is
    /// active. While one is active but has no live process yet, the request
    /// is remembered and honoured at launch.
    pub fn request_cancel(&self) -> bool {
        let mut slot = self.slot();
        if slot.active.is_none() {
            return false;
        }
        slot.cancel_pending = true;
        let Some(handle) = slot.armed.as_ref().and_then(|(_, weak)| weak.upgrade()) else {
            info!("cancel recorded; no process armed yet");
            return true;
        };
        drop(slot);
        if !handle.is_running() {
            info!(pid = handle.pid(), "process already exited");
            return true;
        }
        let running_ms = handle.started_at().elapsed().as_millis() as u64;
        match handle.terminate() {
            Ok(true) => info!(pid = handle.pid(), running_ms, "sent graceful termination"),
            Ok(false) => info!(pid = handle.pid(), "process already exited"),
            Err(err) => warn!(pid = handle.pid(), error = %err, "failed to terminate process"),
        }
        true
    }

    /// Escalation hook for callers whose grace period ran out.
    pub fn force_kill(&self) -> bool {
        let handle = {
            let slot = self.slot();
            slot.armed.as_ref().and_then(|(_, weak)| weak.upgrade())
        };
        let Some(handle) = handle.filter(|handle| handle.is_running()) else {
            return false;
        };
        match handle.kill() {
            Ok(killed) => killed,
            Err(err) => {
                warn!(pid = handle.pid(), error = %err, "failed to kill process");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_without_active_operation_is_a_no_op() {
        let controller = CancellationController::new();
        assert!(!controller.request_cancel());
        assert!(!controller.cancel_pending());
        assert!(!controller.force_kill());
    }

    #[test]
    fn begin_rejects_second_top_level_operation() {
        let controller = CancellationController::new();
        controller.begin("flash", "t1").expect("first begin");
        let err = controller.begin("backup", "t2").expect_err("busy");
        assert!(err.is_busy());
        controller.finish();
        controller.begin("backup", "t3").expect("after finish");
    }

    #[test]
    fn cancel_before_launch_is_remembered() {
        let controller = CancellationController::new();
        controller.begin("flash", "t1").expect("begin");
        assert!(controller.request_cancel());
        assert!(controller.cancel_pending());
        controller.finish();
        assert!(!controller.cancel_pending());
    }

    #[cfg(unix)]
    #[test]
    fn arm_supersedes_and_disarm_matches_owner() {
        use std::process::{Command, Stdio};
        let controller = CancellationController::new();
        controller.begin("seq", "t1").expect("begin");

        let spawn = |program: &str| {
            let mut command = Command::new(program);
            command.stdout(Stdio::null()).stderr(Stdio::null());
            ProcessHandle::spawn(&mut command, OperationId::new()).expect("spawn")
        };
        let first = spawn("true");
        let second = spawn("true");
        assert!(!controller.arm(&first));
        assert!(!controller.arm(&second));
        assert_eq!(controller.armed_operation(), Some(second.operation_id()));

        controller.disarm(first.operation_id());
        assert_eq!(controller.armed_operation(), Some(second.operation_id()));
        controller.disarm(second.operation_id());
        assert_eq!(controller.armed_operation(), None);

        let _ = first.wait_until(None);
        let _ = second.wait_until(None);
    }

    #[cfg(unix)]
    #[test]
    fn cancel_of_a_reaped_process_sends_nothing() {
        use std::process::{Command, Stdio};
        let controller = CancellationController::new();
        controller.begin("flash", "t1").expect("begin");
        let mut command = Command::new("true");
        command.stdout(Stdio::null()).stderr(Stdio::null());
        let handle = ProcessHandle::spawn(&mut command, OperationId::new()).expect("spawn");
        assert!(!controller.arm(&handle));
        let _ = handle.wait_until(None);
        assert!(!handle.is_running());

        assert!(controller.request_cancel());
        assert!(!handle.cancel_requested());
        assert!(!controller.force_kill());
    }
}
