use std::collections::HashMap;
use std::mem;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::app::cancel::CancellationController;
use crate::app::classify::apply_classifiers;
use crate::app::config::EngineConfig;
use crate::app::error::{AppError, ErrorKind};
use crate::app::models::{
    DeviceInfo, EndOfStream, LineEvent, LogTag, Mode, Operation, OperationId, OperationResult,
    Output, QueueMessage, SequenceOutcome,
};
use crate::app::process::runner::{ProcessRunner, WorkerContext};
use crate::app::report::{self, ReportLine};
use crate::app::sequence::{is_soft_failure, SequencePolicy, SequenceState, StepDecision};
use crate::app::sinks::{LogSink, ProgressSink};

pub type Callback = Box<dyn FnOnce(&OperationResult) + Send>;
pub type StepCallback = Box<dyn FnMut(&OperationResult) + Send>;
pub type SequenceCallback = Box<dyn FnOnce(SequenceOutcome) + Send>;

struct Registration {
    operation: Operation,
    /// `None` for sequence steps; the sequence owns their completion.
    on_done: Option<Callback>,
    lines: Vec<String>,
    device_info: DeviceInfo,
}

struct ActiveSequence {
    state: SequenceState,
    trace_id: String,
    on_step: StepCallback,
    on_done: SequenceCallback,
}

/// Single consumer of the result channel. Owns the sinks, the callback
/// registry and the sequence cursor; every side effect of a finished process
/// happens inside [`Engine::tick`] on the thread that owns the engine.
pub struct Engine {
    config: EngineConfig,
    sender: SyncSender<QueueMessage>,
    receiver: Receiver<QueueMessage>,
    controller: CancellationController,
    log: Box<dyn LogSink>,
    progress: Box<dyn ProgressSink>,
    pending: HashMap<OperationId, Registration>,
    sequence: Option<ActiveSequence>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        log: impl LogSink + 'static,
        progress: impl ProgressSink + 'static,
    ) -> Self {
        let (sender, receiver) = mpsc::sync_channel(config.dispatcher.channel_capacity.max(1));
        Self {
            config,
            sender,
            receiver,
            controller: CancellationController::new(),
            log: Box::new(log),
            progress: Box::new(progress),
            pending: HashMap::new(),
            sequence: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared handle to the cancel slot, for callers on other threads.
    pub fn controller(&self) -> CancellationController {
        self.controller.clone()
    }

    /// No operation in flight and no sequence running.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.sequence.is_none()
    }

    /// Whether the cancel affordance should be enabled.
    pub fn cancel_enabled(&self) -> bool {
        self.controller.is_active()
    }

    /// Starts a top-level operation. `on_done` runs exactly once, from a later
    /// [`Engine::tick`].
    pub fn submit<F>(&mut self, operation: Operation, on_done: F) -> Result<OperationId, AppError>
    where
        F: FnOnce(&OperationResult) + Send + 'static,
    {
        let trace_id = operation.trace_id();
        validate_operation(&operation, &trace_id)?;
        self.controller.begin(&operation.name, &trace_id)?;

        info!(
            trace_id = %trace_id,
            operation = %operation.name,
            command = %operation.command_line(),
            "submitting operation"
        );
        let quiet = operation.quiet;
        if !quiet {
            self.log.clear();
            self.write_lines(report::start_lines(&operation));
            self.progress.set_indeterminate(true);
            self.progress.set_cancel_enabled(true);
        }

        let id = operation.id;
        if let Err(err) = self.launch(operation, Some(Box::new(on_done))) {
            if !quiet {
                self.progress.set_indeterminate(false);
                self.progress.set_cancel_enabled(false);
            }
            self.controller.finish();
            return Err(err);
        }
        Ok(id)
    }

    /// Runs `steps` one at a time as a single top-level unit. `on_step` sees
    /// every step result; `on_done` runs exactly once, immediately for an empty
    /// list. `policy` defaults to the configured one.
    pub fn run_sequence<S, D>(
        &mut self,
        name: &str,
        steps: Vec<Operation>,
        policy: Option<SequencePolicy>,
        on_step: S,
        on_done: D,
    ) -> Result<(), AppError>
    where
        S: FnMut(&OperationResult) + Send + 'static,
        D: FnOnce(SequenceOutcome) + Send + 'static,
    {
        let trace_id = OperationId::new().to_string();
        if name.trim().is_empty() {
            return Err(AppError::validation("Sequence name is required", &trace_id));
        }
        for step in &steps {
            validate_operation(step, &trace_id)?;
        }
        self.controller.begin(name, &trace_id)?;

        let policy = policy.unwrap_or_else(|| SequencePolicy::from(&self.config.sequence));
        let steps: Vec<Operation> = steps.into_iter().map(Operation::as_sub_step).collect();
        info!(
            trace_id = %trace_id,
            sequence = %name,
            steps = steps.len(),
            halt_on_soft_failure = policy.halt_on_soft_failure,
            "starting sequence"
        );

        self.log.clear();
        self.write_line(report::sequence_start_line(name, steps.len()));
        self.progress.set_indeterminate(false);
        self.progress.set_percent(0);
        self.progress.set_cancel_enabled(true);

        let mut state = SequenceState::new(name, steps, policy);
        let first = state.start();
        self.sequence = Some(ActiveSequence {
            state,
            trace_id,
            on_step: Box::new(on_step),
            on_done: Box::new(on_done),
        });
        match first {
            StepDecision::Next(_) => self.start_current_step(),
            StepDecision::Done(outcome) => self.finish_sequence(outcome),
        }
        Ok(())
    }

    /// The cancel affordance. Graceful only; see [`Engine::force_kill`].
    pub fn on_cancel_requested(&mut self) -> bool {
        let accepted = self.controller.request_cancel();
        if accepted {
            self.write_line((
                "Cancellation requested. Waiting for the process to stop...".to_string(),
                LogTag::Warning,
            ));
        }
        accepted
    }

    /// Escalation for callers whose grace period ran out.
    pub fn force_kill(&mut self) -> bool {
        let killed = self.controller.force_kill();
        if killed {
            self.write_line(("Process force-killed.".to_string(), LogTag::Warning));
        }
        killed
    }

    /// Drains every message currently queued, up to the configured cap, and
    /// never waits for more. Returns how many were handled.
    pub fn tick(&mut self) -> usize {
        let limit = self.config.dispatcher.max_messages_per_tick.max(1);
        let mut handled = 0;
        while handled < limit {
            match self.receiver.try_recv() {
                Ok(message) => {
                    self.handle(message);
                    handled += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        handled
    }

    /// Ticks on the configured period until idle. Returns `false` on timeout.
    pub fn run_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.tick();
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.config.tick_interval());
        }
    }

    fn resolve_timeout(&self, operation: &Operation) -> Option<Duration> {
        if operation.timeout.is_some() {
            return operation.timeout;
        }
        match operation.mode {
            Mode::Collect if operation.quiet => Some(self.config.quick_timeout()),
            Mode::Collect => Some(self.config.collect_timeout()),
            Mode::Stream => self.config.stream_timeout(),
        }
    }

    fn launch(&mut self, operation: Operation, on_done: Option<Callback>) -> Result<(), AppError> {
        let id = operation.id;
        let trace_id = operation.trace_id();
        let context = WorkerContext {
            sender: self.sender.clone(),
            controller: self.controller.clone(),
            cancellable: true,
            timeout: self.resolve_timeout(&operation),
        };
        self.pending.insert(
            id,
            Registration {
                operation: operation.clone(),
                on_done,
                lines: Vec::new(),
                device_info: DeviceInfo::new(),
            },
        );
        match ProcessRunner::submit(operation, context) {
            Ok(_worker) => Ok(()),
            Err(err) => {
                self.pending.remove(&id);
                warn!(trace_id = %trace_id, error = %err, "failed to start worker thread");
                Err(AppError::system(
                    format!("Failed to start worker thread: {err}"),
                    trace_id,
                ))
            }
        }
    }

    fn handle(&mut self, message: QueueMessage) {
        trace!(operation_id = %message.operation_id(), "dispatching message");
        match message {
            QueueMessage::Line(event) => self.handle_line(event),
            QueueMessage::EndOfStream(end) => self.handle_end_of_stream(end),
            QueueMessage::Finished(result) => self.handle_finished(result),
        }
    }

    fn handle_line(&mut self, event: LineEvent) {
        let Some(registration) = self.pending.get_mut(&event.operation_id) else {
            debug!(
                operation_id = %event.operation_id,
                "line for an operation that already finished"
            );
            return;
        };
        if !registration.operation.quiet {
            self.log.write(&event.text, LogTag::Raw);
        }
        apply_classifiers(
            &registration.operation.classifiers,
            &event.text,
            &mut registration.device_info,
        );
        registration.lines.push(event.text);
    }

    fn handle_end_of_stream(&mut self, end: EndOfStream) {
        let Some(registration) = self.pending.remove(&end.operation_id) else {
            warn!(operation_id = %end.operation_id, "dropping duplicate end of stream");
            return;
        };
        let result = OperationResult {
            operation: registration.operation,
            exit_code: end.exit_code,
            output: Output::Streamed {
                lines: registration.lines,
            },
            error_kind: end.error_kind,
            device_info: registration.device_info,
            duration: end.duration,
        };
        self.complete(result, registration.on_done);
    }

    fn handle_finished(&mut self, mut result: OperationResult) {
        let Some(mut registration) = self.pending.remove(&result.operation.id) else {
            warn!(trace_id = %result.operation.trace_id(), "dropping duplicate terminal result");
            return;
        };
        match &mut result.output {
            Output::Collected { stdout, stderr } => {
                for line in stdout.lines().chain(stderr.lines()) {
                    apply_classifiers(
                        &registration.operation.classifiers,
                        line,
                        &mut registration.device_info,
                    );
                }
            }
            // A stream worker that panicked reports through here; keep what it read.
            Output::Streamed { lines } => {
                if lines.is_empty() {
                    *lines = mem::take(&mut registration.lines);
                }
            }
        }
        for (key, value) in mem::take(&mut result.device_info) {
            registration.device_info.entry(key).or_insert(value);
        }
        result.device_info = registration.device_info;
        self.complete(result, registration.on_done);
    }

    fn complete(&mut self, result: OperationResult, on_done: Option<Callback>) {
        let trace_id = result.operation.trace_id();
        self.controller.disarm(result.operation.id);
        let duration_ms = result.duration.as_millis() as u64;
        match &result.error_kind {
            Some(kind) => info!(
                trace_id = %trace_id,
                operation = %result.operation.name,
                kind = %kind,
                code = kind.code(),
                duration_ms,
                "operation finished"
            ),
            None => info!(
                trace_id = %trace_id,
                operation = %result.operation.name,
                exit_code = ?result.exit_code,
                duration_ms,
                "operation finished"
            ),
        }
        self.write_lines(report::result_lines(&result, &self.config.report));

        if result.operation.is_sub_step {
            self.advance_sequence(result);
            return;
        }
        if !result.operation.quiet {
            self.progress.set_indeterminate(false);
            self.progress.set_cancel_enabled(false);
        }
        self.controller.finish();
        match on_done {
            Some(on_done) => on_done(&result),
            None => warn!(trace_id = %trace_id, "top-level operation without a callback"),
        }
    }

    fn advance_sequence(&mut self, result: OperationResult) {
        let cancel_pending = self.controller.cancel_pending();
        let Some(active) = self.sequence.as_mut() else {
            warn!(trace_id = %result.operation.trace_id(), "step finished outside a sequence");
            return;
        };
        let decision = active.state.record(&result, cancel_pending);
        (active.on_step)(&result);
        self.progress.set_percent(active.state.percent());
        if is_soft_failure(&result) {
            let halting = decision == StepDecision::Done(SequenceOutcome::Aborted);
            self.write_line(report::soft_failure_line(&result.operation, halting));
        }
        match decision {
            StepDecision::Next(_) => self.start_current_step(),
            StepDecision::Done(outcome) => self.finish_sequence(outcome),
        }
    }

    fn start_current_step(&mut self) {
        if self.controller.cancel_pending() {
            if let Some(active) = self.sequence.as_mut() {
                let StepDecision::Done(outcome) = active.state.cancel() else {
                    return;
                };
                self.finish_sequence(outcome);
            }
            return;
        }
        let Some(step) = self
            .sequence
            .as_ref()
            .and_then(|active| active.state.current().cloned())
        else {
            return;
        };
        self.write_line(report::sequence_attempt_line(&step));
        if let Err(err) = self.launch(step.clone(), None) {
            // Reported like any other step failure so the sequence still ends once.
            let result = OperationResult::failed(step, ErrorKind::Other(err.error), Duration::ZERO);
            self.write_lines(report::result_lines(&result, &self.config.report));
            self.advance_sequence(result);
        }
    }

    fn finish_sequence(&mut self, outcome: SequenceOutcome) {
        let Some(active) = self.sequence.take() else {
            return;
        };
        info!(
            trace_id = %active.trace_id,
            sequence = %active.state.name(),
            outcome = %outcome,
            completed = active.state.cursor(),
            total = active.state.total(),
            halt_on_soft_failure = active.state.policy().halt_on_soft_failure,
            "sequence finished"
        );
        self.write_line(report::sequence_done_line(active.state.name(), outcome));
        self.progress.set_cancel_enabled(false);
        self.controller.finish();
        (active.on_done)(outcome);
    }

    fn write_line(&self, (text, tag): ReportLine) {
        self.log.write(&text, tag);
    }

    fn write_lines(&self, lines: Vec<ReportLine>) {
        for line in lines {
            self.write_line(line);
        }
    }
}

fn validate_operation(operation: &Operation, trace_id: &str) -> Result<(), AppError> {
    if operation.name.trim().is_empty() {
        return Err(AppError::validation("Operation name is required", trace_id));
    }
    if operation.program().trim().is_empty() {
        return Err(AppError::validation(
            format!("Operation '{}' has an empty command", operation.name),
            trace_id,
        ));
    }
    Ok(())
}
