use serde::{Deserialize, Serialize};

use crate::app::config::SequenceSettings;
use crate::app::error::ErrorKind;
use crate::app::models::{Operation, OperationResult, Outcome, SequenceOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePolicy {
    /// Stop at the first failed step instead of recording it and moving on.
    pub halt_on_soft_failure: bool,
}

impl From<&SequenceSettings> for SequencePolicy {
    fn from(settings: &SequenceSettings) -> Self {
        Self {
            halt_on_soft_failure: settings.halt_on_soft_failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    /// Start the step at this index.
    Next(usize),
    Done(SequenceOutcome),
}

/// Any failure other than a user cancel.
pub fn is_soft_failure(result: &OperationResult) -> bool {
    match result.outcome() {
        Outcome::Success => false,
        Outcome::Failed(ErrorKind::Cancelled) => false,
        Outcome::NonZeroExit(_) | Outcome::Failed(_) => true,
    }
}

/// `percent = 100 * cursor / total`, rounded half up. Zero steps count as done.
pub fn progress_percent(cursor: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let cursor = cursor.min(total);
    let rounded = (200 * cursor + total) / (2 * total);
    u8::try_from(rounded).unwrap_or(100)
}

/// Cursor over an ordered list of steps. Pure bookkeeping; launching the
/// steps and publishing progress belong to the dispatcher.
#[derive(Debug)]
pub struct SequenceState {
    name: String,
    steps: Vec<Operation>,
    cursor: usize,
    failed_steps: usize,
    policy: SequencePolicy,
    outcome: SequenceOutcome,
}

impl SequenceState {
    pub fn new(name: impl Into<String>, steps: Vec<Operation>, policy: SequencePolicy) -> Self {
        Self {
            name: name.into(),
            steps,
            cursor: 0,
            failed_steps: 0,
            policy,
            outcome: SequenceOutcome::Pending,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total(&self) -> usize {
        self.steps.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn failed_steps(&self) -> usize {
        self.failed_steps
    }

    pub fn policy(&self) -> SequencePolicy {
        self.policy
    }

    pub fn outcome(&self) -> SequenceOutcome {
        self.outcome
    }

    pub fn is_finished(&self) -> bool {
        self.outcome != SequenceOutcome::Pending
    }

    pub fn percent(&self) -> u8 {
        progress_percent(self.cursor, self.steps.len())
    }

    /// The step to launch next, if the sequence is still running.
    pub fn current(&self) -> Option<&Operation> {
        if self.is_finished() {
            return None;
        }
        self.steps.get(self.cursor)
    }

    /// First decision after construction: an empty sequence succeeds at once.
    pub fn start(&mut self) -> StepDecision {
        if self.steps.is_empty() {
            return self.finish(SequenceOutcome::Success);
        }
        StepDecision::Next(0)
    }

    /// Records the terminal result of the current step and decides what happens
    /// next. `cancel_pending` stops the sequence even when the step itself
    /// finished before the cancel reached it.
    pub fn record(&mut self, result: &OperationResult, cancel_pending: bool) -> StepDecision {
        if self.is_finished() {
            return StepDecision::Done(self.outcome);
        }
        self.cursor = (self.cursor + 1).min(self.steps.len());

        if result.is_cancelled() || cancel_pending {
            return self.finish(SequenceOutcome::Cancelled);
        }
        if is_soft_failure(result) {
            self.failed_steps += 1;
            if self.policy.halt_on_soft_failure {
                return self.finish(SequenceOutcome::Aborted);
            }
        }
        if self.cursor >= self.steps.len() {
            let outcome = if self.failed_steps > 0 {
                SequenceOutcome::PartialFailure
            } else {
                SequenceOutcome::Success
            };
            return self.finish(outcome);
        }
        StepDecision::Next(self.cursor)
    }

    /// Ends the sequence before its next step starts.
    pub fn cancel(&mut self) -> StepDecision {
        self.finish(SequenceOutcome::Cancelled)
    }

    fn finish(&mut self, outcome: SequenceOutcome) -> StepDecision {
        if !self.is_finished() {
            self.outcome = outcome;
        }
        StepDecision::Done(self.outcome)
    }
}
