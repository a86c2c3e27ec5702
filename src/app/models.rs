use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::app::classify::LineClassifier;
use crate::app::error::ErrorKind;

/// Key/value side-table filled by line classifiers (chipset, model, partitions...).
pub type DeviceInfo = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Collect,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogTag {
    Info,
    Success,
    Error,
    Warning,
    Raw,
}

impl fmt::Display for LogTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Raw => "raw",
        };
        f.write_str(label)
    }
}

/// One request to run an external program.
#[derive(Clone)]
pub struct Operation {
    pub id: OperationId,
    pub name: String,
    pub argv: Vec<String>,
    pub mode: Mode,
    /// Part of a sequence: the sequence owns progress, cancel and log chrome.
    pub is_sub_step: bool,
    /// Info-gathering: nothing is logged when it succeeds.
    pub quiet: bool,
    /// `None` falls back to the configured ceiling for the mode.
    pub timeout: Option<Duration>,
    pub classifiers: Vec<Arc<dyn LineClassifier>>,
}

impl Operation {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            id: OperationId::new(),
            name: name.into(),
            argv,
            mode: Mode::Collect,
            is_sub_step: false,
            quiet: false,
            timeout: None,
            classifiers: Vec::new(),
        }
    }

    pub fn from_args<I, S>(name: impl Into<String>, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, argv.into_iter().map(Into::into).collect())
    }

    pub fn streaming(mut self) -> Self {
        self.mode = Mode::Stream;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn LineClassifier>) -> Self {
        self.classifiers.push(classifier);
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub(crate) fn as_sub_step(mut self) -> Self {
        self.is_sub_step = true;
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or(&[])
    }

    pub fn trace_id(&self) -> String {
        self.id.to_string()
    }

    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let classifiers: Vec<&str> = self.classifiers.iter().map(|c| c.name()).collect();
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("argv", &self.argv)
            .field("mode", &self.mode)
            .field("is_sub_step", &self.is_sub_step)
            .field("quiet", &self.quiet)
            .field("timeout", &self.timeout)
            .field("classifiers", &classifiers)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Collected { stdout: String, stderr: String },
    Streamed { lines: Vec<String> },
}

/// Terminal outcome of one operation. Built once, never mutated by consumers.
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub operation: Operation,
    pub exit_code: Option<i32>,
    pub output: Output,
    pub error_kind: Option<ErrorKind>,
    pub device_info: DeviceInfo,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    NonZeroExit(i32),
    Failed(ErrorKind),
}

impl OperationResult {
    pub fn failed(operation: Operation, kind: ErrorKind, duration: Duration) -> Self {
        let output = match operation.mode {
            Mode::Collect => Output::Collected {
                stdout: String::new(),
                stderr: String::new(),
            },
            Mode::Stream => Output::Streamed { lines: Vec::new() },
        };
        Self {
            operation,
            exit_code: None,
            output,
            error_kind: Some(kind),
            device_info: DeviceInfo::new(),
            duration,
        }
    }

    pub fn outcome(&self) -> Outcome {
        if let Some(kind) = &self.error_kind {
            return Outcome::Failed(kind.clone());
        }
        match self.exit_code {
            Some(0) => Outcome::Success,
            Some(code) => Outcome::NonZeroExit(code),
            None => Outcome::Failed(ErrorKind::Other(
                "process exited without an exit code".to_string(),
            )),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome() == Outcome::Success
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_kind == Some(ErrorKind::Cancelled)
    }

    pub fn stdout(&self) -> &str {
        match &self.output {
            Output::Collected { stdout, .. } => stdout,
            Output::Streamed { .. } => "",
        }
    }

    pub fn stderr(&self) -> &str {
        match &self.output {
            Output::Collected { stderr, .. } => stderr,
            Output::Streamed { .. } => "",
        }
    }

    pub fn lines(&self) -> &[String] {
        match &self.output {
            Output::Streamed { lines } => lines,
            Output::Collected { .. } => &[],
        }
    }

    pub fn summary(&self) -> ResultSummary {
        ResultSummary {
            operation_id: self.operation.id,
            name: self.operation.name.clone(),
            exit_code: self.exit_code,
            error_kind: self.error_kind.clone(),
            device_info: self.device_info.clone(),
            duration_ms: self.duration.as_millis(),
        }
    }
}

/// Serializable view of a result for JSON reports.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResultSummary {
    pub operation_id: OperationId,
    pub name: String,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub device_info: DeviceInfo,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEvent {
    pub operation_id: OperationId,
    pub text: String,
}

/// Posted once per stream operation, after its merged pipe closed and the
/// process was reaped. Carries the captured exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfStream {
    pub operation_id: OperationId,
    pub exit_code: Option<i32>,
    pub error_kind: Option<ErrorKind>,
    pub duration: Duration,
}

/// The only type carried by the result channel.
#[derive(Debug, Clone)]
pub enum QueueMessage {
    Line(LineEvent),
    EndOfStream(EndOfStream),
    Finished(OperationResult),
}

impl QueueMessage {
    pub fn operation_id(&self) -> OperationId {
        match self {
            Self::Line(event) => event.operation_id,
            Self::EndOfStream(end) => end.operation_id,
            Self::Finished(result) => result.operation.id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceOutcome {
    Pending,
    Success,
    PartialFailure,
    Cancelled,
    Aborted,
}

impl fmt::Display for SequenceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::PartialFailure => "partial_failure",
            Self::Cancelled => "cancelled",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(exit_code: Option<i32>, error_kind: Option<ErrorKind>) -> OperationResult {
        OperationResult {
            operation: Operation::from_args("noop", ["true"]),
            exit_code,
            output: Output::Collected {
                stdout: String::new(),
                stderr: String::new(),
            },
            error_kind,
            device_info: DeviceInfo::new(),
            duration: Duration::from_millis(1),
        }
    }

    #[test]
    fn classifies_outcomes() {
        assert_eq!(result_with(Some(0), None).outcome(), Outcome::Success);
        assert_eq!(result_with(Some(2), None).outcome(), Outcome::NonZeroExit(2));
        assert_eq!(
            result_with(None, Some(ErrorKind::Timeout)).outcome(),
            Outcome::Failed(ErrorKind::Timeout)
        );
        assert!(matches!(
            result_with(None, None).outcome(),
            Outcome::Failed(ErrorKind::Other(_))
        ));
    }

    #[test]
    fn error_kind_wins_over_exit_code() {
        let result = result_with(Some(0), Some(ErrorKind::Cancelled));
        assert!(result.is_cancelled());
        assert!(!result.is_success());
    }

    #[test]
    fn operation_splits_program_and_args() {
        let op = Operation::from_args("reboot", ["adb", "reboot", "bootloader"]);
        assert_eq!(op.program(), "adb");
        assert_eq!(op.args(), ["reboot".to_string(), "bootloader".to_string()]);
        assert_eq!(op.mode, Mode::Collect);

        let empty = Operation::new("empty", Vec::new());
        assert_eq!(empty.program(), "");
        assert!(empty.args().is_empty());
    }

    #[test]
    fn summary_serializes_error_kind() {
        let summary = result_with(None, Some(ErrorKind::LaunchNotFound)).summary();
        let value = serde_json::to_value(&summary).expect("serialize");
        assert_eq!(value["error_kind"]["kind"], "launch_not_found");
        assert!(value.get("device_info").is_none());
    }
}
