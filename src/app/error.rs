use serde::{Deserialize, Serialize};
use std::fmt;

/// Synchronous failure returned to a caller before any worker is involved:
/// a rejected submission, a bad argv, a config file that cannot be read.
#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_VALIDATION", message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_DEPENDENCY", message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_SYSTEM", message, trace_id)
    }

    pub fn busy(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_BUSY", message, trace_id)
    }

    pub fn is_busy(&self) -> bool {
        self.code == "ERR_BUSY"
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}

/// Why an operation ended without a usable exit code, or ended early.
///
/// A non-zero exit is deliberately absent: it is a completed run and is
/// derived from the exit code (see [`crate::app::models::Outcome`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ErrorKind {
    LaunchNotFound,
    Timeout,
    Cancelled,
    Other(String),
}

impl ErrorKind {
    pub fn from_spawn_error(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::LaunchNotFound,
            _ => Self::Other(format!("Failed to spawn command: {err}")),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::LaunchNotFound => "ERR_LAUNCH_NOT_FOUND",
            Self::Timeout => "ERR_TIMEOUT",
            Self::Cancelled => "ERR_CANCELLED",
            Self::Other(_) => "ERR_SYSTEM",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LaunchNotFound => write!(f, "executable not found"),
            Self::Timeout => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Other(message) => write!(f, "{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_not_found_spawn_error_to_launch_not_found() {
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(ErrorKind::from_spawn_error(&err), ErrorKind::LaunchNotFound);
    }

    #[test]
    fn keeps_other_spawn_errors_as_messages() {
        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        match ErrorKind::from_spawn_error(&err) {
            ErrorKind::Other(message) => assert!(message.starts_with("Failed to spawn command")),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn busy_errors_are_recognizable() {
        let err = AppError::busy("Another operation is already running", "trace-1");
        assert!(err.is_busy());
        assert_eq!(err.to_string(), "Another operation is already running (ERR_BUSY)");
    }
}
