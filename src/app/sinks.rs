use std::sync::{Arc, Mutex};

use crate::app::models::LogTag;

/// Receives classified log lines. Display formatting is the sink's concern.
pub trait LogSink: Send {
    fn write(&self, text: &str, tag: LogTag);

    fn clear(&self) {}
}

impl<F> LogSink for F
where
    F: Fn(&str, LogTag) + Send,
{
    fn write(&self, text: &str, tag: LogTag) {
        (self)(text, tag)
    }
}

/// Progress bar plus the cancel control's enabled state.
pub trait ProgressSink: Send {
    fn set_percent(&self, percent: u8);

    fn set_indeterminate(&self, running: bool);

    fn set_cancel_enabled(&self, _enabled: bool) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn set_percent(&self, _percent: u8) {}

    fn set_indeterminate(&self, _running: bool) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Percent(u8),
    Indeterminate(bool),
    CancelEnabled(bool),
}

/// In-memory sink shared between the engine and an observer (smoke runs, tests).
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    lines: Arc<Mutex<Vec<(String, LogTag)>>>,
    progress: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(String, LogTag)> {
        match self.lines.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.lines().into_iter().map(|(text, _)| text).collect()
    }

    pub fn progress(&self) -> Vec<ProgressEvent> {
        match self.progress.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        }
    }

    pub fn percents(&self) -> Vec<u8> {
        self.progress()
            .into_iter()
            .filter_map(|event| match event {
                ProgressEvent::Percent(value) => Some(value),
                _ => None,
            })
            .collect()
    }

    fn push_progress(&self, event: ProgressEvent) {
        if let Ok(mut guard) = self.progress.lock() {
            guard.push(event);
        }
    }
}

impl LogSink for RecordingSink {
    fn write(&self, text: &str, tag: LogTag) {
        if let Ok(mut guard) = self.lines.lock() {
            guard.push((text.to_string(), tag));
        }
    }
}

impl ProgressSink for RecordingSink {
    fn set_percent(&self, percent: u8) {
        self.push_progress(ProgressEvent::Percent(percent));
    }

    fn set_indeterminate(&self, running: bool) {
        self.push_progress(ProgressEvent::Indeterminate(running));
    }

    fn set_cancel_enabled(&self, enabled: bool) {
        self.push_progress(ProgressEvent::CancelEnabled(enabled));
    }
}
