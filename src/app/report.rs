use crate::app::config::ReportSettings;
use crate::app::error::ErrorKind;
use crate::app::models::{
    DeviceInfo, LogTag, Mode, Operation, OperationResult, Outcome, SequenceOutcome,
};

pub type ReportLine = (String, LogTag);

const INDENT_1: &str = "  ";
const INDENT_2: &str = "    ";

/// Output that only says "it worked" is not worth echoing.
const BOILERPLATE_MARKERS: &[&str] = &[
    "success",
    "already",
    "performed",
    "daemon started successfully",
    "waiting for brom...",
    "payload sent successfully",
];

const ERROR_KEYWORDS: &[&str] = &[
    "error",
    "fail",
    "traceback",
    "except",
    "critical",
    "could not",
    "can't open",
    "not found",
    "no such file",
    "nomodulefound",
];

fn is_boilerplate(text: &str) -> bool {
    let lower = text.to_lowercase();
    BOILERPLATE_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn push_block(lines: &mut Vec<ReportLine>, text: &str, limit: usize, tag: LogTag, overflow: &str) {
    for (index, line) in text.trim().lines().enumerate() {
        if index == limit {
            lines.push((format!("{INDENT_2}{overflow}"), tag));
            break;
        }
        lines.push((format!("{INDENT_2}{line}"), tag));
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}...")
}

fn error_summary(operation: &Operation, kind: &ErrorKind) -> String {
    match kind {
        ErrorKind::Timeout => "Operation timed out".to_string(),
        ErrorKind::LaunchNotFound => format!(
            "Command '{}' not found. Ensure ADB/Fastboot/mtkclient is in PATH.",
            operation.program()
        ),
        ErrorKind::Cancelled => "Operation cancelled by user".to_string(),
        ErrorKind::Other(message) => format!("Error - {message}"),
    }
}

fn error_tag(kind: &ErrorKind) -> LogTag {
    match kind {
        ErrorKind::Cancelled => LogTag::Warning,
        _ => LogTag::Error,
    }
}

pub fn start_lines(operation: &Operation) -> Vec<ReportLine> {
    vec![(format!("Operation Started: {}", operation.name), LogTag::Info)]
}

/// Log block for a terminal result, shaped by how the operation was run.
pub fn result_lines(result: &OperationResult, settings: &ReportSettings) -> Vec<ReportLine> {
    if result.operation.is_sub_step {
        return step_lines(result, settings);
    }
    if result.operation.quiet && result.is_success() {
        return Vec::new();
    }
    match result.operation.mode {
        Mode::Collect => collect_lines(result, settings),
        Mode::Stream => stream_lines(result, settings),
    }
}

fn collect_lines(result: &OperationResult, settings: &ReportSettings) -> Vec<ReportLine> {
    let name = &result.operation.name;
    let mut lines = Vec::new();
    match result.outcome() {
        Outcome::Failed(kind) => {
            lines.push((
                format!("{name}: {}", error_summary(&result.operation, &kind)),
                error_tag(&kind),
            ));
        }
        Outcome::Success => {
            lines.push((format!("{name}: Completed successfully."), LogTag::Success));
            let stdout = result.stdout();
            if !stdout.trim().is_empty() && !is_boilerplate(stdout) {
                lines.push((format!("{INDENT_1}Output (stdout):"), LogTag::Info));
                push_block(
                    &mut lines,
                    stdout,
                    settings.max_stdout_lines,
                    LogTag::Info,
                    "... (further output truncated in summary)",
                );
            }
            let stderr = result.stderr();
            if !stderr.trim().is_empty() {
                lines.push((format!("{INDENT_1}Output (stderr):"), LogTag::Warning));
                push_block(
                    &mut lines,
                    stderr,
                    settings.max_stderr_lines,
                    LogTag::Warning,
                    "... (further stderr truncated)",
                );
            }
        }
        Outcome::NonZeroExit(code) => {
            lines.push((format!("{name}: Failed (Code: {code})."), LogTag::Error));
            let details = if result.stderr().trim().is_empty() {
                result.stdout()
            } else {
                result.stderr()
            };
            if details.trim().is_empty() {
                lines.push((
                    format!("{INDENT_1}No specific error message from command."),
                    LogTag::Error,
                ));
            } else {
                lines.push((format!("{INDENT_1}Error Details:"), LogTag::Error));
                push_block(
                    &mut lines,
                    details,
                    settings.max_error_detail_lines,
                    LogTag::Error,
                    "... (further error details truncated)",
                );
            }
        }
    }
    lines
}

pub fn device_info_line(info: &DeviceInfo) -> String {
    if info.is_empty() {
        return "Device Info: Not detected or N/A.".to_string();
    }
    let joined = info
        .iter()
        .map(|(key, value)| format!("{}: {value}", title_case(key)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("Device Info: {joined}")
}

fn title_case(key: &str) -> String {
    key.split(['_', '.'])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn stream_lines(result: &OperationResult, settings: &ReportSettings) -> Vec<ReportLine> {
    let mut lines = vec![(format!("Operation: {}", result.operation.name), LogTag::Info)];
    lines.push((device_info_line(&result.device_info), LogTag::Info));
    match result.outcome() {
        Outcome::Success => lines.push(("Status: Success".to_string(), LogTag::Success)),
        Outcome::Failed(kind) => {
            lines.push((
                format!("Status: {}", error_summary(&result.operation, &kind)),
                error_tag(&kind),
            ));
        }
        Outcome::NonZeroExit(code) => {
            lines.push((format!("Status: Failed (Exit Code: {code})"), LogTag::Error));
            let suspects = result
                .lines()
                .iter()
                .filter(|line| {
                    let lower = line.to_lowercase();
                    ERROR_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
                })
                .take(settings.max_potential_error_lines);
            for line in suspects {
                lines.push((
                    format!("{INDENT_1}Potential Error Detail: {line}"),
                    LogTag::Error,
                ));
            }
        }
    }
    lines
}

fn step_lines(result: &OperationResult, settings: &ReportSettings) -> Vec<ReportLine> {
    let name = &result.operation.name;
    match result.outcome() {
        Outcome::Failed(kind) => vec![(
            format!("{INDENT_1}Step Error ({name}): {}", error_summary(&result.operation, &kind)),
            error_tag(&kind),
        )],
        Outcome::NonZeroExit(_) => {
            let details = if result.stderr().trim().is_empty() {
                result.stdout()
            } else {
                result.stderr()
            };
            let first = details
                .trim()
                .lines()
                .next()
                .or_else(|| result.lines().last().map(String::as_str))
                .unwrap_or("Unknown reason");
            vec![(
                format!("{INDENT_1}Step Failed ({name}): {first}"),
                LogTag::Error,
            )]
        }
        Outcome::Success => {
            let stdout = result.stdout().trim();
            if stdout.is_empty() || is_boilerplate(stdout) {
                return vec![(format!("{INDENT_1}Step OK ({name})"), LogTag::Info)];
            }
            let first = stdout.lines().next().unwrap_or_default();
            vec![(
                format!(
                    "{INDENT_1}Step OK: {}",
                    truncate_chars(first, settings.max_step_summary_chars)
                ),
                LogTag::Info,
            )]
        }
    }
}

pub fn sequence_start_line(name: &str, total: usize) -> ReportLine {
    (format!("Starting sequence: {name} ({total} steps)"), LogTag::Info)
}

pub fn sequence_attempt_line(step: &Operation) -> ReportLine {
    (format!("{INDENT_1}Attempting: {}", step.name), LogTag::Info)
}

pub fn soft_failure_line(step: &Operation, halting: bool) -> ReportLine {
    let tail = if halting { "Halting sequence." } else { "Continuing..." };
    (
        format!("{INDENT_1}Step '{}' may have failed. {tail}", step.name),
        LogTag::Warning,
    )
}

pub fn sequence_done_line(name: &str, outcome: SequenceOutcome) -> ReportLine {
    match outcome {
        SequenceOutcome::Success => (format!("{name}: Sequence completed."), LogTag::Success),
        SequenceOutcome::PartialFailure => (
            format!("{name}: Sequence finished with failed steps."),
            LogTag::Warning,
        ),
        SequenceOutcome::Cancelled => (
            format!("{name}: Sequence cancelled by user."),
            LogTag::Warning,
        ),
        SequenceOutcome::Aborted => (
            format!("{name}: Sequence aborted after a failed step."),
            LogTag::Error,
        ),
        SequenceOutcome::Pending => (format!("{name}: Sequence pending."), LogTag::Info),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::models::Output;
    use std::time::Duration;

    fn collected(op: Operation, code: Option<i32>, stdout: &str, stderr: &str) -> OperationResult {
        OperationResult {
            operation: op,
            exit_code: code,
            output: Output::Collected {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
            error_kind: None,
            device_info: DeviceInfo::new(),
            duration: Duration::ZERO,
        }
    }

    fn texts(lines: &[ReportLine]) -> Vec<&str> {
        lines.iter().map(|(text, _)| text.as_str()).collect()
    }

    #[test]
    fn success_echoes_stdout_and_truncates() {
        let op = Operation::from_args("List", ["adb", "devices"]);
        let stdout = (0..20).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        let lines = result_lines(&collected(op, Some(0), &stdout, ""), &ReportSettings::default());
        assert_eq!(lines[0], ("List: Completed successfully.".to_string(), LogTag::Success));
        assert_eq!(lines[1].0, "  Output (stdout):");
        assert_eq!(lines.len(), 2 + 15 + 1);
        assert!(lines.last().map(|(t, _)| t.contains("truncated")).unwrap_or(false));
    }

    #[test]
    fn boilerplate_stdout_is_not_echoed() {
        let op = Operation::from_args("Reboot", ["adb", "reboot"]);
        let lines = result_lines(
            &collected(op, Some(0), "Success", "warning: x"),
            &ReportSettings::default(),
        );
        assert_eq!(
            texts(&lines),
            vec!["Reboot: Completed successfully.", "  Output (stderr):", "    warning: x"]
        );
    }

    #[test]
    fn non_zero_exit_prefers_stderr_details() {
        let op = Operation::from_args("Flash", ["fastboot", "flash"]);
        let lines = result_lines(
            &collected(op.clone(), Some(1), "ignored", "FAILED (remote: locked)"),
            &ReportSettings::default(),
        );
        assert_eq!(lines[0], ("Flash: Failed (Code: 1).".to_string(), LogTag::Error));
        assert_eq!(lines[2].0, "    FAILED (remote: locked)");

        let empty = result_lines(&collected(op, Some(2), "", ""), &ReportSettings::default());
        assert_eq!(empty[1].0, "  No specific error message from command.");
    }

    #[test]
    fn error_kinds_have_readable_summaries() {
        let op = Operation::from_args("Flash", ["does-not-exist-xyz"]);
        let mut result = collected(op, None, "", "");
        result.error_kind = Some(ErrorKind::LaunchNotFound);
        let lines = result_lines(&result, &ReportSettings::default());
        assert_eq!(
            lines[0].0,
            "Flash: Command 'does-not-exist-xyz' not found. \
             Ensure ADB/Fastboot/mtkclient is in PATH."
        );
        result.error_kind = Some(ErrorKind::Cancelled);
        let lines = result_lines(&result, &ReportSettings::default());
        assert_eq!(
            lines[0],
            ("Flash: Operation cancelled by user".to_string(), LogTag::Warning)
        );
    }

    #[test]
    fn quiet_success_logs_nothing() {
        let op = Operation::from_args("Get Property", ["adb", "shell", "getprop"]).quiet();
        let result = collected(op, Some(0), "x", "");
        assert!(result_lines(&result, &ReportSettings::default()).is_empty());
    }

    #[test]
    fn sub_steps_are_concise() {
        let op = Operation::from_args("Disable Pkg: a.b", ["adb"]).as_sub_step();
        let ok = result_lines(&collected(op.clone(), Some(0), "", ""), &ReportSettings::default());
        assert_eq!(texts(&ok), vec!["  Step OK (Disable Pkg: a.b)"]);
        let failed = result_lines(
            &collected(op, Some(1), "", "Error: unknown package\nmore"),
            &ReportSettings::default(),
        );
        assert_eq!(
            texts(&failed),
            vec!["  Step Failed (Disable Pkg: a.b): Error: unknown package"]
        );
    }

    #[test]
    fn stream_report_lists_device_info_and_error_suspects() {
        let op = Operation::from_args("Read Info", ["mtk", "printgpt"]).streaming();
        let mut info = DeviceInfo::new();
        info.insert("hw_ver".to_string(), "0xca00".to_string());
        info.insert("chipset".to_string(), "MT6765".to_string());
        let result = OperationResult {
            operation: op,
            exit_code: Some(1),
            output: Output::Streamed {
                lines: vec![
                    "Waiting for device".to_string(),
                    "Error: handshake failed".to_string(),
                ],
            },
            error_kind: None,
            device_info: info,
            duration: Duration::ZERO,
        };
        let lines = result_lines(&result, &ReportSettings::default());
        assert_eq!(
            texts(&lines),
            vec![
                "Operation: Read Info",
                "Device Info: Chipset: MT6765, Hw Ver: 0xca00",
                "Status: Failed (Exit Code: 1)",
                "  Potential Error Detail: Error: handshake failed",
            ]
        );
    }

    #[test]
    fn empty_device_info_is_reported() {
        assert_eq!(device_info_line(&DeviceInfo::new()), "Device Info: Not detected or N/A.");
    }
}
