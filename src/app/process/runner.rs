use std::io::{BufRead, BufReader, Read};
use std::panic::{self, AssertUnwindSafe};
use std::process::{Command, Stdio};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::cancel::CancellationController;
use crate::app::error::ErrorKind;
use crate::app::models::{
    DeviceInfo, EndOfStream, LineEvent, Mode, Operation, OperationResult, Output, QueueMessage,
};
use crate::app::process::handle::ProcessHandle;

/// How long pipe readers may lag behind a reaped process before they are abandoned.
///
/// A descendant that escaped the process group can keep the write end open forever.
pub const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Everything a worker needs besides the operation itself.
#[derive(Clone)]
pub struct WorkerContext {
    pub sender: SyncSender<QueueMessage>,
    pub controller: CancellationController,
    /// Publish the handle to the controller while the process runs.
    pub cancellable: bool,
    pub timeout: Option<Duration>,
}

/// Starts one worker thread per operation; the caller never blocks.
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn submit(operation: Operation, context: WorkerContext) -> std::io::Result<JoinHandle<()>> {
        let name = format!("op-{}", operation.id);
        std::thread::Builder::new().name(name).spawn(move || {
            let fallback = operation.clone();
            let sender = context.sender.clone();
            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| match operation.mode {
                Mode::Collect => run_collect_worker(operation, &context),
                Mode::Stream => run_stream_worker(operation, &context),
            }));
            if outcome.is_err() {
                // The dispatcher drops duplicates, so posting here is safe even
                // if the panic happened after the worker already reported.
                warn!(
                    trace_id = %fallback.trace_id(),
                    operation = %fallback.name,
                    "worker panicked"
                );
                let result = OperationResult::failed(
                    fallback,
                    ErrorKind::Other("worker thread panicked".to_string()),
                    started.elapsed(),
                );
                let _ = sender.send(QueueMessage::Finished(result));
            }
        })
    }
}

fn build_command(operation: &Operation, stdout: Stdio, stderr: Stdio) -> Command {
    let mut command = Command::new(operation.program());
    command
        .args(operation.args())
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);
    command
}

fn arm_if_cancellable(handle: &Arc<ProcessHandle>, context: &WorkerContext, trace_id: &str) {
    if !context.cancellable {
        return;
    }
    if context.controller.arm(handle) {
        info!(
            trace_id = %trace_id,
            pid = handle.pid(),
            "cancel was pending at launch; terminating"
        );
        if let Err(err) = handle.terminate() {
            warn!(trace_id = %trace_id, error = %err, "failed to terminate process");
        }
    }
}

/// Waits for `reader` to finish, giving up after `grace`.
///
/// Returns `false` when the thread is still running; it is left detached.
fn join_within(reader: JoinHandle<()>, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while !reader.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    reader.join().is_ok()
}

/// Bytes read so far plus the thread still reading.
struct Drain {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl Drain {
    fn start<R: Read + Send + 'static>(reader: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::<u8>::new()));
        let shared = buffer.clone();
        let reader = std::thread::spawn(move || {
            let mut reader = reader;
            let mut temp = [0u8; 4096];
            loop {
                match reader.read(&mut temp) {
                    Ok(0) => break,
                    Ok(count) => match shared.lock() {
                        Ok(mut buffer) => buffer.extend_from_slice(&temp[..count]),
                        Err(_) => break,
                    },
                    Err(_) => break,
                }
            }
        });
        Self { buffer, reader }
    }

    /// Whatever arrived before the reader finished or `grace` ran out.
    fn finish(self, grace: Duration, trace_id: &str) -> Vec<u8> {
        if !join_within(self.reader, grace) {
            warn!(trace_id = %trace_id, "pipe still open after exit; keeping partial output");
        }
        self.buffer
            .lock()
            .map(|mut buffer| std::mem::take(&mut *buffer))
            .unwrap_or_default()
    }
}

fn run_collect_worker(operation: Operation, context: &WorkerContext) {
    let result = run_collect(operation, context.timeout, |handle, trace_id| {
        arm_if_cancellable(handle, context, trace_id)
    });
    if context.sender.send(QueueMessage::Finished(result)).is_err() {
        debug!("result channel closed before a collect result was delivered");
    }
}

/// Runs `operation` to completion on the current thread with both pipes captured.
///
/// `on_spawn` sees the live handle before the wait starts.
pub fn run_collect(
    operation: Operation,
    timeout: Option<Duration>,
    on_spawn: impl FnOnce(&Arc<ProcessHandle>, &str),
) -> OperationResult {
    let started = Instant::now();
    let trace_id = operation.trace_id();
    if operation.program().is_empty() {
        return OperationResult::failed(
            operation,
            ErrorKind::Other("empty command".to_string()),
            started.elapsed(),
        );
    }

    let mut command = build_command(&operation, Stdio::piped(), Stdio::piped());
    let handle = match ProcessHandle::spawn(&mut command, operation.id) {
        Ok(handle) => handle,
        Err(err) => {
            warn!(
                trace_id = %trace_id,
                program = %operation.program(),
                error = %err,
                "failed to spawn command"
            );
            let kind = ErrorKind::from_spawn_error(&err);
            return OperationResult::failed(operation, kind, started.elapsed());
        }
    };
    info!(
        trace_id = %trace_id,
        operation = %operation.name,
        pid = handle.pid(),
        "process started"
    );
    on_spawn(&handle, &trace_id);

    // Drain stdout/stderr in parallel; otherwise, a chatty child process can block once the pipe
    // buffer fills, and we will incorrectly hit the timeout.
    let (stdout, stderr) = handle.take_pipes().unwrap_or_else(|err| {
        warn!(trace_id = %trace_id, error = %err, "failed to capture pipes");
        (None, None)
    });
    let stdout_drain = stdout.map(Drain::start);
    let stderr_drain = stderr.map(Drain::start);

    let deadline = timeout.map(|timeout| started + timeout);
    let wait = handle.wait_until(deadline);
    let (exit_code, error_kind) = handle.classify_exit(wait);
    if let Some(kind) = &error_kind {
        info!(
            trace_id = %trace_id,
            operation = %operation.name,
            kind = %kind,
            "process ended abnormally"
        );
    }

    let stdout_bytes = stdout_drain
        .map(|drain| drain.finish(PIPE_DRAIN_GRACE, &trace_id))
        .unwrap_or_default();
    let stderr_bytes = stderr_drain
        .map(|drain| drain.finish(PIPE_DRAIN_GRACE, &trace_id))
        .unwrap_or_default();

    OperationResult {
        operation,
        exit_code,
        output: Output::Collected {
            stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
            stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        },
        error_kind,
        device_info: DeviceInfo::new(),
        duration: started.elapsed(),
    }
}

fn post_end_of_stream(
    context: &WorkerContext,
    operation: &Operation,
    exit_code: Option<i32>,
    error_kind: Option<ErrorKind>,
    started: Instant,
) {
    let end = EndOfStream {
        operation_id: operation.id,
        exit_code,
        error_kind,
        duration: started.elapsed(),
    };
    if context.sender.send(QueueMessage::EndOfStream(end)).is_err() {
        debug!(trace_id = %operation.trace_id(), "result channel closed before end of stream");
    }
}

/// stdout and stderr share one pipe so lines keep their real-time order.
fn run_stream_worker(operation: Operation, context: &WorkerContext) {
    let started = Instant::now();
    let trace_id = operation.trace_id();
    if operation.program().is_empty() {
        post_end_of_stream(
            context,
            &operation,
            None,
            Some(ErrorKind::Other("empty command".to_string())),
            started,
        );
        return;
    }

    let (reader, writer) = match std::io::pipe() {
        Ok(pair) => pair,
        Err(err) => {
            let kind = ErrorKind::Other(format!("Failed to create output pipe: {err}"));
            post_end_of_stream(context, &operation, None, Some(kind), started);
            return;
        }
    };
    let writer_err = match writer.try_clone() {
        Ok(writer_err) => writer_err,
        Err(err) => {
            let kind = ErrorKind::Other(format!("Failed to create output pipe: {err}"));
            post_end_of_stream(context, &operation, None, Some(kind), started);
            return;
        }
    };

    let mut command = build_command(&operation, Stdio::from(writer), Stdio::from(writer_err));
    let spawned = ProcessHandle::spawn(&mut command, operation.id);
    // Our copies of the write end must go, or the reader never sees EOF.
    drop(command);
    let handle = match spawned {
        Ok(handle) => handle,
        Err(err) => {
            warn!(
                trace_id = %trace_id,
                program = %operation.program(),
                error = %err,
                "failed to spawn command"
            );
            post_end_of_stream(
                context,
                &operation,
                None,
                Some(ErrorKind::from_spawn_error(&err)),
                started,
            );
            return;
        }
    };
    info!(
        trace_id = %trace_id,
        operation = %operation.name,
        pid = handle.pid(),
        "stream started"
    );
    arm_if_cancellable(&handle, context, &trace_id);

    let sender = context.sender.clone();
    let operation_id = operation.id;
    let trace_reader = trace_id.clone();
    let reader_handle = std::thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::<u8>::new();
        let mut receiver_gone = false;
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(trace_id = %trace_reader, error = %err, "failed to read merged output");
                    break;
                }
            }
            if receiver_gone {
                continue;
            }
            let text = String::from_utf8_lossy(&buffer)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            let event = LineEvent { operation_id, text };
            // Keep draining after the consumer is gone so the child never blocks on a full pipe.
            receiver_gone = sender.send(QueueMessage::Line(event)).is_err();
        }
    });

    let deadline = context.timeout.map(|timeout| started + timeout);
    let wait = handle.wait_until(deadline);
    let (exit_code, error_kind) = handle.classify_exit(wait);
    // Lines a detached reader sends later are dropped by the dispatcher.
    if !join_within(reader_handle, PIPE_DRAIN_GRACE) {
        warn!(trace_id = %trace_id, "merged output still open after exit; ending stream");
    }
    post_end_of_stream(context, &operation, exit_code, error_kind, started);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn context(timeout: Option<Duration>) -> (WorkerContext, mpsc::Receiver<QueueMessage>) {
        let (sender, receiver) = mpsc::sync_channel(1024);
        let context = WorkerContext {
            sender,
            controller: CancellationController::new(),
            cancellable: false,
            timeout,
        };
        (context, receiver)
    }

    #[test]
    fn run_collect_does_not_deadlock_on_large_stdout() {
        // Regression test: If stdout/stderr are piped but not drained, the child can block once
        // the pipe buffer fills, causing an otherwise-fast command to "hang" until we hit the
        // timeout.
        let (program, args, min_stdout_len) = if cfg!(windows) {
            (
                "cmd.exe",
                vec!["/C", "for /L %i in (1,1,100000) do @echo 1234567890"],
                1_000_000usize,
            )
        } else {
            (
                "sh",
                vec![
                    "-c",
                    "i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done",
                ],
                1_000_000usize,
            )
        };
        let mut argv = vec![program];
        argv.extend(args);
        let operation = Operation::from_args("large output", argv);

        let result = run_collect(operation, Some(Duration::from_secs(10)), |_, _| {});

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.error_kind, None);
        assert!(
            result.stdout().len() >= min_stdout_len,
            "expected stdout >= {min_stdout_len}, got {}",
            result.stdout().len()
        );
    }

    #[test]
    fn run_collect_reports_missing_binary() {
        let operation = Operation::from_args("missing", ["does-not-exist-xyz"]);
        let result = run_collect(operation, None, |_, _| panic!("must not spawn"));
        assert_eq!(result.error_kind, Some(ErrorKind::LaunchNotFound));
        assert_eq!(result.exit_code, None);
    }

    #[cfg(unix)]
    #[test]
    fn run_collect_captures_both_streams() {
        let operation =
            Operation::from_args("both", ["sh", "-c", "echo out; echo err 1>&2; exit 3"]);
        let result = run_collect(operation, Some(Duration::from_secs(10)), |_, _| {});
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout().trim(), "out");
        assert_eq!(result.stderr().trim(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn stream_worker_merges_output_in_order_then_ends() {
        let (context, receiver) = context(Some(Duration::from_secs(10)));
        let operation = Operation::from_args(
            "merged",
            ["sh", "-c", "echo a; echo b 1>&2; printf 'c\\r\\n'"],
        )
        .streaming();
        let id = operation.id;
        ProcessRunner::submit(operation, context)
            .expect("spawn worker")
            .join()
            .expect("join worker");

        let messages: Vec<QueueMessage> = receiver.try_iter().collect();
        let lines: Vec<String> = messages
            .iter()
            .filter_map(|message| match message {
                QueueMessage::Line(event) => Some(event.text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["a", "b", "c"]);
        match messages.last() {
            Some(QueueMessage::EndOfStream(end)) => {
                assert_eq!(end.operation_id, id);
                assert_eq!(end.exit_code, Some(0));
                assert_eq!(end.error_kind, None);
            }
            other => panic!("expected end of stream, got {other:?}"),
        }
    }

    #[test]
    fn join_within_gives_up_on_a_blocked_reader() {
        let (_keep_open, blocked) = mpsc::channel::<()>();
        let reader = std::thread::spawn(move || {
            let _ = blocked.recv();
        });
        let started = Instant::now();
        assert!(!join_within(reader, Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[cfg(unix)]
    #[test]
    fn run_collect_keeps_output_when_a_detached_child_holds_the_pipe() {
        // setsid moves the background sleep out of the process group.
        let operation = Operation::from_args(
            "detached",
            ["sh", "-c", "echo before; setsid sleep 5 & exit 0"],
        );
        let started = Instant::now();
        let result = run_collect(operation, Some(Duration::from_secs(10)), |_, _| {});
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout().trim(), "before");
    }

    #[test]
    fn stream_worker_reports_missing_binary_as_end_of_stream() {
        let (context, receiver) = context(None);
        let operation = Operation::from_args("missing", ["does-not-exist-xyz"]).streaming();
        ProcessRunner::submit(operation, context)
            .expect("spawn worker")
            .join()
            .expect("join worker");
        let messages: Vec<QueueMessage> = receiver.try_iter().collect();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            QueueMessage::EndOfStream(end) => {
                assert_eq!(end.error_kind, Some(ErrorKind::LaunchNotFound));
                assert_eq!(end.exit_code, None);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn stream_worker_times_out_long_running_process() {
        let (context, receiver) = context(Some(Duration::from_millis(200)));
        let operation = Operation::from_args("sleepy", ["sleep", "30"]).streaming();
        ProcessRunner::submit(operation, context)
            .expect("spawn worker")
            .join()
            .expect("join worker");
        let end = receiver
            .try_iter()
            .find_map(|message| match message {
                QueueMessage::EndOfStream(end) => Some(end),
                _ => None,
            })
            .expect("end of stream");
        assert_eq!(end.error_kind, Some(ErrorKind::Timeout));
    }
}
