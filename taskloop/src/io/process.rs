//! Helpers for running child processes under a call guard with bounded output.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
#[cfg(unix)]
use nix::sys::signal::{Signal, killpg};
#[cfg(unix)]
use nix::unistd::Pid;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::interrupt::{CallGuard, POLL_INTERVAL, Stop};

/// How long to wait for pipe readers after a child was stopped early.
const READER_GRACE: Duration = Duration::from_secs(2);

/// The child could not be started. `source.kind()` tells a missing binary apart.
#[derive(Debug, thiserror::Error)]
#[error("spawn {program}: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Callback invoked with each stdout line as it arrives.
pub type LineHook = Box<dyn FnMut(&[u8]) + Send>;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    /// Set when the guard stopped the child before it exited on its own.
    pub stopped: Option<Stop>,
}

impl CommandOutput {
    pub fn timed_out(&self) -> bool {
        self.stopped == Some(Stop::Deadline)
    }

    pub fn interrupted(&self) -> bool {
        self.stopped == Some(Stop::Interrupted)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Options for [`run_guarded`].
pub struct RunOptions<'a> {
    pub stdin: Option<&'a [u8]>,
    pub output_limit_bytes: usize,
    /// Tee each stdout line to this file, flushed per line.
    pub stream_path: Option<&'a Path>,
    /// Called with each stdout line (terminal echo).
    pub on_line: Option<LineHook>,
    /// Time the child gets to exit by itself after an interrupt before it is killed.
    pub interrupt_grace: Duration,
}

impl RunOptions<'_> {
    pub fn capture(output_limit_bytes: usize) -> Self {
        Self {
            stdin: None,
            output_limit_bytes,
            stream_path: None,
            on_line: None,
            interrupt_grace: Duration::ZERO,
        }
    }
}

/// Run a command until it exits or `guard` stops it.
///
/// Output is read concurrently while the child runs so pipes never fill up.
/// On unix the child leads its own process group, so the terminal's Ctrl-C
/// does not reach it directly and stopping it also stops anything it spawned.
/// On deadline the whole group is killed immediately. On interrupt the group
/// receives SIGINT and gets `interrupt_grace` to exit before being killed.
/// Either way the child is reaped before this returns.
#[instrument(skip_all, fields(timeout_secs = guard.timeout().as_secs(), output_limit_bytes = options.output_limit_bytes, streaming = options.stream_path.is_some()))]
pub fn run_guarded(
    mut cmd: Command,
    options: RunOptions<'_>,
    guard: &CallGuard,
) -> Result<CommandOutput> {
    let RunOptions {
        stdin,
        output_limit_bytes,
        stream_path,
        on_line,
        interrupt_grace,
    } = options;

    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let stream_file = match stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(SpawnError {
                program: cmd.get_program().to_string_lossy().into_owned(),
                source: e,
            }
            .into());
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (stdout_tx, stdout_rx) = mpsc::channel();
    let (stderr_tx, stderr_rx) = mpsc::channel();
    thread::spawn(move || {
        let result = read_lines_limited_with_tee(stdout, output_limit_bytes, stream_file, on_line);
        let _ = stdout_tx.send(result);
    });
    thread::spawn(move || {
        let _ = stderr_tx.send(read_stream_limited(stderr, output_limit_bytes));
    });

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        thread::spawn(move || {
            // A child that exits without draining stdin closes the pipe early.
            if let Err(e) = child_stdin.write_all(&input) {
                debug!(err = %e, "stdin closed before prompt was fully written");
            }
        });
    }

    let mut stopped = None;
    let status = loop {
        if let Some(status) = child.wait_timeout(POLL_INTERVAL).context("wait for command")? {
            break status;
        }
        match guard.check() {
            None => {}
            Some(Stop::Deadline) => {
                warn!(
                    timeout_secs = guard.timeout().as_secs(),
                    "command timed out, killing"
                );
                stopped = Some(Stop::Deadline);
                break kill_and_reap(&mut child)?;
            }
            Some(Stop::Interrupted) => {
                stopped = Some(Stop::Interrupted);
                #[cfg(unix)]
                signal_group(&child, Signal::SIGINT);
                match child
                    .wait_timeout(interrupt_grace)
                    .context("wait for interrupted command")?
                {
                    Some(status) => {
                        debug!("command exited after interrupt");
                        break status;
                    }
                    None => {
                        warn!(
                            grace_secs = interrupt_grace.as_secs(),
                            "command ignored interrupt, killing"
                        );
                        break kill_and_reap(&mut child)?;
                    }
                }
            }
        }
    };

    let reader_wait = stopped.map(|_| READER_GRACE);
    let (stdout, stdout_truncated) = join_output(&stdout_rx, reader_wait).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(&stderr_rx, reader_wait).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), ?stopped, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        stopped,
    })
}

fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    #[cfg(unix)]
    signal_group(child, Signal::SIGKILL);
    if let Err(e) = child.kill() {
        // Already exited between the last poll and the kill.
        debug!(err = %e, "kill failed");
    }
    child.wait().context("wait command after kill")
}

/// Deliver `signal` to every process in the child's group.
#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) {
    let Ok(pid) = i32::try_from(child.id()) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pid), signal) {
        debug!(%err, ?signal, "signal process group failed");
    }
}

type ReadResult = Result<(Vec<u8>, usize)>;

/// Collect a reader thread's result. With `wait` set, grandchildren holding
/// the pipe open cannot block us past it; their output is dropped.
fn join_output(rx: &mpsc::Receiver<ReadResult>, wait: Option<Duration>) -> ReadResult {
    match wait {
        None => rx
            .recv()
            .map_err(|_| anyhow!("output reader thread panicked"))?,
        Some(wait) => match rx.recv_timeout(wait) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!("output pipe still open after child stopped, abandoning reader");
                Ok((Vec::new(), 0))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(anyhow!("output reader thread panicked"))
            }
        },
    }
}

/// Read stdout line by line with a size limit, tee-ing to a file and a hook.
fn read_lines_limited_with_tee<R: Read>(
    reader: R,
    limit: usize,
    mut stream_file: Option<BufWriter<File>>,
    mut on_line: Option<LineHook>,
) -> ReadResult {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(writer) = stream_file.as_mut() {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }
        if let Some(hook) = on_line.as_mut() {
            hook(&line);
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> ReadResult {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

/// Write a combined stdout/stderr log, truncated to `output_limit` bytes.
pub fn write_output_log(
    path: &Path,
    label: &str,
    output: &CommandOutput,
    output_limit: usize,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {label} log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str(&output.stdout_truncated_notice(label));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.stderr_truncated_notice(label));
    match output.stopped {
        Some(Stop::Deadline) => buf.push_str(&format!("\n[{label} timed out]\n")),
        Some(Stop::Interrupted) => buf.push_str(&format!("\n[{label} interrupted]\n")),
        None => buf.push_str(&format!("\n[exit status: {:?}]\n", output.status.code())),
    }

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &buf[..cut], buf.len() - cut);
        std::fs::write(path, truncated)
            .with_context(|| format!("write {label} log {}", path.display()))?;
        return Ok(());
    }

    std::fs::write(path, buf).with_context(|| format!("write {label} log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::interrupt::CancelToken;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_stdin() {
        let guard = CallGuard::new(CancelToken::new(), Duration::from_secs(10));
        let output = run_guarded(
            sh("cat; echo done >&2"),
            RunOptions {
                stdin: Some(b"hello\n"),
                ..RunOptions::capture(1_000)
            },
            &guard,
        )
        .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout_lossy(), "hello\n");
        assert_eq!(output.stderr_lossy(), "done\n");
        assert_eq!(output.stopped, None);
    }

    #[test]
    fn truncates_beyond_limit() {
        let guard = CallGuard::new(CancelToken::new(), Duration::from_secs(10));
        let output = run_guarded(sh("printf '0123456789'"), RunOptions::capture(4), &guard)
            .expect("run");
        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
    }

    #[test]
    fn deadline_kills_hanging_child() {
        let guard = CallGuard::new(CancelToken::new(), Duration::from_millis(200));
        let start = Instant::now();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let output = run_guarded(cmd, RunOptions::capture(1_000), &guard).expect("run");
        assert!(output.timed_out());
        assert!(!output.status.success());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn interrupt_kills_after_grace() {
        let token = CancelToken::new();
        let guard = CallGuard::new(token.clone(), Duration::from_secs(60));
        token.cancel();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let start = Instant::now();
        let output = run_guarded(
            cmd,
            RunOptions {
                interrupt_grace: Duration::from_millis(100),
                ..RunOptions::capture(1_000)
            },
            &guard,
        )
        .expect("run");
        assert!(output.interrupted());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    /// Background jobs started by the child die with it at the deadline.
    #[cfg(unix)]
    #[test]
    fn deadline_kills_the_whole_process_group() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("survivor");
        let script = format!("(sleep 1; touch '{}') & wait", marker.display());
        let guard = CallGuard::new(CancelToken::new(), Duration::from_millis(300));
        let start = Instant::now();
        let output = run_guarded(sh(&script), RunOptions::capture(1_000), &guard).expect("run");
        assert!(output.timed_out());
        assert!(start.elapsed() < Duration::from_secs(2));

        thread::sleep(Duration::from_millis(1_500));
        assert!(!marker.exists(), "background job outlived the deadline");
    }

    /// An interrupt is forwarded as SIGINT so the child can shut down cleanly.
    #[cfg(unix)]
    #[test]
    fn interrupt_is_forwarded_to_the_child() {
        let token = CancelToken::new();
        let guard = CallGuard::new(token.clone(), Duration::from_secs(60));
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            remote.cancel();
        });
        let start = Instant::now();
        let output = run_guarded(
            sh("trap 'echo stopping; exit 3' INT; echo ready; while :; do sleep 0.05; done"),
            RunOptions {
                interrupt_grace: Duration::from_secs(20),
                ..RunOptions::capture(1_000)
            },
            &guard,
        )
        .expect("run");
        canceller.join().expect("join");
        assert!(output.interrupted());
        assert_eq!(output.status.code(), Some(3));
        assert!(output.stdout_lossy().contains("stopping"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn tees_lines_to_file_and_hook() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stream_path = temp.path().join("nested").join("stream.log");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let guard = CallGuard::new(CancelToken::new(), Duration::from_secs(10));
        let output = run_guarded(
            sh("echo one; echo two"),
            RunOptions {
                stream_path: Some(&stream_path),
                on_line: Some(Box::new(move |line: &[u8]| {
                    sink.lock()
                        .expect("lock")
                        .push(String::from_utf8_lossy(line).into_owned());
                })),
                ..RunOptions::capture(1_000)
            },
            &guard,
        )
        .expect("run");
        assert_eq!(output.stdout_lossy(), "one\ntwo\n");
        let streamed = std::fs::read_to_string(&stream_path).expect("stream file");
        assert_eq!(streamed, "one\ntwo\n");
        assert_eq!(*seen.lock().expect("lock"), vec!["one\n", "two\n"]);
    }

    #[test]
    fn missing_binary_surfaces_not_found() {
        let guard = CallGuard::new(CancelToken::new(), Duration::from_secs(10));
        let err = run_guarded(
            Command::new("taskloop-definitely-missing-binary"),
            RunOptions::capture(1_000),
            &guard,
        )
        .unwrap_err();
        let spawn = err.downcast_ref::<SpawnError>().expect("spawn error");
        assert_eq!(spawn.source.kind(), std::io::ErrorKind::NotFound);
        assert_eq!(spawn.program, "taskloop-definitely-missing-binary");
    }

    #[test]
    fn output_log_marks_timeouts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let guard = CallGuard::new(CancelToken::new(), Duration::from_millis(100));
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let output = run_guarded(cmd, RunOptions::capture(1_000), &guard).expect("run");
        let path = temp.path().join("backend.log");
        write_output_log(&path, "backend", &output, 10_000).expect("write log");
        let log = std::fs::read_to_string(&path).expect("read log");
        assert!(log.contains("[backend timed out]"));
    }
}
