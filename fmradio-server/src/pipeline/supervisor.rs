//! Demodulator → encoder process pipeline.
//!
//! A [`Pipeline`] owns up to two child processes. The demodulator's stdout is
//! pumped into the encoder's stdin by a background task, and each process's
//! stderr is drained by another task that keeps a bounded tail of the text.
//! The demodulator tail is offered to a [`TailObserver`] after every chunk.
//!
//! Processes are spawned in their own process group (unix) and the whole
//! group is killed on shutdown, so helper processes started by the tools do
//! not outlive the pipeline.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::command::{ProcessRole, ProcessSpec};
use super::lock::LockError;
use super::relay::RelayError;

/// How long each background task gets to finish after cancellation.
pub const TEARDOWN_GRACE: Duration = Duration::from_millis(200);

/// Diagnostic tail kept for live and continuous pipelines.
pub const LIVE_TAIL_LIMIT: usize = 8 * 1024;

/// Diagnostic tail kept for scan probes.
pub const SCAN_TAIL_LIMIT: usize = 16 * 1024;

const PUMP_CHUNK: usize = 64 * 1024;
const DRAIN_CHUNK: usize = 4096;

/// Pipeline errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The program could not be found; nothing was started.
    #[error("{role} executable not found: {program}")]
    ExecutableNotFound { role: ProcessRole, program: String },

    /// The operating system refused to start the process.
    #[error("failed to start {role}: {source}")]
    Spawn {
        role: ProcessRole,
        #[source]
        source: io::Error,
    },

    /// A process ended without being asked to.
    #[error("{role} exited unexpectedly ({status}){}", detail_suffix(.detail))]
    UnexpectedExit {
        role: ProcessRole,
        status: String,
        detail: Option<String>,
    },

    /// The encoder output closed while both processes still seemed alive.
    #[error("encoder output closed unexpectedly")]
    OutputClosed,

    #[error("pipe I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Another owner holds the radio hardware.
    #[error("device busy: {0}")]
    DeviceBusy(&'static str),

    #[error(transparent)]
    Device(#[from] LockError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(line) => format!(": {}", line),
        None => String::new(),
    }
}

impl PipelineError {
    /// Launch failures repeat on every attempt, so loops should stop on them.
    pub fn is_launch_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::ExecutableNotFound { .. } | PipelineError::Spawn { .. }
        )
    }
}

/// Receives the rolling diagnostic tail after each chunk.
pub trait TailObserver: Send + Sync {
    fn observe(&self, tail: &str);
}

/// Where the final stage's stdout goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Returned to the caller via [`Pipeline::take_output`].
    Capture,
    Discard,
}

/// Everything needed to launch a pipeline.
pub struct PipelineSpec {
    /// Used as a log prefix.
    pub label: &'static str,
    pub demodulator: ProcessSpec,
    pub encoder: Option<ProcessSpec>,
    pub output: OutputMode,
    pub tail_limit: usize,
    pub observer: Option<Arc<dyn TailObserver>>,
    /// Log the demodulator's diagnostic text as it arrives.
    pub echo_diagnostics: bool,
}

/// Exit information gathered at shutdown.
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// Statuses of processes that had already exited before they were killed.
    pub demodulator: Option<ExitStatus>,
    pub encoder: Option<ExitStatus>,
    demodulator_note: Option<String>,
    encoder_note: Option<String>,
}

impl PipelineReport {
    /// Error describing the first process that ended on its own.
    pub fn exit_error(&self) -> Option<PipelineError> {
        let (role, status, note) = match (self.demodulator, self.encoder) {
            (Some(status), _) => (ProcessRole::Demodulator, status, &self.demodulator_note),
            (None, Some(status)) => (ProcessRole::Encoder, status, &self.encoder_note),
            (None, None) => return None,
        };
        Some(PipelineError::UnexpectedExit {
            role,
            status: status.to_string(),
            detail: note.clone(),
        })
    }

    /// Error for an exit seen by [`Pipeline::wait`], with the last diagnostic line when known.
    pub fn unexpected_exit(&self, role: ProcessRole, status: ExitStatus) -> PipelineError {
        self.exit_error().unwrap_or(PipelineError::UnexpectedExit {
            role,
            status: status.to_string(),
            detail: None,
        })
    }
}

/// Result of [`Pipeline::wait`].
#[derive(Debug)]
pub enum PipelineExit {
    Cancelled,
    Exited {
        role: ProcessRole,
        status: ExitStatus,
    },
}

/// A running demodulator (and optional encoder).
pub struct Pipeline {
    label: &'static str,
    demodulator: Child,
    encoder: Option<Child>,
    output: Option<ChildStdout>,
    tasks: Vec<JoinHandle<()>>,
    demodulator_tail: Arc<Mutex<String>>,
    encoder_tail: Arc<Mutex<String>>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Resolve both programs, then spawn them and their background tasks.
    ///
    /// Nothing is spawned when either program is missing. The pipeline's own
    /// token is a child of `parent`, so cancelling the caller's token tears it
    /// down while [`Pipeline::shutdown`] never cancels the caller.
    pub fn start(spec: PipelineSpec, parent: &CancellationToken) -> Result<Self, PipelineError> {
        let demodulator_program = resolve(&spec.demodulator)?;
        let encoder_program = spec.encoder.as_ref().map(resolve).transpose()?;

        let cancel = parent.child_token();
        let has_encoder = spec.encoder.is_some();
        let demodulator_stdout = if has_encoder || spec.output == OutputMode::Capture {
            Stdio::piped()
        } else {
            Stdio::null()
        };

        let mut demodulator = command(&spec.demodulator, &demodulator_program)
            .stdin(Stdio::null())
            .stdout(demodulator_stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                role: ProcessRole::Demodulator,
                source,
            })?;
        debug!(
            "[{}] started {} (pid {:?}): {:?}",
            spec.label,
            demodulator_program.display(),
            demodulator.id(),
            spec.demodulator.args
        );

        let mut encoder = match (&spec.encoder, encoder_program) {
            (Some(encoder_spec), Some(program)) => {
                let output = match spec.output {
                    OutputMode::Capture => Stdio::piped(),
                    OutputMode::Discard => Stdio::null(),
                };
                let spawned = command(encoder_spec, &program)
                    .stdin(Stdio::piped())
                    .stdout(output)
                    .stderr(Stdio::piped())
                    .spawn();
                match spawned {
                    Ok(child) => {
                        debug!(
                            "[{}] started {} (pid {:?}): {:?}",
                            spec.label,
                            program.display(),
                            child.id(),
                            encoder_spec.args
                        );
                        Some(child)
                    }
                    Err(source) => {
                        terminate(&mut demodulator);
                        return Err(PipelineError::Spawn {
                            role: ProcessRole::Encoder,
                            source,
                        });
                    }
                }
            }
            _ => None,
        };

        let demodulator_tail = Arc::new(Mutex::new(String::new()));
        let encoder_tail = Arc::new(Mutex::new(String::new()));
        let mut tasks = Vec::new();

        if let Some(stderr) = demodulator.stderr.take() {
            tasks.push(tokio::spawn(drain_diagnostics(
                stderr,
                DrainTarget {
                    label: spec.label,
                    role: ProcessRole::Demodulator,
                    tail: Arc::clone(&demodulator_tail),
                    limit: spec.tail_limit,
                    observer: spec.observer.clone(),
                    echo: spec.echo_diagnostics,
                },
                cancel.clone(),
            )));
        }

        let output = match encoder.as_mut() {
            Some(encoder) => {
                if let Some(stderr) = encoder.stderr.take() {
                    tasks.push(tokio::spawn(drain_diagnostics(
                        stderr,
                        DrainTarget {
                            label: spec.label,
                            role: ProcessRole::Encoder,
                            tail: Arc::clone(&encoder_tail),
                            limit: LIVE_TAIL_LIMIT,
                            observer: None,
                            echo: false,
                        },
                        cancel.clone(),
                    )));
                }
                if let (Some(from), Some(to)) = (demodulator.stdout.take(), encoder.stdin.take()) {
                    tasks.push(tokio::spawn(pump(from, to, spec.label, cancel.clone())));
                }
                encoder.stdout.take()
            }
            None => demodulator.stdout.take(),
        };

        Ok(Self {
            label: spec.label,
            demodulator,
            encoder,
            output,
            tasks,
            demodulator_tail,
            encoder_tail,
            cancel,
        })
    }

    /// The final stage's stdout, when started with [`OutputMode::Capture`].
    pub fn take_output(&mut self) -> Option<ChildStdout> {
        self.output.take()
    }

    /// Token cancelled by [`Pipeline::shutdown`] or by the caller's token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for cancellation or for either process to exit.
    pub async fn wait(&mut self) -> Result<PipelineExit, PipelineError> {
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => Ok(PipelineExit::Cancelled),
            status = self.demodulator.wait() => Ok(PipelineExit::Exited {
                role: ProcessRole::Demodulator,
                status: status?,
            }),
            status = wait_optional(self.encoder.as_mut()) => Ok(PipelineExit::Exited {
                role: ProcessRole::Encoder,
                status: status?,
            }),
        }
    }

    /// Cancel the background tasks, kill both process groups and reap them.
    ///
    /// Runs on every exit path; each step is bounded by [`TEARDOWN_GRACE`].
    pub async fn shutdown(mut self) -> PipelineReport {
        self.cancel.cancel();

        let mut report = PipelineReport {
            demodulator: self.demodulator.try_wait().ok().flatten(),
            encoder: self
                .encoder
                .as_mut()
                .and_then(|child| child.try_wait().ok().flatten()),
            ..PipelineReport::default()
        };

        terminate(&mut self.demodulator);
        if let Some(encoder) = self.encoder.as_mut() {
            terminate(encoder);
        }
        drop(self.output.take());

        for task in self.tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(TEARDOWN_GRACE, task).await.is_err() {
                abort.abort();
            }
        }

        if tokio::time::timeout(TEARDOWN_GRACE, self.demodulator.wait()).await.is_err() {
            warn!("[{}] demodulator did not exit after kill", self.label);
        }
        if let Some(encoder) = self.encoder.as_mut() {
            if tokio::time::timeout(TEARDOWN_GRACE, encoder.wait()).await.is_err() {
                warn!("[{}] encoder did not exit after kill", self.label);
            }
        }

        report.demodulator_note = last_line(&self.demodulator_tail.lock());
        report.encoder_note = last_line(&self.encoder_tail.lock());
        debug!("[{}] pipeline shut down", self.label);
        report
    }
}

fn resolve(spec: &ProcessSpec) -> Result<std::path::PathBuf, PipelineError> {
    spec.resolve_program()
        .ok_or_else(|| PipelineError::ExecutableNotFound {
            role: spec.role,
            program: spec.program.display().to_string(),
        })
}

fn command(spec: &ProcessSpec, program: &std::path::Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(&spec.args).kill_on_drop(true);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Kill the child and, on unix, everything in its process group.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    let _ = child.start_kill();
}

async fn wait_optional(child: Option<&mut Child>) -> io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

/// Copy demodulator PCM into the encoder, preserving order.
async fn pump(mut from: ChildStdout, mut to: ChildStdin, label: &'static str, cancel: CancellationToken) {
    let mut buf = vec![0u8; PUMP_CHUNK];
    let mut total: u64 = 0;
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = from.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("[{}] pump read ended: {}", label, e);
                    break;
                }
            },
        };
        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = to.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            debug!("[{}] pump write ended: {}", label, e);
            break;
        }
        total += n as u64;
    }
    // Closing stdin lets the encoder flush and exit when the demodulator ends.
    let _ = to.shutdown().await;
    debug!("[{}] pump finished after {} bytes", label, total);
}

struct DrainTarget {
    label: &'static str,
    role: ProcessRole,
    tail: Arc<Mutex<String>>,
    limit: usize,
    observer: Option<Arc<dyn TailObserver>>,
    echo: bool,
}

async fn drain_diagnostics<R>(mut stderr: R, target: DrainTarget, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; DRAIN_CHUNK];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = stderr.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        let chunk = String::from_utf8_lossy(&buf[..n]);
        if target.echo {
            info!("[{}] {}: {}", target.label, target.role, chunk.trim_end());
        } else if target.role == ProcessRole::Encoder {
            debug!("[{}] encoder: {}", target.label, chunk.trim_end());
        }

        let snapshot = {
            let mut tail = target.tail.lock();
            tail.push_str(&chunk);
            trim_front(&mut tail, target.limit);
            target.observer.as_ref().map(|_| tail.clone())
        };
        if let (Some(observer), Some(tail)) = (&target.observer, snapshot) {
            observer.observe(&tail);
        }
    }
}

/// Drop leading text so at most `limit` bytes remain, cutting on a char boundary.
fn trim_front(text: &mut String, limit: usize) {
    if text.len() <= limit {
        return;
    }
    let mut cut = text.len() - limit;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    text.drain(..cut);
}

fn last_line(tail: &str) -> Option<String> {
    tail.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_front_on_char_boundary() {
        let mut text = "ab€cd".to_string();
        trim_front(&mut text, 4);
        // "€" is three bytes; cutting inside it moves forward to "cd".
        assert_eq!(text, "cd");

        let mut text = "hello".to_string();
        trim_front(&mut text, 10);
        assert_eq!(text, "hello");
    }

    #[test]
    fn test_last_line() {
        assert_eq!(last_line("one\ntwo\n\n"), Some("two".to_string()));
        assert_eq!(last_line("  \n"), None);
    }

    #[tokio::test]
    async fn test_missing_executable_spawns_nothing() {
        let spec = PipelineSpec {
            label: "Test",
            demodulator: ProcessSpec::new(ProcessRole::Demodulator, "/nonexistent/softfm"),
            encoder: None,
            output: OutputMode::Discard,
            tail_limit: LIVE_TAIL_LIMIT,
            observer: None,
            echo_diagnostics: false,
        };
        let err = Pipeline::start(spec, &CancellationToken::new()).err().unwrap();
        assert!(err.is_launch_failure());
        assert!(matches!(
            err,
            PipelineError::ExecutableNotFound { role: ProcessRole::Demodulator, .. }
        ));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        fn sh(role: ProcessRole, script: &str) -> ProcessSpec {
            ProcessSpec::new(role, "/bin/sh").args(["-c", script])
        }

        #[derive(Default)]
        struct Recorder(Mutex<Vec<String>>);

        impl TailObserver for Recorder {
            fn observe(&self, tail: &str) {
                self.0.lock().push(tail.to_string());
            }
        }

        #[tokio::test]
        async fn test_demodulator_bytes_reach_encoder_output() {
            let spec = PipelineSpec {
                label: "Test",
                demodulator: sh(ProcessRole::Demodulator, "printf 'hello pipeline'"),
                encoder: Some(sh(ProcessRole::Encoder, "cat")),
                output: OutputMode::Capture,
                tail_limit: LIVE_TAIL_LIMIT,
                observer: None,
                echo_diagnostics: false,
            };
            let mut pipeline = Pipeline::start(spec, &CancellationToken::new()).unwrap();
            let mut output = pipeline.take_output().unwrap();

            let mut received = String::new();
            output.read_to_string(&mut received).await.unwrap();
            assert_eq!(received, "hello pipeline");

            pipeline.shutdown().await;
        }

        #[tokio::test]
        async fn test_observer_sees_diagnostics_and_exit_is_reported() {
            let recorder = Arc::new(Recorder::default());
            let spec = PipelineSpec {
                label: "Test",
                demodulator: sh(
                    ProcessRole::Demodulator,
                    "echo 'IF=+3.0dB' >&2; echo 'device vanished' >&2; exit 3",
                ),
                encoder: None,
                output: OutputMode::Discard,
                tail_limit: SCAN_TAIL_LIMIT,
                observer: Some(recorder.clone()),
                echo_diagnostics: false,
            };
            let mut pipeline = Pipeline::start(spec, &CancellationToken::new()).unwrap();

            match pipeline.wait().await.unwrap() {
                PipelineExit::Exited { role, status } => {
                    assert_eq!(role, ProcessRole::Demodulator);
                    assert_eq!(status.code(), Some(3));
                }
                PipelineExit::Cancelled => panic!("not cancelled"),
            }
            // Let the drain task read the remaining stderr.
            tokio::time::sleep(Duration::from_millis(50)).await;

            let report = pipeline.shutdown().await;
            let err = report.exit_error().unwrap();
            assert!(matches!(err, PipelineError::UnexpectedExit { role: ProcessRole::Demodulator, .. }));
            assert!(err.to_string().contains("device vanished"));
            assert!(recorder.0.lock().iter().any(|tail| tail.contains("IF=+3.0dB")));
        }

        #[tokio::test]
        async fn test_unexpected_exit_falls_back_to_observed_status() {
            let spec = PipelineSpec {
                label: "Test",
                demodulator: sh(ProcessRole::Demodulator, "exit 4"),
                encoder: None,
                output: OutputMode::Discard,
                tail_limit: LIVE_TAIL_LIMIT,
                observer: None,
                echo_diagnostics: false,
            };
            let mut pipeline = Pipeline::start(spec, &CancellationToken::new()).unwrap();
            let PipelineExit::Exited { role, status } = pipeline.wait().await.unwrap() else {
                panic!("not cancelled");
            };

            let report = PipelineReport::default();
            let err = report.unexpected_exit(role, status);
            assert!(matches!(
                err,
                PipelineError::UnexpectedExit { role: ProcessRole::Demodulator, detail: None, .. }
            ));
            pipeline.shutdown().await;
        }

        #[tokio::test]
        async fn test_cancellation_kills_long_running_processes() {
            let parent = CancellationToken::new();
            let spec = PipelineSpec {
                label: "Test",
                demodulator: sh(ProcessRole::Demodulator, "sleep 30"),
                encoder: Some(sh(ProcessRole::Encoder, "cat >/dev/null")),
                output: OutputMode::Discard,
                tail_limit: LIVE_TAIL_LIMIT,
                observer: None,
                echo_diagnostics: false,
            };
            let mut pipeline = Pipeline::start(spec, &parent).unwrap();

            parent.cancel();
            assert!(matches!(pipeline.wait().await.unwrap(), PipelineExit::Cancelled));

            let started = std::time::Instant::now();
            let report = pipeline.shutdown().await;
            assert!(started.elapsed() < Duration::from_secs(2));
            assert!(report.exit_error().is_none());
        }
    }
}
