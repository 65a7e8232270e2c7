use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TranscoderError;
use crate::invocation::{Invocation, OutputTarget};

/// Lines of stderr kept for the exit report
const STDERR_TAIL_LINES: usize = 20;

/// Data events buffered between the stdout reader and the consumer
const EVENT_CAPACITY: usize = 64;

/// How long to wait for the output pipes to drain after the process exited.
/// Orphaned grandchildren can hold a pipe open.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A process still running this long after SIGTERM gets SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Something the transcoder did.
#[derive(Debug)]
pub enum ProcessEvent {
    /// A chunk read from stdout, in production order
    Data(Bytes),
    /// The process is gone. Always the last event.
    Exited(ExitReport),
}

pub type ProcessEvents = mpsc::Receiver<ProcessEvent>;

#[derive(Debug, Clone)]
pub struct ExitReport {
    pub status: Option<ExitStatus>,
    /// The exit followed a terminate/interrupt/kill request
    pub requested: bool,
    pub stderr_tail: Vec<String>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.status.map(|s| s.success()).unwrap_or(false)
    }

    /// One-line summary for logs: status plus the last stderr line.
    pub fn describe(&self) -> String {
        let status = match self.status {
            Some(status) => status.to_string(),
            None => "unknown status".to_string(),
        };
        match self.stderr_tail.last() {
            Some(line) => format!("{} ({})", status, line),
            None => status,
        }
    }
}

/// How to stop a transcoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM
    Terminate,
    /// SIGINT, lets ffmpeg finalize its output file
    Interrupt,
    /// SIGKILL
    Kill,
}

/// Owns one spawned transcoder process.
///
/// A supervisor task holds the OS child; this handle only carries the control
/// channel. Output and the exit notification arrive on the `ProcessEvents`
/// receiver returned by [`ProcessHandle::spawn`]. Dropping the handle without
/// stopping the process kills it. Dropping it after a stop request lets the
/// process finish on its own.
pub struct ProcessHandle {
    label: String,
    pid: Option<u32>,
    stopping: bool,
    control: mpsc::UnboundedSender<Termination>,
}

impl ProcessHandle {
    pub fn spawn(
        invocation: &Invocation,
        chunk_size: usize,
    ) -> Result<(Self, ProcessEvents), TranscoderError> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            // A recorder interrupted at shutdown must be able to write its trailer
            // after the runtime is gone.
            .kill_on_drop(invocation.output == OutputTarget::Pipe);
        match invocation.output {
            OutputTarget::Pipe => command.stdout(Stdio::piped()),
            OutputTarget::File(_) => command.stdout(Stdio::null()),
        };

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TranscoderError::NotFound(invocation.program.display().to_string())
            } else {
                TranscoderError::SpawnFailed(e.to_string())
            }
        })?;

        let label = invocation.label.clone();
        let pid = child.id();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        let stdout_task = match (&invocation.output, child.stdout.take()) {
            (OutputTarget::Pipe, Some(stdout)) => Some(tokio::spawn(pump_stdout(
                stdout,
                events_tx.clone(),
                chunk_size.max(1),
            ))),
            (OutputTarget::Pipe, None) => return Err(TranscoderError::MissingPipe),
            (OutputTarget::File(_), _) => None,
        };

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(drain_stderr(
                stderr,
                tail.clone(),
                invocation.clone(),
            ))
        });

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervise(
            child,
            control_rx,
            Pipes {
                stdout: stdout_task,
                stderr: stderr_task,
            },
            tail,
            events_tx,
            label.clone(),
        ));

        tracing::debug!("Spawned transcoder [{}] pid {:?}", label, pid);

        Ok((
            Self {
                label,
                pid,
                stopping: false,
                control: control_tx,
            },
            events_rx,
        ))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True once a stop has been requested.
    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Ask the process to exit with SIGTERM. SIGKILL follows if it is still
    /// running after [`TERMINATE_GRACE`].
    pub fn terminate(&mut self) -> bool {
        self.stop(Termination::Terminate)
    }

    /// Ask the process to finish cleanly with SIGINT.
    pub fn interrupt(&mut self) -> bool {
        self.stop(Termination::Interrupt)
    }

    /// SIGKILL.
    pub fn kill(&mut self) -> bool {
        self.stop(Termination::Kill)
    }

    /// Send a stop request. A later, stronger request (e.g. kill after
    /// interrupt) is delivered too. Returns false once the process is gone.
    pub fn stop(&mut self, how: Termination) -> bool {
        self.stopping = true;
        self.control.send(how).is_ok()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.stopping {
            let _ = self.control.send(Termination::Kill);
        }
    }
}

struct Pipes {
    stdout: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
}

async fn supervise(
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<Termination>,
    pipes: Pipes,
    tail: Arc<Mutex<VecDeque<String>>>,
    events: mpsc::Sender<ProcessEvent>,
    label: String,
) {
    let mut requested = false;
    let mut control_open = true;
    let mut kill_at: Option<tokio::time::Instant> = None;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            how = control.recv(), if control_open => match how {
                Some(how) => {
                    requested = true;
                    deliver(&mut child, how, &label);
                    kill_at = match how {
                        Termination::Terminate => {
                            kill_at.or(Some(tokio::time::Instant::now() + TERMINATE_GRACE))
                        }
                        _ => None,
                    };
                }
                None => {
                    control_open = false;
                    // The handle went away without asking: kill.
                    if !requested {
                        deliver(&mut child, Termination::Kill, &label);
                    }
                }
            },
            _ = escalation(kill_at), if kill_at.is_some() => {
                tracing::warn!(
                    "Transcoder [{}] ignored SIGTERM for {:?}, killing",
                    label,
                    TERMINATE_GRACE
                );
                kill_at = None;
                deliver(&mut child, Termination::Kill, &label);
            }
        }
    };

    let status = match status {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!("Failed to wait for transcoder [{}]: {}", label, e);
            None
        }
    };

    // Data must be fully delivered before the exit event.
    for task in [pipes.stdout, pipes.stderr].into_iter().flatten() {
        let abort = task.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
            abort.abort();
        }
    }

    let report = ExitReport {
        status,
        requested,
        stderr_tail: tail.lock().iter().cloned().collect(),
    };
    tracing::debug!("Transcoder [{}] exited: {}", label, report.describe());
    let _ = events.send(ProcessEvent::Exited(report)).await;
}

async fn escalation(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn deliver(child: &mut Child, how: Termination, label: &str) {
    tracing::debug!("Stopping transcoder [{}] with {:?}", label, how);

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let signal = match how {
            Termination::Terminate => Some(Signal::SIGTERM),
            Termination::Interrupt => Some(Signal::SIGINT),
            Termination::Kill => None,
        };
        if let (Some(signal), Some(pid)) = (signal, child.id()) {
            if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
                tracing::debug!("Signal {:?} to [{}] failed: {}", signal, label, e);
            }
            return;
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!("Kill of [{}] failed: {}", label, e);
    }
}

async fn pump_stdout(mut stdout: ChildStdout, events: mpsc::Sender<ProcessEvent>, chunk_size: usize) {
    let mut buf = vec![0u8; chunk_size];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break, // EOF
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if events.send(ProcessEvent::Data(chunk)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Error reading transcoder stdout: {}", e);
                break;
            }
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>, invocation: Invocation) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = invocation.redact(line.trim_end());
        if line.is_empty() {
            continue;
        }
        tracing::debug!("[{}] {}", invocation.label, line);
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
