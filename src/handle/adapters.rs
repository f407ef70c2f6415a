//! Process adapters for abstracting the underlying process primitive
//!
//! This module provides traits and implementations for the external process
//! capability a [`CmdHandle`](super::CmdHandle) coordinates: a not-yet-started
//! command that can have its standard streams rebound and be spawned, and a
//! running process that can be waited on and probed for exit status. The
//! tokio-backed implementation is the production path; a mock implementation
//! with invocation counters supports deterministic testing of the handle's
//! exactly-once guarantees.

use crate::error::{CmdError, Result};
use async_trait::async_trait;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Destination for a process's redirected stdout/stderr
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Source for a process's redirected stdin
pub type InputSource = Box<dyn AsyncRead + Send + Unpin>;

/// Terminal process-state snapshot, valid once the process has been observed
/// to have exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSnapshot {
    /// Process ID, if one was ever assigned
    pub pid: Option<u32>,
    /// Exit code, `None` when the process was terminated by a signal
    pub code: Option<i32>,
    /// Terminating signal number (Unix), `None` on normal exit
    pub signal: Option<i32>,
}

impl ExitSnapshot {
    /// Build a snapshot from an OS exit status.
    pub fn from_status(pid: Option<u32>, status: ExitStatus) -> Self {
        let (code, signal) = if let Some(code) = status.code() {
            (Some(code), None)
        } else {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                (None, status.signal())
            }
            #[cfg(not(unix))]
            {
                (None, None)
            }
        };

        Self { pid, code, signal }
    }

    /// Whether the process exited with code zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Exit code of the process, `-1` when it was terminated by a signal.
    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(-1)
    }
}

impl fmt::Display for ExitSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {}", code),
            (None, Some(signal)) => write!(f, "terminated by signal {}", signal),
            (None, None) => write!(f, "exited with unknown status"),
        }
    }
}

/// A not-yet-started process primitive.
///
/// Stream redirection must be applied before `spawn`; the implementations
/// ignore redirection calls once the command has been consumed.
pub trait ProcessCommand: Send {
    /// Bind both stdout and stderr of the future process to the given sink.
    fn redirect_output(&mut self, sink: OutputSink);

    /// Bind stdin of the future process to the given source.
    fn redirect_input(&mut self, source: InputSource);

    /// Launch the OS process, transferring ownership of the running side.
    fn spawn(&mut self) -> Result<Box<dyn ManagedProcess>>;
}

/// A running process that can be waited on and probed for exit status.
#[async_trait]
pub trait ManagedProcess: Send {
    /// Get the process ID
    fn pid(&self) -> Option<u32>;

    /// Block until the process exits and return its terminal snapshot.
    ///
    /// Returns the snapshot for any exit, successful or not; surfacing a
    /// nonzero exit as an error is the coordination layer's policy, applied
    /// after the snapshot has been recorded.
    async fn wait(&mut self) -> Result<ExitSnapshot>;

    /// Non-blocking exit-status probe. `Ok(None)` while still running.
    fn poll_exit(&mut self) -> Result<Option<ExitSnapshot>>;
}

/// Process primitive backed by `tokio::process`.
pub struct TokioProcessCommand {
    command: Command,
    stdout_sink: Option<OutputSink>,
    stdin_source: Option<InputSource>,
}

impl TokioProcessCommand {
    /// Create a command for the given program and arguments.
    ///
    /// Streams are inherited from the parent unless redirected before spawn.
    pub fn new(program: &str, args: &[&str]) -> Self {
        let mut command = Command::new(program);
        command.args(args);
        Self {
            command,
            stdout_sink: None,
            stdin_source: None,
        }
    }
}

impl ProcessCommand for TokioProcessCommand {
    fn redirect_output(&mut self, sink: OutputSink) {
        self.stdout_sink = Some(sink);
    }

    fn redirect_input(&mut self, source: InputSource) {
        self.stdin_source = Some(source);
    }

    fn spawn(&mut self) -> Result<Box<dyn ManagedProcess>> {
        if self.stdout_sink.is_some() {
            self.command.stdout(Stdio::piped());
            self.command.stderr(Stdio::piped());
        }
        if self.stdin_source.is_some() {
            self.command.stdin(Stdio::piped());
        }

        let mut child = self.command.spawn().map_err(|e| {
            error!("Failed to spawn process: {}", e);
            CmdError::StartFailure(e.to_string())
        })?;
        let pid = child.id();
        debug!("Spawned process {:?}", pid);

        let mut io_tasks = Vec::new();
        if let Some(sink) = self.stdout_sink.take() {
            let sink = Arc::new(Mutex::new(sink));
            if let Some(stdout) = child.stdout.take() {
                io_tasks.push(spawn_stream_copy(stdout, Arc::clone(&sink)));
            }
            if let Some(stderr) = child.stderr.take() {
                io_tasks.push(spawn_stream_copy(stderr, sink));
            }
        }
        if let Some(source) = self.stdin_source.take() {
            if let Some(stdin) = child.stdin.take() {
                io_tasks.push(spawn_stdin_feed(source, stdin));
            }
        }

        Ok(Box::new(TokioManagedProcess {
            pid,
            child,
            io_tasks,
        }))
    }
}

/// Spawn a background task that copies a child stream into the shared sink.
///
/// Both stdout and stderr feed the same sink, so writes go through a mutex;
/// interleaving between the two streams carries no ordering guarantee.
fn spawn_stream_copy<R>(mut reader: R, sink: Arc<Mutex<OutputSink>>) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let mut sink = sink.lock().await;
                    if let Err(e) = sink.write_all(&buf[..n]).await {
                        warn!("Error copying process output: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    warn!("Error reading process output: {}", e);
                    break;
                }
            }
        }
        let mut sink = sink.lock().await;
        if let Err(e) = sink.flush().await {
            warn!("Error flushing process output: {}", e);
        }
    })
}

/// Spawn a background task that feeds the source into the child's stdin and
/// closes the pipe at EOF so the child does not block on further input.
fn spawn_stdin_feed(mut source: InputSource, mut stdin: ChildStdin) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut source, &mut stdin).await {
            warn!("Error feeding process input: {}", e);
        }
        // stdin dropped here, closing the pipe
    })
}

/// Running process backed by `tokio::process::Child`.
struct TokioManagedProcess {
    pid: Option<u32>,
    child: Child,
    io_tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl ManagedProcess for TokioManagedProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&mut self) -> Result<ExitSnapshot> {
        let status = self.child.wait().await.map_err(|e| {
            error!("Failed to wait for process {:?}: {}", self.pid, e);
            CmdError::WaitFailure(e.to_string())
        })?;

        // Drain redirected streams so sinks hold the complete output by the
        // time the exit is reported.
        for task in self.io_tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("I/O task for process {:?} failed: {}", self.pid, e);
            }
        }

        let snapshot = ExitSnapshot::from_status(self.pid, status);
        debug!("Process {:?} {}", self.pid, snapshot);
        Ok(snapshot)
    }

    fn poll_exit(&mut self) -> Result<Option<ExitSnapshot>> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| CmdError::WaitFailure(e.to_string()))?;
        Ok(status.map(|s| ExitSnapshot::from_status(self.pid, s)))
    }
}

/// Invocation counters shared between a mock command and its tests.
///
/// Tests clone the counters out before handing the command to a handle, then
/// assert how many times the underlying spawn/wait actually ran.
#[derive(Debug, Clone, Default)]
pub struct MockCounters {
    spawns: Arc<AtomicUsize>,
    waits: Arc<AtomicUsize>,
}

impl MockCounters {
    /// Number of times the underlying spawn was invoked
    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Number of times the underlying wait was invoked
    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }
}

/// Behavior description for a mock process
#[derive(Debug, Clone, Copy)]
pub struct MockInstruction {
    /// How long after spawn the process "exits"
    pub exit_delay: Duration,
    /// Exit code to report (`None` means killed by a signal)
    pub exit_code: Option<i32>,
    /// Signal that killed the process (Unix numbering)
    pub signal: Option<i32>,
}

impl Default for MockInstruction {
    fn default() -> Self {
        Self {
            exit_delay: Duration::from_millis(25),
            exit_code: Some(0),
            signal: None,
        }
    }
}

static NEXT_MOCK_PID: AtomicU32 = AtomicU32::new(40_000);

/// Mock process primitive for testing the coordination layer.
pub struct MockProcessCommand {
    instruction: MockInstruction,
    start_error: Option<String>,
    wait_error: Option<String>,
    counters: MockCounters,
}

impl MockProcessCommand {
    /// Create a mock process with the given behavior
    pub fn new(instruction: MockInstruction) -> Self {
        Self {
            instruction,
            start_error: None,
            wait_error: None,
            counters: MockCounters::default(),
        }
    }

    /// Create a mock that exits quickly with code zero
    pub fn success() -> Self {
        Self::new(MockInstruction::default())
    }

    /// Create a mock that exits quickly with the given nonzero code
    pub fn failure(code: i32) -> Self {
        Self::new(MockInstruction {
            exit_code: Some(code),
            ..MockInstruction::default()
        })
    }

    /// Create a mock whose spawn fails with the given message
    pub fn unlaunchable(message: &str) -> Self {
        let mut mock = Self::success();
        mock.start_error = Some(message.to_string());
        mock
    }

    /// Create a mock whose underlying wait fails with the given message
    pub fn broken_wait(message: &str) -> Self {
        let mut mock = Self::success();
        mock.wait_error = Some(message.to_string());
        mock
    }

    /// Counters observing this mock's spawn/wait invocations
    pub fn counters(&self) -> MockCounters {
        self.counters.clone()
    }
}

impl ProcessCommand for MockProcessCommand {
    fn redirect_output(&mut self, _sink: OutputSink) {
        // Mock processes produce no output
    }

    fn redirect_input(&mut self, _source: InputSource) {
        // Mock processes consume no input
    }

    fn spawn(&mut self) -> Result<Box<dyn ManagedProcess>> {
        self.counters.spawns.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.start_error {
            return Err(CmdError::StartFailure(message.clone()));
        }

        let pid = NEXT_MOCK_PID.fetch_add(1, Ordering::SeqCst);
        debug!("Spawned mock process {}", pid);
        Ok(Box::new(MockManagedProcess {
            pid,
            instruction: self.instruction,
            wait_error: self.wait_error.clone(),
            started_at: Instant::now(),
            counters: self.counters.clone(),
        }))
    }
}

struct MockManagedProcess {
    pid: u32,
    instruction: MockInstruction,
    wait_error: Option<String>,
    started_at: Instant,
    counters: MockCounters,
}

impl MockManagedProcess {
    fn snapshot(&self) -> ExitSnapshot {
        ExitSnapshot {
            pid: Some(self.pid),
            code: self.instruction.exit_code,
            signal: self.instruction.signal,
        }
    }
}

#[async_trait]
impl ManagedProcess for MockManagedProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> Result<ExitSnapshot> {
        self.counters.waits.fetch_add(1, Ordering::SeqCst);
        let elapsed = self.started_at.elapsed();
        if elapsed < self.instruction.exit_delay {
            sleep(self.instruction.exit_delay - elapsed).await;
        }
        if let Some(message) = &self.wait_error {
            return Err(CmdError::WaitFailure(message.clone()));
        }
        Ok(self.snapshot())
    }

    fn poll_exit(&mut self) -> Result<Option<ExitSnapshot>> {
        if self.started_at.elapsed() >= self.instruction.exit_delay {
            Ok(Some(self.snapshot()))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_display_and_code() {
        let exited = ExitSnapshot {
            pid: Some(7),
            code: Some(3),
            signal: None,
        };
        assert_eq!(exited.to_string(), "exited with code 3");
        assert_eq!(exited.exit_code(), 3);
        assert!(!exited.success());

        let signalled = ExitSnapshot {
            pid: Some(7),
            code: None,
            signal: Some(9),
        };
        assert_eq!(signalled.to_string(), "terminated by signal 9");
        assert_eq!(signalled.exit_code(), -1);
    }

    #[cfg(unix)]
    #[test]
    fn test_snapshot_from_real_status() {
        let status = std::process::Command::new("sh")
            .args(["-c", "exit 4"])
            .status()
            .expect("Failed to run sh");

        let snapshot = ExitSnapshot::from_status(Some(1), status);
        assert_eq!(snapshot.code, Some(4));
        assert_eq!(snapshot.signal, None);
    }

    #[tokio::test]
    async fn test_mock_spawn_and_wait() {
        let mut command = MockProcessCommand::success();
        let counters = command.counters();

        let mut process = command.spawn().unwrap();
        assert!(process.pid().is_some());

        let snapshot = process.wait().await.unwrap();
        assert!(snapshot.success());
        assert_eq!(counters.spawns(), 1);
        assert_eq!(counters.waits(), 1);

        // After the exit delay the probe observes the terminal state too.
        assert!(process.poll_exit().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mock_poll_before_exit() {
        let mut command = MockProcessCommand::new(MockInstruction {
            exit_delay: Duration::from_secs(5),
            ..MockInstruction::default()
        });
        let mut process = command.spawn().unwrap();
        assert_eq!(process.poll_exit().unwrap(), None);
    }

    #[tokio::test]
    async fn test_mock_unlaunchable() {
        let mut command = MockProcessCommand::unlaunchable("no such binary");
        let counters = command.counters();

        let result = command.spawn();
        assert_eq!(
            result.err(),
            Some(CmdError::StartFailure("no such binary".to_string()))
        );
        assert_eq!(counters.spawns(), 1);
    }

    #[tokio::test]
    async fn test_mock_failure_snapshot() {
        let mut command = MockProcessCommand::failure(2);
        let mut process = command.spawn().unwrap();
        let snapshot = process.wait().await.unwrap();
        assert_eq!(snapshot.code, Some(2));
        assert!(!snapshot.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_spawn_and_wait() {
        let mut command = TokioProcessCommand::new("true", &[]);
        let mut process = command.spawn().expect("Failed to spawn true");
        assert!(process.pid().is_some());

        let snapshot = process.wait().await.expect("Failed to wait");
        assert!(snapshot.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_spawn_nonexistent_command() {
        let mut command = TokioProcessCommand::new("this_command_does_not_exist_12345", &[]);
        let result = command.spawn();
        assert!(matches!(result, Err(CmdError::StartFailure(_))));
    }
}
