//! The command handle: one-shot lifecycle coordination for a child process

use super::adapters::{ExitSnapshot, ManagedProcess, ProcessCommand, TokioProcessCommand};
use super::HandleState;
use crate::error::{CmdError, Result};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, warn};

/// A concurrency-safe handle over one child-process invocation.
///
/// The handle is cheaply cloneable; all clones coordinate on the same
/// process. Any number of callers may invoke [`start`](CmdHandle::start),
/// [`wait`](CmdHandle::wait), [`run`](CmdHandle::run), and the state queries
/// concurrently:
///
/// - the underlying process is started at most once, and every caller
///   observes the recorded start outcome;
/// - the underlying process is waited on at most once, and every caller,
///   early or late, observes the identical recorded wait outcome;
/// - starting a handle whose process has already exited is rejected.
///
/// # Example
///
/// ```no_run
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> oncecmd::Result<()> {
/// use oncecmd::CmdHandle;
///
/// let cmd = CmdHandle::command("echo", &["hello"]);
/// cmd.run().await?;
/// assert_eq!(cmd.exit_code()?, 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CmdHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    /// The general lock: every mutable process-state field lives behind it.
    state: Mutex<ProcState>,
    /// Exactly-once start guard holding the permanent start outcome.
    start_cell: OnceCell<Result<()>>,
    /// Exactly-once wait guard holding the permanent wait outcome.
    wait_cell: OnceCell<Result<()>>,
    /// Lifecycle broadcast; waiters park here until a start attempt resolves.
    state_tx: watch::Sender<HandleState>,
    /// Recorded wait outcome, published once for every present and future waiter.
    wait_tx: watch::Sender<Option<Result<()>>>,
}

struct ProcState {
    /// Not-yet-started primitive; taken by the first start.
    command: Option<Box<dyn ProcessCommand>>,
    /// Running primitive; taken by the first wait so the blocking wait runs
    /// without the general lock held.
    child: Option<Box<dyn ManagedProcess>>,
    pid: Option<u32>,
    /// Terminal snapshot, present once an exit has been observed.
    exit: Option<ExitSnapshot>,
}

impl ProcState {
    /// Refresh the terminal snapshot from the primitive without blocking.
    ///
    /// Called under the general lock by every state query and by the start
    /// precondition check, so a process that died without anyone waiting is
    /// still observed as exited.
    fn probe_exit(&mut self, state_tx: &watch::Sender<HandleState>) {
        if self.exit.is_some() {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            match child.poll_exit() {
                Ok(Some(snapshot)) => {
                    self.exit = Some(snapshot);
                    state_tx.send_replace(HandleState::Exited);
                }
                Ok(None) => {}
                Err(e) => debug!("Exit probe failed: {}", e),
            }
        }
    }
}

impl CmdHandle {
    /// Wrap a not-yet-started process primitive.
    ///
    /// No side effects; the process is launched by the first
    /// [`start`](CmdHandle::start) (or [`run`](CmdHandle::run)) call.
    pub fn new(command: Box<dyn ProcessCommand>) -> Self {
        let (state_tx, _) = watch::channel(HandleState::Created);
        let (wait_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(HandleInner {
                state: Mutex::new(ProcState {
                    command: Some(command),
                    child: None,
                    pid: None,
                    exit: None,
                }),
                start_cell: OnceCell::new(),
                wait_cell: OnceCell::new(),
                state_tx,
                wait_tx,
            }),
        }
    }

    /// Create a handle for the given program and arguments, backed by the
    /// tokio process primitive.
    pub fn command(program: &str, args: &[&str]) -> Self {
        Self::new(Box::new(TokioProcessCommand::new(program, args)))
    }

    /// Redirect both stdout and stderr of the process to the given sink.
    ///
    /// Must be called before [`start`](CmdHandle::start); once the process
    /// has been launched the call is ignored with a warning (caller
    /// contract). Returns the handle for chaining.
    #[must_use]
    pub fn with_output<W>(self, sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        {
            let mut state = self.inner.state.lock().unwrap();
            match state.command.as_mut() {
                Some(command) => command.redirect_output(Box::new(sink)),
                None => warn!("Output redirection ignored: process already started"),
            }
        }
        self
    }

    /// Redirect stdin of the process to the given source.
    ///
    /// Same pre-start contract as [`with_output`](CmdHandle::with_output).
    #[must_use]
    pub fn with_input<R>(self, source: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        {
            let mut state = self.inner.state.lock().unwrap();
            match state.command.as_mut() {
                Some(command) => command.redirect_input(Box::new(source)),
                None => warn!("Input redirection ignored: process already started"),
            }
        }
        self
    }

    /// Start the underlying process.
    ///
    /// The first call across all clones launches the process; the recorded
    /// outcome is replayed to every other caller, first or subsequent, and
    /// the underlying start primitive runs exactly once in total. Fails with
    /// [`CmdError::AlreadyExited`] once the process has been observed to
    /// have exited, checked freshly under the lock before the one-shot guard
    /// is consulted.
    pub async fn start(&self) -> Result<()> {
        if self.exited() {
            return Err(CmdError::AlreadyExited);
        }
        self.inner
            .start_cell
            .get_or_init(|| self.start_once())
            .await
            .clone()
    }

    async fn start_once(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        self.inner.state_tx.send_replace(HandleState::Starting);

        let Some(mut command) = state.command.take() else {
            // new() always seeds the command and only this one-shot path
            // takes it.
            self.inner.state_tx.send_replace(HandleState::StartFailed);
            return Err(CmdError::StartFailure(
                "process specification missing".to_string(),
            ));
        };

        match command.spawn() {
            Ok(child) => {
                state.pid = child.pid();
                state.child = Some(child);
                self.inner.state_tx.send_replace(HandleState::Started);
                debug!("Process {:?} started", state.pid);
                Ok(())
            }
            Err(e) => {
                self.inner.state_tx.send_replace(HandleState::StartFailed);
                Err(e)
            }
        }
    }

    /// Start the process and wait for it to finish.
    ///
    /// Returns the start error without waiting when the start fails,
    /// otherwise the wait outcome. Composes the guarantees of
    /// [`start`](CmdHandle::start) and [`wait`](CmdHandle::wait).
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        self.wait().await
    }

    /// Wait for the underlying process to exit.
    ///
    /// Any number of callers may wait, concurrently or at different times;
    /// the underlying wait primitive runs exactly once, and every caller
    /// receives the identical recorded outcome. A nonzero exit (or signal
    /// death) is surfaced as [`CmdError::WaitFailure`]; the exit code
    /// remains queryable through [`exit_code`](CmdHandle::exit_code)
    /// regardless.
    ///
    /// Each call dispatches a background task that races for the one-shot
    /// wait guard, so a caller that abandons its wait (e.g. behind an
    /// external timeout) never cancels the real wait for everyone else. If
    /// the handle is never started, the call blocks indefinitely (caller
    /// contract); bound it externally when that is not acceptable.
    pub async fn wait(&self) -> Result<()> {
        if self.inner.wait_tx.borrow().is_none() {
            self.spawn_wait_driver();
        }

        let mut outcome_rx = self.inner.wait_tx.subscribe();
        loop {
            {
                let current = outcome_rx.borrow_and_update();
                if let Some(outcome) = current.as_ref() {
                    return outcome.clone();
                }
            }
            if outcome_rx.changed().await.is_err() {
                return Err(CmdError::WaitFailure(
                    "handle closed before wait completed".to_string(),
                ));
            }
        }
    }

    /// Dispatch the background task that attempts the one-shot wait guard
    /// and publishes the recorded outcome. Idempotent: losers of the guard
    /// race park until the winner resolves it, then publish the same
    /// recorded value.
    fn spawn_wait_driver(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            let outcome = handle
                .inner
                .wait_cell
                .get_or_init(|| handle.wait_once())
                .await
                .clone();
            handle.inner.wait_tx.send_replace(Some(outcome));
        });
    }

    async fn wait_once(&self) -> Result<()> {
        // Park until a start attempt has resolved. A handle that is never
        // started keeps every waiter pending.
        let mut state_rx = self.inner.state_tx.subscribe();
        loop {
            let current = *state_rx.borrow_and_update();
            match current {
                HandleState::Created | HandleState::Starting => {
                    if state_rx.changed().await.is_err() {
                        return Err(CmdError::WaitFailure(
                            "handle state channel closed".to_string(),
                        ));
                    }
                }
                HandleState::StartFailed => {
                    return Err(CmdError::WaitFailure(
                        "process was never started".to_string(),
                    ));
                }
                HandleState::Started | HandleState::Exited => break,
            }
        }

        // Take the child so the underlying wait runs without the lock held.
        let child = self.inner.state.lock().unwrap().child.take();
        let Some(mut child) = child else {
            // The child is only ever taken here, and this path runs at most
            // once.
            return Err(CmdError::WaitFailure(
                "process handle unavailable".to_string(),
            ));
        };

        let waited = child.wait().await;
        let mut state = self.inner.state.lock().unwrap();
        match waited {
            Ok(snapshot) => {
                state.exit = Some(snapshot);
                self.inner.state_tx.send_replace(HandleState::Exited);
                debug!("Process {:?} {}", snapshot.pid, snapshot);
                if snapshot.success() {
                    Ok(())
                } else {
                    Err(CmdError::WaitFailure(format!("process {}", snapshot)))
                }
            }
            Err(e) => {
                // Keep the child so status probes can still observe a
                // terminal state if the process did in fact exit.
                state.child = Some(child);
                Err(e)
            }
        }
    }

    /// Whether the process has been observed to have exited.
    ///
    /// Reads fresh process state under the general lock; `false` while the
    /// process is running or was never started.
    pub fn exited(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        state.probe_exit(&self.inner.state_tx);
        state.exit.is_some()
    }

    /// Exit code of the process.
    ///
    /// Fails with [`CmdError::NotYetRun`] while no terminal state is
    /// available; after termination returns the real exit code, or `-1`
    /// when the process was killed by a signal.
    pub fn exit_code(&self) -> Result<i32> {
        let mut state = self.inner.state.lock().unwrap();
        state.probe_exit(&self.inner.state_tx);
        match state.exit {
            Some(snapshot) => Ok(snapshot.exit_code()),
            None => Err(CmdError::NotYetRun),
        }
    }

    /// Process ID, `None` until the process has been started.
    pub fn pid(&self) -> Option<u32> {
        self.inner.state.lock().unwrap().pid
    }

    /// Current lifecycle state of the handle.
    pub fn state(&self) -> HandleState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<HandleState> {
        self.inner.state_tx.subscribe()
    }
}

impl fmt::Debug for CmdHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdHandle")
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}
