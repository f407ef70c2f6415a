//! Integration tests for command handles against real processes
//!
//! These tests verify that a handle shared between concurrent callers:
//! - starts the underlying process at most once
//! - deduplicates any number of waits onto one underlying wait
//! - rejects starting a handle whose process has already exited
//! - reports consistent exit state and captures redirected I/O

#![cfg(unix)]

use oncecmd::{CmdError, CmdHandle, HandleState};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::time::timeout;

/// Capturing sink shared between the handle's copy tasks and the test.
#[derive(Clone, Default)]
struct CaptureBuf(Arc<Mutex<Vec<u8>>>);

impl CaptureBuf {
    fn new() -> Self {
        Self::default()
    }

    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl AsyncWrite for CaptureBuf {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Test that repeated starts on a running process replay the first outcome
#[tokio::test]
async fn test_multiple_starts() {
    let cmd = CmdHandle::command("sleep", &["1"]);

    cmd.start().await.expect("Failed to start sleep");
    cmd.start().await.expect("Second start should replay Ok");
    assert_eq!(cmd.state(), HandleState::Started);

    // Clean up the sleep process.
    cmd.wait().await.expect("Failed to wait for sleep");
}

/// Test that a handle whose process exited cannot be started again
#[tokio::test]
async fn test_start_after_exit() {
    let buf = CaptureBuf::new();
    let cmd = CmdHandle::command("echo", &["ok"]).with_output(buf);

    cmd.run().await.expect("Failed to run echo");
    assert_eq!(cmd.start().await, Err(CmdError::AlreadyExited));
}

/// Test that serial waits all observe the same outcome
#[tokio::test]
async fn test_multiple_waits() {
    let buf = CaptureBuf::new();
    let cmd = CmdHandle::command("echo", &["ok"]).with_output(buf);

    cmd.start().await.expect("Failed to start echo");
    cmd.wait().await.expect("First wait failed");
    cmd.wait().await.expect("Second wait should replay Ok");
}

/// Test exit-state reporting after a successful run
#[tokio::test]
async fn test_exit_code() {
    let _ = oncecmd::utils::init_tracing("warn");

    let buf = CaptureBuf::new();
    let cmd = CmdHandle::command("echo", &["ok"]).with_output(buf);

    assert!(!cmd.exited());
    assert_eq!(cmd.exit_code(), Err(CmdError::NotYetRun));

    cmd.run().await.expect("Failed to run echo");

    assert!(cmd.exited());
    assert_eq!(cmd.exit_code(), Ok(0));
    assert!(cmd.pid().is_some());
}

/// Test that redirected output lands complete in the sink once run returns
#[tokio::test]
async fn test_with_output() {
    let buf = CaptureBuf::new();
    let cmd = CmdHandle::command("echo", &["ok"]).with_output(buf.clone());

    cmd.run().await.expect("Failed to run echo");

    assert_eq!(buf.contents(), "ok\n");
    assert_eq!(cmd.exit_code(), Ok(0));
}

/// Test stdin redirection through a field-extracting filter
#[tokio::test]
async fn test_with_input() {
    let buf = CaptureBuf::new();
    let cmd = CmdHandle::command("cut", &["-d", " ", "-f", "2"])
        .with_input(&b"1 2\n"[..])
        .with_output(buf.clone());

    cmd.run().await.expect("Failed to run cut");

    assert_eq!(buf.contents(), "2\n");
}

/// Test that 100 concurrent waiters all observe the one recorded outcome
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_waits_concurrent() {
    let buf = CaptureBuf::new();
    let cmd = CmdHandle::command("echo", &["ok"]).with_output(buf);
    cmd.start().await.expect("Failed to start echo");

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let cmd = cmd.clone();
        tasks.push(tokio::spawn(async move { cmd.wait().await }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    assert!(cmd.exited());
    assert_eq!(cmd.exit_code(), Ok(0));
}

/// Test that a nonzero exit surfaces as the wait error while the exit code
/// stays queryable
#[tokio::test]
async fn test_nonzero_exit() {
    let cmd = CmdHandle::command("sh", &["-c", "exit 3"]);

    let outcome = cmd.run().await;
    match outcome {
        Err(CmdError::WaitFailure(ref message)) => {
            assert!(message.contains("code 3"), "unexpected message: {message}");
        }
        other => panic!("Expected WaitFailure, got: {:?}", other),
    }

    assert!(cmd.exited());
    assert_eq!(cmd.exit_code(), Ok(3));
    assert_eq!(cmd.start().await, Err(CmdError::AlreadyExited));

    // Late waiters replay the identical recorded outcome.
    assert_eq!(cmd.wait().await, outcome);
}

/// Test that a failed start is recorded and replayed, and that waiting on
/// the handle afterwards reports the unstarted process
#[tokio::test]
async fn test_start_failure() {
    let cmd = CmdHandle::command("this_command_definitely_does_not_exist_12345", &[]);

    let first = cmd.start().await;
    assert!(matches!(first, Err(CmdError::StartFailure(_))));
    assert_eq!(cmd.start().await, first);
    assert_eq!(cmd.state(), HandleState::StartFailed);

    assert_eq!(
        cmd.wait().await,
        Err(CmdError::WaitFailure("process was never started".to_string()))
    );
}

/// Test that waiting on a never-started handle stays pending
#[tokio::test]
async fn test_wait_never_started() {
    let cmd = CmdHandle::command("echo", &["ok"]);

    let pending = timeout(Duration::from_millis(100), cmd.wait()).await;
    assert!(pending.is_err(), "wait on a never-started handle resolved");
    assert!(!cmd.exited());
}
