//! Concurrency-safe command handles
//!
//! This module provides [`CmdHandle`], a coordination wrapper around one
//! child-process invocation that any number of concurrent callers can share:
//! start happens at most once, wait is deduplicated onto a single underlying
//! wait whose outcome is replayed to every caller, and state queries are
//! consistent under concurrent access.
//!
//! ## Lifecycle
//!
//! ```text
//! Created → Starting → Started → Exited
//!                 ↘ StartFailed
//! ```
//!
//! ## Components
//!
//! - [`CmdHandle`]: the coordination wrapper
//! - [`ProcessCommand`] / [`ManagedProcess`]: the underlying process
//!   primitive the handle coordinates, with tokio-backed and mock
//!   implementations

pub mod adapters;
mod cmd;

pub use adapters::{
    ExitSnapshot, InputSource, ManagedProcess, MockCounters, MockInstruction, MockProcessCommand,
    OutputSink, ProcessCommand, TokioProcessCommand,
};
pub use cmd::CmdHandle;

/// Lifecycle state of a command handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// The process has not been started
    Created,
    /// The first start call is invoking the underlying primitive
    Starting,
    /// The process is running (or has exited without being observed yet)
    Started,
    /// The one-shot start attempt failed; terminal for this handle
    StartFailed,
    /// The process has been observed to have exited
    Exited,
}
