//! Concurrency-safe handles over external child processes
//!
//! This crate wraps a child-process invocation in a handle that multiple
//! independent callers can start, wait on, and inspect without races or
//! duplicate side effects: the process starts at most once, a single
//! underlying wait serves every waiter, and every caller observes the same
//! recorded outcomes.
//!
//! Process creation and execution themselves are delegated to an underlying
//! process primitive (tokio-backed by default, pluggable through the
//! [`handle::ProcessCommand`] trait); this crate supplies only the
//! coordination discipline around it.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> oncecmd::Result<()> {
//! use oncecmd::CmdHandle;
//!
//! let cmd = CmdHandle::command("sh", &["-c", "echo done"]);
//! cmd.start().await?;
//!
//! // Any number of clones can wait; the process is only waited on once.
//! let waiter = cmd.clone();
//! let task = tokio::spawn(async move { waiter.wait().await });
//!
//! cmd.wait().await?;
//! task.await.unwrap()?;
//! assert!(cmd.exited());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod handle;

pub use error::{CmdError, Result};
pub use handle::{CmdHandle, HandleState};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| crate::CmdError::Initialization(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
