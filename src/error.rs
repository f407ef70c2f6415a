//! Error types and utilities for command handles

use thiserror::Error;

/// Errors produced by command handles.
///
/// Variants carry owned strings rather than source errors so that the
/// recorded start/wait outcomes are `Clone` and can be replayed verbatim to
/// every caller of the one-shot operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CmdError {
    #[error("process has already exited")]
    AlreadyExited,

    #[error("failed to start process: {0}")]
    StartFailure(String),

    #[error("failed to wait for process: {0}")]
    WaitFailure(String),

    #[error("process has not finished yet")]
    NotYetRun,

    #[error("initialization error: {0}")]
    Initialization(String),
}

impl CmdError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CmdError::AlreadyExited => "CMD001",
            CmdError::StartFailure(_) => "CMD002",
            CmdError::WaitFailure(_) => "CMD003",
            CmdError::NotYetRun => "CMD004",
            CmdError::Initialization(_) => "CMD005",
        }
    }
}

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, CmdError>;
