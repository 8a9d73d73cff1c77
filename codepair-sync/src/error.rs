//! Error types for the session sync engine.

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors surfaced by session lifecycle operations and their collaborators.
///
/// `TransientBus` and `Persistence` are recovered locally by the engine
/// (logged, local state kept); the rest are returned to the caller.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("no session found for join code {0}")]
    NotFound(String),

    #[error("invalid join code: {0:?}")]
    InvalidJoinCode(String),

    #[error("join code {0} is already in use")]
    JoinCodeTaken(String),

    #[error("unknown language: {0:?}")]
    UnknownLanguage(String),

    #[error("bus unavailable: {0}")]
    TransientBus(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("already in a session")]
    AlreadyInSession,

    #[error("not in a session")]
    NotInSession,

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("execution still pending after {polls} polls")]
    ExecutionStalled { polls: u32 },
}

impl SyncError {
    /// Whether the failure is one the engine retries or recovers from.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientBus(_) | Self::Persistence(_))
    }
}
