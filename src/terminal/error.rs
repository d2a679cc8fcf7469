//! Terminal Error Types
//!
//! Every failure the engine can surface, split by who gets to hear about it:
//! validation and execution errors go back to the operator as `error`
//! messages, cancellation is silent, transport errors end the session.

use std::process::ExitStatus;

/// Rejection from the allow-list validator. No process is spawned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("this command {0:?} is not permitted")]
    NotPermitted(String),

    #[error("argument {0:?} is too long")]
    ArgumentTooLong(String),

    #[error("argument {0:?} contains forbidden characters")]
    ForbiddenCharacters(String),
}

impl ValidationError {
    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::NotPermitted(_) => "not_permitted",
            ValidationError::ArgumentTooLong(_) => "argument_too_long",
            ValidationError::ForbiddenCharacters(_) => "forbidden_characters",
        }
    }
}

/// Failure of a single command run
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to start command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to collect command output: {0}")]
    Output(#[source] std::io::Error),

    #[error("command execution failed: {0}")]
    Exited(ExitStatus),

    #[error("command {0:?} timed out")]
    TimedOut(String),

    /// Session teardown or an explicit stop. Never shown to the operator.
    #[error("command cancelled")]
    Cancelled,

    #[error("command task panicked")]
    Panicked,
}

impl RunError {
    /// Whether this is the expected outcome of a stop or disconnect
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RunError::Cancelled)
    }

    /// Short label for metrics
    pub fn outcome(&self) -> &'static str {
        match self {
            RunError::Spawn(_) => "spawn_failed",
            RunError::Output(_) => "output_failed",
            RunError::Exited(_) => "exited",
            RunError::TimedOut(_) => "timed_out",
            RunError::Cancelled => "cancelled",
            RunError::Panicked => "panicked",
        }
    }
}

/// Transport failure. Fatal for the session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}
