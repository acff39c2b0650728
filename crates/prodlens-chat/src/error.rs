//! Error types for the conversation core.

use serde::{Deserialize, Serialize};

use prodlens_core::error::ProdLensError;

/// Errors returned to the caller of the orchestrator.
///
/// Collaborator failures inside a turn never surface here; they degrade the
/// turn and are recorded as [`TurnError`]s instead.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("message exceeds maximum length of {0} characters")]
    MessageTooLong(usize),
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),
    #[error("session store error: {0}")]
    SessionStore(String),
}

impl ChatError {
    /// Whether the caller sent something unacceptable, as opposed to an
    /// infrastructure failure.
    pub fn is_caller_error(&self) -> bool {
        !matches!(self, ChatError::SessionStore(_))
    }
}

impl From<ProdLensError> for ChatError {
    fn from(err: ProdLensError) -> Self {
        ChatError::SessionStore(err.to_string())
    }
}

/// A degraded step recorded on a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "stage", content = "message", rename_all = "snake_case")]
pub enum TurnError {
    #[error("rewrite failed: {0}")]
    Rewrite(String),
    #[error("routing failed: {0}")]
    Routing(String),
    #[error("content classification failed: {0}")]
    ContentClassification(String),
    #[error("entity resolution failed: {0}")]
    EntityResolution(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("small talk failed: {0}")]
    SmallTalk(String),
    #[error("synthesis failed: {0}")]
    Synthesis(String),
}
