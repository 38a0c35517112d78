//! Loop manager error taxonomy
//!
//! These kinds are what a route layer maps onto HTTP status codes.

use crate::agent::AgentError;
use crate::backend::BackendError;
use crate::git::GitError;
use crate::state::StateError;

/// Errors surfaced by loop operations
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a draft loop")]
    NotDraft,

    #[error("loop is not running")]
    NotRunning,

    #[error("loop is not planning")]
    NotPlanning,

    #[error("operation already in progress")]
    AlreadyInProgress,

    #[error("model not enabled: {0}")]
    ModelNotEnabled(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("uncommitted changes in {0}")]
    UncommittedChanges(String),

    #[error("update branch failed: {0}")]
    UpdateBranchFailed(String),

    #[error("push failed: {0}")]
    PushFailed(String),

    #[error("accept failed: {0}")]
    AcceptFailed(String),

    #[error("discard failed: {0}")]
    DiscardFailed(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection timed out")]
    ConnectionTimeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl LoopError {
    /// Stable error kind for API responses
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NotDraft => "not_draft",
            Self::NotRunning => "not_running",
            Self::NotPlanning => "not_planning",
            Self::AlreadyInProgress => "already_in_progress",
            Self::ModelNotEnabled(_) => "model_not_enabled",
            Self::ModelNotFound(_) => "model_not_found",
            Self::ProviderNotFound(_) => "provider_not_found",
            Self::ValidationFailed(_) => "validation_failed",
            Self::UncommittedChanges(_) => "uncommitted_changes",
            Self::UpdateBranchFailed(_) => "update_branch_failed",
            Self::PushFailed(_) => "push_failed",
            Self::AcceptFailed(_) => "accept_failed",
            Self::DiscardFailed(_) => "discard_failed",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::ConnectionTimeout => "connection_timeout",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<StateError> for LoopError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(what) => Self::NotFound(what),
            StateError::Conflict(what) => Self::ValidationFailed(format!("conflict: {}", what)),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<AgentError> for LoopError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::ModelNotEnabled(m) => Self::ModelNotEnabled(m),
            AgentError::ModelNotFound(m) => Self::ModelNotFound(m),
            AgentError::ProviderNotFound(p) => Self::ProviderNotFound(p),
            AgentError::ConnectionTimeout => Self::ConnectionTimeout,
            AgentError::NotConnected => Self::ConnectionFailed("not connected".to_string()),
            AgentError::ConnectionFailed(cause) => Self::ConnectionFailed(cause),
            AgentError::SessionNotFound(s) => Self::NotFound(format!("session {}", s)),
        }
    }
}

impl From<BackendError> for LoopError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Agent(inner) => inner.into(),
            BackendError::ConnectionTimeout => Self::ConnectionTimeout,
            BackendError::RemoteOnly => Self::ValidationFailed(err.to_string()),
            BackendError::SpawnFailed(cause) => Self::ConnectionFailed(cause),
        }
    }
}

impl From<GitError> for LoopError {
    fn from(err: GitError) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(LoopError::NotDraft.kind(), "not_draft");
        assert_eq!(LoopError::AlreadyInProgress.kind(), "already_in_progress");
        assert_eq!(LoopError::ModelNotEnabled("m".into()).kind(), "model_not_enabled");
        assert_eq!(LoopError::Internal("x".into()).kind(), "internal");
    }

    #[test]
    fn test_state_error_mapping() {
        let err: LoopError = StateError::NotFound("loop x".into()).into();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_agent_error_mapping() {
        let err: LoopError = AgentError::ModelNotEnabled("claude".into()).into();
        assert_eq!(err.kind(), "model_not_enabled");
        let err: LoopError = AgentError::ConnectionTimeout.into();
        assert_eq!(err.kind(), "connection_timeout");
    }
}
