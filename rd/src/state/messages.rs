//! Command and error types for the StateManager actor

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::domain::{Loop, LoopState, ReviewComment, SessionMapping, Workspace};
use crate::store::StoreError;

/// Errors surfaced by the StateManager
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("state channel closed")]
    Channel,

    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for StateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => StateError::NotFound(what),
            StoreError::Conflict(id) => StateError::Conflict(id),
            other => StateError::Store(other.to_string()),
        }
    }
}

/// Convenience alias for StateManager results
pub type StateResponse<T> = Result<T, StateError>;

/// Commands processed by the actor loop
pub enum StateCommand {
    // Loops
    SaveLoop {
        record: Box<Loop>,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    GetLoop {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Loop>>>,
    },
    ListLoops {
        reply: oneshot::Sender<StateResponse<Vec<Loop>>>,
    },
    ListLoopsForWorkspace {
        workspace_id: String,
        reply: oneshot::Sender<StateResponse<Vec<Loop>>>,
    },
    UpdateLoopState {
        id: String,
        state: Box<LoopState>,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    DeleteLoop {
        id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },

    // Workspaces
    SaveWorkspace {
        workspace: Box<Workspace>,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    GetWorkspace {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Workspace>>>,
    },
    GetWorkspaceByDirectory {
        directory: String,
        reply: oneshot::Sender<StateResponse<Option<Workspace>>>,
    },
    ListWorkspaces {
        reply: oneshot::Sender<StateResponse<Vec<Workspace>>>,
    },
    DeleteWorkspace {
        id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },

    // Sessions
    SetSessionMapping {
        backend: String,
        loop_id: String,
        session_id: String,
        server_url: Option<String>,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    GetSessionMapping {
        backend: String,
        loop_id: String,
        reply: oneshot::Sender<StateResponse<Option<SessionMapping>>>,
    },
    SaveSessionMappings {
        backend: String,
        mappings: HashMap<String, SessionMapping>,
        reply: oneshot::Sender<StateResponse<()>>,
    },

    // Review comments
    AddReviewComment {
        comment: Box<ReviewComment>,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListReviewComments {
        loop_id: String,
        reply: oneshot::Sender<StateResponse<Vec<ReviewComment>>>,
    },
    MarkCommentAddressed {
        id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },

    // Preferences
    GetPreference {
        key: String,
        reply: oneshot::Sender<StateResponse<Option<String>>>,
    },
    SetPreference {
        key: String,
        value: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },

    // Maintenance
    Reset {
        reply: oneshot::Sender<StateResponse<()>>,
    },
    DeleteAndReinit {
        reply: oneshot::Sender<StateResponse<()>>,
    },
    Shutdown,
}
