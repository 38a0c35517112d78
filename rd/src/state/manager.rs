//! StateManager - actor that owns the Store
//!
//! Processes commands via channels so engines, the loop manager and the
//! persistence ticker can all touch durable state concurrently while the
//! rusqlite connection stays single-owner.

use std::collections::HashMap;
use std::path::Path;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::domain::{Loop, LoopState, ReviewComment, SessionMapping, Workspace};
use crate::store::Store;

use super::messages::{StateCommand, StateError, StateResponse};

/// Handle to send commands to the StateManager actor
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Open the store under `data_dir` and spawn the actor
    pub fn spawn(data_dir: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(data_dir = %data_dir.as_ref().display(), "StateManager::spawn: called");
        let store = Store::open(data_dir.as_ref())?;
        Ok(Self::spawn_with_store(store))
    }

    /// Spawn the actor over an already-open store
    pub fn spawn_with_store(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand,
    ) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).await.map_err(|_| StateError::Channel)?;
        reply_rx.await.map_err(|_| StateError::Channel)?
    }

    // === Loop operations ===

    pub async fn save_loop(&self, record: Loop) -> StateResponse<()> {
        debug!(id = %record.config.id, status = %record.state.status, "save_loop: called");
        self.send(|reply| StateCommand::SaveLoop {
            record: Box::new(record),
            reply,
        })
        .await
    }

    pub async fn get_loop(&self, id: &str) -> StateResponse<Option<Loop>> {
        debug!(%id, "get_loop: called");
        let id = id.to_string();
        self.send(|reply| StateCommand::GetLoop { id, reply }).await
    }

    /// Get a loop, failing with NotFound when absent
    pub async fn get_loop_required(&self, id: &str) -> Result<Loop, StateError> {
        self.get_loop(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("loop {}", id)))
    }

    pub async fn list_loops(&self) -> StateResponse<Vec<Loop>> {
        debug!("list_loops: called");
        self.send(|reply| StateCommand::ListLoops { reply }).await
    }

    pub async fn list_loops_for_workspace(&self, workspace_id: &str) -> StateResponse<Vec<Loop>> {
        debug!(%workspace_id, "list_loops_for_workspace: called");
        let workspace_id = workspace_id.to_string();
        self.send(|reply| StateCommand::ListLoopsForWorkspace { workspace_id, reply })
            .await
    }

    pub async fn update_loop_state(&self, id: &str, state: LoopState) -> StateResponse<()> {
        debug!(%id, status = %state.status, "update_loop_state: called");
        let id = id.to_string();
        self.send(|reply| StateCommand::UpdateLoopState {
            id,
            state: Box::new(state),
            reply,
        })
        .await
    }

    pub async fn delete_loop(&self, id: &str) -> StateResponse<()> {
        debug!(%id, "delete_loop: called");
        let id = id.to_string();
        self.send(|reply| StateCommand::DeleteLoop { id, reply }).await
    }

    // === Workspace operations ===

    pub async fn save_workspace(&self, workspace: Workspace) -> StateResponse<()> {
        debug!(id = %workspace.id, "save_workspace: called");
        self.send(|reply| StateCommand::SaveWorkspace {
            workspace: Box::new(workspace),
            reply,
        })
        .await
    }

    pub async fn get_workspace(&self, id: &str) -> StateResponse<Option<Workspace>> {
        debug!(%id, "get_workspace: called");
        let id = id.to_string();
        self.send(|reply| StateCommand::GetWorkspace { id, reply }).await
    }

    pub async fn get_workspace_required(&self, id: &str) -> Result<Workspace, StateError> {
        self.get_workspace(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("workspace {}", id)))
    }

    pub async fn get_workspace_by_directory(&self, directory: &str) -> StateResponse<Option<Workspace>> {
        debug!(%directory, "get_workspace_by_directory: called");
        let directory = directory.to_string();
        self.send(|reply| StateCommand::GetWorkspaceByDirectory { directory, reply })
            .await
    }

    pub async fn list_workspaces(&self) -> StateResponse<Vec<Workspace>> {
        debug!("list_workspaces: called");
        self.send(|reply| StateCommand::ListWorkspaces { reply }).await
    }

    pub async fn delete_workspace(&self, id: &str) -> StateResponse<()> {
        debug!(%id, "delete_workspace: called");
        let id = id.to_string();
        self.send(|reply| StateCommand::DeleteWorkspace { id, reply }).await
    }

    // === Session operations ===

    pub async fn set_session_mapping(
        &self,
        backend: &str,
        loop_id: &str,
        session_id: &str,
        server_url: Option<String>,
    ) -> StateResponse<()> {
        debug!(%backend, %loop_id, %session_id, "set_session_mapping: called");
        let (backend, loop_id, session_id) = (backend.to_string(), loop_id.to_string(), session_id.to_string());
        self.send(|reply| StateCommand::SetSessionMapping {
            backend,
            loop_id,
            session_id,
            server_url,
            reply,
        })
        .await
    }

    pub async fn get_session_mapping(&self, backend: &str, loop_id: &str) -> StateResponse<Option<SessionMapping>> {
        debug!(%backend, %loop_id, "get_session_mapping: called");
        let (backend, loop_id) = (backend.to_string(), loop_id.to_string());
        self.send(|reply| StateCommand::GetSessionMapping { backend, loop_id, reply })
            .await
    }

    pub async fn save_session_mappings(
        &self,
        backend: &str,
        mappings: HashMap<String, SessionMapping>,
    ) -> StateResponse<()> {
        debug!(%backend, count = mappings.len(), "save_session_mappings: called");
        let backend = backend.to_string();
        self.send(|reply| StateCommand::SaveSessionMappings {
            backend,
            mappings,
            reply,
        })
        .await
    }

    // === Review comment operations ===

    pub async fn add_review_comment(&self, comment: ReviewComment) -> StateResponse<()> {
        debug!(loop_id = %comment.loop_id, "add_review_comment: called");
        self.send(|reply| StateCommand::AddReviewComment {
            comment: Box::new(comment),
            reply,
        })
        .await
    }

    pub async fn list_review_comments(&self, loop_id: &str) -> StateResponse<Vec<ReviewComment>> {
        debug!(%loop_id, "list_review_comments: called");
        let loop_id = loop_id.to_string();
        self.send(|reply| StateCommand::ListReviewComments { loop_id, reply })
            .await
    }

    pub async fn mark_comment_addressed(&self, id: &str) -> StateResponse<()> {
        debug!(%id, "mark_comment_addressed: called");
        let id = id.to_string();
        self.send(|reply| StateCommand::MarkCommentAddressed { id, reply }).await
    }

    // === Preferences ===

    pub async fn get_preference(&self, key: &str) -> StateResponse<Option<String>> {
        let key = key.to_string();
        self.send(|reply| StateCommand::GetPreference { key, reply }).await
    }

    pub async fn set_preference(&self, key: &str, value: &str) -> StateResponse<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.send(|reply| StateCommand::SetPreference { key, value, reply }).await
    }

    // === Maintenance ===

    pub async fn reset(&self) -> StateResponse<()> {
        debug!("reset: called");
        self.send(|reply| StateCommand::Reset { reply }).await
    }

    pub async fn delete_and_reinit(&self) -> StateResponse<()> {
        debug!("delete_and_reinit: called");
        self.send(|reply| StateCommand::DeleteAndReinit { reply }).await
    }

    /// Shutdown the actor
    pub async fn shutdown(&self) -> Result<(), StateError> {
        debug!("shutdown: called");
        self.tx.send(StateCommand::Shutdown).await.map_err(|_| StateError::Channel)
    }
}

/// The actor loop that owns the Store and processes commands
async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("StateManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::SaveLoop { record, reply } => {
                let _ = reply.send(store.save_loop(&record).map_err(StateError::from));
            }
            StateCommand::GetLoop { id, reply } => {
                let _ = reply.send(store.get_loop(&id).map_err(StateError::from));
            }
            StateCommand::ListLoops { reply } => {
                let _ = reply.send(store.list_loops().map_err(StateError::from));
            }
            StateCommand::ListLoopsForWorkspace { workspace_id, reply } => {
                let _ = reply.send(store.list_loops_for_workspace(&workspace_id).map_err(StateError::from));
            }
            StateCommand::UpdateLoopState { id, state, reply } => {
                let _ = reply.send(store.update_loop_state(&id, &state).map_err(StateError::from));
            }
            StateCommand::DeleteLoop { id, reply } => {
                let _ = reply.send(store.delete_loop(&id).map_err(StateError::from));
            }
            StateCommand::SaveWorkspace { workspace, reply } => {
                let _ = reply.send(store.save_workspace(&workspace).map_err(StateError::from));
            }
            StateCommand::GetWorkspace { id, reply } => {
                let _ = reply.send(store.get_workspace(&id).map_err(StateError::from));
            }
            StateCommand::GetWorkspaceByDirectory { directory, reply } => {
                let _ = reply.send(store.get_workspace_by_directory(&directory).map_err(StateError::from));
            }
            StateCommand::ListWorkspaces { reply } => {
                let _ = reply.send(store.list_workspaces().map_err(StateError::from));
            }
            StateCommand::DeleteWorkspace { id, reply } => {
                let _ = reply.send(store.delete_workspace(&id).map_err(StateError::from));
            }
            StateCommand::SetSessionMapping {
                backend,
                loop_id,
                session_id,
                server_url,
                reply,
            } => {
                let _ = reply.send(
                    store
                        .set_session_mapping(&backend, &loop_id, &session_id, server_url.as_deref())
                        .map_err(StateError::from),
                );
            }
            StateCommand::GetSessionMapping {
                backend,
                loop_id,
                reply,
            } => {
                let _ = reply.send(store.get_session_mapping(&backend, &loop_id).map_err(StateError::from));
            }
            StateCommand::SaveSessionMappings {
                backend,
                mappings,
                reply,
            } => {
                let _ = reply.send(store.save_session_mappings(&backend, &mappings).map_err(StateError::from));
            }
            StateCommand::AddReviewComment { comment, reply } => {
                let _ = reply.send(store.add_review_comment(&comment).map_err(StateError::from));
            }
            StateCommand::ListReviewComments { loop_id, reply } => {
                let _ = reply.send(store.list_review_comments(&loop_id).map_err(StateError::from));
            }
            StateCommand::MarkCommentAddressed { id, reply } => {
                let _ = reply.send(store.mark_comment_addressed(&id).map_err(StateError::from));
            }
            StateCommand::GetPreference { key, reply } => {
                let _ = reply.send(store.get_preference(&key).map_err(StateError::from));
            }
            StateCommand::SetPreference { key, value, reply } => {
                let _ = reply.send(store.set_preference(&key, &value).map_err(StateError::from));
            }
            StateCommand::Reset { reply } => {
                let _ = reply.send(store.reset().map_err(StateError::from));
            }
            StateCommand::DeleteAndReinit { reply } => {
                let _ = reply.send(store.delete_and_reinit().map_err(StateError::from));
            }
            StateCommand::Shutdown => {
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}
