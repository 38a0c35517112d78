//! Sync controller - push and update-branch orchestration
//!
//! Pushing a finished loop first brings its working branch up to date with
//! the remote base branch, then with the remote working branch if one
//! exists, then pushes. A merge that stops on conflicts hands the worktree
//! to a conflict-resolution agent iteration and returns immediately; the
//! resolution's completion handler re-enters this flow.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::CreateSessionRequest;
use crate::backend::BackendManager;
use crate::domain::{
    COMPLETE_MARKER, CompletionAction, Loop, LoopStatus, ReviewModeState, SyncModeState, SyncPhase,
};
use crate::events::EventBus;
use crate::git::{GitService, MergeOutcome};
use crate::r#loop::{DriveEnd, LoopError, LoopLocks, drive_session_iteration};
use crate::state::StateManager;

/// How a push call concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    AlreadyUpToDate,
    Clean,
    ConflictsBeingResolved,
}

/// Result of `push_loop` / `update_branch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub sync_status: SyncStatus,
    /// Present iff the push actually happened in this call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Which flow is running; update-branch skips review initialization and
/// has a different status precondition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Push,
    UpdateBranch,
}

/// Orchestrates base-branch and working-branch synchronization
pub struct SyncController {
    state: StateManager,
    git: GitService,
    events: Arc<EventBus>,
    backends: Arc<BackendManager>,
    locks: Arc<LoopLocks>,
    cancel: CancellationToken,
}

impl SyncController {
    pub fn new(
        state: StateManager,
        git: GitService,
        events: Arc<EventBus>,
        backends: Arc<BackendManager>,
        locks: Arc<LoopLocks>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            git,
            events,
            backends,
            locks,
            cancel: CancellationToken::new(),
        })
    }

    /// Cancel in-flight resolution work
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run the sync flow. The caller holds the per-loop mutex; the
    /// retry-after-resolution path re-acquires it itself.
    ///
    /// Returns an explicitly boxed future (rather than `async fn`) because
    /// this method and [`Self::enter_conflict_resolution`] are mutually
    /// recursive; an opaque `impl Future` here would make the compiler try
    /// to expand the recursion when checking `Send`, which never resolves.
    pub fn run<'a>(
        self: &'a Arc<Self>,
        loop_id: &'a str,
        kind: SyncKind,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<SyncResult, LoopError>> + Send + 'a>> {
        Box::pin(async move {
        debug!(%loop_id, ?kind, "run: sync flow starting");
        let record = self.state.get_loop_required(loop_id).await?;

        let retrying = record.state.status == LoopStatus::ResolvingConflicts && record.state.sync.is_some();
        let allowed = match kind {
            SyncKind::Push => matches!(
                record.state.status,
                LoopStatus::Completed | LoopStatus::MaxIterations
            ),
            SyncKind::UpdateBranch => record.state.status == LoopStatus::Pushed,
        };
        if !allowed && !retrying {
            return Err(LoopError::ValidationFailed(format!(
                "cannot sync loop in status {}",
                record.state.status
            )));
        }

        let Some(git_state) = record.state.git.clone() else {
            return Err(LoopError::ValidationFailed("loop has no git state".to_string()));
        };

        let emitter = self.events.emitter_for(loop_id);
        emitter.sync_started();

        let worktree = PathBuf::from(&git_state.worktree_path);
        self.git.ensure_merge_strategy(&worktree).await.map_err(|e| self.wrap(kind, e))?;

        // Phase 1: merge the remote base branch into the working branch
        let mut merged_anything = false;
        self.git
            .fetch(&worktree, "origin", &git_state.original_branch)
            .await
            .map_err(|e| self.wrap(kind, e))?;
        match self
            .git
            .merge_from_remote(&worktree, &git_state.original_branch)
            .await
            .map_err(|e| self.wrap(kind, e))?
        {
            MergeOutcome::AlreadyUpToDate => emitter.sync_clean(true),
            MergeOutcome::Clean => {
                merged_anything = true;
                emitter.sync_clean(false);
            }
            MergeOutcome::Conflicts { files } => {
                return self
                    .enter_conflict_resolution(&record, kind, SyncPhase::BaseBranch, files)
                    .await;
            }
        }

        // Phase 2: if the working branch already lives on the remote, merge
        // it in before pushing
        let mut set_upstream = true;
        if self
            .git
            .remote_branch_exists(&worktree, &git_state.working_branch)
            .await
            .map_err(|e| self.wrap(kind, e))?
        {
            set_upstream = false;
            self.git
                .fetch(&worktree, "origin", &git_state.working_branch)
                .await
                .map_err(|e| self.wrap(kind, e))?;
            match self
                .git
                .merge_from_remote(&worktree, &git_state.working_branch)
                .await
                .map_err(|e| self.wrap(kind, e))?
            {
                MergeOutcome::AlreadyUpToDate => emitter.sync_clean(true),
                MergeOutcome::Clean => {
                    merged_anything = true;
                    emitter.sync_clean(false);
                }
                MergeOutcome::Conflicts { files } => {
                    return self
                        .enter_conflict_resolution(&record, kind, SyncPhase::WorkingBranch, files)
                        .await;
                }
            }
        }

        // Push, then finalize state
        self.git
            .push(&worktree, &git_state.working_branch, set_upstream)
            .await
            .map_err(|e| self.wrap(kind, e))?;

        let mut state = self.state.get_loop_required(loop_id).await?.state;
        state.status = LoopStatus::Pushed;
        state.sync = None;
        if kind == SyncKind::Push && state.review.is_none() {
            state.review = Some(ReviewModeState::new(CompletionAction::Push));
        }
        self.state.update_loop_state(loop_id, state).await?;

        let remote_branch = format!("origin/{}", git_state.working_branch);
        emitter.pushed(&remote_branch);
        info!(%loop_id, %remote_branch, "Sync complete, branch pushed");

        Ok(SyncResult {
            success: true,
            sync_status: if merged_anything {
                SyncStatus::Clean
            } else {
                SyncStatus::AlreadyUpToDate
            },
            remote_branch: Some(remote_branch),
            error: None,
        })
        })
    }

    fn wrap(&self, kind: SyncKind, err: crate::git::GitError) -> LoopError {
        match kind {
            SyncKind::Push => LoopError::PushFailed(err.to_string()),
            SyncKind::UpdateBranch => LoopError::UpdateBranchFailed(err.to_string()),
        }
    }

    /// Record conflict state, spawn the resolution sub-loop, return without
    /// pushing
    async fn enter_conflict_resolution(
        self: &Arc<Self>,
        record: &Loop,
        kind: SyncKind,
        phase: SyncPhase,
        files: Vec<String>,
    ) -> Result<SyncResult, LoopError> {
        let loop_id = record.id().to_string();
        warn!(%loop_id, ?phase, conflicted = files.len(), "enter_conflict_resolution: merge stopped on conflicts");

        let mut state = self.state.get_loop_required(&loop_id).await?.state;
        state.status = LoopStatus::ResolvingConflicts;
        state.sync = Some(SyncModeState {
            sync_phase: phase,
            auto_push_on_complete: true,
            resolution_session_id: None,
        });
        self.state.update_loop_state(&loop_id, state).await?;

        self.events.emitter_for(&loop_id).sync_conflicts(phase, files.clone());

        let this = self.clone();
        let record = record.clone();
        tokio::spawn(async move {
            let loop_id = record.id().to_string();
            match this.run_resolution(&record, &files).await {
                Ok(true) => {
                    // Auto-push on completion: re-enter the sync flow under
                    // the per-loop mutex
                    let guard = this.locks.try_acquire(&loop_id).await;
                    match guard {
                        Ok(_guard) => {
                            if let Err(e) = this.run(&loop_id, kind).await {
                                warn!(%loop_id, error = %e, "resolution retry: sync failed");
                                this.mark_sync_failed(&loop_id, &e.to_string()).await;
                            }
                        }
                        Err(_) => {
                            warn!(%loop_id, "resolution retry: loop busy, leaving conflicts resolved but unpushed");
                        }
                    }
                }
                Ok(false) => {
                    this.mark_sync_failed(&loop_id, "conflict resolution did not complete").await;
                }
                Err(e) => {
                    this.mark_sync_failed(&loop_id, &e.to_string()).await;
                }
            }
        });

        Ok(SyncResult {
            success: true,
            sync_status: SyncStatus::ConflictsBeingResolved,
            remote_branch: None,
            error: None,
        })
    }

    /// Run the conflict-resolution sub-loop: a fresh session in the loop's
    /// worktree prompted with the conflicted files, iterating until the
    /// canonical completion marker appears.
    async fn run_resolution(self: &Arc<Self>, record: &Loop, files: &[String]) -> Result<bool, LoopError> {
        let loop_id = record.id();
        let Some(git_state) = record.state.git.clone() else {
            return Err(LoopError::ValidationFailed("loop has no git state".to_string()));
        };
        let worktree = PathBuf::from(&git_state.worktree_path);

        let workspace = self.state.get_workspace_required(&record.config.workspace_id).await?;
        let backend = self.backends.get_or_create(&workspace).await?;

        let session = backend
            .create_session(CreateSessionRequest {
                title: format!("{} (conflict resolution)", record.config.name),
                directory: git_state.worktree_path.clone(),
                model: record.config.model.clone(),
            })
            .await?;

        {
            let mut state = self.state.get_loop_required(loop_id).await?.state;
            if let Some(sync) = state.sync.as_mut() {
                sync.resolution_session_id = Some(session.id.clone());
            }
            self.state.update_loop_state(loop_id, state).await?;
        }

        let prompt = resolution_prompt(files);
        let shared = Arc::new(Mutex::new(record.state.clone()));
        let timeout = Duration::from_secs(record.config.activity_timeout_seconds);

        for attempt in 1..=record.config.max_iterations.max(1) {
            debug!(%loop_id, attempt, "run_resolution: iteration");
            let prompt = if attempt == 1 {
                prompt.clone()
            } else {
                "The merge conflicts are not fully resolved yet. Finish resolving them, then respond with \
                 <promise>COMPLETE</promise>."
                    .to_string()
            };

            let outcome = drive_session_iteration(
                backend.as_ref(),
                &session.id,
                &prompt,
                COMPLETE_MARKER,
                timeout,
                &self.cancel,
                &shared,
            )
            .await?;

            // Conclude the merge: stage and commit whatever the agent left
            if self.git.has_uncommitted_changes(&worktree).await.unwrap_or(false) {
                let message = format!("{}: resolve merge conflicts", record.config.commit_scope);
                if let Err(e) = async {
                    self.git.add_all(&worktree).await?;
                    self.git.commit(&worktree, &message).await
                }
                .await
                {
                    warn!(%loop_id, error = %e, "run_resolution: commit failed");
                }
            }

            match outcome.end {
                DriveEnd::Cancelled => return Ok(false),
                DriveEnd::Timeout => continue,
                DriveEnd::StreamEnded => {
                    if outcome.scanner.error_detected().is_some() {
                        continue;
                    }
                    if outcome.scanner.stop_detected() {
                        info!(%loop_id, attempt, "run_resolution: conflicts resolved");
                        return Ok(true);
                    }
                }
            }
        }

        Ok(false)
    }

    /// Resolution failed: clear auto-push and fail the loop
    async fn mark_sync_failed(&self, loop_id: &str, message: &str) {
        warn!(%loop_id, %message, "mark_sync_failed: called");
        if let Ok(record) = self.state.get_loop_required(loop_id).await {
            // Leave the worktree out of the half-merged state
            if let Some(git_state) = record.state.git.as_ref() {
                let _ = self.git.abort_merge(Path::new(&git_state.worktree_path)).await;
            }
            let mut state = record.state;
            state.status = LoopStatus::Failed;
            if let Some(sync) = state.sync.as_mut() {
                sync.auto_push_on_complete = false;
            }
            let iteration = state.current_iteration;
            state.record_error(message, iteration);
            let _ = self.state.update_loop_state(loop_id, state).await;
        }
        self.events.emitter_for(loop_id).failed(message);
    }
}

fn resolution_prompt(files: &[String]) -> String {
    let listing = if files.is_empty() {
        "(unknown)".to_string()
    } else {
        files.join("\n- ")
    };
    format!(
        "A git merge in this working tree stopped on conflicts. Resolve every conflict, keeping both \
         sides' intent where possible.\n\nConflicted files:\n- {}\n\nWhen every conflict marker is gone and \
         the tree builds, respond with <promise>COMPLETE</promise>.",
        listing
    )
}
