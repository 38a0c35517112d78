//! LoopManager - supervisor for all loops
//!
//! Central entry point for loop CRUD and lifecycle. Owns the engine map,
//! the per-loop mutexes and the state-persistence ticker. Mutating
//! operations try-lock the loop's mutex and validate the model before
//! touching status; reads bypass the mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentBackend, CreateSessionRequest};
use crate::backend::BackendManager;
use crate::domain::{
    CompletionAction, HandleUncommitted, Loop, LoopConfig, LoopMode, LoopStatus, ModelRef, ReviewComment,
    ReviewModeState, derive_name,
};
use crate::events::EventBus;
use crate::git::{GitService, WORKTREE_DIR};
use crate::state::StateManager;
use crate::sync::{SyncController, SyncKind, SyncResult};

use super::engine::{EngineCommand, EngineHandle, LoopEngine};
use super::error::LoopError;
use super::locks::LoopLocks;

/// Manager tuning knobs
#[derive(Debug, Clone)]
pub struct LoopManagerConfig {
    /// Period of the state-persistence ticker
    pub persist_interval: Duration,
    /// How long to wait for an engine task on stop/shutdown
    pub stop_join_timeout: Duration,
}

impl Default for LoopManagerConfig {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_millis(250),
            stop_join_timeout: Duration::from_secs(10),
        }
    }
}

/// Options for creating a loop
#[derive(Debug, Clone, Default)]
pub struct CreateLoopOptions {
    pub workspace_id: String,
    pub prompt: String,
    pub name: Option<String>,
    pub draft: bool,
    pub plan_mode: bool,
    pub clear_planning_folder: bool,
    pub max_iterations: Option<u32>,
    pub max_consecutive_errors: Option<u32>,
    pub activity_timeout_seconds: Option<u64>,
    pub model: Option<ModelRef>,
    pub base_branch: Option<String>,
    pub branch_prefix: Option<String>,
    pub commit_scope: Option<String>,
}

/// Options for `inject_pending`
#[derive(Debug, Clone, Default)]
pub struct PendingOptions {
    pub message: Option<String>,
    pub model: Option<ModelRef>,
}

/// Options for editing a loop. Drafts accept everything; any other status
/// only accepts the pending fields.
#[derive(Debug, Clone, Default)]
pub struct UpdateLoopOptions {
    pub name: Option<String>,
    pub prompt: Option<String>,
    pub max_iterations: Option<u32>,
    pub max_consecutive_errors: Option<u32>,
    pub activity_timeout_seconds: Option<u64>,
    pub model: Option<ModelRef>,
    pub base_branch: Option<String>,
    pub pending_prompt: Option<String>,
    pub pending_model: Option<ModelRef>,
}

impl UpdateLoopOptions {
    fn touches_config(&self) -> bool {
        self.name.is_some()
            || self.prompt.is_some()
            || self.max_iterations.is_some()
            || self.max_consecutive_errors.is_some()
            || self.activity_timeout_seconds.is_some()
            || self.model.is_some()
            || self.base_branch.is_some()
    }
}

/// Supervisor owning all loops
pub struct LoopManager {
    config: LoopManagerConfig,
    state: StateManager,
    git: GitService,
    events: Arc<EventBus>,
    backends: Arc<BackendManager>,
    sync: Arc<SyncController>,
    engines: Mutex<HashMap<String, Arc<EngineHandle>>>,
    locks: Arc<LoopLocks>,
    shutdown: CancellationToken,
    self_ref: Weak<Self>,
}

impl LoopManager {
    pub fn new(
        config: LoopManagerConfig,
        state: StateManager,
        git: GitService,
        events: Arc<EventBus>,
        backends: Arc<BackendManager>,
    ) -> Arc<Self> {
        let locks = Arc::new(LoopLocks::new());
        let sync = SyncController::new(
            state.clone(),
            git.clone(),
            events.clone(),
            backends.clone(),
            locks.clone(),
        );

        let manager = Arc::new_cyclic(|self_ref| Self {
            config,
            state,
            git,
            events,
            backends,
            sync,
            engines: Mutex::new(HashMap::new()),
            locks,
            shutdown: CancellationToken::new(),
            self_ref: self_ref.clone(),
        });
        manager.spawn_ticker();
        manager
    }

    // === Reads (no mutex) ===

    pub async fn get_loop(&self, id: &str) -> Result<Loop, LoopError> {
        // Prefer the live engine's state over the persisted snapshot
        let mut record = self.state.get_loop_required(id).await?;
        if let Some(handle) = self.engines.lock().await.get(id) {
            record.state = handle.snapshot().await;
        }
        Ok(record)
    }

    pub async fn list_loops(&self) -> Result<Vec<Loop>, LoopError> {
        Ok(self.state.list_loops().await?)
    }

    // === Creation ===

    /// Create a loop. Validates the workspace and model, generates the
    /// loop's name from its prompt when none is supplied.
    pub async fn create_loop(&self, opts: CreateLoopOptions) -> Result<Loop, LoopError> {
        debug!(workspace_id = %opts.workspace_id, draft = opts.draft, plan_mode = opts.plan_mode, "create_loop: called");
        let workspace = self.state.get_workspace_required(&opts.workspace_id).await?;

        let mut config = LoopConfig::new(&workspace.id, &workspace.directory, &opts.prompt);
        if let Some(model) = opts.model.clone() {
            config.model = model;
        }
        if let Some(v) = opts.max_iterations {
            config.max_iterations = v;
        }
        if let Some(v) = opts.max_consecutive_errors {
            config.max_consecutive_errors = v;
        }
        if let Some(v) = opts.activity_timeout_seconds {
            config.activity_timeout_seconds = v;
        }
        if let Some(v) = opts.base_branch.clone() {
            config.base_branch = Some(v);
        }
        if let Some(v) = opts.branch_prefix.clone() {
            config.branch_prefix = v;
        }
        if let Some(v) = opts.commit_scope.clone() {
            config.commit_scope = v;
        }
        if opts.plan_mode {
            config = config.with_plan_mode(opts.clear_planning_folder);
        }

        self.backends.validate_model(&workspace, &config.model).await?;

        // The exclude entry is re-validated on every loop creation
        self.git
            .ensure_exclude_entry(Path::new(&workspace.directory), WORKTREE_DIR)
            .await?;

        config.name = match opts.name {
            Some(name) => name,
            None => self.generate_name(&workspace, &config).await,
        };

        let status = if opts.draft {
            LoopStatus::Draft
        } else if opts.plan_mode {
            LoopStatus::Planning
        } else {
            LoopStatus::Idle
        };
        let record = Loop::new(config, status);
        self.state.save_loop(record.clone()).await?;
        self.events.emitter_for(record.id()).created();
        info!(loop_id = %record.id(), name = %record.config.name, %status, "Created loop");
        Ok(record)
    }

    /// Create a chat and run its first turn in the background
    pub async fn create_chat(&self, opts: CreateLoopOptions) -> Result<Loop, LoopError> {
        debug!(workspace_id = %opts.workspace_id, "create_chat: called");
        let workspace = self.state.get_workspace_required(&opts.workspace_id).await?;

        let mut config = LoopConfig::new(&workspace.id, &workspace.directory, &opts.prompt).as_chat();
        if let Some(model) = opts.model.clone() {
            config.model = model;
        }
        if let Some(v) = opts.activity_timeout_seconds {
            config.activity_timeout_seconds = v;
        }
        config.name = opts.name.unwrap_or_else(|| derive_name(&opts.prompt));

        self.backends.validate_model(&workspace, &config.model).await?;
        self.git
            .ensure_exclude_entry(Path::new(&workspace.directory), WORKTREE_DIR)
            .await?;

        let record = Loop::new(config, LoopStatus::Idle);
        self.state.save_loop(record.clone()).await?;
        self.events.emitter_for(record.id()).created();

        // First turn starts immediately
        self.spawn_engine(&record, None).await?;
        Ok(record)
    }

    /// Best-effort one-shot name generation; falls back to the prompt's
    /// first 50 characters
    async fn generate_name(&self, workspace: &crate::domain::Workspace, config: &LoopConfig) -> String {
        let fallback = derive_name(&config.prompt);
        let Ok(backend) = self.backends.get_or_create(workspace).await else {
            return fallback;
        };
        match self.generate_name_via_backend(backend.as_ref(), workspace, config).await {
            Some(name) if !name.is_empty() => name,
            _ => fallback,
        }
    }

    async fn generate_name_via_backend(
        &self,
        backend: &dyn AgentBackend,
        workspace: &crate::domain::Workspace,
        config: &LoopConfig,
    ) -> Option<String> {
        let session = backend
            .create_session(CreateSessionRequest {
                title: "name-generation".to_string(),
                directory: workspace.directory.clone(),
                model: config.model.clone(),
            })
            .await
            .ok()?;
        let reply = backend
            .send_prompt(
                &session.id,
                &format!(
                    "Reply with a short descriptive name (at most 50 characters) for this task. \
                     Reply with the name only.\n\nTask: {}",
                    config.prompt
                ),
            )
            .await
            .ok();
        let _ = backend.abort_session(&session.id).await;

        let name = reply?.content.lines().next()?.trim().chars().take(50).collect::<String>();
        if name.is_empty() { None } else { Some(name) }
    }

    /// Edit a loop. Drafts may change anything; active loops are
    /// restricted to the pending prompt and pending model.
    pub async fn update_loop(&self, id: &str, opts: UpdateLoopOptions) -> Result<Loop, LoopError> {
        let _guard = self.locks.try_acquire(id).await?;
        let mut record = self.state.get_loop_required(id).await?;
        let workspace = self.state.get_workspace_required(&record.config.workspace_id).await?;

        // Model validation runs before the status check
        if let Some(model) = opts.model.as_ref().or(opts.pending_model.as_ref()) {
            self.backends.validate_model(&workspace, model).await?;
        }

        if record.state.status != LoopStatus::Draft && opts.touches_config() {
            return Err(LoopError::ValidationFailed(
                "only pending_prompt and pending_model can change outside draft".to_string(),
            ));
        }

        if record.state.status == LoopStatus::Draft {
            if let Some(v) = opts.name {
                record.config.name = v;
            }
            if let Some(v) = opts.prompt {
                record.config.prompt = v;
            }
            if let Some(v) = opts.max_iterations {
                record.config.max_iterations = v;
            }
            if let Some(v) = opts.max_consecutive_errors {
                record.config.max_consecutive_errors = v;
            }
            if let Some(v) = opts.activity_timeout_seconds {
                record.config.activity_timeout_seconds = v;
            }
            if let Some(v) = opts.model {
                record.config.model = v;
            }
            if let Some(v) = opts.base_branch {
                record.config.base_branch = Some(v);
            }
            record.config.updated_at = chrono::Utc::now();
        }

        if let Some(v) = opts.pending_prompt {
            record.state.pending_prompt = Some(v);
        }
        if let Some(v) = opts.pending_model {
            record.state.pending_model = Some(v);
        }

        self.state.save_loop(record.clone()).await?;
        Ok(record)
    }

    // === Lifecycle ===

    /// Start (or jumpstart) a loop
    pub async fn start_loop(&self, id: &str, handle_uncommitted: Option<HandleUncommitted>) -> Result<(), LoopError> {
        let _guard = self.locks.try_acquire(id).await?;
        let record = self.state.get_loop_required(id).await?;
        let workspace = self.state.get_workspace_required(&record.config.workspace_id).await?;

        self.backends.validate_model(&workspace, &record.config.model).await?;

        if !record.state.status.can_start() {
            return Err(LoopError::ValidationFailed(format!(
                "cannot start loop in status {}",
                record.state.status
            )));
        }

        // Compatibility knob for callers that run against the main
        // checkout; worktree-backed loops never consult it
        if let Some(policy) = handle_uncommitted {
            self.apply_uncommitted_policy(&record.config.directory, policy).await?;
        }

        let mut record = record;
        record.state.clear_errors();
        self.state.update_loop_state(id, record.state.clone()).await?;

        self.spawn_engine(&record, None).await?;
        Ok(())
    }

    /// Start a draft loop, optionally flipping it into plan mode
    pub async fn start_draft(&self, id: &str, plan_mode: bool) -> Result<(), LoopError> {
        {
            let _guard = self.locks.try_acquire(id).await?;
            let mut record = self.state.get_loop_required(id).await?;
            if record.state.status != LoopStatus::Draft {
                return Err(LoopError::NotDraft);
            }

            record.config.plan_mode = plan_mode;
            record.state.status = if plan_mode { LoopStatus::Planning } else { LoopStatus::Idle };
            self.state.save_loop(record.clone()).await?;

            if plan_mode {
                self.spawn_engine(&record, None).await?;
                return Ok(());
            }
        }
        self.start_loop(id, None).await
    }

    async fn apply_uncommitted_policy(&self, directory: &str, policy: HandleUncommitted) -> Result<(), LoopError> {
        let repo = Path::new(directory);
        if !self.git.has_uncommitted_changes(repo).await? {
            return Ok(());
        }
        match policy {
            HandleUncommitted::Throw => Err(LoopError::UncommittedChanges(directory.to_string())),
            HandleUncommitted::Commit => {
                self.git.add_all(repo).await?;
                self.git.commit(repo, "wip: uncommitted changes before loop start").await?;
                Ok(())
            }
            HandleUncommitted::Stash => {
                self.git.stash(repo).await?;
                Ok(())
            }
        }
    }

    /// Stop a running loop
    pub async fn stop_loop(&self, id: &str) -> Result<(), LoopError> {
        let _guard = self.locks.try_acquire(id).await?;
        let handle = self.engines.lock().await.get(id).cloned();

        match handle {
            Some(handle) => {
                debug!(%id, "stop_loop: cancelling engine");
                handle.cancel();
                handle.join(self.config.stop_join_timeout).await;
                self.engines.lock().await.remove(id);
                Ok(())
            }
            None => {
                // No live engine (e.g. after restart): persist the stop
                let mut record = self.state.get_loop_required(id).await?;
                if !record.state.status.is_active() {
                    return Err(LoopError::NotRunning);
                }
                record.state.status = LoopStatus::Stopped;
                self.state.update_loop_state(id, record.state).await?;
                self.events.emitter_for(id).stopped();
                Ok(())
            }
        }
    }

    /// Soft-delete: status `deleted`, worktree preserved until purge
    pub async fn delete_loop(&self, id: &str) -> Result<(), LoopError> {
        let _guard = self.locks.try_acquire(id).await?;
        let mut record = self.state.get_loop_required(id).await?;

        self.teardown_engine(id).await;

        record.state.status = LoopStatus::Deleted;
        self.state.update_loop_state(id, record.state).await?;
        self.events.emitter_for(id).deleted();
        Ok(())
    }

    /// Physical delete: worktree, branch and database row all go
    pub async fn purge_loop(&self, id: &str) -> Result<(), LoopError> {
        let _guard = self.locks.try_acquire(id).await?;
        let record = self.state.get_loop_required(id).await?;

        if !matches!(
            record.state.status,
            LoopStatus::Merged | LoopStatus::Pushed | LoopStatus::Deleted
        ) {
            return Err(LoopError::ValidationFailed(format!(
                "cannot purge loop in status {}",
                record.state.status
            )));
        }

        self.teardown_engine(id).await;

        if let Some(git_state) = record.state.git.as_ref() {
            let repo = Path::new(&record.config.directory);
            let worktree = PathBuf::from(&git_state.worktree_path);
            if let Err(e) = self.git.remove_worktree(repo, &worktree).await {
                warn!(%id, error = %e, "purge_loop: worktree removal failed");
            }
            if let Err(e) = self.git.delete_branch(repo, &git_state.working_branch, true).await {
                warn!(%id, error = %e, "purge_loop: branch deletion failed");
            }
            if record.state.status == LoopStatus::Pushed {
                let _ = self.git.delete_remote_branch(repo, &git_state.working_branch).await;
            }
        }

        self.state.delete_loop(id).await?;
        drop(_guard);
        self.locks.remove(id).await;
        info!(%id, "Purged loop");
        Ok(())
    }

    /// Merge the working branch into the original branch, keeping the
    /// branch alive for review
    pub async fn accept_loop(&self, id: &str) -> Result<(), LoopError> {
        let _guard = self.locks.try_acquire(id).await?;
        let mut record = self.state.get_loop_required(id).await?;

        if !record.state.status.is_terminal() {
            return Err(LoopError::ValidationFailed(format!(
                "cannot accept loop in status {}",
                record.state.status
            )));
        }
        let Some(git_state) = record.state.git.clone() else {
            return Err(LoopError::AcceptFailed("loop has no git state".to_string()));
        };

        let repo = Path::new(&record.config.directory);
        self.git
            .checkout(repo, &git_state.original_branch, false)
            .await
            .map_err(|e| LoopError::AcceptFailed(e.to_string()))?;

        match self.git.merge_branch(repo, &git_state.working_branch).await {
            Ok(outcome) if outcome.is_clean() => {}
            Ok(_) => {
                let _ = self.git.abort_merge(repo).await;
                return Err(LoopError::AcceptFailed("merge produced conflicts".to_string()));
            }
            Err(e) => {
                let _ = self.git.abort_merge(repo).await;
                return Err(LoopError::AcceptFailed(e.to_string()));
            }
        }

        record.state.status = LoopStatus::Merged;
        record.state.review = Some(ReviewModeState::new(CompletionAction::Merge));
        self.state.update_loop_state(id, record.state).await?;
        self.events.emitter_for(id).accepted();
        info!(%id, branch = %git_state.working_branch, "Accepted loop");
        Ok(())
    }

    /// Delete plus working-branch removal; the worktree survives until purge
    pub async fn discard_loop(&self, id: &str) -> Result<(), LoopError> {
        let _guard = self.locks.try_acquire(id).await?;
        let mut record = self.state.get_loop_required(id).await?;

        self.teardown_engine(id).await;

        if let Some(git_state) = record.state.git.as_ref() {
            let repo = Path::new(&record.config.directory);
            let worktree = Path::new(&git_state.worktree_path);
            // The branch is checked out in the worktree; detach first
            if worktree.exists() {
                self.git
                    .detach_head(worktree)
                    .await
                    .map_err(|e| LoopError::DiscardFailed(e.to_string()))?;
            }
            self.git
                .delete_branch(repo, &git_state.working_branch, true)
                .await
                .map_err(|e| LoopError::DiscardFailed(e.to_string()))?;
        }

        record.state.status = LoopStatus::Deleted;
        self.state.update_loop_state(id, record.state).await?;
        self.events.emitter_for(id).discarded();
        Ok(())
    }

    // === Sync delegation ===

    pub async fn push_loop(&self, id: &str) -> Result<SyncResult, LoopError> {
        let _guard = self.locks.try_acquire(id).await?;
        self.sync.run(id, SyncKind::Push).await
    }

    pub async fn update_branch(&self, id: &str) -> Result<SyncResult, LoopError> {
        let _guard = self.locks.try_acquire(id).await?;
        self.sync.run(id, SyncKind::UpdateBranch).await
    }

    // === Pending injection / jumpstart ===

    /// Write a pending prompt and/or model for the next iteration. On a
    /// terminal or merged/pushed loop this jumpstarts a new run; on a
    /// merged/pushed loop it also opens the next review cycle.
    pub async fn inject_pending(&self, id: &str, opts: PendingOptions) -> Result<(), LoopError> {
        let _guard = self.locks.try_acquire(id).await?;
        let mut record = self.state.get_loop_required(id).await?;
        let workspace = self.state.get_workspace_required(&record.config.workspace_id).await?;

        // Model validation runs before the status check
        if let Some(model) = opts.model.as_ref() {
            self.backends.validate_model(&workspace, model).await?;
        }

        if record.state.status == LoopStatus::Deleted {
            return Err(LoopError::ValidationFailed("loop is deleted".to_string()));
        }

        let engine = self.engines.lock().await.get(id).cloned();
        if let Some(handle) = engine {
            // Live engine: mutate its state directly
            let shared = handle.shared();
            let mut st = shared.lock().await;
            st.sync = None;
            st.clear_errors();
            if let Some(message) = opts.message.clone() {
                st.pending_prompt = Some(message);
            }
            if let Some(model) = opts.model.clone() {
                st.pending_model = Some(model);
            }
            if let Some(review) = st.review.as_mut() {
                review.review_cycles += 1;
            }
            let snapshot = st.clone();
            drop(st);
            self.state.update_loop_state(id, snapshot).await?;
            return Ok(());
        }

        record.state.sync = None;
        record.state.clear_errors();
        if let Some(message) = opts.message.clone() {
            record.state.pending_prompt = Some(message);
        }
        if let Some(model) = opts.model.clone() {
            record.state.pending_model = Some(model);
        }
        if let Some(review) = record.state.review.as_mut() {
            review.review_cycles += 1;
        }

        let jumpstart = record.state.status.is_terminal()
            || matches!(record.state.status, LoopStatus::Merged | LoopStatus::Pushed);
        if jumpstart {
            // A fresh iteration window for the resumed run
            record.state.current_iteration = 0;
        }
        self.state.update_loop_state(id, record.state.clone()).await?;

        if jumpstart {
            debug!(%id, "inject_pending: jumpstarting terminal loop");
            self.spawn_engine(&record, None).await?;
        }
        Ok(())
    }

    // === Planning ===

    /// Inject feedback into a ready plan. Bookkeeping (`is_plan_ready`,
    /// `feedback_rounds`) flips synchronously before the engine sees the
    /// feedback text.
    pub async fn send_plan_feedback(&self, id: &str, feedback: &str) -> Result<(), LoopError> {
        let _guard = self.locks.try_acquire(id).await?;
        let record = self.state.get_loop_required(id).await?;
        if record.state.status != LoopStatus::Planning {
            return Err(LoopError::NotPlanning);
        }

        let handle = self.engine_or_recover(&record).await?;

        let rounds = {
            let shared = handle.shared();
            let mut st = shared.lock().await;
            let plan = st.plan.get_or_insert_with(Default::default);
            plan.is_plan_ready = false;
            plan.feedback_rounds += 1;
            let rounds = plan.feedback_rounds;
            let snapshot = st.clone();
            drop(st);
            self.state.update_loop_state(id, snapshot).await?;
            rounds
        };
        self.events.emitter_for(id).plan_feedback(rounds);

        handle
            .send(EngineCommand::PlanFeedback {
                text: feedback.to_string(),
            })
            .await
    }

    /// Accept a ready plan; the loop continues on the same session
    pub async fn accept_plan(&self, id: &str) -> Result<(), LoopError> {
        let _guard = self.locks.try_acquire(id).await?;
        let record = self.state.get_loop_required(id).await?;
        if record.state.status != LoopStatus::Planning {
            return Err(LoopError::NotPlanning);
        }

        let handle = self.engine_or_recover(&record).await?;
        let ready = {
            let shared = handle.shared();
            let st = shared.lock().await;
            st.plan.as_ref().map(|p| p.is_plan_ready).unwrap_or(false)
        };
        if !ready {
            return Err(LoopError::ValidationFailed("plan is not ready".to_string()));
        }

        handle.send(EngineCommand::AcceptPlan).await
    }

    /// Discard a plan: the loop is deleted, the worktree preserved
    pub async fn discard_plan(&self, id: &str) -> Result<(), LoopError> {
        let _guard = self.locks.try_acquire(id).await?;
        let mut record = self.state.get_loop_required(id).await?;
        if record.state.status != LoopStatus::Planning {
            return Err(LoopError::NotPlanning);
        }

        self.teardown_engine(id).await;

        // Abort the plan session so no remote work dangles
        if let Some(session) = record.state.session.as_ref() {
            if let Ok(workspace) = self.state.get_workspace_required(&record.config.workspace_id).await {
                if let Ok(backend) = self.backends.get_or_create(&workspace).await {
                    let _ = backend.abort_session(&session.id).await;
                }
            }
        }

        record.state.status = LoopStatus::Deleted;
        self.state.update_loop_state(id, record.state).await?;
        self.events.emitter_for(id).plan_discarded();
        Ok(())
    }

    // === Chat ===

    /// Deliver a chat turn, recovering the engine from persisted state if
    /// the process restarted since the last turn
    pub async fn send_chat_message(&self, id: &str, message: &str) -> Result<(), LoopError> {
        let _guard = self.locks.try_acquire(id).await?;
        let record = self
            .state
            .get_loop(id)
            .await?
            .ok_or_else(|| LoopError::ValidationFailed(format!("Cannot send chat message: loop {} not found", id)))?;

        if record.config.mode != LoopMode::Chat {
            return Err(LoopError::ValidationFailed(
                "Cannot send chat message to a non-chat loop".to_string(),
            ));
        }
        if matches!(
            record.state.status,
            LoopStatus::Stopped | LoopStatus::Deleted | LoopStatus::Failed
        ) {
            return Err(LoopError::ValidationFailed(format!(
                "Cannot send chat message to a {} chat",
                record.state.status
            )));
        }

        let handle = self.engines.lock().await.get(id).cloned();
        match handle {
            Some(handle) => {
                handle
                    .send(EngineCommand::ChatMessage {
                        text: message.to_string(),
                    })
                    .await
            }
            None => {
                debug!(%id, "send_chat_message: recovering chat engine");
                self.recover_chat_engine(&record, message).await
            }
        }
    }

    /// Rebuild a chat engine from persisted state and inject the message
    async fn recover_chat_engine(&self, record: &Loop, message: &str) -> Result<(), LoopError> {
        if matches!(
            record.state.status,
            LoopStatus::Stopped | LoopStatus::Deleted | LoopStatus::Failed
        ) {
            return Err(LoopError::ValidationFailed(format!(
                "Cannot recover chat engine for a {} chat",
                record.state.status
            )));
        }
        // The engine reattaches the persisted session mapping during setup
        self.spawn_engine(record, Some(message.to_string())).await?;
        Ok(())
    }

    // === Review comments ===

    pub async fn add_review_comment(&self, id: &str, text: &str) -> Result<ReviewComment, LoopError> {
        let record = self.state.get_loop_required(id).await?;
        let cycle = record.state.review.as_ref().map(|r| r.review_cycles).unwrap_or(0);
        let comment = ReviewComment::new(id, cycle, text);
        self.state.add_review_comment(comment.clone()).await?;
        Ok(comment)
    }

    pub async fn list_review_comments(&self, id: &str) -> Result<Vec<ReviewComment>, LoopError> {
        self.state.get_loop_required(id).await?;
        Ok(self.state.list_review_comments(id).await?)
    }

    pub async fn mark_comment_addressed(&self, comment_id: &str) -> Result<(), LoopError> {
        Ok(self.state.mark_comment_addressed(comment_id).await?)
    }

    // === Recovery / shutdown ===

    /// Startup recovery: engines are not eagerly restarted; interrupted
    /// loops are surfaced and rebuilt lazily on their first action.
    pub async fn recover(&self) -> Result<Vec<Loop>, LoopError> {
        let loops = self.state.list_loops().await?;
        let interrupted: Vec<Loop> = loops.into_iter().filter(|l| l.state.status.is_active()).collect();
        for record in &interrupted {
            info!(loop_id = %record.id(), status = %record.state.status, "recover: interrupted loop, will rebuild lazily");
        }
        Ok(interrupted)
    }

    /// Stop the ticker and every engine, flushing state
    pub async fn shutdown(&self) {
        info!("LoopManager shutting down");
        self.shutdown.cancel();
        self.sync.shutdown();

        let handles: Vec<Arc<EngineHandle>> = self.engines.lock().await.values().cloned().collect();
        for handle in &handles {
            handle.cancel();
        }
        for handle in handles {
            handle.join(self.config.stop_join_timeout).await;
        }
        self.engines.lock().await.clear();
    }

    // === Engine plumbing ===

    async fn engine_or_recover(&self, record: &Loop) -> Result<Arc<EngineHandle>, LoopError> {
        if let Some(handle) = self.engines.lock().await.get(record.id()).cloned() {
            return Ok(handle);
        }
        debug!(loop_id = %record.id(), "engine_or_recover: rebuilding engine from persisted state");
        self.spawn_engine(record, None).await
    }

    async fn teardown_engine(&self, id: &str) {
        let handle = self.engines.lock().await.remove(id);
        if let Some(handle) = handle {
            handle.cancel();
            handle.join(self.config.stop_join_timeout).await;
        }
    }

    async fn spawn_engine(
        &self,
        record: &Loop,
        initial_message: Option<String>,
    ) -> Result<Arc<EngineHandle>, LoopError> {
        let workspace = self.state.get_workspace_required(&record.config.workspace_id).await?;
        let backend = self.backends.get_or_create(&workspace).await?;

        let (engine, handle) = LoopEngine::build(
            record.config.clone(),
            record.state.clone(),
            backend,
            self.git.clone(),
            self.state.clone(),
            self.events.emitter_for(record.id()),
        );
        let engine = match initial_message {
            Some(message) => engine.with_initial_message(message),
            None => engine,
        };

        self.engines.lock().await.insert(record.id().to_string(), handle.clone());

        let task = tokio::spawn(run_engine_task(
            engine,
            self.self_ref.clone(),
            handle.clone(),
            self.state.clone(),
            self.events.clone(),
        ));
        handle.attach_task(task).await;
        Ok(handle)
    }

    fn spawn_ticker(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.config.persist_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(manager) = weak.upgrade() else { break };
                manager.persist_running_loops().await;
            }
            debug!("persistence ticker stopped");
        });
    }

    /// Snapshot every live engine's in-memory state into the store
    async fn persist_running_loops(&self) {
        let handles: Vec<(String, Arc<EngineHandle>)> = self
            .engines
            .lock()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        for (id, handle) in handles {
            let snapshot = handle.snapshot().await;
            if let Err(e) = self.state.update_loop_state(&id, snapshot).await {
                debug!(%id, error = %e, "persist_running_loops: update failed");
            }
        }
    }
}

/// Run an engine to completion, isolating panics into `failed` status and
/// dropping the handle from the manager's map when the task ends.
async fn run_engine_task(
    engine: LoopEngine,
    manager: Weak<LoopManager>,
    handle: Arc<EngineHandle>,
    state: StateManager,
    events: Arc<EventBus>,
) {
    let loop_id = handle.loop_id().to_string();
    let inner = tokio::spawn(engine.run());

    match inner.await {
        Ok(()) => {}
        Err(join_error) if join_error.is_panic() => {
            let payload = join_error.into_panic();
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "engine panicked".to_string()
            };
            warn!(%loop_id, %message, "engine task panicked");

            let snapshot = {
                let shared = handle.shared();
                let mut st = shared.lock().await;
                st.status = LoopStatus::Failed;
                let iteration = st.current_iteration;
                st.record_error(&message, iteration);
                st.clone()
            };
            let _ = state.update_loop_state(&loop_id, snapshot).await;
            events.emitter_for(&loop_id).failed(&message);
        }
        Err(_) => {
            debug!(%loop_id, "engine task cancelled");
        }
    }

    if let Some(manager) = manager.upgrade() {
        manager.engines.lock().await.remove(&loop_id);
    }
}
