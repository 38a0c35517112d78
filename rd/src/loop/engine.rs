//! LoopEngine - drives a single loop through its state machine
//!
//! One engine per loop, one tokio task per engine. The engine owns the
//! iteration loop: compose prompt, fire it at the agent session, drain the
//! event stream watching for markers, commit worktree changes, decide the
//! next transition. Plan mode and chat mode are variants of the same loop
//! with different suspension points.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentBackend, AgentError, AgentEvent, CreateSessionRequest};
use crate::domain::{
    GitState, IterationOutcome, LoopConfig, LoopMode, LoopState, LoopStatus, PlanModeState, RecentIteration,
    SessionRef,
};
use crate::events::EventEmitter;
use crate::git::{GitService, WORKTREE_DIR, working_branch_name, worktree_path};
use crate::state::StateManager;

use super::detect::MarkerScanner;
use super::error::LoopError;

/// Commands delivered to a resident engine
#[derive(Debug)]
pub enum EngineCommand {
    PlanFeedback { text: String },
    AcceptPlan,
    ChatMessage { text: String },
}

/// Handle the manager keeps per live engine: read-snapshot, stop, inject.
pub struct EngineHandle {
    loop_id: String,
    mode: LoopMode,
    shared: Arc<Mutex<LoopState>>,
    cancel: CancellationToken,
    cmd_tx: mpsc::Sender<EngineCommand>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EngineHandle {
    pub fn loop_id(&self) -> &str {
        &self.loop_id
    }

    pub fn mode(&self) -> LoopMode {
        self.mode
    }

    /// Clone the engine's in-memory state
    pub async fn snapshot(&self) -> LoopState {
        self.shared.lock().await.clone()
    }

    /// Shared state cell, used by the manager for synchronous mutations
    /// under the per-loop mutex (plan feedback bookkeeping)
    pub fn shared(&self) -> Arc<Mutex<LoopState>> {
        self.shared.clone()
    }

    /// Signal cooperative cancellation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn send(&self, cmd: EngineCommand) -> Result<(), LoopError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| LoopError::Internal("engine command channel closed".to_string()))
    }

    pub(crate) async fn attach_task(&self, task: tokio::task::JoinHandle<()>) {
        *self.task.lock().await = Some(task);
    }

    /// Wait for the engine task to finish, bounded by `timeout`
    pub async fn join(&self, timeout: Duration) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!(loop_id = %self.loop_id, "join: engine task did not stop in time");
            }
        }
    }
}

/// What one iteration decided
enum Disposition {
    Complete,
    Continue,
    Error(String),
    PlanReady,
    Stopped,
}

enum Phase {
    Plan,
    Loop,
}

enum WaitOutcome {
    Stop,
    Closed,
    Command(EngineCommand),
}

/// Result of draining one agent stream
pub(crate) struct DriveOutcome {
    pub end: DriveEnd,
    pub scanner: MarkerScanner,
    pub tool_calls: Vec<serde_json::Value>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DriveEnd {
    StreamEnded,
    Cancelled,
    Timeout,
}

/// Fire a prompt at a session and drain its event stream, watching markers
/// and refreshing the activity clock. Shared by the engine and the
/// conflict-resolution flow.
pub(crate) async fn drive_session_iteration(
    backend: &dyn AgentBackend,
    session_id: &str,
    prompt: &str,
    stop_pattern: &str,
    activity_timeout: Duration,
    cancel: &CancellationToken,
    shared: &Arc<Mutex<LoopState>>,
) -> Result<DriveOutcome, AgentError> {
    backend.send_prompt_async(session_id, prompt).await?;
    let mut stream = backend.subscribe_events(session_id).await?;

    let mut scanner = MarkerScanner::new(stop_pattern);
    let mut tool_calls = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%session_id, "drive_session_iteration: cancelled");
                let _ = backend.abort_session(session_id).await;
                return Ok(DriveOutcome { end: DriveEnd::Cancelled, scanner, tool_calls });
            }
            event = tokio::time::timeout(activity_timeout, stream.recv()) => match event {
                Err(_) => {
                    debug!(%session_id, "drive_session_iteration: activity timeout");
                    let _ = backend.abort_session(session_id).await;
                    return Ok(DriveOutcome { end: DriveEnd::Timeout, scanner, tool_calls });
                }
                Ok(None) => {
                    return Ok(DriveOutcome { end: DriveEnd::StreamEnded, scanner, tool_calls });
                }
                Ok(Some(event)) => {
                    let mut st = shared.lock().await;
                    st.touch_activity();
                    match event {
                        AgentEvent::MessageDelta { content } => {
                            if st.status == LoopStatus::Waiting {
                                st.status = LoopStatus::Running;
                            }
                            drop(st);
                            scanner.push(&content);
                        }
                        AgentEvent::ToolStart { name, args } => {
                            drop(st);
                            tool_calls.push(serde_json::json!({ "name": name, "args": args, "done": false }));
                        }
                        AgentEvent::ToolEnd { name, success } => {
                            drop(st);
                            tool_calls.push(serde_json::json!({ "name": name, "success": success, "done": true }));
                        }
                        AgentEvent::Question { .. } | AgentEvent::Permission { .. } => {
                            if st.status == LoopStatus::Running {
                                st.status = LoopStatus::Waiting;
                            }
                        }
                        AgentEvent::MessageStart | AgentEvent::MessageComplete => {}
                    }
                }
            }
        }
    }
}

/// The per-loop execution engine
pub struct LoopEngine {
    config: LoopConfig,
    repo: PathBuf,
    shared: Arc<Mutex<LoopState>>,
    backend: Arc<dyn AgentBackend>,
    git: GitService,
    store: StateManager,
    events: EventEmitter,
    cancel: CancellationToken,
    cmd_rx: mpsc::Receiver<EngineCommand>,
    /// Message consumed as the first turn's prompt (chat recovery,
    /// jumpstart feedback)
    initial_injected: Option<String>,
}

impl LoopEngine {
    /// Build an engine plus the handle the manager keeps
    pub fn build(
        config: LoopConfig,
        state: LoopState,
        backend: Arc<dyn AgentBackend>,
        git: GitService,
        store: StateManager,
        events: EventEmitter,
    ) -> (Self, Arc<EngineHandle>) {
        let shared = Arc::new(Mutex::new(state));
        let cancel = CancellationToken::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let handle = Arc::new(EngineHandle {
            loop_id: config.id.clone(),
            mode: config.mode,
            shared: shared.clone(),
            cancel: cancel.clone(),
            cmd_tx,
            task: Mutex::new(None),
        });

        let repo = PathBuf::from(&config.directory);
        let engine = Self {
            config,
            repo,
            shared,
            backend,
            git,
            store,
            events,
            cancel,
            cmd_rx,
            initial_injected: None,
        };
        (engine, handle)
    }

    /// Queue a message for the first iteration of this run
    pub fn with_initial_message(mut self, message: impl Into<String>) -> Self {
        self.initial_injected = Some(message.into());
        self
    }

    /// Run the loop to a terminal status (or stay resident for chat)
    pub async fn run(mut self) {
        let loop_id = self.config.id.clone();
        debug!(%loop_id, mode = %self.config.mode, plan_mode = self.config.plan_mode, "run: engine starting");

        if let Err(e) = self.setup().await {
            warn!(%loop_id, error = %e, "run: setup failed");
            let message = e.to_string();
            {
                let mut st = self.shared.lock().await;
                // Worktree/session errors abort the start and leave the
                // loop startable again
                st.status = if self.config.plan_mode {
                    LoopStatus::Planning
                } else {
                    LoopStatus::Idle
                };
                let iteration = st.current_iteration;
                st.record_error(&message, iteration);
            }
            self.persist().await;
            self.events.error(&message);
            return;
        }

        self.events.started();
        self.drive().await;
        debug!(%loop_id, "run: engine finished");
    }

    // === Setup ===

    async fn setup(&mut self) -> Result<(), LoopError> {
        {
            let mut st = self.shared.lock().await;
            if !self.config.plan_mode {
                st.status = LoopStatus::Starting;
            } else {
                st.status = LoopStatus::Planning;
                let plan = st.plan.get_or_insert_with(PlanModeState::default);
                plan.active = true;
            }
            if st.started_at.is_none() {
                st.started_at = Some(Utc::now());
            }
            st.touch_activity();
        }
        self.persist().await;

        self.ensure_worktree().await?;
        self.ensure_session().await?;
        if self.config.plan_mode {
            self.prepare_planning_folder().await;
        }
        self.persist().await;
        Ok(())
    }

    async fn ensure_worktree(&mut self) -> Result<(), LoopError> {
        let existing = { self.shared.lock().await.git.clone() };
        if let Some(git_state) = existing {
            if Path::new(&git_state.worktree_path).exists() {
                debug!(loop_id = %self.config.id, "ensure_worktree: worktree already present");
                return Ok(());
            }
            // Worktree directory pruned but the branch survives: reattach
            let path = PathBuf::from(&git_state.worktree_path);
            self.git
                .attach_worktree(&self.repo, &path, &git_state.working_branch)
                .await?;
            return Ok(());
        }

        let original_branch = self.git.current_branch(&self.repo).await?;
        let base = match &self.config.base_branch {
            Some(branch) => branch.clone(),
            None => self.git.default_branch(&self.repo).await?,
        };
        let branch = working_branch_name(
            &self.config.branch_prefix,
            &self.config.name,
            &self.config.id,
            Utc::now().date_naive(),
        );
        let path = worktree_path(&self.repo, &branch);

        self.git.ensure_exclude_entry(&self.repo, WORKTREE_DIR).await?;
        self.git.create_worktree(&self.repo, &path, &branch, &base).await?;

        let mut st = self.shared.lock().await;
        st.git = Some(GitState {
            original_branch,
            working_branch: branch,
            worktree_path: path.to_string_lossy().to_string(),
            commits: Vec::new(),
        });
        Ok(())
    }

    async fn prepare_planning_folder(&mut self) {
        let worktree = { self.shared.lock().await.git.as_ref().map(|g| g.worktree_path.clone()) };
        let Some(worktree) = worktree else { return };
        let planning = Path::new(&worktree).join(".planning");

        // The one-time folder clear has its own persisted flag
        let needs_clear = {
            let st = self.shared.lock().await;
            self.config.clear_planning_folder
                && !st.plan.as_ref().map(|p| p.planning_folder_cleared).unwrap_or(false)
        };
        if needs_clear {
            debug!(loop_id = %self.config.id, "prepare_planning_folder: clearing .planning");
            let _ = tokio::fs::remove_dir_all(&planning).await;
            let mut st = self.shared.lock().await;
            let plan = st.plan.get_or_insert_with(PlanModeState::default);
            plan.planning_folder_cleared = true;
        }

        // Stale plans never bleed across sessions: every plan start begins
        // without a plan.md, recovery included
        let _ = tokio::fs::remove_file(planning.join("plan.md")).await;
    }

    async fn ensure_session(&mut self) -> Result<(), LoopError> {
        let has_session = { self.shared.lock().await.session.is_some() };
        if has_session {
            return Ok(());
        }

        // Reattach a persisted session before creating a fresh one
        if let Ok(Some(mapping)) = self
            .store
            .get_session_mapping(self.backend.name(), &self.config.id)
            .await
        {
            debug!(loop_id = %self.config.id, session = %mapping.session_id, "ensure_session: reattached persisted session");
            let mut st = self.shared.lock().await;
            st.session = Some(SessionRef {
                id: mapping.session_id,
                server_url: mapping.server_url,
            });
            return Ok(());
        }

        self.create_session(None).await
    }

    /// Create a fresh session (optionally with a model override) and
    /// persist the mapping
    async fn create_session(&mut self, model: Option<crate::domain::ModelRef>) -> Result<(), LoopError> {
        let worktree = {
            let st = self.shared.lock().await;
            st.git
                .as_ref()
                .map(|g| g.worktree_path.clone())
                .unwrap_or_else(|| self.config.directory.clone())
        };

        let info = self
            .backend
            .create_session(CreateSessionRequest {
                title: self.config.name.clone(),
                directory: worktree,
                model: model.unwrap_or_else(|| self.config.model.clone()),
            })
            .await?;

        {
            let mut st = self.shared.lock().await;
            st.session = Some(SessionRef {
                id: info.id.clone(),
                server_url: None,
            });
        }
        self.store
            .set_session_mapping(self.backend.name(), &self.config.id, &info.id, None)
            .await
            .map_err(LoopError::from)?;
        Ok(())
    }

    // === Main loop ===

    async fn drive(&mut self) {
        let mut phase = if self.config.plan_mode { Phase::Plan } else { Phase::Loop };
        let mut injected = self.initial_injected.take();
        let run_start = { self.shared.lock().await.current_iteration };

        loop {
            if self.cancel.is_cancelled() {
                self.finish_stopped().await;
                return;
            }

            // A ready plan suspends iterations until feedback or acceptance
            // arrives. This also covers engines recovered after a restart
            // with the plan already marked ready.
            if matches!(phase, Phase::Plan) && self.plan_is_ready().await {
                match self.wait_for_command().await {
                    WaitOutcome::Stop | WaitOutcome::Closed => {
                        self.finish_stopped().await;
                        return;
                    }
                    WaitOutcome::Command(EngineCommand::PlanFeedback { text }) => {
                        // The manager already flipped is_plan_ready and
                        // counted the round
                        injected = Some(text);
                    }
                    WaitOutcome::Command(EngineCommand::AcceptPlan) => {
                        {
                            let mut st = self.shared.lock().await;
                            let session_id = st.session.as_ref().map(|s| s.id.clone());
                            if let Some(plan) = st.plan.as_mut() {
                                plan.plan_session_id = session_id;
                                plan.active = false;
                            }
                            st.status = LoopStatus::Running;
                        }
                        self.events.plan_accepted();
                        self.persist().await;
                        phase = Phase::Loop;
                    }
                    WaitOutcome::Command(EngineCommand::ChatMessage { .. }) => {
                        debug!(loop_id = %self.config.id, "drive: chat message ignored while planning");
                        continue;
                    }
                }
            }

            let i = { self.shared.lock().await.current_iteration } + 1;
            let disposition = self.run_iteration(i, &phase, injected.take()).await;
            // Continue and sub-threshold errors both loop again; the
            // iteration budget below bounds every such path
            let keeps_iterating = matches!(disposition, Disposition::Continue | Disposition::Error(_));

            match disposition {
                Disposition::Stopped => {
                    self.finish_stopped().await;
                    return;
                }
                Disposition::PlanReady => {
                    {
                        let mut st = self.shared.lock().await;
                        let plan = st.plan.get_or_insert_with(PlanModeState::default);
                        plan.active = true;
                        plan.is_plan_ready = true;
                        st.status = LoopStatus::Planning;
                    }
                    self.events.plan_ready();
                    if !self.persist().await {
                        self.finish_failed("state persistence failed").await;
                        return;
                    }
                }
                Disposition::Complete => {
                    {
                        let mut st = self.shared.lock().await;
                        st.status = LoopStatus::Completed;
                        st.completed_at = Some(Utc::now());
                    }
                    self.events.completed(i);
                    self.persist().await;

                    if self.config.mode != LoopMode::Chat {
                        return;
                    }
                    // Chat engines stay resident for the next turn
                    match self.wait_for_command().await {
                        WaitOutcome::Stop | WaitOutcome::Closed => {
                            self.finish_stopped().await;
                            return;
                        }
                        WaitOutcome::Command(EngineCommand::ChatMessage { text }) => {
                            injected = Some(text);
                            let mut st = self.shared.lock().await;
                            st.status = LoopStatus::Running;
                        }
                        WaitOutcome::Command(_) => {
                            debug!(loop_id = %self.config.id, "drive: non-chat command ignored in chat mode");
                        }
                    }
                }
                Disposition::Error(message) => {
                    self.events.error(&message);
                    let over_threshold = {
                        let mut st = self.shared.lock().await;
                        st.record_error(&message, i);
                        st.consecutive_errors.len() as u32 >= self.config.max_consecutive_errors
                    };
                    if over_threshold {
                        self.finish_failed(&message).await;
                        return;
                    }
                    self.persist().await;
                    if self.config.mode == LoopMode::Chat {
                        // Turn over; stay resident for a retry message
                        {
                            let mut st = self.shared.lock().await;
                            st.status = LoopStatus::Completed;
                        }
                        self.persist().await;
                        match self.wait_for_command().await {
                            WaitOutcome::Stop | WaitOutcome::Closed => {
                                self.finish_stopped().await;
                                return;
                            }
                            WaitOutcome::Command(EngineCommand::ChatMessage { text }) => {
                                injected = Some(text);
                                let mut st = self.shared.lock().await;
                                st.status = LoopStatus::Running;
                            }
                            WaitOutcome::Command(_) => {}
                        }
                    }
                }
                Disposition::Continue => {}
            }

            // Chat turns are bounded by being single-prompt; everything else
            // stops at max_iterations regardless of how the iteration ended
            if keeps_iterating
                && self.config.mode != LoopMode::Chat
                && i.saturating_sub(run_start) >= self.config.max_iterations
            {
                debug!(loop_id = %self.config.id, i, "drive: iteration budget exhausted");
                {
                    let mut st = self.shared.lock().await;
                    st.status = LoopStatus::MaxIterations;
                    st.completed_at = Some(Utc::now());
                }
                self.persist().await;
                return;
            }
        }
    }

    async fn run_iteration(&mut self, i: u32, phase: &Phase, injected: Option<String>) -> Disposition {
        debug!(loop_id = %self.config.id, iteration = i, "run_iteration: called");

        // A pending model swap takes effect on a fresh session
        let pending_model = { self.shared.lock().await.pending_model.take() };
        if let Some(model) = pending_model {
            debug!(loop_id = %self.config.id, model = %model.model_id, "run_iteration: applying pending model");
            {
                self.shared.lock().await.session = None;
            }
            if let Err(e) = self.create_session(Some(model)).await {
                return Disposition::Error(e.to_string());
            }
        }

        self.events.iteration_start(i);
        {
            let mut st = self.shared.lock().await;
            st.current_iteration = i;
            st.status = match phase {
                Phase::Plan => LoopStatus::Planning,
                Phase::Loop => LoopStatus::Running,
            };
            st.touch_activity();
        }

        let pending = { self.shared.lock().await.pending_prompt.take() };
        let prompt = self.compose_prompt(phase, injected, pending);

        let session_id = {
            let st = self.shared.lock().await;
            match st.session.as_ref() {
                Some(session) => session.id.clone(),
                None => return Disposition::Error("no agent session".to_string()),
            }
        };

        let outcome = drive_session_iteration(
            self.backend.as_ref(),
            &session_id,
            &prompt,
            &self.config.stop_pattern,
            Duration::from_secs(self.config.activity_timeout_seconds),
            &self.cancel,
            &self.shared,
        )
        .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(loop_id = %self.config.id, error = %e, "run_iteration: agent error");
                return self.close_iteration(i, Disposition::Error(e.to_string())).await;
            }
        };

        // Record tool calls for observers
        if !outcome.tool_calls.is_empty() {
            let mut st = self.shared.lock().await;
            st.tool_calls = Some(serde_json::Value::Array(outcome.tool_calls.clone()));
        }

        // A stop signalled mid-iteration still records the commit below
        let disposition = if outcome.end == DriveEnd::Timeout {
            Disposition::Error(format!(
                "no agent activity for {} seconds",
                self.config.activity_timeout_seconds
            ))
        } else if let Some(message) = outcome.scanner.error_detected() {
            Disposition::Error(message.to_string())
        } else if matches!(phase, Phase::Plan) {
            if outcome.scanner.plan_ready_detected() {
                Disposition::PlanReady
            } else {
                Disposition::Continue
            }
        } else if outcome.scanner.stop_detected() {
            Disposition::Complete
        } else if self.config.mode == LoopMode::Chat {
            // One prompt = one turn
            Disposition::Complete
        } else {
            Disposition::Continue
        };

        let disposition = self.close_iteration(i, disposition).await;
        if outcome.end == DriveEnd::Cancelled {
            return Disposition::Stopped;
        }
        disposition
    }

    /// Commit worktree changes, record the ring entry, emit iteration.end
    async fn close_iteration(&mut self, i: u32, disposition: Disposition) -> Disposition {
        self.commit_iteration(i).await;

        let ring_outcome = match &disposition {
            Disposition::Complete | Disposition::PlanReady => IterationOutcome::Complete,
            Disposition::Error(_) => IterationOutcome::Error,
            _ => IterationOutcome::Continue,
        };
        {
            let mut st = self.shared.lock().await;
            st.push_recent(RecentIteration {
                iteration: i,
                outcome: ring_outcome,
                summary: None,
            });
            if !matches!(disposition, Disposition::Error(_)) {
                st.consecutive_errors.clear();
            }
        }
        self.events.iteration_end(i, ring_outcome);
        self.persist().await;
        disposition
    }

    async fn commit_iteration(&mut self, i: u32) {
        let worktree = {
            let st = self.shared.lock().await;
            st.git.as_ref().map(|g| PathBuf::from(&g.worktree_path))
        };
        let Some(worktree) = worktree else { return };

        match self.git.has_uncommitted_changes(&worktree).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(loop_id = %self.config.id, error = %e, "commit_iteration: status check failed");
                return;
            }
        }

        let message = format!("{}: iteration {}", self.config.commit_scope, i);
        let result = async {
            self.git.add_all(&worktree).await?;
            self.git.commit(&worktree, &message).await
        }
        .await;

        match result {
            Ok(hash) => {
                info!(loop_id = %self.config.id, iteration = i, %hash, "Committed iteration");
                {
                    let mut st = self.shared.lock().await;
                    if let Some(git) = st.git.as_mut() {
                        git.commits.push(hash.clone());
                    }
                }
                self.events.git_commit(&hash, i);
            }
            Err(e) => {
                warn!(loop_id = %self.config.id, error = %e, "commit_iteration: commit failed");
            }
        }
    }

    fn compose_prompt(&self, phase: &Phase, injected: Option<String>, pending: Option<String>) -> String {
        // Injected text (chat turn, plan feedback) is the whole prompt;
        // loop iterations always restate the task plus any pending note.
        if let Some(text) = injected {
            return text;
        }
        if self.config.mode == LoopMode::Chat {
            return pending.unwrap_or_else(|| self.config.prompt.clone());
        }
        match (phase, pending) {
            (_, Some(pending)) => format!("{}\n\n{}", self.config.prompt, pending),
            (_, None) => self.config.prompt.clone(),
        }
    }

    async fn plan_is_ready(&self) -> bool {
        let st = self.shared.lock().await;
        st.plan.as_ref().map(|p| p.is_plan_ready).unwrap_or(false)
    }

    async fn wait_for_command(&mut self) -> WaitOutcome {
        tokio::select! {
            _ = self.cancel.cancelled() => WaitOutcome::Stop,
            cmd = self.cmd_rx.recv() => match cmd {
                Some(cmd) => WaitOutcome::Command(cmd),
                None => WaitOutcome::Closed,
            },
        }
    }

    async fn finish_stopped(&mut self) {
        debug!(loop_id = %self.config.id, "finish_stopped: called");
        let session_id = { self.shared.lock().await.session.as_ref().map(|s| s.id.clone()) };
        if let Some(session_id) = session_id {
            let _ = self.backend.abort_session(&session_id).await;
        }
        {
            let mut st = self.shared.lock().await;
            // A resident chat sits in Completed between turns; stopping it
            // still lands on Stopped
            if !matches!(st.status, LoopStatus::Failed | LoopStatus::Deleted) {
                st.status = LoopStatus::Stopped;
            }
        }
        self.persist().await;
        self.events.stopped();
    }

    async fn finish_failed(&mut self, message: &str) {
        warn!(loop_id = %self.config.id, %message, "finish_failed: called");
        {
            let mut st = self.shared.lock().await;
            st.status = LoopStatus::Failed;
            // Conflict-resolution bookkeeping does not survive a failure
            if let Some(sync) = st.sync.as_mut() {
                sync.auto_push_on_complete = false;
            }
        }
        self.persist().await;
        self.events.failed(message);
    }

    /// Persist the shared state; one retry before reporting failure
    async fn persist(&self) -> bool {
        let snapshot = { self.shared.lock().await.clone() };
        match self.store.update_loop_state(&self.config.id, snapshot.clone()).await {
            Ok(()) => true,
            Err(first) => {
                debug!(loop_id = %self.config.id, error = %first, "persist: retrying once");
                match self.store.update_loop_state(&self.config.id, snapshot).await {
                    Ok(()) => true,
                    Err(second) => {
                        warn!(loop_id = %self.config.id, error = %second, "persist: failed after retry");
                        false
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{MockBackend, MockResponse};
    use crate::domain::Loop;
    use crate::events::EventBus;
    use crate::git::test_support::setup_git_repo;
    use crate::state::StateManager;
    use tempfile::tempdir;

    struct Harness {
        _temp: tempfile::TempDir,
        repo: tempfile::TempDir,
        state: StateManager,
        bus: Arc<EventBus>,
    }

    async fn harness() -> Harness {
        let temp = tempdir().unwrap();
        let repo = tempdir().unwrap();
        setup_git_repo(repo.path()).await;
        let state = StateManager::spawn(temp.path()).unwrap();
        Harness {
            _temp: temp,
            repo,
            state,
            bus: Arc::new(EventBus::with_default_capacity()),
        }
    }

    async fn make_loop(h: &Harness, prompt: &str, max_iterations: u32) -> Loop {
        let ws = crate::domain::Workspace::new(
            "ws",
            h.repo.path().to_string_lossy(),
            crate::domain::ServerSettings::Connect {
                hostname: "localhost".into(),
                port: 1,
                https: false,
                allow_insecure: false,
            },
        );
        h.state.save_workspace(ws.clone()).await.unwrap();

        let mut config = LoopConfig::new(&ws.id, h.repo.path().to_string_lossy(), prompt);
        config.max_iterations = max_iterations;
        config.activity_timeout_seconds = 10;
        let record = Loop::new(config, LoopStatus::Idle);
        h.state.save_loop(record.clone()).await.unwrap();
        record
    }

    async fn spawn_engine(h: &Harness, record: &Loop, backend: Arc<MockBackend>) -> Arc<EngineHandle> {
        let (engine, handle) = LoopEngine::build(
            record.config.clone(),
            record.state.clone(),
            backend,
            GitService::local(),
            h.state.clone(),
            h.bus.emitter_for(record.id()),
        );
        let task = tokio::spawn(engine.run());
        handle.attach_task(task).await;
        handle
    }

    async fn wait_for_status(h: &Harness, id: &str, status: LoopStatus) -> Loop {
        for _ in 0..200 {
            let l = h.state.get_loop(id).await.unwrap().unwrap();
            if l.state.status == status {
                return l;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let l = h.state.get_loop(id).await.unwrap().unwrap();
        panic!("loop never reached {:?}, stuck at {:?}", status, l.state.status);
    }

    #[tokio::test]
    async fn test_loop_completes_on_marker() {
        let h = harness().await;
        let record = make_loop(&h, "build the feature", 5).await;
        let backend = MockBackend::new(vec![
            MockResponse::text("working on it").with_file("src/lib.rs", "fn one() {}"),
            MockResponse::text("done <promise>COMPLETE</promise>").with_file("src/lib.rs", "fn two() {}"),
        ]);
        backend.connect().await.unwrap();

        let handle = spawn_engine(&h, &record, backend.clone()).await;
        let done = wait_for_status(&h, record.id(), LoopStatus::Completed).await;
        handle.join(Duration::from_secs(5)).await;

        assert_eq!(done.state.current_iteration, 2);
        let git = done.state.git.unwrap();
        assert!(git.working_branch.starts_with("ralph/"));
        assert!(Path::new(&git.worktree_path).exists());
        assert_eq!(git.commits.len(), 2);
        assert_eq!(done.state.recent_iterations.len(), 2);
        assert_eq!(done.state.recent_iterations[1].outcome, IterationOutcome::Complete);
    }

    #[tokio::test]
    async fn test_loop_hits_max_iterations() {
        let h = harness().await;
        let record = make_loop(&h, "never finishes", 2).await;
        let backend = MockBackend::with_texts(vec!["still going", "still going", "still going", "still going"]);
        backend.connect().await.unwrap();

        let handle = spawn_engine(&h, &record, backend).await;
        let done = wait_for_status(&h, record.id(), LoopStatus::MaxIterations).await;
        handle.join(Duration::from_secs(5)).await;

        assert_eq!(done.state.current_iteration, 2);
        assert!(done
            .state
            .recent_iterations
            .iter()
            .all(|r| r.outcome == IterationOutcome::Continue));
    }

    #[tokio::test]
    async fn test_consecutive_errors_fail_the_loop() {
        let h = harness().await;
        let mut record = make_loop(&h, "error prone", 10).await;
        record.config.max_consecutive_errors = 2;
        h.state.save_loop(record.clone()).await.unwrap();

        let backend = MockBackend::with_texts(vec!["ERROR:backend exploded", "ERROR:backend exploded again"]);
        backend.connect().await.unwrap();

        let handle = spawn_engine(&h, &record, backend).await;
        let done = wait_for_status(&h, record.id(), LoopStatus::Failed).await;
        handle.join(Duration::from_secs(5)).await;

        let error = done.state.error.unwrap();
        assert!(error.message.contains("exploded"));
        assert_eq!(done.state.consecutive_errors.len(), 2);
    }

    #[tokio::test]
    async fn test_error_then_recovery_clears_consecutive() {
        let h = harness().await;
        let mut record = make_loop(&h, "flaky", 10).await;
        record.config.max_consecutive_errors = 3;
        h.state.save_loop(record.clone()).await.unwrap();

        let backend = MockBackend::with_texts(vec![
            "ERROR:transient failure",
            "recovered fine",
            "<promise>COMPLETE</promise>",
        ]);
        backend.connect().await.unwrap();

        let handle = spawn_engine(&h, &record, backend).await;
        let done = wait_for_status(&h, record.id(), LoopStatus::Completed).await;
        handle.join(Duration::from_secs(5)).await;

        assert!(done.state.consecutive_errors.is_empty());
        assert_eq!(done.state.current_iteration, 3);
    }

    #[tokio::test]
    async fn test_interleaved_errors_still_bounded_by_max_iterations() {
        let h = harness().await;
        let mut record = make_loop(&h, "flaky forever", 3).await;
        // Alternating outcomes keep the consecutive-error count at one, so
        // only the iteration budget can stop this loop
        record.config.max_consecutive_errors = 3;
        h.state.save_loop(record.clone()).await.unwrap();

        let backend = MockBackend::with_texts(vec![
            "ERROR:blip",
            "still going",
            "ERROR:blip",
            "still going",
            "ERROR:blip",
            "still going",
        ]);
        backend.connect().await.unwrap();

        let handle = spawn_engine(&h, &record, backend.clone()).await;
        let done = wait_for_status(&h, record.id(), LoopStatus::MaxIterations).await;
        handle.join(Duration::from_secs(5)).await;

        assert_eq!(done.state.current_iteration, 3);
        assert_eq!(done.state.recent_iterations.len(), 3);
        // The budget stopped the run; no further scripted responses consumed
        assert_eq!(backend.prompt_count().await, 3);
    }

    #[tokio::test]
    async fn test_stop_mid_run() {
        let h = harness().await;
        let record = make_loop(&h, "long task", 100).await;
        // Endless continues
        let backend = MockBackend::with_texts(vec!["going"; 100]);
        backend.connect().await.unwrap();

        let handle = spawn_engine(&h, &record, backend.clone()).await;
        wait_for_status(&h, record.id(), LoopStatus::Running).await;

        handle.cancel();
        let done = wait_for_status(&h, record.id(), LoopStatus::Stopped).await;
        handle.join(Duration::from_secs(5)).await;
        assert_eq!(done.state.status, LoopStatus::Stopped);
        assert!(backend.abort_count() >= 1);
    }

    #[tokio::test]
    async fn test_pending_prompt_consumed_once() {
        let h = harness().await;
        let mut record = make_loop(&h, "base task", 3).await;
        record.state.pending_prompt = Some("also fix the tests".into());
        h.state.save_loop(record.clone()).await.unwrap();

        let backend = MockBackend::with_texts(vec!["one", "two <promise>COMPLETE</promise>"]);
        backend.connect().await.unwrap();

        let handle = spawn_engine(&h, &record, backend.clone()).await;
        wait_for_status(&h, record.id(), LoopStatus::Completed).await;
        handle.join(Duration::from_secs(5)).await;

        let prompts = backend.prompts().await;
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].1.contains("base task"));
        assert!(prompts[0].1.contains("also fix the tests"));
        // Consumed by exactly one iteration
        assert!(!prompts[1].1.contains("also fix the tests"));
    }

    #[tokio::test]
    async fn test_plan_mode_feedback_and_accept() {
        let h = harness().await;
        let mut record = make_loop(&h, "plan the work", 10).await;
        record.config.plan_mode = true;
        record.state.status = LoopStatus::Planning;
        h.state.save_loop(record.clone()).await.unwrap();

        let backend = MockBackend::new(vec![
            MockResponse::text("plan drafted <promise>PLAN_READY</promise>")
                .with_file(".planning/plan.md", "# Plan v1"),
            MockResponse::text("plan revised <promise>PLAN_READY</promise>")
                .with_file(".planning/plan.md", "# Plan v2"),
            MockResponse::text("implementing <promise>COMPLETE</promise>"),
        ]);
        backend.connect().await.unwrap();

        let handle = spawn_engine(&h, &record, backend.clone()).await;

        // First iteration produces a ready plan
        let mut planning = wait_for_status(&h, record.id(), LoopStatus::Planning).await;
        for _ in 0..200 {
            if planning.state.plan.as_ref().map(|p| p.is_plan_ready).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
            planning = h.state.get_loop(record.id()).await.unwrap().unwrap();
        }
        assert!(planning.state.plan.unwrap().is_plan_ready);

        // Feedback: the manager flips bookkeeping synchronously, then the
        // engine runs another planning iteration
        {
            let shared = handle.shared();
            let mut st = shared.lock().await;
            let plan = st.plan.as_mut().unwrap();
            plan.is_plan_ready = false;
            plan.feedback_rounds += 1;
        }
        handle
            .send(EngineCommand::PlanFeedback {
                text: "Add estimates".into(),
            })
            .await
            .unwrap();

        let mut replanned = h.state.get_loop(record.id()).await.unwrap().unwrap();
        for _ in 0..200 {
            if replanned.state.plan.as_ref().map(|p| p.is_plan_ready).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
            replanned = h.state.get_loop(record.id()).await.unwrap().unwrap();
        }
        let plan = replanned.state.plan.clone().unwrap();
        assert!(plan.is_plan_ready);
        assert_eq!(plan.feedback_rounds, 1);

        // Accept: same session continues as a normal loop
        handle.send(EngineCommand::AcceptPlan).await.unwrap();
        let done = wait_for_status(&h, record.id(), LoopStatus::Completed).await;
        handle.join(Duration::from_secs(5)).await;

        let plan = done.state.plan.unwrap();
        assert!(plan.plan_session_id.is_some());
        assert_eq!(backend.session_count(), 1);

        // Plan file survives acceptance
        let worktree = done.state.git.unwrap().worktree_path;
        assert!(Path::new(&worktree).join(".planning/plan.md").exists());
    }

    #[tokio::test]
    async fn test_chat_engine_stays_resident() {
        let h = harness().await;
        let mut record = make_loop(&h, "hello there", 1).await;
        record.config = record.config.clone().as_chat();
        h.state.save_loop(record.clone()).await.unwrap();

        let backend = MockBackend::with_texts(vec!["hi! how can I help", "second answer"]);
        backend.connect().await.unwrap();

        let handle = spawn_engine(&h, &record, backend.clone()).await;
        let first = wait_for_status(&h, record.id(), LoopStatus::Completed).await;
        assert_eq!(first.state.current_iteration, 1);

        // Second turn through the resident engine
        handle
            .send(EngineCommand::ChatMessage {
                text: "follow up question".into(),
            })
            .await
            .unwrap();

        let mut second = h.state.get_loop(record.id()).await.unwrap().unwrap();
        for _ in 0..200 {
            if second.state.current_iteration == 2 && second.state.status == LoopStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
            second = h.state.get_loop(record.id()).await.unwrap().unwrap();
        }
        assert_eq!(second.state.current_iteration, 2);
        assert_eq!(second.state.status, LoopStatus::Completed);

        let prompts = backend.prompts().await;
        assert_eq!(prompts[1].1, "follow up question");
        // Same session across turns
        assert_eq!(prompts[0].0, prompts[1].0);

        handle.cancel();
        handle.join(Duration::from_secs(5)).await;
    }

    /// Backend whose event stream stays open without delivering events,
    /// for exercising the activity-timeout path
    struct StuckBackend;

    #[async_trait::async_trait]
    impl AgentBackend for StuckBackend {
        fn name(&self) -> &str {
            "stuck"
        }
        async fn connect(&self) -> Result<(), AgentError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), AgentError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn create_session(
            &self,
            request: CreateSessionRequest,
        ) -> Result<crate::agent::SessionInfo, AgentError> {
            Ok(crate::agent::SessionInfo {
                id: "stuck-sess".into(),
                title: request.title,
                created_at: Utc::now(),
            })
        }
        async fn send_prompt(&self, _s: &str, _p: &str) -> Result<crate::agent::PromptReply, AgentError> {
            Err(AgentError::NotConnected)
        }
        async fn send_prompt_async(&self, _s: &str, _p: &str) -> Result<(), AgentError> {
            Ok(())
        }
        async fn subscribe_events(&self, _s: &str) -> Result<crate::agent::AgentEventStream, AgentError> {
            let (tx, rx) = mpsc::channel(1);
            // Keep the sender alive forever so the stream never ends
            tokio::spawn(async move {
                let _tx = tx;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            });
            Ok(rx)
        }
        async fn abort_session(&self, _s: &str) -> Result<(), AgentError> {
            Ok(())
        }
        async fn reply_to_permission(&self, _s: &str, _r: &str, _a: bool) -> Result<(), AgentError> {
            Ok(())
        }
        async fn reply_to_question(&self, _s: &str, _r: &str, _a: &str) -> Result<(), AgentError> {
            Ok(())
        }
        async fn list_models(&self) -> Result<Vec<crate::agent::ModelInfo>, AgentError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_activity_timeout_aborts_iteration() {
        let backend = StuckBackend;
        let shared = Arc::new(Mutex::new(LoopState::default()));
        let cancel = CancellationToken::new();

        let outcome = drive_session_iteration(
            &backend,
            "stuck-sess",
            "do something",
            "COMPLETE",
            Duration::from_millis(200),
            &cancel,
            &shared,
        )
        .await
        .unwrap();
        assert_eq!(outcome.end, DriveEnd::Timeout);
    }

    #[tokio::test]
    async fn test_activity_timeout_fails_engine_at_threshold() {
        let h = harness().await;
        let mut record = make_loop(&h, "slow agent", 5).await;
        record.config.activity_timeout_seconds = 1;
        record.config.max_consecutive_errors = 1;
        h.state.save_loop(record.clone()).await.unwrap();

        let backend = Arc::new(StuckBackend);
        let (engine, handle) = LoopEngine::build(
            record.config.clone(),
            record.state.clone(),
            backend,
            GitService::local(),
            h.state.clone(),
            h.bus.emitter_for(record.id()),
        );
        let task = tokio::spawn(engine.run());
        handle.attach_task(task).await;

        let done = wait_for_status(&h, record.id(), LoopStatus::Failed).await;
        handle.join(Duration::from_secs(10)).await;
        assert!(done.state.error.unwrap().message.contains("activity"));
    }
}
