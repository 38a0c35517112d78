//! Loop domain types
//!
//! A loop is a supervised iterative agent session: an immutable-ish
//! [`LoopConfig`] plus a mutable [`LoopState`] that the engine advances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::new_loop_id;

/// Maximum entries kept in `LoopState::recent_iterations`
pub const RECENT_ITERATIONS_MAX: usize = 20;

/// Default stop pattern scanned for in iteration output
pub const DEFAULT_STOP_PATTERN: &str = "COMPLETE";

/// Canonical completion marker, always honored regardless of stop pattern
pub const COMPLETE_MARKER: &str = "<promise>COMPLETE</promise>";

/// Plan readiness marker
pub const PLAN_READY_MARKER: &str = "<promise>PLAN_READY</promise>";

/// Prefix the backends use to inject failures into the output stream
pub const ERROR_MARKER: &str = "ERROR:";

/// Execution mode of a loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// Iterate until the stop pattern or a failsafe fires
    #[default]
    Loop,
    /// One prompt per turn, engine stays resident between turns
    Chat,
}

impl std::fmt::Display for LoopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loop => write!(f, "loop"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

/// Loop status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    /// Created but not yet configured for execution
    Draft,
    /// Ready to start
    #[default]
    Idle,
    /// Producing a plan, awaiting feedback or acceptance
    Planning,
    /// Worktree and session being prepared
    Starting,
    /// Actively iterating
    Running,
    /// Waiting on external input
    Waiting,
    /// Stop pattern detected
    Completed,
    /// User requested stop
    Stopped,
    /// Consecutive-error failsafe or unrecoverable error
    Failed,
    /// Iteration cap reached
    MaxIterations,
    /// A conflict-resolution sub-loop is running
    ResolvingConflicts,
    /// Accepted: working branch merged into the original branch
    Merged,
    /// Working branch pushed to the remote
    Pushed,
    /// Soft-deleted; worktree preserved until purge
    Deleted,
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::MaxIterations => "max_iterations",
            Self::ResolvingConflicts => "resolving_conflicts",
            Self::Merged => "merged",
            Self::Pushed => "pushed",
            Self::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

impl LoopStatus {
    /// Statuses a loop can be started (or jumpstarted) from
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Stopped | Self::Failed | Self::Completed | Self::MaxIterations
        )
    }

    /// Terminal iteration outcomes (the engine has stopped advancing)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Stopped | Self::Failed | Self::MaxIterations
        )
    }

    /// Statuses from which no further work is accepted at all
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Statuses during which an engine is actively driving iterations
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Planning | Self::ResolvingConflicts
        )
    }
}

/// Reference to an agent model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl ModelRef {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            variant: None,
        }
    }
}

/// How to treat a dirty main checkout when a caller opts out of worktree
/// isolation. Worktree-backed loops never consult this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HandleUncommitted {
    #[default]
    Throw,
    Commit,
    Stash,
}

/// Immutable-ish configuration of a loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Unique identifier (uuid v7)
    pub id: String,

    /// Display name; derived from the prompt when not provided
    pub name: String,

    /// Owning workspace
    pub workspace_id: String,

    /// Repository directory of the owning workspace
    pub directory: String,

    /// Execution mode
    #[serde(default)]
    pub mode: LoopMode,

    /// The task prompt sent on every iteration
    pub prompt: String,

    /// Marker detected in iteration output to signal completion
    #[serde(default = "default_stop_pattern")]
    pub stop_pattern: String,

    /// Iteration cap
    pub max_iterations: u32,

    /// Consecutive-error failsafe threshold
    pub max_consecutive_errors: u32,

    /// Abort an iteration after this many seconds without an agent event
    pub activity_timeout_seconds: u64,

    /// Model the agent sessions use
    pub model: ModelRef,

    /// Prefix for working branches, e.g. `ralph/`
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,

    /// Scope prefix for per-iteration commit messages, e.g. `ralph`
    #[serde(default = "default_commit_scope")]
    pub commit_scope: String,

    /// Branch to fork the worktree from; repository default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,

    /// Start in the planning phase
    #[serde(default)]
    pub plan_mode: bool,

    /// Clear `worktree/.planning` once before the first plan iteration
    #[serde(default)]
    pub clear_planning_folder: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_stop_pattern() -> String {
    DEFAULT_STOP_PATTERN.to_string()
}

fn default_branch_prefix() -> String {
    "ralph/".to_string()
}

fn default_commit_scope() -> String {
    "ralph".to_string()
}

impl LoopConfig {
    /// Create a config with generated ID and defaults
    pub fn new(workspace_id: impl Into<String>, directory: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        let prompt = prompt.into();
        Self {
            id: new_loop_id(),
            name: derive_name(&prompt),
            workspace_id: workspace_id.into(),
            directory: directory.into(),
            mode: LoopMode::Loop,
            prompt,
            stop_pattern: default_stop_pattern(),
            max_iterations: 10,
            max_consecutive_errors: 3,
            activity_timeout_seconds: 300,
            model: ModelRef::new("mock", "mock-agent"),
            branch_prefix: default_branch_prefix(),
            commit_scope: default_commit_scope(),
            base_branch: None,
            plan_mode: false,
            clear_planning_folder: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder method to set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder method to set the model
    pub fn with_model(mut self, model: ModelRef) -> Self {
        self.model = model;
        self
    }

    /// Builder method to switch to chat mode (one iteration per turn)
    pub fn as_chat(mut self) -> Self {
        self.mode = LoopMode::Chat;
        self.max_iterations = 1;
        self.plan_mode = false;
        self
    }

    /// Builder method to start in plan mode
    pub fn with_plan_mode(mut self, clear_planning_folder: bool) -> Self {
        self.plan_mode = true;
        self.clear_planning_folder = clear_planning_folder;
        self
    }
}

/// Derive a loop name from its prompt (first 50 chars, single line)
pub fn derive_name(prompt: &str) -> String {
    let line = prompt.lines().next().unwrap_or("").trim();
    line.chars().take(50).collect::<String>()
}

/// Current agent session of a loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
}

/// Error recorded on the loop state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopErrorInfo {
    pub message: String,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
}

impl LoopErrorInfo {
    pub fn new(message: impl Into<String>, iteration: u32) -> Self {
        Self {
            message: message.into(),
            iteration,
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    Complete,
    Continue,
    Error,
}

impl std::fmt::Display for IterationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Continue => write!(f, "continue"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One entry of the bounded recent-iterations ring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentIteration {
    pub iteration: u32,
    pub outcome: IterationOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Git bookkeeping for a loop that has a worktree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitState {
    /// Branch the main checkout was on when the loop started
    pub original_branch: String,
    /// The loop's working branch
    pub working_branch: String,
    /// Absolute path of the linked worktree
    pub worktree_path: String,
    /// Per-iteration commit hashes, oldest first
    #[serde(default)]
    pub commits: Vec<String>,
}

/// Planning-phase bookkeeping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanModeState {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_session_id: Option<String>,
    #[serde(default)]
    pub feedback_rounds: u32,
    #[serde(default)]
    pub planning_folder_cleared: bool,
    #[serde(default)]
    pub is_plan_ready: bool,
}

/// How an addressable loop reached its review phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionAction {
    Merge,
    Push,
}

/// Post-accept / post-push review bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewModeState {
    pub addressable: bool,
    pub completion_action: CompletionAction,
    #[serde(default)]
    pub review_cycles: u32,
}

impl ReviewModeState {
    pub fn new(completion_action: CompletionAction) -> Self {
        Self {
            addressable: true,
            completion_action,
            review_cycles: 0,
        }
    }
}

/// Which merge target a conflict-resolution sub-loop is working on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    BaseBranch,
    WorkingBranch,
}

/// Conflict-resolution bookkeeping, present only while a sub-loop runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncModeState {
    pub sync_phase: SyncPhase,
    pub auto_push_on_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_session_id: Option<String>,
}

/// Mutable state of a loop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopState {
    #[serde(default)]
    pub status: LoopStatus,

    #[serde(default)]
    pub current_iteration: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,

    /// Current agent session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionRef>,

    /// Last recorded error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<LoopErrorInfo>,

    /// Errors since the last successful iteration
    #[serde(default)]
    pub consecutive_errors: Vec<LoopErrorInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitState>,

    /// Bounded ring of recent iteration outcomes
    #[serde(default)]
    pub recent_iterations: Vec<RecentIteration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanModeState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewModeState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncModeState>,

    /// Prompt injected into the next iteration, cleared on consumption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_prompt: Option<String>,

    /// Model applied on the next iteration, cleared on consumption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_model: Option<ModelRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todos: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
}

impl LoopState {
    /// Initial state for a newly created loop
    pub fn initial(status: LoopStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Refresh the activity timestamp
    pub fn touch_activity(&mut self) {
        self.last_activity_at = Some(Utc::now());
    }

    /// Record an error and add it to the consecutive-error window
    pub fn record_error(&mut self, message: impl Into<String>, iteration: u32) {
        let info = LoopErrorInfo::new(message, iteration);
        self.consecutive_errors.push(info.clone());
        self.error = Some(info);
    }

    /// Clear the error block and the consecutive-error window
    pub fn clear_errors(&mut self) {
        self.error = None;
        self.consecutive_errors.clear();
    }

    /// Append to the bounded recent-iterations ring, evicting the oldest
    pub fn push_recent(&mut self, entry: RecentIteration) {
        self.recent_iterations.push(entry);
        while self.recent_iterations.len() > RECENT_ITERATIONS_MAX {
            self.recent_iterations.remove(0);
        }
    }
}

/// A loop: config plus state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loop {
    pub config: LoopConfig,
    pub state: LoopState,
}

impl Loop {
    /// Create a loop in the given initial status
    pub fn new(config: LoopConfig, status: LoopStatus) -> Self {
        Self {
            config,
            state: LoopState::initial(status),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn status(&self) -> LoopStatus {
        self.state.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&LoopStatus::MaxIterations).unwrap();
        assert_eq!(json, "\"max_iterations\"");
        let back: LoopStatus = serde_json::from_str("\"resolving_conflicts\"").unwrap();
        assert_eq!(back, LoopStatus::ResolvingConflicts);
    }

    #[test]
    fn test_status_predicates() {
        assert!(LoopStatus::Idle.can_start());
        assert!(LoopStatus::Failed.can_start());
        assert!(!LoopStatus::Running.can_start());
        assert!(!LoopStatus::Merged.can_start());
        assert!(LoopStatus::MaxIterations.is_terminal());
        assert!(!LoopStatus::Planning.is_terminal());
        assert!(LoopStatus::Deleted.is_final());
    }

    #[test]
    fn test_derive_name_truncates() {
        let prompt = "x".repeat(80);
        assert_eq!(derive_name(&prompt).len(), 50);
        assert_eq!(derive_name("short task\nsecond line"), "short task");
    }

    #[test]
    fn test_chat_builder_forces_single_iteration() {
        let config = LoopConfig::new("ws", "/repo", "chat away").as_chat();
        assert_eq!(config.mode, LoopMode::Chat);
        assert_eq!(config.max_iterations, 1);
        assert!(!config.plan_mode);
    }

    #[test]
    fn test_recent_iterations_bounded() {
        let mut state = LoopState::default();
        for i in 0..(RECENT_ITERATIONS_MAX as u32 + 5) {
            state.push_recent(RecentIteration {
                iteration: i + 1,
                outcome: IterationOutcome::Continue,
                summary: None,
            });
        }
        assert_eq!(state.recent_iterations.len(), RECENT_ITERATIONS_MAX);
        assert_eq!(state.recent_iterations[0].iteration, 6);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut state = LoopState::initial(LoopStatus::Running);
        state.git = Some(GitState {
            original_branch: "main".into(),
            working_branch: "ralph/fix-2026-08-01-0194a2f3".into(),
            worktree_path: "/repo/.ralph-worktrees/ralph-fix".into(),
            commits: vec!["abc123".into()],
        });
        state.record_error("boom", 2);

        let json = serde_json::to_string(&state).unwrap();
        let back: LoopState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, LoopStatus::Running);
        assert_eq!(back.git.unwrap().commits, vec!["abc123".to_string()]);
        assert_eq!(back.consecutive_errors.len(), 1);
    }

    #[test]
    fn test_record_and_clear_errors() {
        let mut state = LoopState::default();
        state.record_error("first", 1);
        state.record_error("second", 2);
        assert_eq!(state.consecutive_errors.len(), 2);
        assert_eq!(state.error.as_ref().unwrap().message, "second");

        state.clear_errors();
        assert!(state.error.is_none());
        assert!(state.consecutive_errors.is_empty());
    }
}
