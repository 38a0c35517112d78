//! Domain types: loops, workspaces, sessions, review comments

mod id;
mod review;
mod session;
mod workspace;

// Note: 'loop' is a reserved keyword, so we use r#loop
mod r#loop;

pub use id::{new_loop_id, sanitize_name, short_id};
pub use r#loop::{
    COMPLETE_MARKER, CompletionAction, DEFAULT_STOP_PATTERN, ERROR_MARKER, GitState, HandleUncommitted,
    IterationOutcome, Loop, LoopConfig, LoopErrorInfo, LoopMode, LoopState, LoopStatus, ModelRef, PLAN_READY_MARKER,
    PlanModeState, RECENT_ITERATIONS_MAX, RecentIteration, ReviewModeState, SessionRef, SyncModeState, SyncPhase,
    derive_name,
};
pub use review::{ReviewComment, ReviewStatus};
pub use session::SessionMapping;
pub use workspace::{ServerSettings, Workspace};
