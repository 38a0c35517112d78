//! Ralpher - Ralph loop orchestrator
//!
//! A long-lived server supervising many concurrent loops, each driving an
//! external coding-agent session through iterative prompts against a
//! per-loop isolated git worktree, committing per-iteration progress and
//! advancing through a state machine with planning, chat, push/merge and
//! post-merge review phases.
//!
//! # Core Concepts
//!
//! - **Worktree isolation**: every loop works on its own branch in its own
//!   linked worktree; the main checkout is never touched
//! - **Marker protocol**: completion and plan readiness are detected as
//!   textual markers in the agent's streamed output
//! - **Durable state**: loop state persists to SQLite at end-of-iteration
//!   and on a bounded ticker; recovery after restart is lazy
//!
//! # Modules
//!
//! - [`domain`] - loops, workspaces, sessions, review comments
//! - [`store`] / [`state`] - SQLite persistence and its async facade
//! - [`events`] - typed event bus
//! - [`exec`] - local and remote command executors
//! - [`git`] - worktree and branch primitives
//! - [`agent`] - agent backend abstraction (remote + mock)
//! - [`backend`] - per-workspace backend pool and model validation
//! - [`r#loop`] - the loop engine and manager
//! - [`sync`] - base-branch synchronization and conflict resolution

pub mod agent;
pub mod backend;
pub mod cli;
pub mod config;
pub mod domain;
pub mod events;
pub mod exec;
pub mod git;
pub mod state;
pub mod store;
pub mod sync;

// Note: 'loop' is a reserved keyword, so we use r#loop
#[path = "loop/mod.rs"]
pub mod r#loop;

// Re-export commonly used types
pub use agent::{AgentBackend, AgentError, AgentEvent, MockBackend, MockResponse, RemoteBackend};
pub use backend::{BackendError, BackendManager};
pub use config::Config;
pub use domain::{
    Loop, LoopConfig, LoopMode, LoopState, LoopStatus, ModelRef, ReviewComment, ServerSettings, Workspace,
};
pub use events::{EventBus, EventEmitter, LoopEvent, LoopEventKind, create_event_bus};
pub use exec::{CommandExecutor, ExecResult, LocalExecutor, RemoteShellExecutor};
pub use git::{GitService, MergeOutcome};
pub use r#loop::{
    CreateLoopOptions, LoopEngine, LoopError, LoopManager, LoopManagerConfig, PendingOptions, UpdateLoopOptions,
};
pub use state::{StateError, StateManager};
pub use store::{Store, StoreError};
pub use sync::{SyncResult, SyncStatus};
