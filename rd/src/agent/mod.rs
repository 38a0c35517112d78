//! Agent backend abstraction
//!
//! The engine talks to coding agents through [`AgentBackend`]: create a
//! session bound to a worktree, fire a prompt, drain the event stream,
//! abort on cancellation. Two implementations exist: the remote HTTP
//! backend and a scripted mock.

mod mock;
mod remote;
mod types;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use mock::{MockBackend, MockResponse};
pub use remote::RemoteBackend;
pub use types::{AgentError, AgentEvent, CreateSessionRequest, ModelInfo, PromptReply, SessionInfo};

/// Stream of events for one session. The sender side closes when the agent
/// finishes producing output for the most recent prompt; dropping the
/// receiver cancels the subscription.
pub type AgentEventStream = mpsc::Receiver<AgentEvent>;

/// Contract between the loop engine and a coding-agent server
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Stable backend name used for session mappings (e.g. `remote`, `mock`)
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), AgentError>;

    async fn disconnect(&self) -> Result<(), AgentError>;

    fn is_connected(&self) -> bool;

    async fn create_session(&self, request: CreateSessionRequest) -> Result<SessionInfo, AgentError>;

    /// Synchronous single-turn call for short out-of-band prompts
    /// (e.g. name generation)
    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<PromptReply, AgentError>;

    /// Fire-and-forget; the response is observable only via the event stream
    async fn send_prompt_async(&self, session_id: &str, prompt: &str) -> Result<(), AgentError>;

    async fn subscribe_events(&self, session_id: &str) -> Result<AgentEventStream, AgentError>;

    async fn abort_session(&self, session_id: &str) -> Result<(), AgentError>;

    async fn reply_to_permission(&self, session_id: &str, request_id: &str, allow: bool) -> Result<(), AgentError>;

    async fn reply_to_question(&self, session_id: &str, request_id: &str, answer: &str) -> Result<(), AgentError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, AgentError>;
}
