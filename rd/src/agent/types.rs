//! Agent backend wire types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::ModelRef;

/// A created agent session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Request to create a session bound to a working directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub title: String,
    pub directory: String,
    pub model: ModelRef,
}

/// Reply from a synchronous single-turn prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptReply {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub parts: Vec<String>,
}

/// A model the backend can run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider_id: String,
    pub provider_name: String,
    pub model_id: String,
    pub model_name: String,
    pub connected: bool,
}

/// Events observed on a session's stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    MessageStart,
    MessageDelta { content: String },
    MessageComplete,
    ToolStart { name: String, args: Value },
    ToolEnd { name: String, success: bool },
    Question { id: String, text: String },
    Permission { id: String, description: String },
}

/// Agent backend failure modes
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("not connected")]
    NotConnected,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("model not enabled: {0}")]
    ModelNotEnabled(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection timed out")]
    ConnectionTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_event_serde() {
        let event = AgentEvent::MessageDelta {
            content: "hello".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"message_delta","content":"hello"}"#);

        let parsed: AgentEvent = serde_json::from_str(r#"{"type":"message_complete"}"#).unwrap();
        assert!(matches!(parsed, AgentEvent::MessageComplete));
    }

    #[test]
    fn test_model_info_serde_roundtrip() {
        let info = ModelInfo {
            provider_id: "anthropic".into(),
            provider_name: "Anthropic".into(),
            model_id: "claude-sonnet".into(),
            model_name: "Claude Sonnet".into(),
            connected: true,
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: ModelInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
