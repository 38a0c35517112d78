//! Remote agent backend over JSON HTTP + server-sent events

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use reqwest_eventsource::{Event as SseEvent, EventSource};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::ServerSettings;

use super::types::{AgentError, AgentEvent, CreateSessionRequest, ModelInfo, PromptReply, SessionInfo};
use super::{AgentBackend, AgentEventStream};

/// Default request timeout for the control-plane calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Agent backend reached over the network
pub struct RemoteBackend {
    base_url: String,
    http: Client,
    connected: AtomicBool,
}

impl RemoteBackend {
    /// Build a backend from workspace server settings
    pub fn from_settings(settings: &ServerSettings) -> Result<Self, AgentError> {
        let allow_insecure = matches!(
            settings,
            ServerSettings::Connect {
                https: true,
                allow_insecure: true,
                ..
            }
        );

        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(allow_insecure)
            .build()
            .map_err(|e| AgentError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            base_url: settings.base_url(),
            http,
            connected: AtomicBool::new(false),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn require_connected(&self) -> Result<(), AgentError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(AgentError::NotConnected)
        }
    }

    fn map_status(status: StatusCode, session_id: &str) -> AgentError {
        match status {
            StatusCode::NOT_FOUND => AgentError::SessionNotFound(session_id.to_string()),
            other => AgentError::ConnectionFailed(format!("unexpected status {}", other)),
        }
    }

    async fn post_json(&self, path: &str, body: serde_json::Value, session_id: &str) -> Result<(), AgentError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::map_status(response.status(), session_id));
        }
        Ok(())
    }
}

#[async_trait]
impl AgentBackend for RemoteBackend {
    fn name(&self) -> &str {
        "remote"
    }

    async fn connect(&self) -> Result<(), AgentError> {
        let url = format!("{}/health", self.base_url);
        debug!(%url, "RemoteBackend::connect: probing");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::ConnectionFailed(format!(
                "health probe returned {}",
                response.status()
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), AgentError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn create_session(&self, request: CreateSessionRequest) -> Result<SessionInfo, AgentError> {
        self.require_connected()?;
        let url = format!("{}/session", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::ConnectionFailed(format!(
                "session create returned {}",
                response.status()
            )));
        }
        response
            .json::<SessionInfo>()
            .await
            .map_err(|e| AgentError::ConnectionFailed(e.to_string()))
    }

    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<PromptReply, AgentError> {
        self.require_connected()?;
        let url = format!("{}/session/{}/message", self.base_url, session_id);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(|e| AgentError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::map_status(response.status(), session_id));
        }
        response
            .json::<PromptReply>()
            .await
            .map_err(|e| AgentError::ConnectionFailed(e.to_string()))
    }

    async fn send_prompt_async(&self, session_id: &str, prompt: &str) -> Result<(), AgentError> {
        self.require_connected()?;
        self.post_json(
            &format!("/session/{}/prompt", session_id),
            serde_json::json!({ "prompt": prompt }),
            session_id,
        )
        .await
    }

    async fn subscribe_events(&self, session_id: &str) -> Result<AgentEventStream, AgentError> {
        self.require_connected()?;
        let url = format!("{}/session/{}/events", self.base_url, session_id);
        debug!(%url, "RemoteBackend::subscribe_events: opening stream");

        let request = self.http.get(&url);
        let mut source = EventSource::new(request).map_err(|e| AgentError::ConnectionFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        let session = session_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = source.next().await {
                match event {
                    Ok(SseEvent::Open) => {}
                    Ok(SseEvent::Message(message)) => {
                        if message.event == "done" {
                            break;
                        }
                        match serde_json::from_str::<AgentEvent>(&message.data) {
                            Ok(parsed) => {
                                if tx.send(parsed).await.is_err() {
                                    // Receiver dropped: subscription cancelled
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(session = %session, error = %e, "subscribe_events: unparseable event");
                            }
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(e) => {
                        warn!(session = %session, error = %e, "subscribe_events: stream error");
                        break;
                    }
                }
            }
            source.close();
            // Sender drops here, terminating the stream for the consumer
        });

        Ok(rx)
    }

    async fn abort_session(&self, session_id: &str) -> Result<(), AgentError> {
        self.require_connected()?;
        self.post_json(
            &format!("/session/{}/abort", session_id),
            serde_json::json!({}),
            session_id,
        )
        .await
    }

    async fn reply_to_permission(&self, session_id: &str, request_id: &str, allow: bool) -> Result<(), AgentError> {
        self.require_connected()?;
        self.post_json(
            &format!("/session/{}/permission", session_id),
            serde_json::json!({ "request_id": request_id, "allow": allow }),
            session_id,
        )
        .await
    }

    async fn reply_to_question(&self, session_id: &str, request_id: &str, answer: &str) -> Result<(), AgentError> {
        self.require_connected()?;
        self.post_json(
            &format!("/session/{}/question", session_id),
            serde_json::json!({ "request_id": request_id, "answer": answer }),
            session_id,
        )
        .await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, AgentError> {
        self.require_connected()?;
        let url = format!("{}/models", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::ConnectionFailed(format!(
                "model list returned {}",
                response.status()
            )));
        }
        response
            .json::<Vec<ModelInfo>>()
            .await
            .map_err(|e| AgentError::ConnectionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_settings_builds_base_url() {
        let backend = RemoteBackend::from_settings(&ServerSettings::Connect {
            hostname: "agent.internal".into(),
            port: 4911,
            https: false,
            allow_insecure: false,
        })
        .unwrap();
        assert_eq!(backend.base_url(), "http://agent.internal:4911");
        assert!(!backend.is_connected());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let backend = RemoteBackend::from_settings(&ServerSettings::Connect {
            hostname: "localhost".into(),
            port: 1,
            https: false,
            allow_insecure: false,
        })
        .unwrap();

        let err = backend.send_prompt_async("sess", "go").await.unwrap_err();
        assert!(matches!(err, AgentError::NotConnected));
        let err = backend.subscribe_events("sess").await.unwrap_err();
        assert!(matches!(err, AgentError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_connection_failed() {
        // Nothing listens on this port
        let backend = RemoteBackend::from_settings(&ServerSettings::Connect {
            hostname: "127.0.0.1".into(),
            port: 1,
            https: false,
            allow_insecure: false,
        })
        .unwrap();

        let err = backend.connect().await.unwrap_err();
        assert!(matches!(err, AgentError::ConnectionFailed(_)));
    }
}
