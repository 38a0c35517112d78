//! Mock agent backend
//!
//! Scripted responses consumed one per prompt, streamed back as deltas over
//! the same channel shape the remote backend uses. A response can also write
//! files into the session's directory so per-iteration commit behavior is
//! exercisable without a real agent. `ERROR:<message>` responses inject
//! failures the engine counts as consecutive errors.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::types::{AgentError, AgentEvent, CreateSessionRequest, ModelInfo, PromptReply, SessionInfo};
use super::{AgentBackend, AgentEventStream};

/// A scripted mock response
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub text: String,
    /// Files written into the session directory before the stream ends
    pub files: Vec<(String, String)>,
}

impl MockResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push((path.into(), content.into()));
        self
    }
}

#[derive(Debug, Clone)]
struct MockSession {
    directory: String,
    pending: Option<MockResponse>,
}

/// Scripted agent backend for tests and agent-free development
pub struct MockBackend {
    connected: AtomicBool,
    responses: Mutex<VecDeque<MockResponse>>,
    oneshot_replies: Mutex<VecDeque<String>>,
    sessions: Mutex<HashMap<String, MockSession>>,
    prompts: Mutex<Vec<(String, String)>>,
    session_counter: AtomicUsize,
    abort_count: AtomicUsize,
    models: Mutex<Vec<ModelInfo>>,
    fail_connect: AtomicBool,
}

impl MockBackend {
    pub fn new(responses: Vec<MockResponse>) -> Arc<Self> {
        debug!(response_count = responses.len(), "MockBackend::new: called");
        Arc::new(Self {
            connected: AtomicBool::new(false),
            responses: Mutex::new(responses.into()),
            oneshot_replies: Mutex::new(VecDeque::new()),
            sessions: Mutex::new(HashMap::new()),
            prompts: Mutex::new(Vec::new()),
            session_counter: AtomicUsize::new(0),
            abort_count: AtomicUsize::new(0),
            models: Mutex::new(vec![ModelInfo {
                provider_id: "mock".into(),
                provider_name: "Mock".into(),
                model_id: "mock-agent".into(),
                model_name: "Mock Agent".into(),
                connected: true,
            }]),
            fail_connect: AtomicBool::new(false),
        })
    }

    /// Convenience: scripted plain-text responses
    pub fn with_texts(texts: Vec<&str>) -> Arc<Self> {
        Self::new(texts.into_iter().map(MockResponse::text).collect())
    }

    /// Queue a reply for the synchronous `send_prompt` path
    pub async fn queue_oneshot_reply(&self, reply: impl Into<String>) {
        self.oneshot_replies.lock().await.push_back(reply.into());
    }

    /// Append more scripted streaming responses
    pub async fn queue_responses(&self, responses: Vec<MockResponse>) {
        let mut queue = self.responses.lock().await;
        for response in responses {
            queue.push_back(response);
        }
    }

    /// Replace the advertised model list
    pub async fn set_models(&self, models: Vec<ModelInfo>) {
        *self.models.lock().await = models;
    }

    /// Make subsequent `connect` calls fail
    pub fn fail_connections(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub async fn prompt_count(&self) -> usize {
        self.prompts.lock().await.len()
    }

    pub async fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().await.clone()
    }

    pub fn session_count(&self) -> usize {
        self.session_counter.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.abort_count.load(Ordering::SeqCst)
    }

    async fn write_response_files(directory: &str, response: &MockResponse) {
        for (rel_path, content) in &response.files {
            let path = std::path::Path::new(directory).join(rel_path);
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let _ = tokio::fs::write(&path, content).await;
        }
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<(), AgentError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(AgentError::ConnectionFailed("mock connection refused".into()));
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
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("mock-sess-{}", n);
        debug!(%id, directory = %request.directory, "MockBackend::create_session");
        self.sessions.lock().await.insert(
            id.clone(),
            MockSession {
                directory: request.directory,
                pending: None,
            },
        );
        Ok(SessionInfo {
            id,
            title: request.title,
            created_at: Utc::now(),
        })
    }

    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<PromptReply, AgentError> {
        if !self.sessions.lock().await.contains_key(session_id) {
            return Err(AgentError::SessionNotFound(session_id.to_string()));
        }
        self.prompts
            .lock()
            .await
            .push((session_id.to_string(), prompt.to_string()));

        let content = self.oneshot_replies.lock().await.pop_front().unwrap_or_default();
        Ok(PromptReply {
            id: format!("reply-{}", uuid::Uuid::now_v7()),
            parts: vec![content.clone()],
            content,
        })
    }

    async fn send_prompt_async(&self, session_id: &str, prompt: &str) -> Result<(), AgentError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;

        self.prompts
            .lock()
            .await
            .push((session_id.to_string(), prompt.to_string()));

        // Exhausted scripts produce an empty response, not an error; loops
        // stay bounded by max_iterations either way.
        let response = self.responses.lock().await.pop_front().unwrap_or(MockResponse {
            text: String::new(),
            files: Vec::new(),
        });
        session.pending = Some(response);
        Ok(())
    }

    async fn subscribe_events(&self, session_id: &str) -> Result<AgentEventStream, AgentError> {
        let pending = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
            session.pending.take().map(|r| (session.directory.clone(), r))
        };

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            if let Some((directory, response)) = pending {
                let _ = tx.send(AgentEvent::MessageStart).await;

                // Stream the text in small chunks so marker detection sees
                // deltas, not one blob
                let chars: Vec<char> = response.text.chars().collect();
                for chunk in chars.chunks(16) {
                    let content: String = chunk.iter().collect();
                    if tx.send(AgentEvent::MessageDelta { content }).await.is_err() {
                        return;
                    }
                    tokio::task::yield_now().await;
                }

                MockBackend::write_response_files(&directory, &response).await;
                let _ = tx.send(AgentEvent::MessageComplete).await;
            }
            // Sender drops here, terminating the stream
        });
        Ok(rx)
    }

    async fn abort_session(&self, session_id: &str) -> Result<(), AgentError> {
        if !self.sessions.lock().await.contains_key(session_id) {
            return Err(AgentError::SessionNotFound(session_id.to_string()));
        }
        self.abort_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reply_to_permission(&self, session_id: &str, _request_id: &str, _allow: bool) -> Result<(), AgentError> {
        if !self.sessions.lock().await.contains_key(session_id) {
            return Err(AgentError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn reply_to_question(&self, session_id: &str, _request_id: &str, _answer: &str) -> Result<(), AgentError> {
        if !self.sessions.lock().await.contains_key(session_id) {
            return Err(AgentError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, AgentError> {
        Ok(self.models.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ModelRef;

    fn session_request(directory: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            title: "test".into(),
            directory: directory.into(),
            model: ModelRef::new("mock", "mock-agent"),
        }
    }

    async fn drain(mut rx: AgentEventStream) -> String {
        let mut buffer = String::new();
        while let Some(event) = rx.recv().await {
            if let AgentEvent::MessageDelta { content } = event {
                buffer.push_str(&content);
            }
        }
        buffer
    }

    #[tokio::test]
    async fn test_scripted_responses_stream_in_order() {
        let backend = MockBackend::with_texts(vec!["first response", "second <promise>COMPLETE</promise>"]);
        backend.connect().await.unwrap();

        let session = backend.create_session(session_request("/tmp")).await.unwrap();

        backend.send_prompt_async(&session.id, "go").await.unwrap();
        let rx = backend.subscribe_events(&session.id).await.unwrap();
        assert_eq!(drain(rx).await, "first response");

        backend.send_prompt_async(&session.id, "go again").await.unwrap();
        let rx = backend.subscribe_events(&session.id).await.unwrap();
        assert_eq!(drain(rx).await, "second <promise>COMPLETE</promise>");

        assert_eq!(backend.prompt_count().await, 2);
    }

    #[tokio::test]
    async fn test_exhausted_script_is_empty_response() {
        let backend = MockBackend::with_texts(vec![]);
        let session = backend.create_session(session_request("/tmp")).await.unwrap();

        backend.send_prompt_async(&session.id, "go").await.unwrap();
        let rx = backend.subscribe_events(&session.id).await.unwrap();
        assert_eq!(drain(rx).await, "");
    }

    #[tokio::test]
    async fn test_response_writes_files() {
        let temp = tempfile::tempdir().unwrap();
        let backend = MockBackend::new(vec![
            MockResponse::text("did the work").with_file("src/change.txt", "edited"),
        ]);
        let session = backend
            .create_session(session_request(temp.path().to_str().unwrap()))
            .await
            .unwrap();

        backend.send_prompt_async(&session.id, "go").await.unwrap();
        let rx = backend.subscribe_events(&session.id).await.unwrap();
        drain(rx).await;

        let written = tokio::fs::read_to_string(temp.path().join("src/change.txt")).await.unwrap();
        assert_eq!(written, "edited");
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let backend = MockBackend::with_texts(vec![]);
        let err = backend.send_prompt_async("nope", "go").await.unwrap_err();
        assert!(matches!(err, AgentError::SessionNotFound(_)));
        let err = backend.subscribe_events("nope").await.unwrap_err();
        assert!(matches!(err, AgentError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_oneshot_reply_queue() {
        let backend = MockBackend::with_texts(vec![]);
        backend.queue_oneshot_reply("A Good Loop Name").await;
        let session = backend.create_session(session_request("/tmp")).await.unwrap();

        let reply = backend.send_prompt(&session.id, "name this").await.unwrap();
        assert_eq!(reply.content, "A Good Loop Name");

        // Exhausted queue yields empty content
        let reply = backend.send_prompt(&session.id, "name again").await.unwrap();
        assert_eq!(reply.content, "");
    }

    #[tokio::test]
    async fn test_connect_failure_injection() {
        let backend = MockBackend::with_texts(vec![]);
        backend.fail_connections();
        let err = backend.connect().await.unwrap_err();
        assert!(matches!(err, AgentError::ConnectionFailed(_)));
        assert!(!backend.is_connected());
    }

    #[tokio::test]
    async fn test_abort_counts() {
        let backend = MockBackend::with_texts(vec![]);
        let session = backend.create_session(session_request("/tmp")).await.unwrap();
        backend.abort_session(&session.id).await.unwrap();
        assert_eq!(backend.abort_count(), 1);
    }
}
