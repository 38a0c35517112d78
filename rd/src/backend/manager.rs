//! Backend manager - per-workspace agent connection pool
//!
//! One backend instance per workspace, built from its server settings and
//! kept alive until the workspace is deleted or reset. Spawn-mode launches
//! the agent locally and connects to it on localhost; connect-mode dials an
//! already-running server. Connection attempts are bounded by a timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentBackend, AgentError, RemoteBackend};
use crate::domain::{ModelRef, ServerSettings, Workspace};
use crate::exec::{CommandExecutor, LocalExecutor};

/// Default timeout for backend connection attempts
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Backend manager errors
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("spawn-mode workspaces are disabled (remote-only)")]
    RemoteOnly,

    #[error("failed to spawn agent: {0}")]
    SpawnFailed(String),

    #[error("connection timed out")]
    ConnectionTimeout,

    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Outcome of a remote directory validation probe
#[derive(Debug, Clone)]
pub struct DirectoryValidation {
    pub success: bool,
    pub error: Option<String>,
}

impl DirectoryValidation {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Owns the map of workspace backends
pub struct BackendManager {
    backends: Mutex<HashMap<String, Arc<dyn AgentBackend>>>,
    spawned: Mutex<HashMap<String, Child>>,
    executor: Arc<dyn CommandExecutor>,
    connect_timeout: Duration,
    remote_only: bool,
    cancel: CancellationToken,
}

impl BackendManager {
    pub fn new(remote_only: bool) -> Self {
        Self {
            backends: Mutex::new(HashMap::new()),
            spawned: Mutex::new(HashMap::new()),
            executor: Arc::new(LocalExecutor::new()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            remote_only,
            cancel: CancellationToken::new(),
        }
    }

    /// Shorter timeouts for tests
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the executor used for directory probes
    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Pre-register a backend for a workspace (mock injection, tests)
    pub async fn register(&self, workspace_id: &str, backend: Arc<dyn AgentBackend>) {
        debug!(%workspace_id, backend = backend.name(), "register: called");
        self.backends.lock().await.insert(workspace_id.to_string(), backend);
    }

    /// Get the workspace's backend, building and connecting it on first use
    pub async fn get_or_create(&self, workspace: &Workspace) -> Result<Arc<dyn AgentBackend>, BackendError> {
        if let Some(existing) = self.backends.lock().await.get(&workspace.id) {
            return Ok(existing.clone());
        }

        debug!(workspace_id = %workspace.id, "get_or_create: building backend");
        let backend = self.build_backend(workspace).await?;
        self.connect_with_timeout(backend.as_ref()).await?;

        self.backends
            .lock()
            .await
            .insert(workspace.id.clone(), backend.clone());
        info!(workspace_id = %workspace.id, backend = backend.name(), "Backend connected");
        Ok(backend)
    }

    async fn build_backend(&self, workspace: &Workspace) -> Result<Arc<dyn AgentBackend>, BackendError> {
        match &workspace.server_settings {
            ServerSettings::Spawn { command, port } => {
                if self.remote_only {
                    return Err(BackendError::RemoteOnly);
                }
                self.spawn_agent(&workspace.id, command, *port).await?;
                let backend = RemoteBackend::from_settings(&workspace.server_settings)?;
                Ok(Arc::new(backend))
            }
            ServerSettings::Connect { .. } => {
                let backend = RemoteBackend::from_settings(&workspace.server_settings)?;
                Ok(Arc::new(backend))
            }
        }
    }

    async fn spawn_agent(&self, workspace_id: &str, command: &str, port: u16) -> Result<(), BackendError> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| BackendError::SpawnFailed("empty spawn command".into()))?;

        debug!(%workspace_id, %program, port, "spawn_agent: launching local agent");
        let child = Command::new(program)
            .args(parts)
            .arg("--port")
            .arg(port.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::SpawnFailed(e.to_string()))?;

        self.spawned.lock().await.insert(workspace_id.to_string(), child);
        Ok(())
    }

    /// Connect a backend, bounded by the configured timeout and the
    /// manager-wide cancellation token
    async fn connect_with_timeout(&self, backend: &dyn AgentBackend) -> Result<(), BackendError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(BackendError::ConnectionTimeout),
            result = tokio::time::timeout(self.connect_timeout, backend.connect()) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(BackendError::Agent(e)),
                Err(_) => Err(BackendError::ConnectionTimeout),
            },
        }
    }

    /// Drop a workspace's backend, disconnecting it and killing a spawned
    /// agent process if one exists
    pub async fn reset(&self, workspace_id: &str) {
        debug!(%workspace_id, "reset: called");
        if let Some(backend) = self.backends.lock().await.remove(workspace_id) {
            let _ = backend.disconnect().await;
        }
        if let Some(mut child) = self.spawned.lock().await.remove(workspace_id) {
            if let Err(e) = child.start_kill() {
                warn!(%workspace_id, error = %e, "reset: failed to kill spawned agent");
            }
        }
    }

    /// Validate that a model is available and enabled on the workspace's
    /// backend. Runs before any status check on model-changing operations.
    pub async fn validate_model(&self, workspace: &Workspace, model: &ModelRef) -> Result<(), BackendError> {
        let backend = self.get_or_create(workspace).await?;
        let models = backend.list_models().await?;

        let provider_models: Vec<_> = models.iter().filter(|m| m.provider_id == model.provider_id).collect();
        if provider_models.is_empty() {
            return Err(BackendError::Agent(AgentError::ProviderNotFound(
                model.provider_id.clone(),
            )));
        }

        let found = provider_models.iter().find(|m| m.model_id == model.model_id);
        match found {
            None => Err(BackendError::Agent(AgentError::ModelNotFound(model.model_id.clone()))),
            Some(info) if !info.connected => {
                Err(BackendError::Agent(AgentError::ModelNotEnabled(model.model_id.clone())))
            }
            Some(_) => Ok(()),
        }
    }

    /// Probe a remote workspace directory: connect, then `directory_exists`.
    /// Never hangs; timeout, refused connection and missing directory all
    /// come back as `{success: false, error}`.
    pub async fn validate_remote_directory(&self, settings: &ServerSettings, dir: &str) -> DirectoryValidation {
        let backend = match RemoteBackend::from_settings(settings) {
            Ok(backend) => backend,
            Err(e) => return DirectoryValidation::fail(e.to_string()),
        };

        let probe = async {
            backend.connect().await?;
            Ok::<(), AgentError>(())
        };
        match tokio::time::timeout(self.connect_timeout, probe).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return DirectoryValidation::fail(e.to_string()),
            Err(_) => return DirectoryValidation::fail("connection timed out"),
        }

        match tokio::time::timeout(self.connect_timeout, self.executor.directory_exists(dir)).await {
            Ok(Ok(true)) => DirectoryValidation::ok(),
            Ok(Ok(false)) => DirectoryValidation::fail(format!("directory does not exist: {}", dir)),
            Ok(Err(e)) => DirectoryValidation::fail(e.to_string()),
            Err(_) => DirectoryValidation::fail("directory probe timed out"),
        }
    }

    /// Cancel in-flight connection attempts and kill spawned agents
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let ids: Vec<String> = self.backends.lock().await.keys().cloned().collect();
        for id in ids {
            self.reset(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{MockBackend, ModelInfo};
    use crate::domain::Workspace;

    fn connect_workspace(port: u16) -> Workspace {
        Workspace::new(
            "ws",
            format!("/repos/{}", uuid::Uuid::now_v7()),
            ServerSettings::Connect {
                hostname: "127.0.0.1".into(),
                port,
                https: false,
                allow_insecure: false,
            },
        )
    }

    #[tokio::test]
    async fn test_registered_backend_is_reused() {
        let manager = BackendManager::new(false);
        let ws = connect_workspace(1);
        let mock = MockBackend::with_texts(vec![]);
        mock.connect().await.unwrap();
        manager.register(&ws.id, mock.clone()).await;

        let backend = manager.get_or_create(&ws).await.unwrap();
        assert_eq!(backend.name(), "mock");
    }

    #[tokio::test]
    async fn test_connect_refused_surfaces_error() {
        let manager = BackendManager::new(false).with_connect_timeout(Duration::from_secs(2));
        let ws = connect_workspace(1);

        let err = match manager.get_or_create(&ws).await {
            Err(e) => e,
            Ok(_) => panic!("expected get_or_create to fail"),
        };
        assert!(matches!(
            err,
            BackendError::Agent(AgentError::ConnectionFailed(_)) | BackendError::ConnectionTimeout
        ));
    }

    #[tokio::test]
    async fn test_remote_only_rejects_spawn() {
        let manager = BackendManager::new(true);
        let ws = Workspace::new(
            "ws",
            "/repos/spawny",
            ServerSettings::Spawn {
                command: "agent serve".into(),
                port: 4911,
            },
        );

        let err = match manager.get_or_create(&ws).await {
            Err(e) => e,
            Ok(_) => panic!("expected get_or_create to fail"),
        };
        assert!(matches!(err, BackendError::RemoteOnly));
    }

    #[tokio::test]
    async fn test_validate_model_paths() {
        let manager = BackendManager::new(false);
        let ws = connect_workspace(1);
        let mock = MockBackend::with_texts(vec![]);
        mock.connect().await.unwrap();
        mock.set_models(vec![
            ModelInfo {
                provider_id: "anthropic".into(),
                provider_name: "Anthropic".into(),
                model_id: "claude-sonnet".into(),
                model_name: "Claude Sonnet".into(),
                connected: true,
            },
            ModelInfo {
                provider_id: "anthropic".into(),
                provider_name: "Anthropic".into(),
                model_id: "claude-haiku".into(),
                model_name: "Claude Haiku".into(),
                connected: false,
            },
        ])
        .await;
        manager.register(&ws.id, mock).await;

        // Enabled model passes
        manager
            .validate_model(&ws, &ModelRef::new("anthropic", "claude-sonnet"))
            .await
            .unwrap();

        // Disabled model
        let err = manager
            .validate_model(&ws, &ModelRef::new("anthropic", "claude-haiku"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Agent(AgentError::ModelNotEnabled(_))));

        // Unknown model under a known provider
        let err = manager
            .validate_model(&ws, &ModelRef::new("anthropic", "claude-nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Agent(AgentError::ModelNotFound(_))));

        // Unknown provider
        let err = manager
            .validate_model(&ws, &ModelRef::new("openai", "gpt"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Agent(AgentError::ProviderNotFound(_))));
    }

    #[tokio::test]
    async fn test_validate_remote_directory_refused_never_hangs() {
        let manager = BackendManager::new(false).with_connect_timeout(Duration::from_secs(2));
        let settings = ServerSettings::Connect {
            hostname: "127.0.0.1".into(),
            port: 1,
            https: false,
            allow_insecure: false,
        };

        let result = manager.validate_remote_directory(&settings, "/tmp").await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_reset_drops_backend() {
        let manager = BackendManager::new(false);
        let ws = connect_workspace(1);
        let mock = MockBackend::with_texts(vec![]);
        mock.connect().await.unwrap();
        manager.register(&ws.id, mock.clone()).await;

        manager.reset(&ws.id).await;
        assert!(!mock.is_connected());
    }
}
