//! Local subprocess executor

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{CommandExecutor, ExecError, ExecResult};

/// Executor that invokes subprocesses directly on this machine
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn exec(&self, cmd: &str, args: &[&str], cwd: Option<&Path>) -> Result<ExecResult, ExecError> {
        debug!(%cmd, ?args, ?cwd, "LocalExecutor::exec: called");
        let mut command = Command::new(cmd);
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = command.output().await.map_err(|source| ExecError::Spawn {
            command: cmd.to_string(),
            source,
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code,
            success: output.status.success(),
        })
    }

    async fn file_exists(&self, path: &str) -> Result<bool, ExecError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(_) => Ok(false),
        }
    }

    async fn directory_exists(&self, path: &str) -> Result<bool, ExecError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(_) => Ok(false),
        }
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>, ExecError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(_) => Ok(None),
        }
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<String>, ExecError> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), ExecError> {
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}
