//! Command executor capability abstraction
//!
//! Everything that touches a filesystem or runs a process goes through a
//! [`CommandExecutor`], so git and directory probes work identically against
//! the local machine and a remote shell.

mod local;
mod remote;

use std::path::Path;

use async_trait::async_trait;

pub use local::LocalExecutor;
pub use remote::{RemoteShellExecutor, extract_marked_output};

/// Result of one command execution
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
}

impl ExecResult {
    /// The failure shape used when marker extraction comes back empty
    pub fn failed_empty() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            success: false,
        }
    }
}

/// Executor errors. Non-zero exits are not errors; they come back as
/// `ExecResult { success: false }`.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("remote shell session closed")]
    SessionClosed,

    #[error("command timed out after {0} seconds")]
    Timeout(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability set shared by the local and remote executors
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command, capturing output. Non-zero exit is reported via
    /// `success = false`, never as an error.
    async fn exec(&self, cmd: &str, args: &[&str], cwd: Option<&Path>) -> Result<ExecResult, ExecError>;

    async fn file_exists(&self, path: &str) -> Result<bool, ExecError>;

    async fn directory_exists(&self, path: &str) -> Result<bool, ExecError>;

    /// Read a file, `None` when it does not exist or cannot be read
    async fn read_file(&self, path: &str) -> Result<Option<String>, ExecError>;

    async fn list_directory(&self, path: &str) -> Result<Vec<String>, ExecError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), ExecError>;
}
