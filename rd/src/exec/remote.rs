//! Remote executor over a persistent marker-framed shell
//!
//! A single shell session (typically `ssh host` with a PTY on the far end)
//! is kept open; each command is wrapped between unique `__START_<uuid>__`
//! and `__END_<uuid>__:<exit>` markers echoed to stdout. A PTY echoes the
//! command line itself before running it, so the echo contains both marker
//! strings too. Extraction must take the *last* occurrence of each marker,
//! never the first.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{CommandExecutor, ExecError, ExecResult};

/// Default per-command timeout (seconds)
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;

struct ShellSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Executor that pipes commands through one persistent remote shell
pub struct RemoteShellExecutor {
    session: Mutex<ShellSession>,
    command_timeout: Duration,
}

impl RemoteShellExecutor {
    /// Spawn the shell transport (e.g. `ssh user@host` or plain `sh`) and
    /// keep it open for the lifetime of the executor.
    pub async fn connect(shell_cmd: &str, shell_args: &[&str]) -> Result<Self, ExecError> {
        debug!(%shell_cmd, ?shell_args, "RemoteShellExecutor::connect: spawning shell");
        let mut child = Command::new(shell_cmd)
            .args(shell_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                command: shell_cmd.to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(ExecError::SessionClosed)?;
        let stdout = child.stdout.take().ok_or(ExecError::SessionClosed)?;

        Ok(Self {
            session: Mutex::new(ShellSession {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            }),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        })
    }

    /// Override the per-command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Close the shell session
    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        let _ = session.child.start_kill();
    }

    /// Run one raw shell line through the framed session
    async fn run_raw(&self, command: &str) -> Result<ExecResult, ExecError> {
        let id = Uuid::now_v7().simple().to_string();
        let start_marker = format!("__START_{}__", id);
        let end_marker = format!("__END_{}__", id);
        debug!(%start_marker, "run_raw: sending framed command");

        let framed = format!(
            "echo \"{start}\"; {{ {cmd} ; }} 2>&1; echo \"{end}:$?\"\n",
            start = start_marker,
            cmd = command,
            end = end_marker,
        );

        let mut session = self.session.lock().await;
        session.stdin.write_all(framed.as_bytes()).await?;
        session.stdin.flush().await?;

        let mut raw = String::new();
        let timeout_secs = self.command_timeout.as_secs();
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(self.command_timeout, session.stdout.read_line(&mut line))
                .await
                .map_err(|_| ExecError::Timeout(timeout_secs))??;
            if read == 0 {
                warn!("run_raw: shell session closed mid-command");
                return Err(ExecError::SessionClosed);
            }
            raw.push_str(&line);

            // The echoed command line carries the literal `:$?`; only a real
            // end marker is followed by a numeric exit code.
            if has_terminal_end_marker(&raw, &end_marker) {
                break;
            }
        }
        drop(session);

        match extract_marked_output(&raw, &start_marker, &end_marker) {
            Some((stdout, exit_code)) => Ok(ExecResult {
                stdout,
                stderr: String::new(),
                exit_code,
                success: exit_code == 0,
            }),
            None => {
                debug!("run_raw: marker extraction came back empty");
                Ok(ExecResult::failed_empty())
            }
        }
    }

    fn shell_quote(value: &str) -> String {
        format!("'{}'", value.replace('\'', "'\\''"))
    }
}

/// True when `raw` holds an end marker followed by a parseable exit code
fn has_terminal_end_marker(raw: &str, end_marker: &str) -> bool {
    let mut search = raw;
    while let Some(idx) = search.rfind(end_marker) {
        let after = &search[idx + end_marker.len()..];
        if let Some(rest) = after.strip_prefix(':') {
            let code: String = rest.chars().take_while(|c| c.is_ascii_digit() || *c == '-').collect();
            if !code.is_empty() && rest.len() > code.len() {
                // exit code terminated by newline/CR
                return true;
            }
        }
        search = &search[..idx];
    }
    false
}

/// Recover `(stdout, exit_code)` from marker-framed raw output.
///
/// Takes the **last** occurrence of the end marker and the last occurrence
/// of the start marker before it; the first occurrences are the terminal's
/// echo of the command line. Tolerates both `\n` and `\r\n` line endings.
/// Returns `None` when either marker is missing or the exit code is absent.
pub fn extract_marked_output(raw: &str, start_marker: &str, end_marker: &str) -> Option<(String, i32)> {
    // Last end marker with a numeric exit code
    let mut end_idx = None;
    let mut exit_code = None;
    let mut search = raw;
    while let Some(idx) = search.rfind(end_marker) {
        let after = &search[idx + end_marker.len()..];
        if let Some(rest) = after.strip_prefix(':') {
            let code: String = rest.chars().take_while(|c| c.is_ascii_digit() || *c == '-').collect();
            if let Ok(parsed) = code.parse::<i32>() {
                end_idx = Some(idx);
                exit_code = Some(parsed);
                break;
            }
        }
        search = &search[..idx];
    }
    let end_idx = end_idx?;
    let exit_code = exit_code?;

    // Last start marker before the end marker
    let start_idx = raw[..end_idx].rfind(start_marker)?;
    let after_start = &raw[start_idx + start_marker.len()..end_idx];

    // Content begins after the start marker's own line ending, with or
    // without a carriage return
    let content = match after_start.find('\n') {
        Some(nl) => &after_start[nl + 1..],
        None => after_start,
    };
    let content = content.trim_end_matches(['\n', '\r']).trim_start_matches('\r');

    Some((content.to_string(), exit_code))
}

#[async_trait]
impl CommandExecutor for RemoteShellExecutor {
    async fn exec(&self, cmd: &str, args: &[&str], cwd: Option<&Path>) -> Result<ExecResult, ExecError> {
        let mut line = String::new();
        if let Some(dir) = cwd {
            line.push_str(&format!("cd {} && ", Self::shell_quote(&dir.to_string_lossy())));
        }
        line.push_str(cmd);
        for arg in args {
            line.push(' ');
            line.push_str(&Self::shell_quote(arg));
        }
        self.run_raw(&line).await
    }

    async fn file_exists(&self, path: &str) -> Result<bool, ExecError> {
        let result = self
            .run_raw(&format!("test -f {}", Self::shell_quote(path)))
            .await?;
        Ok(result.success)
    }

    async fn directory_exists(&self, path: &str) -> Result<bool, ExecError> {
        let result = self
            .run_raw(&format!("test -d {}", Self::shell_quote(path)))
            .await?;
        Ok(result.success)
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>, ExecError> {
        let result = self.run_raw(&format!("cat {}", Self::shell_quote(path))).await?;
        if result.success {
            Ok(Some(result.stdout))
        } else {
            Ok(None)
        }
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<String>, ExecError> {
        let result = self.run_raw(&format!("ls -1 {}", Self::shell_quote(path))).await?;
        if !result.success {
            return Ok(Vec::new());
        }
        Ok(result
            .stdout
            .lines()
            .map(|l| l.trim_end_matches('\r').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), ExecError> {
        // printf keeps the whole command on one line, which the marker
        // framing requires
        let quoted = Self::shell_quote(path);
        let escaped = Self::shell_quote(content);
        let result = self
            .run_raw(&format!(
                "mkdir -p \"$(dirname {quoted})\" && printf '%s' {escaped} > {quoted}"
            ))
            .await?;
        if !result.success {
            return Err(ExecError::Io(std::io::Error::other(format!(
                "remote write failed with exit code {}",
                result.exit_code
            ))));
        }
        Ok(())
    }
}
