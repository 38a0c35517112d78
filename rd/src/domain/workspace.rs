//! Workspace domain type
//!
//! A workspace binds a repository directory to agent server settings. One
//! workspace owns many loops; `directory` is unique across workspaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::new_loop_id;

/// How the workspace reaches its agent server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ServerSettings {
    /// Launch the agent locally and connect to it on localhost
    Spawn {
        /// Command used to launch the agent
        command: String,
        /// Port the spawned agent listens on
        port: u16,
    },
    /// Reach an already-running agent over the network
    Connect {
        hostname: String,
        port: u16,
        #[serde(default)]
        https: bool,
        /// Accept invalid TLS certificates (https only)
        #[serde(default)]
        allow_insecure: bool,
    },
}

impl ServerSettings {
    /// Base URL the HTTP transport dials
    pub fn base_url(&self) -> String {
        match self {
            Self::Spawn { port, .. } => format!("http://127.0.0.1:{}", port),
            Self::Connect {
                hostname, port, https, ..
            } => {
                let scheme = if *https { "https" } else { "http" };
                format!("{}://{}:{}", scheme, hostname, port)
            }
        }
    }

    pub fn is_spawn(&self) -> bool {
        matches!(self, Self::Spawn { .. })
    }
}

/// A workspace record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    /// Repository directory; unique across workspaces
    pub directory: String,
    pub server_settings: ServerSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(name: impl Into<String>, directory: impl Into<String>, server_settings: ServerSettings) -> Self {
        let now = Utc::now();
        Self {
            id: new_loop_id(),
            name: name.into(),
            directory: directory.into(),
            server_settings,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_server_settings(&mut self, settings: ServerSettings) {
        self.server_settings = settings;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_connect() {
        let s = ServerSettings::Connect {
            hostname: "agent.example".into(),
            port: 4096,
            https: true,
            allow_insecure: false,
        };
        assert_eq!(s.base_url(), "https://agent.example:4096");
    }

    #[test]
    fn test_base_url_spawn() {
        let s = ServerSettings::Spawn {
            command: "opencode serve".into(),
            port: 4911,
        };
        assert_eq!(s.base_url(), "http://127.0.0.1:4911");
        assert!(s.is_spawn());
    }

    #[test]
    fn test_server_settings_tagged_serde() {
        let s = ServerSettings::Connect {
            hostname: "h".into(),
            port: 1,
            https: false,
            allow_insecure: false,
        };
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"mode\":\"connect\""));
        let back: ServerSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
