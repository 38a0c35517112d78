//! Backend session mappings
//!
//! For each `(backend, loop_id)` pair at most one agent session is recorded,
//! so a restarted process can reattach to remote sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted backend session for a loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMapping {
    /// Backend name, e.g. `remote` or `mock`
    pub backend: String,
    pub loop_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SessionMapping {
    pub fn new(
        backend: impl Into<String>,
        loop_id: impl Into<String>,
        session_id: impl Into<String>,
        server_url: Option<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            loop_id: loop_id.into(),
            session_id: session_id.into(),
            server_url,
            created_at: Utc::now(),
        }
    }
}
