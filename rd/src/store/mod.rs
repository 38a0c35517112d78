//! Persistence store
//!
//! A single embedded SQLite database owns all durable state: workspaces,
//! loops, backend sessions, review comments and preferences. The [`Store`]
//! is a single-owner synchronous handle; async callers go through the
//! [`crate::state::StateManager`] actor.
//!
//! Every connection is configured with write-ahead journaling, a 5 second
//! busy timeout and foreign-key enforcement. Multi-statement operations run
//! inside explicit transactions.

mod migrations;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::domain::{
    Loop, LoopConfig, LoopMode, LoopState, ModelRef, ReviewComment, ReviewStatus, SessionMapping,
    Workspace,
};

pub use migrations::{Migration, all_migrations, current_version, run_migrations};

/// Database file name under the data directory
pub const DB_FILE_NAME: &str = "ralpher.db";

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique-constraint style conflicts; carries the existing row's id
    #[error("conflict: {0}")]
    Conflict(String),

    /// A dynamic column escaped the static allow-list. Programming error.
    #[error("invalid column: {0}")]
    InvalidColumn(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Static allow-list for the dynamic loop upsert. Never synthesize column
/// lists from input; every dynamic column is checked against this set.
const LOOP_COLUMNS: &[&str] = &[
    "id",
    "workspace_id",
    "name",
    "directory",
    "mode",
    "prompt",
    "stop_pattern",
    "max_iterations",
    "max_consecutive_errors",
    "activity_timeout_seconds",
    "model",
    "branch_prefix",
    "commit_scope",
    "base_branch",
    "plan_mode",
    "clear_planning_folder",
    "status",
    "state",
    "created_at",
    "updated_at",
];

fn validate_columns(columns: &[&str]) -> Result<(), StoreError> {
    for col in columns {
        if !LOOP_COLUMNS.contains(col) {
            return Err(StoreError::InvalidColumn((*col).to_string()));
        }
    }
    Ok(())
}

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_sql(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// The persistence store
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Open (or create) the database under the given data directory and run
    /// pending migrations.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(DB_FILE_NAME);
        debug!(path = %path.display(), "Store::open: opening database");

        let mut conn = Self::open_connection(&path)?;
        let applied = run_migrations(&mut conn)?;
        if applied > 0 {
            info!(applied, "Store::open: applied migrations");
        }

        Ok(Self { conn, path })
    }

    fn open_connection(path: &Path) -> Result<Connection, StoreError> {
        let conn = Connection::open(path)?;
        // journal_mode and busy_timeout report their new value back, so
        // run them as a batch that ignores returned rows
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(conn)
    }

    /// Run pending migrations, returning how many were applied
    pub fn run_migrations(&mut self) -> Result<usize, StoreError> {
        run_migrations(&mut self.conn)
    }

    /// Highest applied migration version
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        current_version(&self.conn)
    }

    // === Workspaces ===

    /// Insert a workspace. A duplicate `directory` is a conflict carrying
    /// the existing workspace's id.
    pub fn save_workspace(&self, workspace: &Workspace) -> Result<(), StoreError> {
        debug!(id = %workspace.id, directory = %workspace.directory, "save_workspace: called");
        if let Some(existing) = self.get_workspace_by_directory(&workspace.directory)? {
            if existing.id != workspace.id {
                return Err(StoreError::Conflict(existing.id));
            }
        }

        self.conn.execute(
            "INSERT INTO workspaces (id, name, directory, server_settings, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                directory = excluded.directory,
                server_settings = excluded.server_settings,
                updated_at = excluded.updated_at",
            params![
                workspace.id,
                workspace.name,
                workspace.directory,
                serde_json::to_string(&workspace.server_settings)?,
                ts_to_sql(&workspace.created_at),
                ts_to_sql(&workspace.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_workspace(&self, id: &str) -> Result<Option<Workspace>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, name, directory, server_settings, created_at, updated_at
                 FROM workspaces WHERE id = ?1",
                params![id],
                row_to_workspace,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn get_workspace_by_directory(&self, directory: &str) -> Result<Option<Workspace>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, name, directory, server_settings, created_at, updated_at
                 FROM workspaces WHERE directory = ?1",
                params![directory],
                row_to_workspace,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, directory, server_settings, created_at, updated_at
             FROM workspaces ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_workspace)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete a workspace; foreign keys cascade to its loops
    pub fn delete_workspace(&self, id: &str) -> Result<(), StoreError> {
        let changed = self.conn.execute("DELETE FROM workspaces WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("workspace {}", id)));
        }
        Ok(())
    }

    // === Loops ===

    /// Upsert a loop. Complex fields are serialized as JSON text; the
    /// dynamic column set is validated against the static allow-list.
    pub fn save_loop(&self, l: &Loop) -> Result<(), StoreError> {
        debug!(id = %l.config.id, status = %l.state.status, "save_loop: called");
        let columns: Vec<&str> = LOOP_COLUMNS.to_vec();
        validate_columns(&columns)?;

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| **c != "id" && **c != "created_at")
            .map(|c| format!("{} = excluded.{}", c, c))
            .collect();
        let sql = format!(
            "INSERT INTO loops ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
            columns.join(", "),
            placeholders.join(", "),
            updates.join(", "),
        );

        let config = &l.config;
        self.conn.execute(
            &sql,
            params![
                config.id,
                config.workspace_id,
                config.name,
                config.directory,
                config.mode.to_string(),
                config.prompt,
                config.stop_pattern,
                config.max_iterations,
                config.max_consecutive_errors,
                config.activity_timeout_seconds as i64,
                serde_json::to_string(&config.model)?,
                config.branch_prefix,
                config.commit_scope,
                config.base_branch,
                config.plan_mode,
                config.clear_planning_folder,
                l.state.status.to_string(),
                serde_json::to_string(&l.state)?,
                ts_to_sql(&config.created_at),
                ts_to_sql(&config.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_loop(&self, id: &str) -> Result<Option<Loop>, StoreError> {
        self.conn
            .query_row(&format!("{} WHERE id = ?1", LOOP_SELECT), params![id], row_to_loop)
            .optional()
            .map_err(StoreError::from)
    }

    /// All loops, newest first
    pub fn list_loops(&self) -> Result<Vec<Loop>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY created_at DESC", LOOP_SELECT))?;
        let rows = stmt.query_map([], row_to_loop)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Loops owned by a workspace, newest first
    pub fn list_loops_for_workspace(&self, workspace_id: &str) -> Result<Vec<Loop>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE workspace_id = ?1 ORDER BY created_at DESC",
            LOOP_SELECT
        ))?;
        let rows = stmt.query_map(params![workspace_id], row_to_loop)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Replace a loop's state inside a transaction (read-modify-write)
    pub fn update_loop_state(&mut self, id: &str, state: &LoopState) -> Result<(), StoreError> {
        debug!(%id, status = %state.status, "update_loop_state: called");
        let tx = self.conn.transaction()?;

        let exists: Option<String> = tx
            .query_row("SELECT id FROM loops WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("loop {}", id)));
        }

        tx.execute(
            "UPDATE loops SET state = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                serde_json::to_string(state)?,
                state.status.to_string(),
                ts_to_sql(&Utc::now()),
                id
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Physically delete a loop; sessions and review comments cascade
    pub fn delete_loop(&self, id: &str) -> Result<(), StoreError> {
        let changed = self.conn.execute("DELETE FROM loops WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("loop {}", id)));
        }
        Ok(())
    }

    // === Sessions ===

    /// Upsert a session mapping, preserving `created_at` on replacement
    pub fn set_session_mapping(
        &self,
        backend: &str,
        loop_id: &str,
        session_id: &str,
        server_url: Option<&str>,
    ) -> Result<(), StoreError> {
        debug!(%backend, %loop_id, %session_id, "set_session_mapping: called");
        self.conn.execute(
            "INSERT INTO sessions (backend, loop_id, session_id, server_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(backend, loop_id) DO UPDATE SET
                session_id = excluded.session_id,
                server_url = excluded.server_url",
            params![backend, loop_id, session_id, server_url, ts_to_sql(&Utc::now())],
        )?;
        Ok(())
    }

    pub fn get_session_mapping(&self, backend: &str, loop_id: &str) -> Result<Option<SessionMapping>, StoreError> {
        self.conn
            .query_row(
                "SELECT backend, loop_id, session_id, server_url, created_at
                 FROM sessions WHERE backend = ?1 AND loop_id = ?2",
                params![backend, loop_id],
                row_to_session,
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Transactionally replace a backend's whole session set
    pub fn save_session_mappings(
        &mut self,
        backend: &str,
        mappings: &HashMap<String, SessionMapping>,
    ) -> Result<(), StoreError> {
        debug!(%backend, count = mappings.len(), "save_session_mappings: called");
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM sessions WHERE backend = ?1", params![backend])?;
        for (loop_id, mapping) in mappings {
            tx.execute(
                "INSERT INTO sessions (backend, loop_id, session_id, server_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    backend,
                    loop_id,
                    mapping.session_id,
                    mapping.server_url,
                    ts_to_sql(&mapping.created_at)
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // === Review comments ===

    pub fn add_review_comment(&self, comment: &ReviewComment) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO review_comments (id, loop_id, review_cycle, text, status, created_at, addressed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                comment.id,
                comment.loop_id,
                comment.review_cycle,
                comment.text,
                comment.status.to_string(),
                ts_to_sql(&comment.created_at),
                comment.addressed_at.as_ref().map(ts_to_sql),
            ],
        )?;
        Ok(())
    }

    pub fn list_review_comments(&self, loop_id: &str) -> Result<Vec<ReviewComment>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, loop_id, review_cycle, text, status, created_at, addressed_at
             FROM review_comments WHERE loop_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![loop_id], row_to_review_comment)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn mark_comment_addressed(&self, id: &str) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE review_comments SET status = 'addressed', addressed_at = ?1 WHERE id = ?2",
            params![ts_to_sql(&Utc::now()), id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("review comment {}", id)));
        }
        Ok(())
    }

    // === Preferences ===

    pub fn get_preference(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.conn
            .query_row("SELECT value FROM preferences WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(StoreError::from)
    }

    pub fn set_preference(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO preferences (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // === Maintenance ===

    /// Drop all tables in dependency order and re-run migrations
    pub fn reset(&mut self) -> Result<(), StoreError> {
        warn!("reset: dropping all tables");
        self.conn.execute_batch(
            "DROP TABLE IF EXISTS review_comments;
             DROP TABLE IF EXISTS sessions;
             DROP TABLE IF EXISTS loops;
             DROP TABLE IF EXISTS workspaces;
             DROP TABLE IF EXISTS preferences;
             DROP TABLE IF EXISTS schema_migrations;",
        )?;
        run_migrations(&mut self.conn)?;
        Ok(())
    }

    /// Remove the database file plus WAL companions and reinitialize
    pub fn delete_and_reinit(&mut self) -> Result<(), StoreError> {
        warn!(path = %self.path.display(), "delete_and_reinit: removing database files");

        // The connection must be closed before the files are unlinked
        let placeholder = Connection::open_in_memory()?;
        let old = std::mem::replace(&mut self.conn, placeholder);
        old.close().map_err(|(_, e)| StoreError::Sqlite(e))?;

        for suffix in ["", "-wal", "-shm"] {
            let mut candidate = self.path.as_os_str().to_owned();
            candidate.push(suffix);
            let candidate = PathBuf::from(candidate);
            if candidate.exists() {
                std::fs::remove_file(&candidate)?;
            }
        }

        let mut conn = Self::open_connection(&self.path)?;
        run_migrations(&mut conn)?;
        self.conn = conn;
        Ok(())
    }
}

const LOOP_SELECT: &str = "SELECT id, workspace_id, name, directory, mode, prompt, stop_pattern, \
     max_iterations, max_consecutive_errors, activity_timeout_seconds, model, branch_prefix, \
     commit_scope, base_branch, plan_mode, clear_planning_folder, state, created_at, updated_at FROM loops";

fn row_to_workspace(row: &rusqlite::Row<'_>) -> rusqlite::Result<Workspace> {
    let settings_json: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(Workspace {
        id: row.get(0)?,
        name: row.get(1)?,
        directory: row.get(2)?,
        server_settings: serde_json::from_str(&settings_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e)))?,
        created_at: ts_from_sql(&created_at),
        updated_at: ts_from_sql(&updated_at),
    })
}

fn row_to_loop(row: &rusqlite::Row<'_>) -> rusqlite::Result<Loop> {
    let mode: String = row.get(4)?;
    let model_json: String = row.get(10)?;
    let state_json: String = row.get(16)?;
    let created_at: String = row.get(17)?;
    let updated_at: String = row.get(18)?;

    let model: ModelRef = serde_json::from_str(&model_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e)))?;
    let state: LoopState = serde_json::from_str(&state_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(16, rusqlite::types::Type::Text, Box::new(e)))?;

    let config = LoopConfig {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        directory: row.get(3)?,
        mode: if mode == "chat" { LoopMode::Chat } else { LoopMode::Loop },
        prompt: row.get(5)?,
        stop_pattern: row.get(6)?,
        max_iterations: row.get(7)?,
        max_consecutive_errors: row.get(8)?,
        activity_timeout_seconds: row.get::<_, i64>(9)? as u64,
        model,
        branch_prefix: row.get(11)?,
        commit_scope: row.get(12)?,
        base_branch: row.get(13)?,
        plan_mode: row.get(14)?,
        clear_planning_folder: row.get(15)?,
        created_at: ts_from_sql(&created_at),
        updated_at: ts_from_sql(&updated_at),
    };

    Ok(Loop { config, state })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionMapping> {
    let created_at: String = row.get(4)?;
    Ok(SessionMapping {
        backend: row.get(0)?,
        loop_id: row.get(1)?,
        session_id: row.get(2)?,
        server_url: row.get(3)?,
        created_at: ts_from_sql(&created_at),
    })
}

fn row_to_review_comment(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewComment> {
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let addressed_at: Option<String> = row.get(6)?;
    Ok(ReviewComment {
        id: row.get(0)?,
        loop_id: row.get(1)?,
        review_cycle: row.get(2)?,
        text: row.get(3)?,
        status: if status == "addressed" {
            ReviewStatus::Addressed
        } else {
            ReviewStatus::Pending
        },
        created_at: ts_from_sql(&created_at),
        addressed_at: addressed_at.as_deref().map(ts_from_sql),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LoopStatus, ServerSettings};
    use tempfile::tempdir;

    fn test_workspace() -> Workspace {
        Workspace::new(
            "test",
            format!("/repos/{}", uuid::Uuid::now_v7()),
            ServerSettings::Connect {
                hostname: "localhost".into(),
                port: 4096,
                https: false,
                allow_insecure: false,
            },
        )
    }

    fn open_store() -> (tempfile::TempDir, Store) {
        let temp = tempdir().unwrap();
        let store = Store::open(temp.path()).unwrap();
        (temp, store)
    }

    #[test]
    fn test_open_creates_database_file() {
        let (temp, store) = open_store();
        assert!(temp.path().join(DB_FILE_NAME).exists());
        assert_eq!(store.schema_version().unwrap(), 1);
    }

    #[test]
    fn test_workspace_crud() {
        let (_temp, store) = open_store();
        let ws = test_workspace();
        store.save_workspace(&ws).unwrap();

        let loaded = store.get_workspace(&ws.id).unwrap().unwrap();
        assert_eq!(loaded.name, "test");
        assert_eq!(loaded.directory, ws.directory);

        let by_dir = store.get_workspace_by_directory(&ws.directory).unwrap().unwrap();
        assert_eq!(by_dir.id, ws.id);

        store.delete_workspace(&ws.id).unwrap();
        assert!(store.get_workspace(&ws.id).unwrap().is_none());
    }

    #[test]
    fn test_workspace_directory_conflict() {
        let (_temp, store) = open_store();
        let ws = test_workspace();
        store.save_workspace(&ws).unwrap();

        let mut other = test_workspace();
        other.directory = ws.directory.clone();
        let err = store.save_workspace(&other).unwrap_err();
        match err {
            StoreError::Conflict(existing) => assert_eq!(existing, ws.id),
            other => panic!("expected Conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_loop_roundtrip_identity() {
        let (_temp, store) = open_store();
        let ws = test_workspace();
        store.save_workspace(&ws).unwrap();

        let config = LoopConfig::new(&ws.id, &ws.directory, "Fix the login bug in the auth module");
        let mut l = Loop::new(config, LoopStatus::Idle);
        l.state.pending_prompt = Some("also add tests".into());
        store.save_loop(&l).unwrap();

        let loaded = store.get_loop(l.id()).unwrap().unwrap();
        assert_eq!(loaded.config.name, l.config.name);
        assert_eq!(loaded.config.stop_pattern, "COMPLETE");
        assert_eq!(loaded.state.status, LoopStatus::Idle);
        assert_eq!(loaded.state.pending_prompt.as_deref(), Some("also add tests"));
    }

    #[test]
    fn test_list_loops_ordered_newest_first() {
        let (_temp, store) = open_store();
        let ws = test_workspace();
        store.save_workspace(&ws).unwrap();

        for i in 0..3 {
            let mut config = LoopConfig::new(&ws.id, &ws.directory, format!("task {}", i));
            config.created_at = Utc::now() + chrono::Duration::seconds(i);
            store.save_loop(&Loop::new(config, LoopStatus::Idle)).unwrap();
        }

        let loops = store.list_loops().unwrap();
        assert_eq!(loops.len(), 3);
        assert_eq!(loops[0].config.prompt, "task 2");
        assert_eq!(loops[2].config.prompt, "task 0");
    }

    #[test]
    fn test_update_loop_state() {
        let (_temp, mut store) = open_store();
        let ws = test_workspace();
        store.save_workspace(&ws).unwrap();

        let config = LoopConfig::new(&ws.id, &ws.directory, "task");
        let l = Loop::new(config, LoopStatus::Idle);
        store.save_loop(&l).unwrap();

        let mut state = l.state.clone();
        state.status = LoopStatus::Running;
        state.current_iteration = 3;
        store.update_loop_state(l.id(), &state).unwrap();

        let loaded = store.get_loop(l.id()).unwrap().unwrap();
        assert_eq!(loaded.state.status, LoopStatus::Running);
        assert_eq!(loaded.state.current_iteration, 3);
    }

    #[test]
    fn test_update_loop_state_not_found() {
        let (_temp, mut store) = open_store();
        let err = store.update_loop_state("missing", &LoopState::default()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_invalid_column_rejected() {
        let cols = ["id", "status; DROP TABLE loops"];
        let err = validate_columns(&cols).unwrap_err();
        assert!(matches!(err, StoreError::InvalidColumn(_)));
    }

    #[test]
    fn test_session_mapping_upsert_preserves_created_at() {
        let (_temp, store) = open_store();
        let ws = test_workspace();
        store.save_workspace(&ws).unwrap();
        let l = Loop::new(LoopConfig::new(&ws.id, &ws.directory, "task"), LoopStatus::Idle);
        store.save_loop(&l).unwrap();

        store.set_session_mapping("remote", l.id(), "sess-1", None).unwrap();
        let first = store.get_session_mapping("remote", l.id()).unwrap().unwrap();

        store
            .set_session_mapping("remote", l.id(), "sess-2", Some("http://h:1"))
            .unwrap();
        let second = store.get_session_mapping("remote", l.id()).unwrap().unwrap();

        assert_eq!(second.session_id, "sess-2");
        assert_eq!(second.server_url.as_deref(), Some("http://h:1"));
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn test_save_session_mappings_replaces_backend_set() {
        let (_temp, mut store) = open_store();
        let ws = test_workspace();
        store.save_workspace(&ws).unwrap();
        let a = Loop::new(LoopConfig::new(&ws.id, &ws.directory, "a"), LoopStatus::Idle);
        let b = Loop::new(LoopConfig::new(&ws.id, &ws.directory, "b"), LoopStatus::Idle);
        store.save_loop(&a).unwrap();
        store.save_loop(&b).unwrap();

        store.set_session_mapping("remote", a.id(), "old", None).unwrap();

        let mut mappings = HashMap::new();
        mappings.insert(
            b.id().to_string(),
            SessionMapping::new("remote", b.id(), "new-sess", None),
        );
        store.save_session_mappings("remote", &mappings).unwrap();

        assert!(store.get_session_mapping("remote", a.id()).unwrap().is_none());
        let kept = store.get_session_mapping("remote", b.id()).unwrap().unwrap();
        assert_eq!(kept.session_id, "new-sess");
    }

    #[test]
    fn test_delete_loop_cascades() {
        let (_temp, store) = open_store();
        let ws = test_workspace();
        store.save_workspace(&ws).unwrap();
        let l = Loop::new(LoopConfig::new(&ws.id, &ws.directory, "task"), LoopStatus::Idle);
        store.save_loop(&l).unwrap();

        store.set_session_mapping("remote", l.id(), "sess", None).unwrap();
        store
            .add_review_comment(&ReviewComment::new(l.id(), 0, "nit: typo"))
            .unwrap();

        store.delete_loop(l.id()).unwrap();
        assert!(store.get_loop(l.id()).unwrap().is_none());
        assert!(store.get_session_mapping("remote", l.id()).unwrap().is_none());
        assert!(store.list_review_comments(l.id()).unwrap().is_empty());
    }

    #[test]
    fn test_review_comment_lifecycle() {
        let (_temp, store) = open_store();
        let ws = test_workspace();
        store.save_workspace(&ws).unwrap();
        let l = Loop::new(LoopConfig::new(&ws.id, &ws.directory, "task"), LoopStatus::Idle);
        store.save_loop(&l).unwrap();

        let comment = ReviewComment::new(l.id(), 1, "rename this");
        store.add_review_comment(&comment).unwrap();

        store.mark_comment_addressed(&comment.id).unwrap();
        let listed = store.list_review_comments(l.id()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ReviewStatus::Addressed);
        assert!(listed[0].addressed_at.is_some());
    }

    #[test]
    fn test_preferences_roundtrip() {
        let (_temp, store) = open_store();
        assert!(store.get_preference("log_level").unwrap().is_none());
        store.set_preference("log_level", "debug").unwrap();
        store.set_preference("log_level", "warn").unwrap();
        assert_eq!(store.get_preference("log_level").unwrap().as_deref(), Some("warn"));
    }

    #[test]
    fn test_reset_clears_rows() {
        let (_temp, mut store) = open_store();
        let ws = test_workspace();
        store.save_workspace(&ws).unwrap();
        store.reset().unwrap();
        assert!(store.list_workspaces().unwrap().is_empty());
        assert_eq!(store.schema_version().unwrap(), 1);
    }

    #[test]
    fn test_delete_and_reinit_removes_files() {
        let (temp, mut store) = open_store();
        let ws = test_workspace();
        store.save_workspace(&ws).unwrap();

        store.delete_and_reinit().unwrap();
        assert!(store.list_workspaces().unwrap().is_empty());
        assert!(temp.path().join(DB_FILE_NAME).exists());
    }
}
