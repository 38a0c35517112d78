//! Schema migration management
//!
//! Migrations are numbered, append-only and idempotent. Applied versions are
//! recorded in `schema_migrations`; running against an up-to-date database is
//! a no-op.

use rusqlite::Connection;
use tracing::{debug, info};

use super::StoreError;

/// An embedded schema migration
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// All embedded migrations, in version order
pub fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        name: "base_schema",
        sql: include_str!("../../migrations/001_base_schema.sql"),
    }]
}

/// Run pending migrations, returning how many were applied
pub fn run_migrations(conn: &mut Connection) -> Result<usize, StoreError> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<_> = all_migrations().into_iter().filter(|m| m.version > current).collect();
    debug!(current, pending = pending.len(), "run_migrations: checked versions");

    if pending.is_empty() {
        return Ok(0);
    }

    let applied = pending.len();
    for migration in pending {
        apply_migration(conn, &migration)?;
        info!(version = migration.version, name = migration.name, "Applied migration");
    }

    Ok(applied)
}

/// Highest applied migration version (0 on a fresh database)
pub fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let version = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get(0)
    })?;
    Ok(version)
}

fn ensure_migrations_table(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;
    Ok(())
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![migration.version, migration.name],
    )?;
    tx.commit()?;
    Ok(())
}
