//! Ordered, reversible schema migrations for the pipeline database.
//!
//! Applied versions are tracked in `schema_migrations`. Every migration runs
//! in its own transaction together with its bookkeeping row, so a crash
//! leaves the schema at a well-defined version.

use anyhow::{anyhow, Context, Result};
use log::info;
use rusqlite::{params, Connection};

use crate::util::now_timestamp;

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up: &'static str,
    pub down: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_queue",
        up: "CREATE TABLE queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                iri TEXT NOT NULL,
                topic TEXT NOT NULL DEFAULT '',
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX idx_queue_topic_order ON queue (topic, created_at, id);
            CREATE INDEX idx_queue_iri ON queue (iri, topic);",
        down: "DROP TABLE queue;",
    },
    Migration {
        version: 2,
        name: "create_registry",
        up: "CREATE TABLE registry (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                iri TEXT NOT NULL,
                topic TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (iri, topic)
            );
            CREATE INDEX idx_registry_topic ON registry (topic);",
        down: "DROP TABLE registry;",
    },
    Migration {
        version: 3,
        name: "create_runs",
        up: "CREATE TABLE runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identifier TEXT,
                started_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        down: "DROP TABLE runs;",
    },
];

pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

fn ensure_bookkeeping(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )
    .context("Failed to create schema_migrations table")
}

/// Highest applied migration version, or 0 for a fresh database.
pub fn current_version(conn: &Connection) -> Result<u32> {
    ensure_bookkeeping(conn)?;
    let version: Option<u32> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })?;
    Ok(version.unwrap_or(0))
}

/// Applies every pending migration in order and returns the versions applied.
pub fn migrate_to_latest(conn: &mut Connection) -> Result<Vec<u32>> {
    let current = current_version(conn)?;
    let mut applied = Vec::new();
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.up)
            .with_context(|| format!("Migration {} ({}) failed", migration.version, migration.name))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![migration.version, migration.name, now_timestamp()],
        )?;
        tx.commit()?;
        info!("Applied migration {} ({})", migration.version, migration.name);
        applied.push(migration.version);
    }
    Ok(applied)
}

/// Reverts applied migrations, newest first, until the schema is at `target`.
/// Returns the versions reverted.
pub fn migrate_down_to(conn: &mut Connection, target: u32) -> Result<Vec<u32>> {
    let current = current_version(conn)?;
    if target > current {
        return Err(anyhow!(
            "Cannot migrate down to version {target}: schema is at version {current}"
        ));
    }
    let mut reverted = Vec::new();
    for migration in MIGRATIONS
        .iter()
        .rev()
        .filter(|m| m.version > target && m.version <= current)
    {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.down).with_context(|| {
            format!(
                "Reverting migration {} ({}) failed",
                migration.version, migration.name
            )
        })?;
        tx.execute(
            "DELETE FROM schema_migrations WHERE version = ?1",
            params![migration.version],
        )?;
        tx.commit()?;
        info!("Reverted migration {} ({})", migration.version, migration.name);
        reverted.push(migration.version);
    }
    Ok(reverted)
}
