//! The SQLite database shared by the work queue, the registry and the run log.

use anyhow::{anyhow, Context, Result};
use log::debug;
use rusqlite::{Connection, OpenFlags};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::consts::DEFAULT_BUSY_TIMEOUT;
use crate::migrations;

/// One SQLite connection behind a mutex. Every queue, registry and run-log
/// operation is a single statement or a single transaction on it.
#[derive(Debug)]
pub struct Datastore {
    path: Option<PathBuf>,
    connection: Mutex<Connection>,
}

impl Datastore {
    /// Opens (creating if needed) the database at `path` and applies pending migrations.
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let store = Self::connect(path)?;
        store.migrate_to_latest()?;
        Ok(store)
    }

    /// Opens the database without touching its schema.
    pub fn connect(path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let connection = Connection::open_with_flags(path, flags)
            .with_context(|| format!("Failed to open datastore {}", path.display()))?;
        apply_pragmas(&connection, DEFAULT_BUSY_TIMEOUT)?;
        debug!("Opened datastore {}", path.display());
        Ok(Arc::new(Self {
            path: Some(path.to_path_buf()),
            connection: Mutex::new(connection),
        }))
    }

    /// A migrated in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Arc<Self>> {
        let connection = Connection::open_in_memory()?;
        let store = Arc::new(Self {
            path: None,
            connection: Mutex::new(connection),
        });
        store.migrate_to_latest()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs `f` with exclusive access to the connection.
    pub fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| anyhow!("Datastore connection mutex poisoned"))?;
        f(&mut guard)
    }

    pub fn migrate_to_latest(&self) -> Result<Vec<u32>> {
        self.with_connection(migrations::migrate_to_latest)
    }

    pub fn migrate_down_to(&self, version: u32) -> Result<Vec<u32>> {
        self.with_connection(|conn| migrations::migrate_down_to(conn, version))
    }

    pub fn schema_version(&self) -> Result<u32> {
        self.with_connection(|conn| migrations::current_version(conn))
    }
}

fn apply_pragmas(connection: &Connection, busy_timeout: Duration) -> Result<()> {
    let mode: String =
        connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!("SQLite journal mode: {mode}");
    connection.pragma_update(None, "synchronous", "NORMAL")?;
    connection.busy_timeout(busy_timeout)?;
    Ok(())
}

/// Column value for an optional topic; "no topic" is stored as the empty string.
pub(crate) fn topic_column(topic: Option<&str>) -> &str {
    topic.unwrap_or("")
}

pub(crate) fn topic_from_column(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
