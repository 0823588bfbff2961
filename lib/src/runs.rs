//! Metadata about the last discovery cycle.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;

use crate::datastore::Datastore;
use crate::util::now_timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunItem {
    pub id: i64,
    /// Dataset version reported by the change query, if one is configured.
    pub identifier: Option<String>,
    pub started_at: String,
    pub created_at: String,
    pub updated_at: String,
}

impl RunItem {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            identifier: row.get("identifier")?,
            started_at: row.get("started_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Keeps at most one row: saving a run replaces the previous one.
#[derive(Debug, Clone)]
pub struct RunLog {
    store: Arc<Datastore>,
}

impl RunLog {
    pub fn new(store: Arc<Datastore>) -> Self {
        Self { store }
    }

    pub fn save(&self, identifier: Option<&str>) -> Result<RunItem> {
        self.store.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM runs", [])?;
            let now = now_timestamp();
            let item = tx.query_row(
                "INSERT INTO runs (identifier, started_at, created_at, updated_at)
                 VALUES (?1, ?2, ?2, ?2)
                 RETURNING id, identifier, started_at, created_at, updated_at",
                params![identifier, now],
                RunItem::from_row,
            )?;
            tx.commit()?;
            Ok(item)
        })
    }

    pub fn last(&self) -> Result<Option<RunItem>> {
        self.store.with_connection(|conn| {
            let item = conn
                .query_row(
                    "SELECT id, identifier, started_at, created_at, updated_at FROM runs
                     ORDER BY id DESC LIMIT 1",
                    [],
                    RunItem::from_row,
                )
                .optional()?;
            Ok(item)
        })
    }
}
