//! Durable record of the IRIs currently mirrored, per topic.

use anyhow::Result;
use rusqlite::{params, Row};
use serde::Serialize;
use std::sync::Arc;

use crate::datastore::{topic_column, topic_from_column, Datastore};
use crate::util::now_timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryItem {
    pub id: i64,
    pub iri: String,
    pub topic: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl RegistryItem {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            iri: row.get("iri")?,
            topic: topic_from_column(row.get("topic")?),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    store: Arc<Datastore>,
}

impl Registry {
    pub fn new(store: Arc<Datastore>) -> Self {
        Self { store }
    }

    /// Inserts `(iri, topic)` or, if it exists, refreshes its `updated_at`.
    pub fn save(&self, iri: &str, topic: Option<&str>) -> Result<RegistryItem> {
        self.store.with_connection(|conn| {
            let now = now_timestamp();
            let item = conn.query_row(
                "INSERT INTO registry (iri, topic, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT (iri, topic) DO UPDATE SET updated_at = excluded.updated_at
                 RETURNING id, iri, topic, created_at, updated_at",
                params![iri, topic_column(topic), now],
                RegistryItem::from_row,
            )?;
            Ok(item)
        })
    }

    pub fn get_all(&self, topic: Option<&str>) -> Result<Vec<RegistryItem>> {
        self.store.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, iri, topic, created_at, updated_at FROM registry
                 WHERE (?1 IS NULL OR topic = ?1)
                 ORDER BY id ASC",
            )?;
            let items = stmt
                .query_map(params![topic], RegistryItem::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(items)
        })
    }

    pub fn size(&self, topic: Option<&str>) -> Result<usize> {
        self.store.with_connection(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM registry WHERE (?1 IS NULL OR topic = ?1)",
                params![topic],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    /// Deletes and returns every registry row of `topic` whose IRI is not
    /// queued under the same topic.
    ///
    /// An empty queue removes every row of the topic, so this must only run
    /// right after a discovery pass has repopulated the queue.
    pub fn remove_obsolete(&self, topic: Option<&str>) -> Result<Vec<RegistryItem>> {
        self.store.with_connection(|conn| {
            let tx = conn.transaction()?;
            let removed = {
                let mut stmt = tx.prepare(
                    "SELECT id, iri, topic, created_at, updated_at FROM registry
                     WHERE (?1 IS NULL OR topic = ?1)
                       AND iri NOT IN (SELECT iri FROM queue WHERE (?1 IS NULL OR topic = ?1))
                     ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map(params![topic], RegistryItem::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            {
                let mut delete = tx.prepare("DELETE FROM registry WHERE id = ?1")?;
                for item in &removed {
                    delete.execute(params![item.id])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
    }
}
