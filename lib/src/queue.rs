//! Durable FIFO of IRIs waiting to be fetched.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::sync::Arc;

use crate::consts::DEFAULT_MAX_RETRY_COUNT;
use crate::datastore::{topic_column, topic_from_column, Datastore};
use crate::errors::RetryExhaustedError;
use crate::util::now_timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueItem {
    pub id: i64,
    pub iri: String,
    pub topic: Option<String>,
    pub retry_count: u32,
    pub created_at: String,
    pub updated_at: String,
}

impl QueueItem {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            iri: row.get("iri")?,
            topic: topic_from_column(row.get("topic")?),
            retry_count: row.get("retry_count")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Items come back in insertion order within a topic. `topic = None` on the
/// read side means "every topic".
#[derive(Debug, Clone)]
pub struct WorkQueue {
    store: Arc<Datastore>,
    max_retry_count: u32,
}

impl WorkQueue {
    pub fn new(store: Arc<Datastore>) -> Self {
        Self::with_max_retry_count(store, DEFAULT_MAX_RETRY_COUNT)
    }

    pub fn with_max_retry_count(store: Arc<Datastore>, max_retry_count: u32) -> Self {
        Self {
            store,
            max_retry_count,
        }
    }

    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    /// Appends an item. Duplicate IRIs are accepted.
    pub fn push(&self, iri: &str, topic: Option<&str>) -> Result<QueueItem> {
        self.push_with_retry_count(iri, topic, 0)
    }

    pub fn push_with_retry_count(
        &self,
        iri: &str,
        topic: Option<&str>,
        retry_count: u32,
    ) -> Result<QueueItem> {
        self.store
            .with_connection(|conn| insert(conn, iri, topic, retry_count))
    }

    /// Removes the item with `id`; removing a missing item is not an error.
    pub fn remove(&self, id: i64) -> Result<()> {
        self.store.with_connection(|conn| {
            conn.execute("DELETE FROM queue WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    /// Removes `item` and, unless its retry budget is used up, appends it again
    /// with `retry_count + 1`. Both steps commit together.
    pub fn retry(&self, item: &QueueItem) -> Result<QueueItem> {
        let max_retry_count = self.max_retry_count;
        self.store.with_connection(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM queue WHERE id = ?1", params![item.id])?;
            let retry_count = item.retry_count + 1;
            if retry_count > max_retry_count {
                tx.commit()?;
                return Err(anyhow!(RetryExhaustedError {
                    iri: item.iri.clone(),
                    max_retry_count,
                }));
            }
            let pushed = insert(&tx, &item.iri, item.topic.as_deref(), retry_count)?;
            tx.commit()?;
            Ok(pushed)
        })
    }

    /// Up to `limit` items, oldest first.
    pub fn get_all(&self, topic: Option<&str>, limit: Option<usize>) -> Result<Vec<QueueItem>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.store.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, iri, topic, retry_count, created_at, updated_at FROM queue
                 WHERE (?1 IS NULL OR topic = ?1)
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?2",
            )?;
            let items = stmt
                .query_map(params![topic, limit], QueueItem::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(items)
        })
    }

    pub fn size(&self, topic: Option<&str>) -> Result<usize> {
        self.store.with_connection(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM queue WHERE (?1 IS NULL OR topic = ?1)",
                params![topic],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    pub fn is_empty(&self, topic: Option<&str>) -> Result<bool> {
        Ok(self.size(topic)? == 0)
    }
}

fn insert(conn: &Connection, iri: &str, topic: Option<&str>, retry_count: u32) -> Result<QueueItem> {
    let now = now_timestamp();
    let item = conn.query_row(
        "INSERT INTO queue (iri, topic, retry_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         RETURNING id, iri, topic, retry_count, created_at, updated_at",
        params![iri, topic_column(topic), retry_count, now],
        QueueItem::from_row,
    )?;
    Ok(item)
}
