use std::sync::Arc;

use chrono::Utc;
use rusqlite::{TransactionBehavior, params};
use serde_json::{Map, Value};
use tracing::debug;

use super::{Store, to_millis};
use crate::error::Result;

/// Transient key/value rows an external process writes for a job.
///
/// The engine drains them into the job's context the next time it looks,
/// so each row is absorbed exactly once. When the same key was written more
/// than once, the latest write wins.
#[derive(Clone)]
pub struct HandoffStore {
    store: Arc<Store>,
}

impl HandoffStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn put(&self, job_id: &str, key: &str, value: &Value) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.store.conn().execute(
            "INSERT INTO context_handoff (job_id, key, value, written_at) VALUES (?1, ?2, ?3, ?4)",
            params![job_id, key, text, to_millis(Utc::now())],
        )?;
        Ok(())
    }

    /// Removes and returns every pending row for the job.
    pub fn take(&self, job_id: &str) -> Result<Map<String, Value>> {
        let mut conn = self.store.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let rows = {
            let mut stmt = tx.prepare(
                "SELECT key, value FROM context_handoff WHERE job_id = ?1 ORDER BY id",
            )?;
            stmt.query_map(params![job_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        if rows.is_empty() {
            return Ok(Map::new());
        }
        tx.execute("DELETE FROM context_handoff WHERE job_id = ?1", params![job_id])?;
        tx.commit()?;

        let mut values = Map::new();
        for (key, text) in rows {
            // Writers are other processes; keep malformed JSON as the raw string.
            let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
            values.insert(key, value);
        }
        debug!(job_id, keys = values.len(), "handoff absorbed");
        Ok(values)
    }

    pub fn pending(&self, job_id: &str) -> Result<usize> {
        let count: i64 = self.store.conn().query_row(
            "SELECT COUNT(*) FROM context_handoff WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
