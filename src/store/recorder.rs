use std::sync::Arc;

use chrono::Utc;
use rusqlite::{TransactionBehavior, params};
use serde_json::Value;
use tracing::debug;

use super::{Store, from_millis, to_millis};
use crate::error::Result;
use crate::state_machine::StepRecord;

/// Append-only log of executed actions. Owns per-job sequence numbering.
#[derive(Clone)]
pub struct StepRecorder {
    store: Arc<Store>,
}

impl StepRecorder {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Writes the next step for `job_id`, numbered one past the highest stored sequence.
    pub fn append(
        &self,
        job_id: &str,
        state: &str,
        action: &str,
        outcome: &str,
        metadata: Value,
    ) -> Result<StepRecord> {
        let recorded_at = from_millis(to_millis(Utc::now()));
        let metadata_text = serde_json::to_string(&metadata)?;

        let mut conn = self.store.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM step_records WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO step_records (job_id, sequence, state, action, outcome, recorded_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job_id,
                sequence,
                state,
                action,
                outcome,
                to_millis(recorded_at),
                metadata_text
            ],
        )?;
        tx.commit()?;

        debug!(job_id, sequence, state, outcome, "step recorded");
        Ok(StepRecord {
            job_id: job_id.to_string(),
            sequence,
            state: state.to_string(),
            action: action.to_string(),
            outcome: outcome.to_string(),
            recorded_at,
            metadata,
        })
    }

    /// All steps of a job in sequence order.
    pub fn read(&self, job_id: &str) -> Result<Vec<StepRecord>> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "SELECT job_id, sequence, state, action, outcome, recorded_at, metadata
             FROM step_records WHERE job_id = ?1 ORDER BY sequence",
        )?;
        let rows = stmt.query_map(params![job_id], |row| {
            let metadata: String = row.get(6)?;
            let metadata = serde_json::from_str(&metadata).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
            })?;
            Ok(StepRecord {
                job_id: row.get(0)?,
                sequence: row.get(1)?,
                state: row.get(2)?,
                action: row.get(3)?,
                outcome: row.get(4)?,
                recorded_at: from_millis(row.get(5)?),
                metadata,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
