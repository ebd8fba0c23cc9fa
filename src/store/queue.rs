use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Store, from_millis, to_millis};
use crate::error::{EngineError, Result};
use crate::state_machine::{Job, JobStatus};

const JOB_COLUMNS: &str = "job_id, payload, status, current_state, variables, created_at, started_at, completed_at, error_message, claimed_by";

/// Durable FIFO of jobs. The only component allowed to change a job's status.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<Store>,
}

impl JobQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Adds a pending job. Without an id a random UUID is assigned.
    pub fn enqueue(&self, payload: Map<String, Value>, id: Option<String>) -> Result<Job> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let payload_text = serde_json::to_string(&payload)?;

        let conn = self.store.conn();
        let inserted = conn.execute(
            "INSERT INTO jobs (job_id, payload, status, created_at) VALUES (?1, ?2, 'pending', ?3)",
            params![id, payload_text, to_millis(now)],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(EngineError::DuplicateJob(id));
            }
            Err(e) => return Err(e.into()),
        }
        drop(conn);

        info!(job_id = %id, "job enqueued");
        Ok(Job {
            id,
            payload,
            status: JobStatus::Pending,
            current_state: None,
            variables: Map::new(),
            created_at: from_millis(to_millis(now)),
            started_at: None,
            completed_at: None,
            error_message: None,
            claimed_by: None,
        })
    }

    /// Atomically takes the oldest pending job and marks it processing.
    ///
    /// The select and update run in one `BEGIN IMMEDIATE` transaction, which
    /// holds SQLite's write lock, so no two callers (threads or processes) can
    /// ever receive the same job. The returned job carries a fresh claim token
    /// in `claimed_by`; every later write for this run must present it.
    pub fn claim_next(&self) -> Result<Option<Job>> {
        let mut conn = self.store.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let next: Option<String> = tx
            .query_row(
                "SELECT job_id FROM jobs WHERE status = 'pending' ORDER BY seq LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(job_id) = next else {
            return Ok(None);
        };

        let now = to_millis(Utc::now());
        tx.execute(
            "UPDATE jobs SET status = 'processing', started_at = ?2, heartbeat_at = ?2, claimed_by = ?3
             WHERE job_id = ?1 AND status = 'pending'",
            params![job_id, now, Uuid::new_v4().to_string()],
        )?;
        let job = tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
            params![job_id],
            job_from_row,
        )?;
        tx.commit()?;

        debug!(job_id = %job.id, "job claimed");
        Ok(Some(job))
    }

    pub fn complete(&self, job_id: &str, claim: &str) -> Result<()> {
        self.finish(job_id, claim, JobStatus::Completed, None)?;
        info!(job_id, "job completed");
        Ok(())
    }

    pub fn fail(&self, job_id: &str, claim: &str, message: &str) -> Result<()> {
        self.finish(job_id, claim, JobStatus::Failed, Some(message))?;
        warn!(job_id, error = message, "job failed");
        Ok(())
    }

    // A completed job drops any message left behind by orphan recovery.
    fn finish(&self, job_id: &str, claim: &str, to: JobStatus, message: Option<&str>) -> Result<()> {
        let conn = self.store.conn();
        let changed = conn.execute(
            "UPDATE jobs SET status = ?3, completed_at = ?4, error_message = ?5, claimed_by = NULL
             WHERE job_id = ?1 AND status = 'processing' AND claimed_by = ?2",
            params![job_id, claim, to.as_str(), to_millis(Utc::now()), message],
        )?;
        if changed == 1 {
            return Ok(());
        }
        Err(unowned(&conn, job_id, to))
    }

    /// Persists where a processing job stands so a later claim can resume it.
    /// Also refreshes the heartbeat.
    pub fn checkpoint(
        &self,
        job_id: &str,
        claim: &str,
        state: &str,
        variables: &Map<String, Value>,
    ) -> Result<()> {
        let vars = serde_json::to_string(variables)?;
        let conn = self.store.conn();
        let changed = conn.execute(
            "UPDATE jobs SET current_state = ?3, variables = ?4, heartbeat_at = ?5
             WHERE job_id = ?1 AND status = 'processing' AND claimed_by = ?2",
            params![job_id, claim, state, vars, to_millis(Utc::now())],
        )?;
        if changed == 1 {
            return Ok(());
        }
        Err(unowned(&conn, job_id, JobStatus::Processing))
    }

    /// Proves the claim is still held and pushes back orphan recovery.
    pub fn heartbeat(&self, job_id: &str, claim: &str) -> Result<()> {
        let conn = self.store.conn();
        let changed = conn.execute(
            "UPDATE jobs SET heartbeat_at = ?3
             WHERE job_id = ?1 AND status = 'processing' AND claimed_by = ?2",
            params![job_id, claim, to_millis(Utc::now())],
        )?;
        if changed == 1 {
            return Ok(());
        }
        Err(unowned(&conn, job_id, JobStatus::Processing))
    }

    /// Returns jobs whose last heartbeat is older than `threshold` to pending.
    ///
    /// Their checkpointed state and variables are kept, so the next claim
    /// resumes where the crashed (or parked) run stopped. The old claim token
    /// is revoked, so a run that was merely slow can no longer write.
    pub fn recover_orphans(&self, threshold: Duration) -> Result<Vec<String>> {
        self.recover_orphans_as_of(threshold, Utc::now())
    }

    pub(crate) fn recover_orphans_as_of(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| EngineError::Config(format!("orphan threshold out of range: {e}")))?;
        let cutoff = to_millis(now - threshold);
        let reason = format!(
            "recovered after {}s without a heartbeat",
            threshold.num_seconds()
        );

        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "UPDATE jobs SET status = 'pending', started_at = NULL, heartbeat_at = NULL,
                    claimed_by = NULL, error_message = ?2
             WHERE status = 'processing' AND heartbeat_at < ?1
             RETURNING job_id",
        )?;
        let recovered = stmt
            .query_map(params![cutoff, reason], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered orphaned jobs");
        }
        Ok(recovered)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.store.conn();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
                params![job_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Newest first, optionally filtered by status.
    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let conn = self.store.conn();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE (?1 IS NULL OR status = ?1) ORDER BY seq DESC LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(params![status.map(|s| s.as_str()), limit], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn count(&self, status: Option<JobStatus>) -> Result<usize> {
        let conn = self.store.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE (?1 IS NULL OR status = ?1)",
            params![status.map(|s| s.as_str())],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn unowned(conn: &rusqlite::Connection, job_id: &str, to: JobStatus) -> EngineError {
    let current: rusqlite::Result<Option<String>> = conn
        .query_row(
            "SELECT status FROM jobs WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )
        .optional();
    match current {
        Ok(Some(status)) if status == JobStatus::Processing.as_str() => {
            EngineError::ClaimLost(job_id.to_string())
        }
        Ok(Some(status)) => EngineError::IllegalStatus {
            job_id: job_id.to_string(),
            from: status.parse().unwrap_or(JobStatus::Pending),
            to,
        },
        Ok(None) => EngineError::JobNotFound(job_id.to_string()),
        Err(e) => e.into(),
    }
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Map<String, Value>> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(2)?;
    let status = status.parse::<JobStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(Job {
        id: row.get(0)?,
        payload: json_column(row, 1)?,
        status,
        current_state: row.get(3)?,
        variables: json_column(row, 4)?,
        created_at: from_millis(row.get(5)?),
        started_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        completed_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        error_message: row.get(8)?,
        claimed_by: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::thread;

    fn memory_queue() -> JobQueue {
        JobQueue::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn claim(job: &Job) -> &str {
        job.claimed_by.as_deref().unwrap()
    }

    #[test]
    fn enqueue_creates_pending_job() {
        let queue = memory_queue();
        let job = queue
            .enqueue(payload(json!({"topic": "rust"})), Some("job-1".into()))
            .unwrap();

        assert_eq!(job.id, "job-1");
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());

        let stored = queue.get("job-1").unwrap().unwrap();
        assert_eq!(stored, job);
    }

    #[test]
    fn enqueue_generates_ids_and_rejects_duplicates() {
        let queue = memory_queue();
        let job = queue.enqueue(Map::new(), None).unwrap();
        assert_eq!(job.id.len(), 36);

        queue.enqueue(Map::new(), Some("same".into())).unwrap();
        let err = queue.enqueue(Map::new(), Some("same".into())).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateJob(id) if id == "same"));
    }

    #[test]
    fn claim_next_is_fifo() {
        let queue = memory_queue();
        for id in ["first", "second", "third"] {
            queue.enqueue(Map::new(), Some(id.into())).unwrap();
        }

        let claimed: Vec<String> = (0..3)
            .map(|_| queue.claim_next().unwrap().unwrap().id)
            .collect();
        assert_eq!(claimed, vec!["first", "second", "third"]);
        assert!(queue.claim_next().unwrap().is_none());
    }

    #[test]
    fn claim_marks_processing_and_stamps_start() {
        let queue = memory_queue();
        queue.enqueue(Map::new(), Some("j".into())).unwrap();

        let job = queue.claim_next().unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());
        assert_eq!(claim(&job).len(), 36);
        assert_eq!(queue.count(Some(JobStatus::Pending)).unwrap(), 0);
        assert_eq!(queue.count(Some(JobStatus::Processing)).unwrap(), 1);
    }

    #[test]
    fn complete_and_fail_only_from_processing() {
        let queue = memory_queue();
        queue.enqueue(Map::new(), Some("a".into())).unwrap();
        queue.enqueue(Map::new(), Some("b".into())).unwrap();

        // Still pending.
        let err = queue.complete("a", "no-claim").unwrap_err();
        assert!(matches!(
            err,
            EngineError::IllegalStatus { from: JobStatus::Pending, to: JobStatus::Completed, .. }
        ));

        let a = queue.claim_next().unwrap().unwrap();
        let b = queue.claim_next().unwrap().unwrap();
        queue.complete("a", claim(&a)).unwrap();
        queue.fail("b", claim(&b), "exploded").unwrap();

        let done = queue.get("a").unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(done.claimed_by.is_none());

        let b = queue.get("b").unwrap().unwrap();
        assert_eq!(b.status, JobStatus::Failed);
        assert_eq!(b.error_message.as_deref(), Some("exploded"));

        // Terminal statuses never reverse.
        assert!(matches!(
            queue.fail("a", claim(&a), "late").unwrap_err(),
            EngineError::IllegalStatus { from: JobStatus::Completed, .. }
        ));
        assert!(matches!(
            queue.complete("ghost", "x").unwrap_err(),
            EngineError::JobNotFound(_)
        ));
    }

    #[test]
    fn checkpoint_persists_state_and_variables() {
        let queue = memory_queue();
        queue.enqueue(Map::new(), Some("j".into())).unwrap();
        assert!(queue.checkpoint("j", "x", "b", &Map::new()).is_err());

        let job = queue.claim_next().unwrap().unwrap();
        queue
            .checkpoint("j", claim(&job), "review", &payload(json!({"score": 7})))
            .unwrap();

        let job = queue.get("j").unwrap().unwrap();
        assert_eq!(job.current_state.as_deref(), Some("review"));
        assert_eq!(job.variables.get("score"), Some(&json!(7)));
    }

    #[test]
    fn recover_orphans_respects_threshold() {
        let queue = memory_queue();
        queue.enqueue(Map::new(), Some("stuck".into())).unwrap();
        queue.enqueue(Map::new(), Some("done".into())).unwrap();
        queue.enqueue(Map::new(), Some("waiting".into())).unwrap();
        queue.claim_next().unwrap();
        let done = queue.claim_next().unwrap().unwrap();
        queue.complete("done", claim(&done)).unwrap();

        let started = queue.get("stuck").unwrap().unwrap().started_at.unwrap();
        let threshold = Duration::from_secs(60);

        // Exactly at the threshold is not enough.
        let at = started + chrono::Duration::seconds(60);
        assert!(queue.recover_orphans_as_of(threshold, at).unwrap().is_empty());

        let later = started + chrono::Duration::seconds(61);
        let recovered = queue.recover_orphans_as_of(threshold, later).unwrap();
        assert_eq!(recovered, vec!["stuck".to_string()]);

        let job = queue.get("stuck").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert!(job.claimed_by.is_none());
        assert!(job.error_message.unwrap().contains("recovered"));

        assert_eq!(queue.get("done").unwrap().unwrap().status, JobStatus::Completed);
        assert_eq!(queue.get("waiting").unwrap().unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn recovered_job_keeps_checkpoint_and_is_claimable_again() {
        let queue = memory_queue();
        queue.enqueue(Map::new(), Some("j".into())).unwrap();
        let first = queue.claim_next().unwrap().unwrap();
        queue
            .checkpoint("j", claim(&first), "waiting", &payload(json!({"attempt": 1})))
            .unwrap();

        let far_future = Utc::now() + chrono::Duration::hours(1);
        queue.recover_orphans_as_of(Duration::from_secs(1), far_future).unwrap();

        let job = queue.claim_next().unwrap().unwrap();
        assert_eq!(job.id, "j");
        assert_eq!(job.current_state.as_deref(), Some("waiting"));
        assert_eq!(job.variables.get("attempt"), Some(&json!(1)));
        assert_ne!(claim(&job), claim(&first));
    }

    #[test]
    fn reclaimed_job_rejects_writes_from_the_previous_claim() {
        let queue = memory_queue();
        queue.enqueue(Map::new(), Some("j".into())).unwrap();
        let stale = queue.claim_next().unwrap().unwrap();

        let far_future = Utc::now() + chrono::Duration::hours(1);
        queue.recover_orphans_as_of(Duration::from_secs(60), far_future).unwrap();
        let fresh = queue.claim_next().unwrap().unwrap();

        let lost = |err: EngineError| matches!(err, EngineError::ClaimLost(id) if id == "j");
        assert!(lost(queue.checkpoint("j", claim(&stale), "x", &Map::new()).unwrap_err()));
        assert!(lost(queue.heartbeat("j", claim(&stale)).unwrap_err()));
        assert!(lost(queue.complete("j", claim(&stale)).unwrap_err()));
        assert!(lost(queue.fail("j", claim(&stale), "late").unwrap_err()));
        assert_eq!(queue.get("j").unwrap().unwrap().status, JobStatus::Processing);

        queue.complete("j", claim(&fresh)).unwrap();
        assert_eq!(queue.get("j").unwrap().unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn heartbeat_defers_orphan_recovery() {
        let queue = memory_queue();
        queue.enqueue(Map::new(), Some("j".into())).unwrap();
        let job = queue.claim_next().unwrap().unwrap();
        let backdate = |minutes: i64| {
            let then = to_millis(Utc::now() - chrono::Duration::minutes(minutes));
            queue
                .store
                .conn()
                .execute("UPDATE jobs SET heartbeat_at = ?1 WHERE job_id = 'j'", params![then])
                .unwrap();
        };
        let threshold = Duration::from_secs(60);

        backdate(2);
        queue.heartbeat("j", claim(&job)).unwrap();
        assert!(queue.recover_orphans(threshold).unwrap().is_empty());

        backdate(2);
        assert_eq!(queue.recover_orphans(threshold).unwrap(), vec!["j".to_string()]);
    }

    #[test]
    fn completion_clears_the_recovery_message() {
        let queue = memory_queue();
        queue.enqueue(Map::new(), Some("j".into())).unwrap();
        queue.claim_next().unwrap();
        let far_future = Utc::now() + chrono::Duration::hours(1);
        queue.recover_orphans_as_of(Duration::from_secs(1), far_future).unwrap();
        assert!(queue.get("j").unwrap().unwrap().error_message.is_some());

        let job = queue.claim_next().unwrap().unwrap();
        queue.complete("j", claim(&job)).unwrap();
        assert!(queue.get("j").unwrap().unwrap().error_message.is_none());
    }

    #[test]
    fn list_and_count_filter_by_status() {
        let queue = memory_queue();
        for id in ["a", "b", "c"] {
            queue.enqueue(Map::new(), Some(id.into())).unwrap();
        }
        queue.claim_next().unwrap();

        assert_eq!(queue.count(None).unwrap(), 3);
        assert_eq!(queue.count(Some(JobStatus::Pending)).unwrap(), 2);

        let all: Vec<String> = queue.list(None, 10).unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(all, vec!["c", "b", "a"]);

        let processing = queue.list(Some(JobStatus::Processing), 10).unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id, "a");

        assert_eq!(queue.list(None, 1).unwrap().len(), 1);
    }

    #[test]
    fn single_job_two_concurrent_claims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let producer = JobQueue::new(Arc::new(Store::open(&path).unwrap()));
        producer.enqueue(Map::new(), Some("only".into())).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || {
                    let queue = JobQueue::new(Arc::new(Store::open(&path).unwrap()));
                    queue.claim_next().unwrap().map(|job| job.id)
                })
            })
            .collect();
        let results: Vec<Option<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<_> = results.iter().flatten().collect();
        assert_eq!(winners, vec!["only"]);
        assert_eq!(results.iter().filter(|r| r.is_none()).count(), 1);
    }

    #[test]
    fn concurrent_claims_hand_out_each_job_once() {
        const JOBS: usize = 40;
        const WORKERS: usize = 6;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let producer = JobQueue::new(Arc::new(Store::open(&path).unwrap()));
        for i in 0..JOBS {
            producer.enqueue(Map::new(), Some(format!("job-{i}"))).unwrap();
        }

        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || {
                    let queue = JobQueue::new(Arc::new(Store::open(&path).unwrap()));
                    let mut mine = Vec::new();
                    while let Some(job) = queue.claim_next().unwrap() {
                        mine.push(job.id);
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.join().unwrap() {
                total += 1;
                assert!(seen.insert(id), "job handed out twice");
            }
        }
        assert_eq!(total, JOBS);
        assert_eq!(producer.count(Some(JobStatus::Pending)).unwrap(), 0);
    }
}
