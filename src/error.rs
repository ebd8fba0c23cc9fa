use thiserror::Error;

use crate::state_machine::JobStatus;

/// Errors raised by the workflow loader, the persistent store and the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Structural or referential problem in a workflow document. Fatal at load time.
    #[error("Config error: {0}")]
    Config(String),

    /// A state produced an event with no exact or wildcard transition.
    #[error("No transition from state '{state}' on event '{event}'")]
    Transition { state: String, event: String },

    #[error("Unknown action type: {0}")]
    UnknownAction(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    /// A status change that would break the pending → processing → {completed, failed} order.
    #[error("Job {job_id} cannot move from {from} to {to}")]
    IllegalStatus {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// The job was reclaimed by orphan recovery; this run no longer owns it.
    #[error("Job {0} is no longer held by this run")]
    ClaimLost(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Errors that end a single job's run without taking the engine down.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Transition { .. } | EngineError::UnknownAction(_)
        )
    }
}

/// Failure raised by an action implementation while executing.
///
/// The dispatcher turns any of these into the generic `error` event, so an
/// action never needs to know how the workflow reacts to its failures.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("process error: {0}")]
    Process(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
