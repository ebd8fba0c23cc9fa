mod context;
mod engine;
mod job;
mod worker;

pub use context::ExecutionContext;
pub use engine::{Engine, RunOutcome, WAKE_EVENT};
pub use job::{Job, JobReport, JobStatus, StepRecord};
pub use worker::{ORPHAN_MARGIN, Worker, WorkerStats};
