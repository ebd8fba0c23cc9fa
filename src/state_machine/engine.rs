use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use super::context::ExecutionContext;
use super::job::{Job, JobStatus};
use crate::actions::{ActionRegistry, Dispatcher, StepOutcome};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::store::{HandoffStore, JobQueue, StepRecorder, Store};
use crate::workflow::WorkflowDefinition;

/// Event delivered at the start of every run, before any action executes.
pub const WAKE_EVENT: &str = "start";

/// How a single run over a claimed job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The job reached a terminal state and is now `completed`.
    Completed { state: String },
    /// The job is now `failed`.
    Failed { state: String, error: String },
    /// The job is waiting in `state`; it stays `processing` with a checkpoint.
    Parked { state: String },
}

impl RunOutcome {
    pub fn state(&self) -> &str {
        match self {
            RunOutcome::Completed { state }
            | RunOutcome::Failed { state, .. }
            | RunOutcome::Parked { state } => state,
        }
    }
}

/// Drives claimed jobs through one workflow.
///
/// Every state entry is checkpointed, every executed action gets a step
/// record, and only the queue changes a job's status.
pub struct Engine {
    workflow: Arc<WorkflowDefinition>,
    queue: JobQueue,
    recorder: StepRecorder,
    handoff: HandoffStore,
    dispatcher: Dispatcher,
    max_transitions: usize,
}

impl Engine {
    /// Fails with a config error if the workflow uses an unregistered action type.
    pub fn new(
        workflow: Arc<WorkflowDefinition>,
        store: Arc<Store>,
        registry: Arc<ActionRegistry>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let missing: Vec<&str> = workflow
            .action_types()
            .into_iter()
            .filter(|t| !registry.contains(t))
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::Config(format!(
                "workflow '{}' uses unregistered action types: {}",
                workflow.name,
                missing.join(", ")
            )));
        }

        Ok(Self {
            workflow,
            queue: JobQueue::new(store.clone()),
            recorder: StepRecorder::new(store.clone()),
            handoff: HandoffStore::new(store),
            dispatcher: Dispatcher::new(registry, config.default_action_timeout()),
            max_transitions: config.max_transitions_per_run.max(1),
        })
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn recorder(&self) -> &StepRecorder {
        &self.recorder
    }

    /// Claims the oldest pending job and runs it. `None` when the queue is empty.
    pub async fn run_next(&self) -> Result<Option<(String, RunOutcome)>> {
        let Some(job) = self.queue.claim_next()? else {
            return Ok(None);
        };
        let job_id = job.id.clone();
        let outcome = self.run_job(job).await?;
        Ok(Some((job_id, outcome)))
    }

    /// Advances a claimed job until it completes, fails or parks.
    ///
    /// Storage errors are returned as-is and leave the job in `processing`;
    /// orphan recovery hands it back to the queue later. If recovery already
    /// handed the job to someone else, the run stops with `ClaimLost` at its
    /// next write.
    pub async fn run_job(&self, job: Job) -> Result<RunOutcome> {
        let job_id = job.id.clone();
        let Some(claim) = job.claimed_by.clone() else {
            return Err(EngineError::IllegalStatus {
                job_id,
                from: job.status,
                to: JobStatus::Processing,
            });
        };
        let mut ctx = ExecutionContext::for_job(&job, &self.workflow.initial_state);

        if !self.workflow.states.contains(ctx.state()) {
            let state = ctx.state().to_string();
            let error = format!("checkpointed state '{state}' is not part of workflow '{}'", self.workflow.name);
            return self.fail(&job_id, &claim, state, error);
        }

        ctx.extend(self.handoff.take(&job_id)?);
        let mut transitions = 0usize;

        if let Some(next) = self.workflow.resolve(ctx.state(), WAKE_EVENT) {
            let next = next.to_string();
            self.record_step(
                &job_id,
                &claim,
                ctx.state(),
                "wake",
                WAKE_EVENT,
                json!({"to": next}),
            )?;
            debug!(job_id = %job_id, from = ctx.state(), to = %next, "woken");
            ctx.enter(&next);
            transitions += 1;
        }

        loop {
            let state = ctx.state().to_string();
            self.queue.checkpoint(&job_id, &claim, &state, ctx.variables())?;

            if self.workflow.is_failure_state(&state) {
                let error = format!("entered failure state '{state}'");
                return self.fail(&job_id, &claim, state, error);
            }

            ctx.extend(self.handoff.take(&job_id)?);

            let actions = self.workflow.actions_for(&state);
            if actions.is_empty() {
                if self.workflow.is_terminal(&state) {
                    return self.complete(&job_id, &claim, state);
                }
                return Ok(self.park(&job_id, state, "waiting for an external event"));
            }

            if transitions >= self.max_transitions {
                warn!(job_id = %job_id, transitions, "transition budget exhausted");
                return Ok(self.park(&job_id, state, "transition budget exhausted"));
            }

            let mut event = String::new();
            for spec in actions {
                let dispatched = match self.dispatcher.dispatch(spec, &ctx).await {
                    Ok(dispatched) => dispatched,
                    Err(e) if e.is_job_fatal() => {
                        return self.fail(&job_id, &claim, state, e.to_string());
                    }
                    Err(e) => return Err(e),
                };
                ctx.extend(dispatched.outputs);
                self.record_step(
                    &job_id,
                    &claim,
                    &state,
                    spec.label(),
                    dispatched.outcome.label(),
                    dispatched.metadata,
                )?;

                match dispatched.outcome {
                    StepOutcome::Success(success) => event = success,
                    StepOutcome::Event(other) => {
                        event = other;
                        break;
                    }
                    StepOutcome::Pending => {
                        self.queue.checkpoint(&job_id, &claim, &state, ctx.variables())?;
                        return Ok(self.park(&job_id, state, "action pending"));
                    }
                    StepOutcome::Unrecoverable { message, .. } => {
                        self.queue.checkpoint(&job_id, &claim, &state, ctx.variables())?;
                        return self.fail(&job_id, &claim, state, message);
                    }
                }
            }

            match self.workflow.resolve(&state, &event) {
                Some(next) => {
                    info!(job_id = %job_id, from = %state, event = %event, to = next, "transition");
                    ctx.enter(next);
                    transitions += 1;
                }
                None if self.workflow.is_terminal(&state) => {
                    self.queue.checkpoint(&job_id, &claim, &state, ctx.variables())?;
                    return self.complete(&job_id, &claim, state);
                }
                None => {
                    self.queue.checkpoint(&job_id, &claim, &state, ctx.variables())?;
                    let error = EngineError::Transition {
                        state: state.clone(),
                        event,
                    };
                    return self.fail(&job_id, &claim, state, error.to_string());
                }
            }
        }
    }

    // Heartbeat first: a run that lost its claim must not add steps.
    fn record_step(
        &self,
        job_id: &str,
        claim: &str,
        state: &str,
        action: &str,
        outcome: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        self.queue.heartbeat(job_id, claim)?;
        self.recorder.append(job_id, state, action, outcome, metadata)?;
        Ok(())
    }

    fn complete(&self, job_id: &str, claim: &str, state: String) -> Result<RunOutcome> {
        self.queue.complete(job_id, claim)?;
        Ok(RunOutcome::Completed { state })
    }

    fn fail(&self, job_id: &str, claim: &str, state: String, error: String) -> Result<RunOutcome> {
        self.queue.fail(job_id, claim, &error)?;
        Ok(RunOutcome::Failed { state, error })
    }

    fn park(&self, job_id: &str, state: String, reason: &str) -> RunOutcome {
        info!(job_id, state = %state, reason, "job parked");
        RunOutcome::Parked { state }
    }
}
