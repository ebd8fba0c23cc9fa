use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::engine::{Engine, RunOutcome};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// Slack added on top of the longest action timeout before a processing job counts as orphaned.
pub const ORPHAN_MARGIN: Duration = Duration::from_secs(30);

/// Tally of the runs a worker performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: usize,
    pub failed: usize,
    pub parked: usize,
}

impl WorkerStats {
    pub fn record(&mut self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Completed { .. } => self.completed += 1,
            RunOutcome::Failed { .. } => self.failed += 1,
            RunOutcome::Parked { .. } => self.parked += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.completed + self.failed + self.parked
    }
}

/// Poll loop around one engine: sweep orphans, claim, run, repeat.
pub struct Worker {
    engine: Arc<Engine>,
    poll_interval: Duration,
    orphan_threshold: Duration,
}

impl Worker {
    /// Refuses an orphan threshold that a healthy long-running action could exceed.
    ///
    /// The engine heartbeats before every step record, so only a single
    /// action has to fit inside the threshold, not a whole run.
    pub fn new(engine: Arc<Engine>, config: &EngineConfig) -> Result<Self> {
        let orphan_threshold = config.orphan_threshold();
        let longest = longest_action_timeout(&engine, config.default_action_timeout());
        if orphan_threshold <= longest + ORPHAN_MARGIN {
            return Err(EngineError::Config(format!(
                "orphan threshold {}s must exceed the longest action timeout ({}s) plus {}s",
                orphan_threshold.as_secs(),
                longest.as_secs(),
                ORPHAN_MARGIN.as_secs()
            )));
        }
        Ok(Self {
            engine,
            poll_interval: config.poll_interval(),
            orphan_threshold,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Returns stale processing jobs to pending.
    pub fn sweep(&self) -> Result<usize> {
        Ok(self.engine.queue().recover_orphans(self.orphan_threshold)?.len())
    }

    /// One sweep plus at most one run.
    pub async fn tick(&self) -> Result<Option<(String, RunOutcome)>> {
        self.sweep()?;
        self.engine.run_next().await
    }

    /// Runs jobs until the queue has nothing pending.
    pub async fn run_until_idle(&self) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        while let Some((job_id, outcome)) = self.tick().await? {
            info!(job_id = %job_id, state = outcome.state(), "run finished");
            stats.record(&outcome);
        }
        Ok(stats)
    }

    /// Polls until `shutdown` turns true.
    ///
    /// The signal is only observed between jobs; a run in progress always
    /// finishes (or parks) first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerStats {
        let mut stats = WorkerStats::default();
        info!(workflow = %self.engine.workflow().name, "worker started");

        while !*shutdown.borrow() {
            match self.tick().await {
                Ok(Some((job_id, outcome))) => {
                    info!(job_id = %job_id, state = outcome.state(), "run finished");
                    stats.record(&outcome);
                    continue;
                }
                Ok(None) => {}
                Err(EngineError::ClaimLost(job_id)) => {
                    warn!(job_id = %job_id, "run abandoned; job was reclaimed by orphan recovery");
                    continue;
                }
                Err(e) => error!(error = %e, "worker tick failed"),
            }
            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(
            completed = stats.completed,
            failed = stats.failed,
            parked = stats.parked,
            "worker stopped"
        );
        stats
    }
}

fn longest_action_timeout(engine: &Engine, default: Duration) -> Duration {
    let workflow = engine.workflow();
    let explicit = workflow.longest_timeout().unwrap_or_default();
    let uses_default = workflow
        .actions
        .values()
        .flatten()
        .any(|spec| spec.timeout.is_none());
    if uses_default {
        explicit.max(default)
    } else {
        explicit
    }
}
