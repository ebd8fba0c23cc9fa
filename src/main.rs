mod cli;
mod ui;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use cli::{Cli, Command};
use jobflow::actions::ActionRegistry;
use jobflow::config::EngineConfig;
use jobflow::error::EngineError;
use jobflow::state_machine::{Engine, JobReport, Worker, WorkerStats};
use jobflow::store::{HandoffStore, JobQueue, StepRecorder, Store};
use jobflow::workflow::load_file;

fn init_tracing(verbose: bool) {
    let default = if verbose { "jobflow=debug,info" } else { "jobflow=info,warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open_store(config: &EngineConfig) -> Result<Arc<Store>> {
    let store = Store::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    match cli.command {
        Command::Validate { workflow } => {
            let definition = load_file(&workflow)?;
            let registry = ActionRegistry::with_defaults(&config)?;
            let unknown: Vec<&str> = definition
                .action_types()
                .into_iter()
                .filter(|t| !registry.contains(t))
                .collect();
            ui::print_workflow(&definition);
            if !unknown.is_empty() {
                bail!("unregistered action types: {}", unknown.join(", "));
            }
        }
        Command::Enqueue { id, payload } => {
            let payload: Map<String, Value> =
                serde_json::from_str(&payload).context("payload must be a JSON object")?;
            let queue = JobQueue::new(open_store(&config)?);
            let job = queue.enqueue(payload, id)?;
            println!("{}", job.id);
        }
        Command::Run { workflow, once } => {
            let definition = Arc::new(load_file(&workflow)?);
            let registry = Arc::new(ActionRegistry::with_defaults(&config)?);
            let engine = Engine::new(definition, open_store(&config)?, registry, &config)?;
            let worker = Worker::new(Arc::new(engine), &config)?;

            if once {
                let progress = ui::RunProgress::start(&worker.engine().workflow().name);
                let mut stats = WorkerStats::default();
                while let Some((job_id, outcome)) = worker.tick().await? {
                    progress.outcome(&job_id, &outcome);
                    stats.record(&outcome);
                }
                progress.finish(&stats);
            } else {
                let (tx, rx) = watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("shutdown requested; finishing the current job");
                        let _ = tx.send(true);
                    }
                });
                let stats = worker.run(rx).await;
                println!(
                    "{} completed, {} failed, {} parked",
                    stats.completed, stats.failed, stats.parked
                );
            }
        }
        Command::Status { status, limit } => {
            let queue = JobQueue::new(open_store(&config)?);
            ui::print_jobs(&queue.list(status, limit)?);
        }
        Command::Steps { job_id } => {
            let store = open_store(&config)?;
            let job = JobQueue::new(store.clone())
                .get(&job_id)?
                .ok_or(EngineError::JobNotFound(job_id))?;
            let steps = StepRecorder::new(store).read(&job.id)?;
            ui::print_report(&JobReport::from_job(&job, steps));
        }
        Command::Recover { threshold_secs } => {
            let threshold = threshold_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.orphan_threshold());
            let queue = JobQueue::new(open_store(&config)?);
            let recovered = queue.recover_orphans(threshold)?;
            println!("recovered {} job(s)", recovered.len());
            for job_id in recovered {
                println!("  {job_id}");
            }
        }
        Command::Handoff { job_id, key, value } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let store = open_store(&config)?;
            if JobQueue::new(store.clone()).get(&job_id)?.is_none() {
                return Err(EngineError::JobNotFound(job_id).into());
            }
            HandoffStore::new(store).put(&job_id, &key, &value)?;
            println!("stored {key} for {job_id}");
        }
    }

    Ok(())
}
