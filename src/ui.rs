//! Terminal output for the `jobflow` binary: a spinner while the worker
//! runs and colored job listings.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use jobflow::state_machine::{Job, JobReport, JobStatus, RunOutcome, WorkerStats};
use jobflow::workflow::WorkflowDefinition;

/// Spinner shown while `run --once` drains the queue.
pub struct RunProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl RunProgress {
    pub fn start(workflow: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("running {workflow}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn outcome(&self, job_id: &str, outcome: &RunOutcome) {
        let line = match outcome {
            RunOutcome::Completed { state } => {
                format!("  {} {job_id} completed in {state}", self.green.apply_to("✓"))
            }
            RunOutcome::Failed { state, error } => {
                format!("  {} {job_id} failed in {state}: {error}", self.red.apply_to("✗"))
            }
            RunOutcome::Parked { state } => {
                format!("  {} {job_id} waiting in {state}", self.yellow.apply_to("…"))
            }
        };
        self.pb.println(line);
    }

    pub fn finish(&self, stats: &WorkerStats) {
        self.pb.finish_and_clear();
        println!(
            "{} completed, {} failed, {} parked",
            self.green.apply_to(stats.completed),
            self.red.apply_to(stats.failed),
            self.yellow.apply_to(stats.parked)
        );
    }
}

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Completed => Style::new().green(),
        JobStatus::Failed => Style::new().red(),
        JobStatus::Processing => Style::new().cyan(),
        JobStatus::Pending => Style::new().yellow(),
    }
}

pub fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("no jobs");
        return;
    }
    for job in jobs {
        let status = status_style(job.status).apply_to(format!("{:<10}", job.status.as_str()));
        let state = job.current_state.as_deref().unwrap_or("-");
        print!("{status} {:<36} {state}", job.id);
        match &job.error_message {
            Some(error) => println!("  {}", Style::new().dim().apply_to(error)),
            None => println!(),
        }
    }
}

pub fn print_report(report: &JobReport) {
    let header = status_style(report.status).bold();
    println!("{}", header.apply_to(format!("─── {} ───", report.job_id)));
    println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
}

pub fn print_workflow(workflow: &WorkflowDefinition) {
    let bold = Style::new().bold();
    println!("{} {}", Style::new().green().apply_to("✓"), bold.apply_to(&workflow.name));
    if let Some(description) = &workflow.description {
        println!("  {description}");
    }
    println!("  initial state: {}", workflow.initial_state);
    println!(
        "  {} states, {} events, {} transitions",
        workflow.states.len(),
        workflow.events.len(),
        workflow.transitions.len()
    );
    let types: Vec<&str> = workflow.action_types().into_iter().collect();
    if !types.is_empty() {
        println!("  action types: {}", types.join(", "));
    }
    let terminal: Vec<&str> = workflow
        .states
        .iter()
        .map(String::as_str)
        .filter(|s| workflow.is_terminal(s))
        .collect();
    println!("  terminal states: {}", terminal.join(", "));
}
