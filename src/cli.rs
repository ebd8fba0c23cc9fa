//! `jobflow` command line, built on clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use jobflow::state_machine::JobStatus;

/// Event-driven workflow engine over a durable SQLite job queue.
#[derive(Debug, Parser)]
#[command(name = "jobflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Engine configuration file (defaults to ./jobflow.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database, overriding the configuration.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Debug-level logging unless RUST_LOG says otherwise.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Checks a workflow document and prints its summary.
    Validate { workflow: PathBuf },

    /// Adds a pending job.
    Enqueue {
        /// Job id; a UUID is generated when omitted.
        #[arg(long)]
        id: Option<String>,

        /// JSON object used as the job payload.
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Runs queued jobs through a workflow.
    Run {
        workflow: PathBuf,

        /// Exit once the queue has nothing pending instead of polling.
        #[arg(long, default_value_t = false)]
        once: bool,
    },

    /// Lists jobs, newest first.
    Status {
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Prints a job with its step timeline as JSON.
    Steps { job_id: String },

    /// Returns jobs stuck in processing to pending.
    Recover {
        /// Overrides `orphan_threshold_secs`.
        #[arg(long)]
        threshold_secs: Option<u64>,
    },

    /// Writes a value into a job's context for the engine to pick up.
    Handoff {
        job_id: String,
        key: String,
        /// JSON value; bare text is stored as a string.
        value: String,
    },
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["jobflow", "run", "flows/research.yaml", "--once"]);
        match cli.command {
            Command::Run { workflow, once } => {
                assert_eq!(workflow, PathBuf::from("flows/research.yaml"));
                assert!(once);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "jobflow",
            "--db",
            "/tmp/q.db",
            "--config",
            "custom.toml",
            "--verbose",
            "recover",
            "--threshold-secs",
            "60",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/q.db")));
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(
            cli.command,
            Command::Recover {
                threshold_secs: Some(60)
            }
        ));
    }

    #[test]
    fn cli_parses_enqueue_and_status() {
        let cli = Cli::parse_from(["jobflow", "enqueue", "--id", "j1", "--payload", r#"{"a":1}"#]);
        match cli.command {
            Command::Enqueue { id, payload } => {
                assert_eq!(id.as_deref(), Some("j1"));
                assert_eq!(payload, r#"{"a":1}"#);
            }
            _ => panic!("expected Enqueue command"),
        }

        let cli = Cli::parse_from(["jobflow", "status", "--status", "failed"]);
        match cli.command {
            Command::Status { status, limit } => {
                assert_eq!(status, Some(JobStatus::Failed));
                assert_eq!(limit, 20);
            }
            _ => panic!("expected Status command"),
        }

        assert!(Cli::try_parse_from(["jobflow", "status", "--status", "stuck"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
