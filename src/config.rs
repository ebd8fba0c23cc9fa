//! Engine configuration loaded from `jobflow.toml`.
//!
//! Every field has a default, so the file is optional. `JOBFLOW_DATABASE`
//! and `ANTHROPIC_API_KEY` take precedence over the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "jobflow.toml";

/// Top-level settings shared by the engine, the worker and the built-in actions.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite file holding jobs, step records and handoff rows.
    pub database_path: PathBuf,

    /// Sleep between claim attempts when the queue is empty.
    pub poll_interval_ms: u64,

    /// Processing jobs started longer ago than this are returned to pending.
    pub orphan_threshold_secs: u64,

    /// Applied to actions without their own `timeout`.
    pub default_action_timeout_secs: u64,

    /// Transitions one run may take before the job is parked.
    pub max_transitions_per_run: usize,

    pub llm_base_url: String,
    pub llm_model: String,

    /// Anthropic API key for the `llm` action.
    pub api_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/jobflow.db"),
            poll_interval_ms: 1000,
            orphan_threshold_secs: 900,
            default_action_timeout_secs: 300,
            max_transitions_per_run: 1000,
            llm_base_url: "https://api.anthropic.com/v1/messages".to_string(),
            llm_model: "claude-sonnet-4-5-20250929".to_string(),
            api_key: String::new(),
        }
    }
}

impl EngineConfig {
    /// Loads `jobflow.toml` from the current directory, or defaults if it does not exist.
    pub fn load() -> Result<Self> {
        let path = Path::new(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::parse_file(path)?
        } else {
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Loads an explicitly named file, which must exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::parse_file(path.as_ref())?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    // Environment wins over the file; empty values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(db) = var("JOBFLOW_DATABASE").filter(|v| !v.is_empty()) {
            self.database_path = PathBuf::from(db);
        }
        if let Some(key) = var("ANTHROPIC_API_KEY").filter(|v| !v.is_empty()) {
            self.api_key = key;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn orphan_threshold(&self) -> Duration {
        Duration::from_secs(self.orphan_threshold_secs)
    }

    pub fn default_action_timeout(&self) -> Duration {
        Duration::from_secs(self.default_action_timeout_secs)
    }
}
