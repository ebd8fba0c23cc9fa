//! The capability contract every action type implements, the registry that
//! maps configured type names to implementations, and the built-in actions.

mod bash;
mod dispatcher;
mod llm;
mod log;
mod sleep;
mod template;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::EngineConfig;
use crate::error::ActionError;
use crate::state_machine::ExecutionContext;

pub use bash::BashAction;
pub use dispatcher::{Dispatched, Dispatcher, ERROR_EVENT, StepOutcome, TIMEOUT_EVENT};
pub use llm::LlmAction;
pub use log::LogAction;
pub use sleep::SleepAction;
pub use template::{Substituted, substitute, substitute_str};

/// What an action reports back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Finished normally; the dispatcher substitutes the configured success event.
    Success,
    /// Finished with an explicit event name.
    Event(String),
    /// Nothing to do yet; the engine parks the job and polls again later.
    Pending,
    /// Finished with a numeric failure code, e.g. a process exit status.
    Failed { code: i64, message: Option<String> },
}

/// Outcome plus the variables and diagnostics an action produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionResult {
    pub outcome: ActionOutcome,
    /// Merged into the job's context for all later actions and states.
    pub outputs: Map<String, Value>,
    /// Stored in the step record only.
    pub details: Map<String, Value>,
}

impl ActionResult {
    pub fn new(outcome: ActionOutcome) -> Self {
        Self {
            outcome,
            outputs: Map::new(),
            details: Map::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(ActionOutcome::Success)
    }

    pub fn event(event: impl Into<String>) -> Self {
        Self::new(ActionOutcome::Event(event.into()))
    }

    pub fn pending() -> Self {
        Self::new(ActionOutcome::Pending)
    }

    pub fn failed(code: i64, message: Option<String>) -> Self {
        Self::new(ActionOutcome::Failed { code, message })
    }

    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// The single capability an action type must provide.
///
/// `params` arrive with placeholders already substituted. Implementations
/// must be cancel-safe: on timeout the returned future is dropped.
#[async_trait]
pub trait Action: Send + Sync {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        params: &Value,
    ) -> Result<ActionResult, ActionError>;
}

/// Produces the executor for one dispatch.
pub type ActionFactory = Arc<dyn Fn() -> Arc<dyn Action> + Send + Sync>;

/// Maps configured `type` strings to action factories. Filled once at startup.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    factories: HashMap<String, ActionFactory>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in action type.
    pub fn with_defaults(config: &EngineConfig) -> Result<Self, ActionError> {
        let mut registry = Self::new();
        register_defaults(&mut registry, config)?;
        Ok(registry)
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Action> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Registers one shared instance handed out on every dispatch.
    pub fn register_shared(&mut self, name: &str, action: Arc<dyn Action>) {
        self.register(name, move || action.clone());
    }

    pub fn create(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Registers the built-in action types.
///
/// Fails only if the HTTP client for `llm` cannot be built.
pub fn register_defaults(registry: &mut ActionRegistry, config: &EngineConfig) -> Result<(), ActionError> {
    registry.register_shared("bash", Arc::new(BashAction));
    registry.register_shared("sleep", Arc::new(SleepAction));
    registry.register_shared("log", Arc::new(LogAction));
    registry.register_shared("llm", Arc::new(LlmAction::from_config(config)?));
    Ok(())
}
