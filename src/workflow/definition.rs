use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;

/// Source state that matches every current state.
pub const WILDCARD: &str = "*";
/// Event an action signals on success when it does not name one.
pub const DEFAULT_SUCCESS_EVENT: &str = "job_done";

/// One `{from, to, event}` rule from the workflow document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: String,
    pub event: String,
    pub to: String,
}

impl Transition {
    pub fn is_wildcard(&self) -> bool {
        self.from == WILDCARD
    }
}

/// Two-tier transition lookup: exact `(state, event)` rules first, then `*` rules.
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    exact: HashMap<(String, String), String>,
    wildcard: HashMap<String, String>,
    sources: HashSet<String>,
}

impl TransitionTable {
    /// Inserts a rule; returns the displaced target if the `(from, event)` slot was taken.
    pub(crate) fn insert(&mut self, transition: &Transition) -> Option<String> {
        if transition.is_wildcard() {
            self.wildcard
                .insert(transition.event.clone(), transition.to.clone())
        } else {
            self.sources.insert(transition.from.clone());
            self.exact.insert(
                (transition.from.clone(), transition.event.clone()),
                transition.to.clone(),
            )
        }
    }

    pub fn resolve(&self, state: &str, event: &str) -> Option<&str> {
        self.exact
            .get(&(state.to_string(), event.to_string()))
            .or_else(|| self.wildcard.get(event))
            .map(String::as_str)
    }

    /// True when at least one non-wildcard rule leaves `state`.
    pub fn has_exact_outgoing(&self, state: &str) -> bool {
        self.sources.contains(state)
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One configured action within a state's ordered action list.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub action_type: String,
    pub description: Option<String>,
    /// Type-specific parameters, subject to `{placeholder}` substitution.
    pub params: Value,
    pub success: Option<String>,
    pub timeout: Option<Duration>,
    pub error_mappings: HashMap<i64, String>,
    pub recoverable_errors: Option<Vec<String>>,
}

impl ActionSpec {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            description: None,
            params: Value::Object(Default::default()),
            success: None,
            timeout: None,
            error_mappings: HashMap::new(),
            recoverable_errors: None,
        }
    }

    pub fn success_event(&self) -> &str {
        self.success.as_deref().unwrap_or(DEFAULT_SUCCESS_EVENT)
    }

    /// Label stored in step records.
    pub fn label(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.action_type)
    }

    pub fn is_recoverable(&self, event: &str) -> bool {
        match &self.recoverable_errors {
            Some(events) => events.iter().any(|e| e == event),
            None => true,
        }
    }
}

/// A validated workflow graph. Built by [`super::load_str`] / [`super::load_file`].
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub description: Option<String>,
    pub states: BTreeSet<String>,
    pub events: BTreeSet<String>,
    pub initial_state: String,
    pub transitions: TransitionTable,
    pub actions: HashMap<String, Vec<ActionSpec>>,
    pub failure_states: BTreeSet<String>,
}

impl WorkflowDefinition {
    pub fn actions_for(&self, state: &str) -> &[ActionSpec] {
        self.actions.get(state).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn resolve(&self, state: &str, event: &str) -> Option<&str> {
        self.transitions.resolve(state, event)
    }

    /// A state with no exact outgoing rule ends the run once its actions finish.
    pub fn is_terminal(&self, state: &str) -> bool {
        !self.transitions.has_exact_outgoing(state)
    }

    pub fn is_failure_state(&self, state: &str) -> bool {
        self.failure_states.contains(state)
    }

    /// Action types referenced anywhere in the workflow.
    pub fn action_types(&self) -> BTreeSet<&str> {
        self.actions
            .values()
            .flatten()
            .map(|spec| spec.action_type.as_str())
            .collect()
    }

    /// Longest explicitly configured action timeout.
    pub fn longest_timeout(&self) -> Option<Duration> {
        self.actions
            .values()
            .flatten()
            .filter_map(|spec| spec.timeout)
            .max()
    }
}
