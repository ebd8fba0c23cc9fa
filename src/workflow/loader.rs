//! YAML workflow document parsing and validation.
//!
//! Parsing happens in two passes: serde reads the document into loosely typed
//! `Raw*` structs, then [`validate`] checks every reference and builds the
//! [`WorkflowDefinition`]. Any violation is an [`EngineError::Config`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::definition::{ActionSpec, Transition, TransitionTable, WILDCARD, WorkflowDefinition};
use crate::error::{EngineError, Result};

/// State treated as the failure terminal when `failure_states` is omitted.
const DEFAULT_FAILURE_STATE: &str = "failed";

/// Keys of an action entry that belong to the dispatcher rather than the action.
const RESERVED_ACTION_KEYS: &[&str] = &[
    "type",
    "description",
    "success",
    "timeout",
    "error_mappings",
    "recoverable_errors",
];

#[derive(Debug, Deserialize)]
struct RawWorkflow {
    #[serde(default)]
    metadata: RawMetadata,
    #[serde(default)]
    states: Vec<String>,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    initial_state: Option<String>,
    #[serde(default)]
    transitions: Vec<RawTransition>,
    #[serde(default)]
    actions: BTreeMap<String, Vec<serde_yaml::Value>>,
    #[serde(default)]
    failure_states: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    name: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTransition {
    from: String,
    to: String,
    event: String,
}

/// Reads and validates a workflow document from disk.
pub fn load_file(path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Config(format!("cannot read workflow {}: {e}", path.display()))
    })?;
    load_str(&contents)
}

/// Parses and validates a workflow document.
pub fn load_str(contents: &str) -> Result<WorkflowDefinition> {
    let raw: RawWorkflow = serde_yaml::from_str(contents)
        .map_err(|e| EngineError::Config(format!("invalid workflow document: {e}")))?;
    let definition = validate(raw)?;
    debug!(
        workflow = %definition.name,
        states = definition.states.len(),
        transitions = definition.transitions.len(),
        "workflow loaded"
    );
    Ok(definition)
}

fn config_err(msg: impl Into<String>) -> EngineError {
    EngineError::Config(msg.into())
}

fn unique_set(kind: &str, items: Vec<String>) -> Result<BTreeSet<String>> {
    if items.is_empty() {
        return Err(config_err(format!("{kind} must not be empty")));
    }
    let mut set = BTreeSet::new();
    for item in items {
        if item.trim().is_empty() {
            return Err(config_err(format!("{kind} contains an empty name")));
        }
        if item == WILDCARD {
            return Err(config_err(format!("'{WILDCARD}' is reserved and cannot be used in {kind}")));
        }
        if !set.insert(item.clone()) {
            return Err(config_err(format!("duplicate entry '{item}' in {kind}")));
        }
    }
    Ok(set)
}

fn validate(raw: RawWorkflow) -> Result<WorkflowDefinition> {
    let states = unique_set("states", raw.states)?;
    let events = unique_set("events", raw.events)?;

    let initial_state = raw
        .initial_state
        .ok_or_else(|| config_err("initial_state is required"))?;
    if !states.contains(&initial_state) {
        return Err(config_err(format!(
            "initial_state '{initial_state}' is not a declared state"
        )));
    }

    let mut transitions = TransitionTable::default();
    for raw_transition in raw.transitions {
        let transition = Transition {
            from: raw_transition.from,
            event: raw_transition.event,
            to: raw_transition.to,
        };
        if !transition.is_wildcard() && !states.contains(&transition.from) {
            return Err(config_err(format!(
                "transition from undeclared state '{}'",
                transition.from
            )));
        }
        if !states.contains(&transition.to) {
            return Err(config_err(format!(
                "transition to undeclared state '{}'",
                transition.to
            )));
        }
        if !events.contains(&transition.event) {
            return Err(config_err(format!(
                "transition on undeclared event '{}'",
                transition.event
            )));
        }
        if transitions.insert(&transition).is_some() {
            return Err(config_err(format!(
                "ambiguous transitions from '{}' on event '{}'",
                transition.from, transition.event
            )));
        }
    }

    let mut actions = HashMap::new();
    for (state, entries) in raw.actions {
        if !states.contains(&state) {
            return Err(config_err(format!("actions declared for undeclared state '{state}'")));
        }
        let specs = entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| parse_action(&state, index, entry, &events))
            .collect::<Result<Vec<_>>>()?;
        actions.insert(state, specs);
    }

    let failure_states = match raw.failure_states {
        Some(list) => {
            let mut set = BTreeSet::new();
            for state in list {
                if !states.contains(&state) {
                    return Err(config_err(format!(
                        "failure state '{state}' is not a declared state"
                    )));
                }
                set.insert(state);
            }
            set
        }
        None if states.contains(DEFAULT_FAILURE_STATE) => {
            BTreeSet::from([DEFAULT_FAILURE_STATE.to_string()])
        }
        None => BTreeSet::new(),
    };

    Ok(WorkflowDefinition {
        name: raw.metadata.name.unwrap_or_else(|| "unnamed".to_string()),
        description: raw.metadata.description,
        states,
        events,
        initial_state,
        transitions,
        actions,
        failure_states,
    })
}

fn parse_action(
    state: &str,
    index: usize,
    entry: serde_yaml::Value,
    events: &BTreeSet<String>,
) -> Result<ActionSpec> {
    let location = format!("action #{} of state '{state}'", index + 1);
    let entry = serde_json::to_value(&entry)
        .map_err(|e| config_err(format!("{location}: unsupported value: {e}")))?;
    let Value::Object(mut fields) = entry else {
        return Err(config_err(format!("{location} must be a mapping")));
    };

    let action_type = match fields.get("type") {
        Some(Value::String(t)) if !t.trim().is_empty() => t.clone(),
        _ => return Err(config_err(format!("{location} is missing a 'type'"))),
    };

    let check_event = |event: &str, key: &str| -> Result<()> {
        if events.contains(event) {
            Ok(())
        } else {
            Err(config_err(format!(
                "{location}: {key} references undeclared event '{event}'"
            )))
        }
    };

    let description = optional_string(&fields, "description", &location)?;

    let success = optional_string(&fields, "success", &location)?;
    if let Some(event) = &success {
        check_event(event, "success")?;
    }

    let timeout = match fields.get("timeout") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            duration_from_json(value).map_err(|e| config_err(format!("{location}: timeout {e}")))?,
        ),
    };

    let mut error_mappings = HashMap::new();
    match fields.get("error_mappings") {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (code, event) in map {
                let code: i64 = code.trim().parse().map_err(|_| {
                    config_err(format!("{location}: error code '{code}' is not an integer"))
                })?;
                let Value::String(event) = event else {
                    return Err(config_err(format!(
                        "{location}: error_mappings values must be event names"
                    )));
                };
                check_event(event, "error_mappings")?;
                error_mappings.insert(code, event.clone());
            }
        }
        Some(_) => {
            return Err(config_err(format!("{location}: error_mappings must be a mapping")));
        }
    }

    let recoverable_errors = match fields.get("recoverable_errors") {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                let Value::String(event) = item else {
                    return Err(config_err(format!(
                        "{location}: recoverable_errors must list event names"
                    )));
                };
                check_event(event, "recoverable_errors")?;
                list.push(event.clone());
            }
            Some(list)
        }
        Some(_) => {
            return Err(config_err(format!("{location}: recoverable_errors must be a list")));
        }
    };

    for key in RESERVED_ACTION_KEYS {
        fields.remove(*key);
    }

    Ok(ActionSpec {
        action_type,
        description,
        params: Value::Object(fields),
        success,
        timeout,
        error_mappings,
        recoverable_errors,
    })
}

fn optional_string(fields: &Map<String, Value>, key: &str, location: &str) -> Result<Option<String>> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(config_err(format!("{location}: '{key}' must be a string"))),
    }
}

/// Parses `"250ms"`, `"30s"`, `"5m"`, `"1h"` or a bare number of seconds.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    let (number, scale) = if let Some(n) = text.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = text.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = text.strip_suffix('m') {
        (n, 60.0)
    } else if let Some(n) = text.strip_suffix('h') {
        (n, 3600.0)
    } else {
        (text, 1.0)
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("'{text}' is not a duration"))?;
    seconds_to_duration(value * scale)
}

/// Reads a duration from a JSON number (seconds) or a suffixed string.
pub fn duration_from_json(value: &Value) -> std::result::Result<Duration, String> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64().ok_or_else(|| format!("'{n}' is not a duration"))?;
            seconds_to_duration(secs)
        }
        Value::String(s) => parse_duration(s),
        other => Err(format!("'{other}' is not a duration")),
    }
}

fn seconds_to_duration(secs: f64) -> std::result::Result<Duration, String> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("must be a positive duration, got {secs}"));
    }
    // Whole nanoseconds: "30ms" is exactly 30ms.
    let nanos = (secs * 1e9).round();
    if nanos >= u64::MAX as f64 {
        return Err(format!("duration of {secs}s is too large"));
    }
    Ok(Duration::from_nanos(nanos as u64))
}
