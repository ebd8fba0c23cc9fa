//! Workflow documents: the validated state/event/transition graph and the
//! per-state action lists the engine executes.

mod definition;
mod loader;

pub use definition::{
    ActionSpec, DEFAULT_SUCCESS_EVENT, Transition, TransitionTable, WILDCARD, WorkflowDefinition,
};
pub use loader::{duration_from_json, load_file, load_str, parse_duration};
