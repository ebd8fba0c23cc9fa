//! Event-driven finite-state-machine workflows over a durable SQLite job queue.
//!
//! A workflow document ([`workflow`]) declares states, events, transitions and
//! per-state action lists. The [`state_machine::Engine`] claims jobs from the
//! [`store::JobQueue`], runs each state's actions through the
//! [`actions::Dispatcher`], resolves the resulting event to the next state and
//! logs every action with the [`store::StepRecorder`].

pub mod actions;
pub mod config;
pub mod error;
pub mod state_machine;
pub mod store;
pub mod workflow;
