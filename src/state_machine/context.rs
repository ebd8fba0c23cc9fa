use std::borrow::Cow;

use serde_json::{Map, Value};

use super::job::Job;

/// Variables visible to the actions of one job run.
///
/// Seeded from the job payload (or from the variables checkpointed by an
/// earlier run) and only ever extended: later writes overwrite a key, nothing
/// is removed.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    job_id: String,
    state: String,
    variables: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(job_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: state.into(),
            variables: Map::new(),
        }
    }

    /// Builds the context for a claimed job, resuming from its checkpoint if it has one.
    pub fn for_job(job: &Job, initial_state: &str) -> Self {
        let state = job.current_state.as_deref().unwrap_or(initial_state);
        let mut ctx = Self::new(job.id.clone(), state);
        ctx.extend(job.payload.clone());
        ctx.extend(job.variables.clone());
        ctx
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub(crate) fn enter(&mut self, state: &str) {
        self.state = state.to_string();
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    pub fn extend(&mut self, values: Map<String, Value>) {
        for (key, value) in values {
            self.variables.insert(key, value);
        }
    }

    /// Resolves a placeholder name to its textual value.
    ///
    /// Exact keys win; otherwise a dotted name walks nested objects
    /// (`user.name`). `job_id` and `state` fall back to the run's own values.
    pub fn lookup(&self, name: &str) -> Option<Cow<'_, str>> {
        if let Some(value) = self.variables.get(name) {
            return Some(render_value(value));
        }

        if name.contains('.') {
            let mut parts = name.split('.');
            let first = parts.next()?;
            let mut current = self.variables.get(first)?;
            for part in parts {
                current = match current {
                    Value::Object(map) => map.get(part)?,
                    Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                    _ => return None,
                };
            }
            return Some(render_value(current));
        }

        match name {
            "job_id" => Some(Cow::Borrowed(self.job_id.as_str())),
            "state" => Some(Cow::Borrowed(self.state.as_str())),
            _ => None,
        }
    }
}

fn render_value(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s.as_str()),
        Value::Null => Cow::Borrowed(""),
        other => Cow::Owned(other.to_string()),
    }
}
