use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{Action, ActionResult};
use crate::error::ActionError;
use crate::state_machine::ExecutionContext;

/// Writes `message` to the engine log at `level` (`info`, `warn` or `debug`).
pub struct LogAction;

#[async_trait]
impl Action for LogAction {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        params: &Value,
    ) -> Result<ActionResult, ActionError> {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::InvalidParams("log action requires 'message'".into()))?;
        let level = params.get("level").and_then(Value::as_str).unwrap_or("info");

        let job_id = ctx.job_id();
        let state = ctx.state();
        match level {
            "info" => info!(job_id, state, "{message}"),
            "warn" | "warning" => warn!(job_id, state, "{message}"),
            "debug" => debug!(job_id, state, "{message}"),
            other => {
                return Err(ActionError::InvalidParams(format!(
                    "unknown log level '{other}'"
                )));
            }
        }
        Ok(ActionResult::success().with_detail("message", json!(message)))
    }
}
