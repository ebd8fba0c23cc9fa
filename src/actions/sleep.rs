use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use super::{Action, ActionResult};
use crate::error::ActionError;
use crate::state_machine::ExecutionContext;
use crate::workflow::duration_from_json;

const DEFAULT_DURATION: Duration = Duration::from_secs(1);

/// Waits for `duration` (seconds or `"500ms"`-style string), then signals
/// `event` if given or the configured success event.
pub struct SleepAction;

#[async_trait]
impl Action for SleepAction {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        params: &Value,
    ) -> Result<ActionResult, ActionError> {
        let duration = match params.get("duration") {
            None | Some(Value::Null) => DEFAULT_DURATION,
            Some(value) => duration_from_json(value)
                .map_err(|e| ActionError::InvalidParams(format!("duration: {e}")))?,
        };

        info!(job_id = ctx.job_id(), ?duration, "sleeping");
        tokio::time::sleep(duration).await;

        let result = match params.get("event").and_then(Value::as_str) {
            Some(event) => ActionResult::event(event),
            None => ActionResult::success(),
        };
        Ok(result.with_detail("slept_ms", json!(duration.as_millis() as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionOutcome;
    use std::time::Instant;

    #[tokio::test]
    async fn sleeps_then_succeeds() {
        let started = Instant::now();
        let result = SleepAction
            .execute(&ExecutionContext::new("j", "s"), &json!({"duration": "30ms"}))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(result.outcome, ActionOutcome::Success);
        assert_eq!(result.details.get("slept_ms"), Some(&json!(30)));
    }

    #[tokio::test]
    async fn custom_event() {
        let result = SleepAction
            .execute(
                &ExecutionContext::new("j", "s"),
                &json!({"duration": 0.01, "event": "work_done"}),
            )
            .await
            .unwrap();
        assert_eq!(result.outcome, ActionOutcome::Event("work_done".into()));
    }

    #[tokio::test]
    async fn rejects_bad_duration() {
        let err = SleepAction
            .execute(&ExecutionContext::new("j", "s"), &json!({"duration": "soon"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));
    }
}
