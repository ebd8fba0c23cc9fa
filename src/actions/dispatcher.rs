use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::template::substitute;
use super::{ActionOutcome, ActionRegistry};
use crate::error::{EngineError, Result};
use crate::state_machine::ExecutionContext;
use crate::workflow::ActionSpec;

/// Event synthesized when an action exceeds its timeout.
pub const TIMEOUT_EVENT: &str = "timeout";
/// Event for failures with no configured mapping.
pub const ERROR_EVENT: &str = "error";

/// How one dispatched action affects the rest of the state's action list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The action's success event; the next action runs.
    Success(String),
    /// Any other event; ends the action phase and drives the transition.
    Event(String),
    /// Nothing to do yet; the job is parked.
    Pending,
    /// A mapped failure outside the action's `recoverable_errors`; fails the job.
    Unrecoverable { event: String, message: String },
}

impl StepOutcome {
    /// Outcome string written to the step record.
    pub fn label(&self) -> &str {
        match self {
            StepOutcome::Success(event) | StepOutcome::Event(event) => event.as_str(),
            StepOutcome::Unrecoverable { event, .. } => event.as_str(),
            StepOutcome::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispatched {
    pub outcome: StepOutcome,
    pub outputs: Map<String, Value>,
    pub metadata: Value,
}

/// Runs configured actions: substitution, timeout enforcement and error-code mapping.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ActionRegistry>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ActionRegistry>, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub async fn dispatch(&self, spec: &ActionSpec, ctx: &ExecutionContext) -> Result<Dispatched> {
        let action = self
            .registry
            .create(&spec.action_type)
            .ok_or_else(|| EngineError::UnknownAction(spec.action_type.clone()))?;

        let params = substitute(&spec.params, ctx);
        let mut metadata = Map::new();
        metadata.insert("type".into(), json!(spec.action_type));
        if !params.unresolved.is_empty() {
            warn!(
                job_id = ctx.job_id(),
                action = spec.label(),
                placeholders = ?params.unresolved,
                "unresolved placeholders left as literal text"
            );
            metadata.insert("unresolved_placeholders".into(), json!(params.unresolved));
        }

        let limit = spec.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        let result = tokio::time::timeout(limit, action.execute(ctx, &params.value)).await;
        metadata.insert("duration_ms".into(), json!(started.elapsed().as_millis() as u64));

        let mut outputs = Map::new();
        let outcome = match result {
            Err(_elapsed) => {
                warn!(job_id = ctx.job_id(), action = spec.label(), ?limit, "action timed out");
                metadata.insert("timeout_ms".into(), json!(limit.as_millis() as u64));
                StepOutcome::Event(TIMEOUT_EVENT.to_string())
            }
            Ok(Err(e)) => {
                warn!(job_id = ctx.job_id(), action = spec.label(), error = %e, "action errored");
                metadata.insert("error".into(), json!(e.to_string()));
                StepOutcome::Event(ERROR_EVENT.to_string())
            }
            Ok(Ok(result)) => {
                outputs = result.outputs;
                for (key, value) in result.details {
                    metadata.insert(key, value);
                }
                map_outcome(spec, result.outcome, &mut metadata)
            }
        };

        debug!(
            job_id = ctx.job_id(),
            action = spec.label(),
            outcome = outcome.label(),
            "action dispatched"
        );
        Ok(Dispatched {
            outcome,
            outputs,
            metadata: Value::Object(metadata),
        })
    }
}

fn map_outcome(spec: &ActionSpec, outcome: ActionOutcome, metadata: &mut Map<String, Value>) -> StepOutcome {
    let success = spec.success_event();
    match outcome {
        ActionOutcome::Success => StepOutcome::Success(success.to_string()),
        ActionOutcome::Event(event) if event == success => StepOutcome::Success(event),
        ActionOutcome::Event(event) => StepOutcome::Event(event),
        ActionOutcome::Pending => StepOutcome::Pending,
        ActionOutcome::Failed { code, message } => {
            metadata.insert("code".into(), json!(code));
            if let Some(message) = &message {
                metadata.insert("message".into(), json!(message));
            }
            match spec.error_mappings.get(&code) {
                Some(event) if !spec.is_recoverable(event) => StepOutcome::Unrecoverable {
                    event: event.clone(),
                    message: message
                        .unwrap_or_else(|| format!("action '{}' failed with code {code}", spec.label())),
                },
                Some(event) => StepOutcome::Event(event.clone()),
                None => StepOutcome::Event(ERROR_EVENT.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, ActionResult};
    use crate::error::ActionError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Returns a fixed result and remembers the params it was called with.
    struct Scripted {
        result: fn() -> std::result::Result<ActionResult, ActionError>,
        seen: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Action for Scripted {
        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            params: &Value,
        ) -> std::result::Result<ActionResult, ActionError> {
            self.seen.lock().unwrap().push(params.clone());
            (self.result)()
        }
    }

    struct Slow;

    #[async_trait]
    impl Action for Slow {
        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            _params: &Value,
        ) -> std::result::Result<ActionResult, ActionError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(ActionResult::success())
        }
    }

    fn dispatcher_with(name: &str, action: Arc<dyn Action>) -> Dispatcher {
        let mut registry = ActionRegistry::new();
        registry.register_shared(name, action);
        registry.register_shared("slow", Arc::new(Slow));
        Dispatcher::new(Arc::new(registry), Duration::from_secs(5))
    }

    fn scripted(result: fn() -> std::result::Result<ActionResult, ActionError>) -> Arc<Scripted> {
        Arc::new(Scripted {
            result,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn spec(action_type: &str) -> ActionSpec {
        ActionSpec::new(action_type)
    }

    #[tokio::test]
    async fn success_uses_configured_event() {
        let action = scripted(|| Ok(ActionResult::success().with_output("x", json!(1))));
        let dispatcher = dispatcher_with("t", action);
        let spec = ActionSpec {
            success: Some("ok".into()),
            ..spec("t")
        };

        let dispatched = dispatcher.dispatch(&spec, &ExecutionContext::new("j", "s")).await.unwrap();
        assert_eq!(dispatched.outcome, StepOutcome::Success("ok".into()));
        assert_eq!(dispatched.outputs.get("x"), Some(&json!(1)));
        assert_eq!(dispatched.metadata["type"], json!("t"));
    }

    #[tokio::test]
    async fn explicit_events_split_into_success_and_other() {
        let action = scripted(|| Ok(ActionResult::event("job_done")));
        let dispatcher = dispatcher_with("t", action);
        let ctx = ExecutionContext::new("j", "s");

        let dispatched = dispatcher.dispatch(&spec("t"), &ctx).await.unwrap();
        assert_eq!(dispatched.outcome, StepOutcome::Success("job_done".into()));

        let other = ActionSpec {
            success: Some("ok".into()),
            ..spec("t")
        };
        let dispatched = dispatcher.dispatch(&other, &ctx).await.unwrap();
        assert_eq!(dispatched.outcome, StepOutcome::Event("job_done".into()));
    }

    #[tokio::test]
    async fn failure_codes_map_through_error_mappings() {
        let ctx = ExecutionContext::new("j", "s");
        let spec = ActionSpec {
            error_mappings: HashMap::from([(1, "validation_failed".to_string())]),
            ..spec("t")
        };

        let mapped = dispatcher_with("t", scripted(|| Ok(ActionResult::failed(1, Some("bad".into())))));
        let dispatched = mapped.dispatch(&spec, &ctx).await.unwrap();
        assert_eq!(dispatched.outcome, StepOutcome::Event("validation_failed".into()));
        assert_eq!(dispatched.metadata["code"], json!(1));
        assert_eq!(dispatched.metadata["message"], json!("bad"));

        let unmapped = dispatcher_with("t", scripted(|| Ok(ActionResult::failed(7, None))));
        let dispatched = unmapped.dispatch(&spec, &ctx).await.unwrap();
        assert_eq!(dispatched.outcome, StepOutcome::Event(ERROR_EVENT.into()));
    }

    #[tokio::test]
    async fn mapped_event_outside_recoverable_list_is_unrecoverable() {
        let ctx = ExecutionContext::new("j", "s");
        let spec = ActionSpec {
            error_mappings: HashMap::from([
                (1, "validation_failed".to_string()),
                (2, "disk_full".to_string()),
            ]),
            recoverable_errors: Some(vec!["validation_failed".into()]),
            ..spec("t")
        };

        let dispatcher = dispatcher_with("t", scripted(|| Ok(ActionResult::failed(2, None))));
        let dispatched = dispatcher.dispatch(&spec, &ctx).await.unwrap();
        match dispatched.outcome {
            StepOutcome::Unrecoverable { event, message } => {
                assert_eq!(event, "disk_full");
                assert!(message.contains("code 2"));
            }
            other => panic!("expected unrecoverable, got {other:?}"),
        }

        let dispatcher = dispatcher_with("t", scripted(|| Ok(ActionResult::failed(1, None))));
        let dispatched = dispatcher.dispatch(&spec, &ctx).await.unwrap();
        assert_eq!(dispatched.outcome, StepOutcome::Event("validation_failed".into()));
    }

    #[tokio::test]
    async fn action_errors_become_generic_failure() {
        let dispatcher = dispatcher_with(
            "t",
            scripted(|| Err(ActionError::InvalidParams("no command".into()))),
        );
        let dispatched = dispatcher
            .dispatch(&spec("t"), &ExecutionContext::new("j", "s"))
            .await
            .unwrap();
        assert_eq!(dispatched.outcome, StepOutcome::Event(ERROR_EVENT.into()));
        assert!(dispatched.metadata["error"].as_str().unwrap().contains("no command"));
    }

    #[tokio::test]
    async fn timeout_cancels_and_synthesizes_event() {
        let dispatcher = dispatcher_with("t", scripted(|| Ok(ActionResult::success())));
        let spec = ActionSpec {
            timeout: Some(Duration::from_millis(20)),
            ..spec("slow")
        };

        let started = Instant::now();
        let dispatched = dispatcher
            .dispatch(&spec, &ExecutionContext::new("j", "s"))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(dispatched.outcome, StepOutcome::Event(TIMEOUT_EVENT.into()));
        assert_eq!(dispatched.metadata["timeout_ms"], json!(20));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bash_timeout_leaves_no_surviving_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher_with("bash", Arc::new(crate::actions::BashAction));
        let spec = ActionSpec {
            params: json!({
                "command": "sh -c 'sleep 1; touch marker'; true",
                "cwd": dir.path().to_str().unwrap(),
            }),
            timeout: Some(Duration::from_millis(200)),
            ..spec("bash")
        };

        let dispatched = dispatcher
            .dispatch(&spec, &ExecutionContext::new("j", "s"))
            .await
            .unwrap();
        assert_eq!(dispatched.outcome, StepOutcome::Event(TIMEOUT_EVENT.into()));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn params_are_substituted_before_execute() {
        let action = scripted(|| Ok(ActionResult::success()));
        let dispatcher = dispatcher_with("t", action.clone());
        let mut ctx = ExecutionContext::new("j", "s");
        ctx.set("topic", json!("queues"));
        let spec = ActionSpec {
            params: json!({"command": "echo {topic} {unknown}"}),
            ..spec("t")
        };

        let dispatched = dispatcher.dispatch(&spec, &ctx).await.unwrap();
        assert_eq!(
            action.seen.lock().unwrap()[0],
            json!({"command": "echo queues {unknown}"})
        );
        assert_eq!(dispatched.metadata["unresolved_placeholders"], json!(["unknown"]));
    }

    #[tokio::test]
    async fn unknown_type_is_an_engine_error() {
        let dispatcher = dispatcher_with("t", scripted(|| Ok(ActionResult::success())));
        let err = dispatcher
            .dispatch(&spec("nope"), &ExecutionContext::new("j", "s"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownAction(t) if t == "nope"));
    }

    #[test]
    fn pending_label() {
        assert_eq!(StepOutcome::Pending.label(), "pending");
        assert_eq!(StepOutcome::Success("ok".into()).label(), "ok");
    }
}
