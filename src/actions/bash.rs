use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::{debug, info};

use super::{Action, ActionResult};
use crate::error::ActionError;
use crate::state_machine::ExecutionContext;

/// Longest stdout/stderr excerpt kept in step metadata.
const EXCERPT_LIMIT: usize = 2000;

/// Runs `command` through `sh -c`.
///
/// Exit 0 is success; any other exit status becomes `Failed { code }` for the
/// dispatcher to map. A child killed by a signal reports code `-1`.
///
/// The shell runs as the leader of its own process group, and the whole group
/// is killed when the future is dropped. A dispatcher timeout therefore stops
/// pipelines and nested scripts too, not just `sh`.
pub struct BashAction;

#[async_trait]
impl Action for BashAction {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        params: &Value,
    ) -> Result<ActionResult, ActionError> {
        let command = params
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ActionError::InvalidParams("bash action requires 'command'".into()))?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(cwd) = params.get("cwd").and_then(Value::as_str) {
            cmd.current_dir(cwd);
        }
        if let Some(env) = params.get("env") {
            let env = env
                .as_object()
                .ok_or_else(|| ActionError::InvalidParams("'env' must be a map".into()))?;
            for (key, value) in env {
                match value {
                    Value::String(s) => cmd.env(key, s),
                    other => cmd.env(key, other.to_string()),
                };
            }
        }

        debug!(job_id = ctx.job_id(), command, "running shell command");
        let child = cmd.spawn()?;
        let _group = GroupKill::new(child.id());
        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let code = output.status.code();
        let mut result = if output.status.success() {
            info!(job_id = ctx.job_id(), "shell command succeeded");
            let mut result = ActionResult::success();
            if let Some(var) = params.get("output_var").and_then(Value::as_str) {
                result = result.with_output(var, json!(stdout.trim_end()));
            }
            result
        } else {
            let message = match code {
                Some(code) => format!("exited with status {code}: {}", stderr.trim()),
                None => format!("terminated by signal: {}", stderr.trim()),
            };
            ActionResult::failed(code.map(i64::from).unwrap_or(-1), Some(message))
        };

        result = result.with_detail("exit_code", json!(code));
        if !stdout.is_empty() {
            result = result.with_detail("stdout", json!(excerpt(&stdout)));
        }
        if !stderr.is_empty() {
            result = result.with_detail("stderr", json!(excerpt(&stderr)));
        }
        Ok(result)
    }
}

/// SIGKILLs a process group on drop. Members that already exited are ignored.
struct GroupKill {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<i32>,
}

impl GroupKill {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|pid| i32::try_from(pid).ok()),
        }
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            // SAFETY: kill(2) takes plain integers and touches no memory of ours.
            let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
            if rc == 0 {
                debug!(pgid, "killed shell process group");
            }
        }
    }
}

/// Tail of `text`, cut on a char boundary.
fn excerpt(text: &str) -> &str {
    if text.len() <= EXCERPT_LIMIT {
        return text;
    }
    let mut start = text.len() - EXCERPT_LIMIT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionOutcome;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("job-1", "build")
    }

    #[tokio::test]
    async fn zero_exit_is_success_and_captures_stdout() {
        let result = BashAction
            .execute(&ctx(), &json!({"command": "echo hello", "output_var": "greeting"}))
            .await
            .unwrap();
        assert_eq!(result.outcome, ActionOutcome::Success);
        assert_eq!(result.outputs.get("greeting"), Some(&json!("hello")));
        assert_eq!(result.details.get("exit_code"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_code() {
        let result = BashAction
            .execute(&ctx(), &json!({"command": "echo nope >&2; exit 3"}))
            .await
            .unwrap();
        match result.outcome {
            ActionOutcome::Failed { code, message } => {
                assert_eq!(code, 3);
                assert!(message.unwrap().contains("nope"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(result.details.get("stderr"), Some(&json!("nope\n")));
        assert!(result.outputs.is_empty());
    }

    #[tokio::test]
    async fn signal_death_reports_minus_one() {
        let result = BashAction
            .execute(&ctx(), &json!({"command": "kill -9 $$"}))
            .await
            .unwrap();
        assert!(matches!(result.outcome, ActionOutcome::Failed { code: -1, .. }));
    }

    #[tokio::test]
    async fn env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let params = json!({
            "command": "ls; echo \"$GREETING $COUNT\"",
            "cwd": dir.path().to_str().unwrap(),
            "env": {"GREETING": "hi", "COUNT": 2},
            "output_var": "out",
        });
        let result = BashAction.execute(&ctx(), &params).await.unwrap();
        assert_eq!(result.outputs.get("out"), Some(&json!("marker.txt\nhi 2")));
    }

    #[tokio::test]
    async fn missing_command_is_invalid() {
        let err = BashAction.execute(&ctx(), &json!({})).await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));

        let err = BashAction
            .execute(&ctx(), &json!({"command": "true", "env": "nope"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidParams(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropping_the_run_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let params = json!({
            "command": "sh -c 'sleep 1; touch marker'; true",
            "cwd": dir.path().to_str().unwrap(),
        });

        let context = ctx();
        let run = BashAction.execute(&context, &params);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(200), run)
                .await
                .is_err()
        );

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!dir.path().join("marker").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn background_children_do_not_outlive_a_finished_command() {
        let dir = tempfile::tempdir().unwrap();
        let params = json!({
            "command": "(sleep 1; touch marker) >/dev/null 2>&1 &",
            "cwd": dir.path().to_str().unwrap(),
        });
        let result = BashAction.execute(&ctx(), &params).await.unwrap();
        assert_eq!(result.outcome, ActionOutcome::Success);

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert!(!dir.path().join("marker").exists());
    }

    #[test]
    fn excerpt_keeps_the_tail() {
        let long = format!("{}é{}", "a".repeat(EXCERPT_LIMIT), "b".repeat(10));
        let tail = excerpt(&long);
        assert!(tail.len() <= EXCERPT_LIMIT);
        assert!(tail.ends_with("bbbbbbbbbb"));
        assert_eq!(excerpt("short"), "short");
    }
}
