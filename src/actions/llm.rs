//! `llm` action: one prompt sent to the Anthropic Messages API.
//!
//! Rate limits and API errors come back as numeric failure codes so a
//! workflow can map them (`429: rate_limited`); transport failures are
//! action errors and become the generic `error` event.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{Action, ActionResult};
use crate::config::EngineConfig;
use crate::error::ActionError;
use crate::state_machine::ExecutionContext;

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_OUTPUT_VAR: &str = "llm_response";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

/// One response block. Non-text blocks carry no `text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl MessagesResponse {
    /// Concatenated text of every `text` block.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.content_type == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// What came back from one Messages call, short of a transport failure.
enum Reply {
    Message(MessagesResponse),
    RateLimited { retry_after_ms: u64 },
    Rejected { status: u16, body: String },
}

/// Sends `prompt` and stores the reply text in `output_var`.
///
/// The HTTP client is built once and shared by every dispatch.
pub struct LlmAction {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl LlmAction {
    pub fn new(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ActionError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ActionError> {
        Self::new(&config.api_key, &config.llm_base_url, &config.llm_model)
    }

    async fn post(&self, request: &MessagesRequest) -> Result<Reply, reqwest::Error> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok()?.parse::<u64>().ok())
                .unwrap_or(1);
            return Ok(Reply::RateLimited {
                retry_after_ms: retry_after_secs.saturating_mul(1000),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(Reply::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(Reply::Message(response.json().await?))
    }
}

#[async_trait]
impl Action for LlmAction {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        params: &Value,
    ) -> Result<ActionResult, ActionError> {
        let prompt = params
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| ActionError::InvalidParams("llm action requires 'prompt'".into()))?;
        if self.api_key.is_empty() {
            return Err(ActionError::InvalidParams(
                "no API key configured (set ANTHROPIC_API_KEY)".into(),
            ));
        }

        let request = MessagesRequest {
            model: params
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(&self.model)
                .to_string(),
            max_tokens: params
                .get("max_tokens")
                .and_then(Value::as_u64)
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                .unwrap_or(DEFAULT_MAX_TOKENS),
            messages: vec![Message {
                role: "user".into(),
                content: prompt.to_string(),
            }],
        };
        let output_var = params
            .get("output_var")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_OUTPUT_VAR);

        debug!(job_id = ctx.job_id(), model = %request.model, "sending prompt");
        let result = match self.post(&request).await? {
            Reply::Message(response) => ActionResult::success()
                .with_output(output_var, json!(response.text()))
                .with_detail("model", json!(response.model))
                .with_detail("stop_reason", json!(response.stop_reason))
                .with_detail("input_tokens", json!(response.usage.input_tokens))
                .with_detail("output_tokens", json!(response.usage.output_tokens)),
            Reply::RateLimited { retry_after_ms } => {
                warn!(job_id = ctx.job_id(), retry_after_ms, "rate limited");
                let message = format!("rate limited, retry after {retry_after_ms}ms");
                ActionResult::failed(429, Some(message))
                    .with_detail("retry_after_ms", json!(retry_after_ms))
            }
            Reply::Rejected { status, body } => {
                warn!(job_id = ctx.job_id(), status, "API error");
                ActionResult::failed(i64::from(status), Some(body))
            }
        };
        Ok(result)
    }
}
