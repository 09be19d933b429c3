//! Anthropic Messages API adapter.
//!
//! The normalized message list is folded into Anthropic's shape: a leading
//! system message becomes the `system` field, tool calls and tool results
//! become `tool_use` / `tool_result` content blocks, and consecutive
//! messages of the same role are merged because the API requires
//! alternating turns.

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::tokens::{CharEstimator, TokenCounter};
use super::types::{
    ChatCompletionMessage, ChatCompletionResult, CompletionParams, FinishReason, Role, ToolCall,
};
use super::{ChatCompletionApi, CompletionAttempt};
use crate::auth::{AuthorizationVariableKind, AuthorizationVariableSpec, Credentials};
use crate::config::ProviderEntry;
use crate::error::{Error, Result};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const PROVIDER_NAME: &str = "Anthropic";

/// Context window shared by current Claude models.
const TOKEN_LIMIT: usize = 200_000;

/// `max_tokens` is mandatory for this API.
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicApi {
    client: Client,
    base_url: String,
    counter: CharEstimator,
    token_limit: usize,
}

impl AnthropicApi {
    pub fn new(api_base: Option<&str>, client: Client) -> Self {
        let base_url = api_base
            .unwrap_or(ANTHROPIC_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        debug!(provider = PROVIDER_NAME, base_url = %base_url, "Initialized chat completion adapter");
        Self {
            client,
            base_url,
            counter: CharEstimator::default(),
            token_limit: TOKEN_LIMIT,
        }
    }

    pub fn with_token_limit(mut self, limit: usize) -> Self {
        self.token_limit = limit;
        self
    }

    /// Adapter configured from a `providers.anthropic` entry.
    pub fn from_entry(entry: Option<&ProviderEntry>, client: Client) -> Self {
        let api = Self::new(entry.and_then(|e| e.api_base.as_deref()), client);
        match entry.and_then(|e| e.token_limit) {
            Some(limit) => api.with_token_limit(limit),
            None => api,
        }
    }

    fn is_retryable_status(status: reqwest::StatusCode) -> bool {
        matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504 | 529)
    }

    fn map_stop_reason(reason: Option<&str>) -> Result<FinishReason> {
        match reason.unwrap_or("end_turn") {
            "end_turn" | "stop_sequence" => Ok(FinishReason::Stop),
            "max_tokens" => Ok(FinishReason::Length),
            "tool_use" => Ok(FinishReason::ToolCalls),
            "refusal" => Ok(FinishReason::ContentFilter),
            other => Err(Error::Provider(anyhow!("unknown stop reason '{other}'"))),
        }
    }

    /// Split off the system prompt and convert the rest into API messages.
    fn convert_messages(messages: &[ChatCompletionMessage]) -> (Option<String>, Vec<ApiMessage>) {
        let (system, rest) = match messages.split_first() {
            Some((first, rest)) if first.role == Role::System => (first.content.clone(), rest),
            _ => (None, messages),
        };

        let mut converted: Vec<ApiMessage> = Vec::new();
        for message in rest {
            let (role, blocks) = match message.role {
                Role::User => ("user", text_blocks(message.content_as_str())),
                Role::System => {
                    let text = match &message.name {
                        Some(name) => format!("[{}] {}", name, message.content_as_str()),
                        None => message.content_as_str().to_string(),
                    };
                    ("user", text_blocks(&text))
                }
                Role::Assistant => {
                    let mut blocks = text_blocks(message.content_as_str());
                    for call in message.tool_calls.iter().flatten() {
                        let input = serde_json::from_str::<Value>(&call.function.arguments)
                            .unwrap_or_else(|_| json!({}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.function.name,
                            "input": input,
                        }));
                    }
                    ("assistant", blocks)
                }
                Role::Tool => (
                    "user",
                    vec![json!({
                        "type": "tool_result",
                        "tool_use_id": message.tool_call_id.clone().unwrap_or_default(),
                        "content": message.content_as_str(),
                    })],
                ),
            };

            match converted.last_mut() {
                Some(last) if last.role == role => last.content.extend(blocks),
                _ => converted.push(ApiMessage {
                    role,
                    content: blocks,
                }),
            }
        }

        (system, converted)
    }
}

fn text_blocks(text: &str) -> Vec<Value> {
    if text.is_empty() {
        Vec::new()
    } else {
        vec![json!({"type": "text", "text": text})]
    }
}

// ── Messages API request/response types ─────────────────────────────

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Vec<Value>,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<UsageResponse>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct UsageResponse {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

#[async_trait]
impl ChatCompletionApi for AnthropicApi {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn auth_variable_specs(&self) -> Vec<AuthorizationVariableSpec> {
        vec![AuthorizationVariableSpec::API_KEY]
    }

    fn token_limit(&self, _model: &str) -> Result<usize> {
        Ok(self.token_limit)
    }

    fn count_tokens(&self, messages: &[ChatCompletionMessage], _model: &str) -> usize {
        self.counter.count_messages(messages)
    }

    async fn call_once(
        &self,
        credentials: &Credentials,
        model: &str,
        messages: &[ChatCompletionMessage],
        params: &CompletionParams,
    ) -> Result<CompletionAttempt> {
        let api_key = credentials
            .get(&AuthorizationVariableKind::ApiKey)
            .ok_or_else(|| Error::ServiceUnauthorized(PROVIDER_NAME.into()))?;
        let (system, api_messages) = Self::convert_messages(messages);

        let tools = params
            .tools
            .iter()
            .flatten()
            .map(|tool| {
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "input_schema": tool.function.parameters,
                })
            })
            .collect();

        let request_body = MessagesRequest {
            model,
            system,
            messages: api_messages,
            max_tokens: params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: params.temperature,
            stop_sequences: params.stop.as_deref(),
            tools,
        };

        let url = format!("{}/messages", self.base_url);
        debug!(model, url = %url, msg_count = messages.len(), "Sending messages request");

        let response = match self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request_body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Network error calling messages API");
                return Ok(CompletionAttempt::RetryRequested(e.into()));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Ok(CompletionAttempt::RetryRequested(e.into())),
        };

        if !status.is_success() {
            let err_msg = serde_json::from_str::<ErrorBody>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| body.clone());
            if Self::is_retryable_status(status) {
                warn!(status = %status, "Transient messages API error");
                return Ok(CompletionAttempt::RetryRequested(anyhow!(
                    "messages API error ({status}): {err_msg}"
                )));
            }
            return Err(Error::Provider(anyhow!("messages API error ({status}): {err_msg}")));
        }

        let parsed: MessagesResponse = match serde_json::from_str(&body) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Malformed messages API response");
                return Ok(CompletionAttempt::RetryRequested(e.into()));
            }
        };

        let finish_reason = Self::map_stop_reason(parsed.stop_reason.as_deref())?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(&t),
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall::function(id, name, input.to_string()));
                }
                ContentBlock::Other => {}
            }
        }

        let (prompt_tokens, completion_tokens) = parsed
            .usage
            .map(|u| (Some(u.input_tokens), Some(u.output_tokens)))
            .unwrap_or((None, None));

        Ok(CompletionAttempt::Completed(ChatCompletionResult {
            message: ChatCompletionMessage {
                content: Some(text),
                role: Role::Assistant,
                name: None,
                tool_call_id: None,
                tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            },
            finish_reason,
            provider: PROVIDER_NAME.into(),
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.zip(completion_tokens).map(|(p, c)| p + c),
        }))
    }
}
