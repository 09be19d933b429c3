//! OpenAI-compatible chat-completion adapter.
//!
//! Talks to any server exposing the `/chat/completions` endpoint
//! (OpenAI itself, vLLM, or another compatible gateway) directly over
//! `reqwest`. One call per [`ChatCompletionApi::call_once`]; transient
//! failures are reported as [`CompletionAttempt::RetryRequested`] and the
//! retry loop lives in [`ChatCompletionClient`](super::ChatCompletionClient).

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::tokens::{CharEstimator, TokenCounter};
use super::types::{
    ChatCompletionMessage, ChatCompletionResult, CompletionParams, FinishReason, Role, ToolCall,
};
use super::{ChatCompletionApi, CompletionAttempt};
use crate::auth::{AuthorizationVariableKind, AuthorizationVariableSpec, Credentials};
use crate::config::ProviderEntry;
use crate::error::{Error, Result};

/// Default OpenAI endpoint.
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub const PROVIDER_NAME: &str = "OpenAI";

/// Context windows of known model families, most specific first.
const MODEL_TOKEN_LIMITS: &[(&str, usize)] = &[
    ("gpt-4-32k", 32_000),
    ("gpt-3.5-turbo-16k", 16_000),
    ("gpt-3.5-turbo-0125", 16_000),
    ("gpt-3.5-turbo-1106", 16_000),
    ("gpt-4-0125-preview", 128_000),
    ("gpt-4-1106-preview", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-3.5", 4_096),
    ("gpt-4", 8_192),
];

/// Adapter for OpenAI-compatible servers.
pub struct OpenAiApi {
    client: Client,
    base_url: String,
    token_limit_override: Option<usize>,
}

impl OpenAiApi {
    /// Create an adapter.
    ///
    /// # Arguments
    /// * `api_base` - Custom base URL (defaults to the OpenAI endpoint)
    /// * `client` - Shared HTTP client
    pub fn new(api_base: Option<&str>, client: Client) -> Self {
        let base_url = api_base
            .unwrap_or(OPENAI_BASE_URL)
            .trim_end_matches('/')
            .to_string();

        debug!(provider = PROVIDER_NAME, base_url = %base_url, "Initialized chat completion adapter");

        Self {
            client,
            base_url,
            token_limit_override: None,
        }
    }

    /// Fixed context window for servers hosting models outside the known table.
    pub fn with_token_limit(mut self, limit: usize) -> Self {
        self.token_limit_override = Some(limit);
        self
    }

    /// Adapter configured from a `providers.openai` entry.
    pub fn from_entry(entry: Option<&ProviderEntry>, client: Client) -> Self {
        let api = Self::new(entry.and_then(|e| e.api_base.as_deref()), client);
        match entry.and_then(|e| e.token_limit) {
            Some(limit) => api.with_token_limit(limit),
            None => api,
        }
    }

    /// Returns `true` if the HTTP status code is transient and should be retried.
    fn is_retryable_status(status: reqwest::StatusCode) -> bool {
        matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
    }

    /// Map an OpenAI finish reason onto the canonical set.
    fn map_finish_reason(reason: Option<&str>) -> Result<FinishReason> {
        match reason.unwrap_or("stop") {
            "stop" => Ok(FinishReason::Stop),
            "length" => Ok(FinishReason::Length),
            "tool_calls" | "function_call" => Ok(FinishReason::ToolCalls),
            "content_filter" => Ok(FinishReason::ContentFilter),
            other => Err(Error::Provider(anyhow!("unknown finish reason '{other}'"))),
        }
    }

    #[cfg(feature = "tiktoken")]
    fn counter(&self, model: &str) -> Box<dyn TokenCounter> {
        match super::tokens::TikTokenCounter::for_model(model) {
            Ok(counter) => Box::new(counter),
            Err(e) => {
                warn!(model, error = %e, "Falling back to character token estimate");
                Box::new(CharEstimator::default())
            }
        }
    }

    #[cfg(not(feature = "tiktoken"))]
    fn counter(&self, _model: &str) -> Box<dyn TokenCounter> {
        Box::new(CharEstimator::default())
    }
}

// ── OpenAI API request/response types ───────────────────────────────

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatCompletionMessage],
    #[serde(flatten)]
    params: &'a CompletionParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageResponse>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageResponse,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct MessageResponse {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct UsageResponse {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorResponse {
    Single(ErrorBody),
    Multiple(Vec<ErrorBody>),
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

impl ErrorResponse {
    fn message(&self) -> String {
        match self {
            Self::Single(b) => b.error.message.clone(),
            Self::Multiple(v) => v
                .first()
                .map(|b| b.error.message.clone())
                .unwrap_or_else(|| "Unknown error".into()),
        }
    }
}

// ── ChatCompletionApi implementation ────────────────────────────────

#[async_trait]
impl ChatCompletionApi for OpenAiApi {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn auth_variable_specs(&self) -> Vec<AuthorizationVariableSpec> {
        vec![AuthorizationVariableSpec::API_KEY]
    }

    fn token_limit(&self, model: &str) -> Result<usize> {
        if let Some(limit) = self.token_limit_override {
            return Ok(limit);
        }
        MODEL_TOKEN_LIMITS
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix))
            .map(|(_, limit)| *limit)
            .ok_or_else(|| Error::UnknownModel(model.to_string()))
    }

    fn count_tokens(&self, messages: &[ChatCompletionMessage], model: &str) -> usize {
        self.counter(model).count_messages(messages)
    }

    async fn call_once(
        &self,
        credentials: &Credentials,
        model: &str,
        messages: &[ChatCompletionMessage],
        params: &CompletionParams,
    ) -> Result<CompletionAttempt> {
        let url = format!("{}/chat/completions", self.base_url);
        let api_key = credentials
            .get(&AuthorizationVariableKind::ApiKey)
            .ok_or_else(|| Error::ServiceUnauthorized(PROVIDER_NAME.into()))?;

        let request_body = CompletionRequest {
            model,
            messages,
            params,
            tool_choice: params.tools.as_ref().map(|_| "auto"),
        };

        debug!(model, url = %url, msg_count = messages.len(), "Sending chat completion request");

        let response = match self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request_body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                // Network-level errors are always retryable.
                warn!(error = %e, "Network error calling chat completion API");
                return Ok(CompletionAttempt::RetryRequested(e.into()));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Ok(CompletionAttempt::RetryRequested(e.into())),
        };

        if !status.is_success() {
            let err_msg = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.message())
                .unwrap_or_else(|_| body.clone());

            if Self::is_retryable_status(status) {
                warn!(status = %status, "Transient chat completion error");
                return Ok(CompletionAttempt::RetryRequested(anyhow!(
                    "chat completion error ({status}): {err_msg}"
                )));
            }

            return Err(Error::Provider(anyhow!("chat completion error ({status}): {err_msg}")));
        }

        let completion: CompletionResponse = match serde_json::from_str(&body) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Malformed chat completion response");
                return Ok(CompletionAttempt::RetryRequested(e.into()));
            }
        };

        let Some(choice) = completion.choices.into_iter().next() else {
            return Ok(CompletionAttempt::RetryRequested(anyhow!(
                "chat completion returned no choices"
            )));
        };

        let finish_reason = Self::map_finish_reason(choice.finish_reason.as_deref())?;
        let tool_calls = choice.message.tool_calls.filter(|calls| !calls.is_empty());
        let usage = completion.usage;

        debug!(
            finish_reason = %finish_reason,
            tool_calls = tool_calls.as_ref().map_or(0, Vec::len),
            "Received chat completion response"
        );

        Ok(CompletionAttempt::Completed(ChatCompletionResult {
            message: ChatCompletionMessage {
                content: choice.message.content,
                role: Role::Assistant,
                name: None,
                tool_call_id: None,
                tool_calls,
            },
            finish_reason,
            provider: PROVIDER_NAME.into(),
            model: completion.model.unwrap_or_else(|| model.to_string()),
            prompt_tokens: usage.as_ref().and_then(|u| u.prompt_tokens),
            completion_tokens: usage.as_ref().and_then(|u| u.completion_tokens),
            total_tokens: usage.as_ref().and_then(|u| u.total_tokens),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> Credentials {
        let mut creds = Credentials::new();
        creds.insert(AuthorizationVariableKind::ApiKey, "test-key".into());
        creds
    }

    #[test]
    fn test_default_and_custom_base_url() {
        let p = OpenAiApi::new(None, Client::new());
        assert_eq!(p.base_url, "https://api.openai.com/v1");

        let p = OpenAiApi::new(Some("http://localhost:8000/v1/"), Client::new());
        assert_eq!(p.base_url, "http://localhost:8000/v1");
    }

    #[test]
    fn test_retryable_status() {
        assert!(OpenAiApi::is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(OpenAiApi::is_retryable_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(OpenAiApi::is_retryable_status(reqwest::StatusCode::GATEWAY_TIMEOUT));

        assert!(!OpenAiApi::is_retryable_status(reqwest::StatusCode::BAD_REQUEST));
        assert!(!OpenAiApi::is_retryable_status(reqwest::StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_model_token_limits() {
        let p = OpenAiApi::new(None, Client::new());
        assert_eq!(p.token_limit("gpt-4-32k").unwrap(), 32_000);
        assert_eq!(p.token_limit("gpt-4o-mini").unwrap(), 128_000);
        assert_eq!(p.token_limit("gpt-4-turbo-preview").unwrap(), 128_000);
        assert_eq!(p.token_limit("gpt-3.5-turbo").unwrap(), 4_096);
        assert_eq!(p.token_limit("gpt-3.5-turbo-0125").unwrap(), 16_000);
        assert_eq!(p.token_limit("gpt-4-0613").unwrap(), 8_192);
        assert!(matches!(p.token_limit("llama-3"), Err(Error::UnknownModel(_))));

        let p = p.with_token_limit(4_000);
        assert_eq!(p.token_limit("llama-3").unwrap(), 4_000);
    }

    #[test]
    fn test_from_entry_applies_configured_limit() {
        let entry = ProviderEntry {
            api_base: Some("http://localhost:8000/v1/".into()),
            token_limit: Some(32_768),
            ..Default::default()
        };
        let p = OpenAiApi::from_entry(Some(&entry), Client::new());
        assert_eq!(p.base_url, "http://localhost:8000/v1");
        assert_eq!(p.token_limit("Qwen/Qwen2.5-7B-Instruct").unwrap(), 32_768);

        let p = OpenAiApi::from_entry(None, Client::new());
        assert!(matches!(p.token_limit("Qwen/Qwen2.5-7B-Instruct"), Err(Error::UnknownModel(_))));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(OpenAiApi::map_finish_reason(None).unwrap(), FinishReason::Stop);
        assert_eq!(
            OpenAiApi::map_finish_reason(Some("function_call")).unwrap(),
            FinishReason::ToolCalls
        );
        assert!(OpenAiApi::map_finish_reason(Some("mystery")).is_err());
    }

    #[tokio::test]
    async fn test_successful_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o-2024-05-13",
                "choices": [{
                    "message": {"role": "assistant", "content": "Hello!"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}
            })))
            .mount(&server)
            .await;

        let api = OpenAiApi::new(Some(&server.uri()), Client::new());
        let attempt = api
            .call_once(&credentials(), "gpt-4o", &[ChatCompletionMessage::user("Hi")], &CompletionParams::default())
            .await
            .unwrap();

        let CompletionAttempt::Completed(result) = attempt else {
            panic!("expected a completed attempt");
        };
        assert_eq!(result.message.content_as_str(), "Hello!");
        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(result.provider, PROVIDER_NAME);
        assert_eq!(result.model, "gpt-4o-2024-05-13");
        assert_eq!(result.total_tokens, Some(11));
    }

    #[tokio::test]
    async fn test_tool_call_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "get_weather", "arguments": "{\"city\":\"Seoul\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            })))
            .mount(&server)
            .await;

        let api = OpenAiApi::new(Some(&server.uri()), Client::new());
        let attempt = api
            .call_once(&credentials(), "gpt-4o", &[], &CompletionParams::default())
            .await
            .unwrap();

        let CompletionAttempt::Completed(result) = attempt else {
            panic!("expected a completed attempt");
        };
        assert_eq!(result.finish_reason, FinishReason::ToolCalls);
        let calls = result.message.tool_calls.unwrap();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(result.model, "gpt-4o");
        assert!(result.total_tokens.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_requests_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "Rate limit reached"}
            })))
            .mount(&server)
            .await;

        let api = OpenAiApi::new(Some(&server.uri()), Client::new());
        let attempt = api
            .call_once(&credentials(), "gpt-4o", &[], &CompletionParams::default())
            .await
            .unwrap();
        match attempt {
            CompletionAttempt::RetryRequested(cause) => {
                assert!(cause.to_string().contains("Rate limit reached"));
            }
            CompletionAttempt::Completed(_) => panic!("expected a retry request"),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_requests_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let api = OpenAiApi::new(Some(&server.uri()), Client::new());
        let attempt = api
            .call_once(&credentials(), "gpt-4o", &[], &CompletionParams::default())
            .await
            .unwrap();
        assert!(matches!(attempt, CompletionAttempt::RetryRequested(_)));
    }

    #[tokio::test]
    async fn test_bad_request_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "Invalid model"}
            })))
            .mount(&server)
            .await;

        let api = OpenAiApi::new(Some(&server.uri()), Client::new());
        let err = api
            .call_once(&credentials(), "gpt-4o", &[], &CompletionParams::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid model"));
    }
}
