//! Chat-completion contract and the retrying client.
//!
//! Defines the [`ChatCompletionApi`] trait that every provider adapter
//! implements, and [`ChatCompletionClient`], which wraps an adapter with
//! authorization and the bounded retry loop. The `openai` and `anthropic`
//! modules provide concrete adapters.

pub mod anthropic;
pub mod openai;
pub mod tokens;
pub mod types;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::{AuthorizationManager, AuthorizationVariableSpec, Credentials};
use crate::error::{Error, Result};
use types::{ChatCompletionMessage, ChatCompletionResult, CompletionParams};

/// Default tolerance subtracted from a provider's token limit.
pub const DEFAULT_TOKEN_TOLERANCE: usize = 120;

/// Default number of additional attempts after the first call.
pub const DEFAULT_TRIAL_COUNT: u32 = 5;

/// Base delay between retry attempts; doubles on every retry.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Upper bound for the backoff multiplier exponent.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// The outcome of a single provider call.
#[derive(Debug)]
pub enum CompletionAttempt {
    Completed(ChatCompletionResult),
    /// Transient failure (rate limit, 5xx, malformed body); the call may be retried.
    RetryRequested(anyhow::Error),
}

/// One provider behind a uniform call surface.
///
/// Adapters only implement the provider-specific parts. Authorization and
/// retries are handled by [`ChatCompletionClient`].
#[async_trait]
pub trait ChatCompletionApi: Send + Sync {
    /// Stable identifier; also used to derive credential variable names.
    fn provider_name(&self) -> &str;

    /// Credential variables this provider needs.
    fn auth_variable_specs(&self) -> Vec<AuthorizationVariableSpec>;

    /// Provider-specific check of the resolved credentials.
    fn authorize_impl(&self, _credentials: &Credentials) -> bool {
        true
    }

    /// Context window of `model` in tokens.
    fn token_limit(&self, model: &str) -> Result<usize>;

    /// Tokens in `messages`. Must be monotonic in message count and length.
    fn count_tokens(&self, messages: &[ChatCompletionMessage], model: &str) -> usize;

    /// Whether `messages` fits into `model`'s window minus `tolerance`.
    fn is_within_token_limit(
        &self,
        messages: &[ChatCompletionMessage],
        model: &str,
        tolerance: usize,
    ) -> Result<bool> {
        let limit = self.token_limit(model)?;
        Ok(self.count_tokens(messages, model) <= limit.saturating_sub(tolerance))
    }

    /// Perform exactly one provider call.
    async fn call_once(
        &self,
        credentials: &Credentials,
        model: &str,
        messages: &[ChatCompletionMessage],
        params: &CompletionParams,
    ) -> Result<CompletionAttempt>;
}

/// Wraps a [`ChatCompletionApi`] with authorization and bounded retries.
pub struct ChatCompletionClient {
    api: Arc<dyn ChatCompletionApi>,
    auth: Arc<AuthorizationManager>,
    retry_delay: Duration,
    verbose: bool,
}

impl ChatCompletionClient {
    pub fn new(api: Arc<dyn ChatCompletionApi>, auth: Arc<AuthorizationManager>) -> Self {
        Self {
            api,
            auth,
            retry_delay: DEFAULT_RETRY_DELAY,
            verbose: false,
        }
    }

    /// Base delay between retries. `Duration::ZERO` retries immediately.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Log every call at `info` instead of `debug`.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn api(&self) -> &Arc<dyn ChatCompletionApi> {
        &self.api
    }

    pub fn provider_name(&self) -> &str {
        self.api.provider_name()
    }

    pub fn auth_variable_specs(&self) -> Vec<AuthorizationVariableSpec> {
        self.api.auth_variable_specs()
    }

    fn resolve_credentials(&self) -> Option<Credentials> {
        let provider = self.api.provider_name();
        let credentials = self.auth.resolve(provider, &self.api.auth_variable_specs())?;
        if self.api.authorize_impl(&credentials) {
            Some(credentials)
        } else {
            debug!(provider, "Provider rejected resolved credentials");
            None
        }
    }

    /// Resolve every declared variable and run the provider check.
    pub fn authorize(&self) -> bool {
        self.resolve_credentials().is_some()
    }

    /// Authorize, prompting once for credentials in interactive mode.
    pub async fn assert_authorize(&self) -> Result<Credentials> {
        if let Some(credentials) = self.resolve_credentials() {
            return Ok(credentials);
        }

        let provider = self.api.provider_name();
        if !self.auth.is_interactive() {
            return Err(Error::ServiceUnauthorized(provider.to_string()));
        }

        self.auth
            .collect_interactively(provider, &self.api.auth_variable_specs())
            .await?;
        self.resolve_credentials()
            .ok_or_else(|| Error::ServiceUnauthorized(provider.to_string()))
    }

    pub fn count_tokens(&self, messages: &[ChatCompletionMessage], model: &str) -> usize {
        self.api.count_tokens(messages, model)
    }

    pub fn is_within_token_limit(
        &self,
        messages: &[ChatCompletionMessage],
        model: &str,
        tolerance: usize,
    ) -> Result<bool> {
        self.api.is_within_token_limit(messages, model, tolerance)
    }

    /// Run a completion with up to `trial_count` retries.
    ///
    /// Returns `Ok(None)` when every attempt requested a retry. Any error
    /// from the adapter is fatal and returned immediately.
    pub async fn run_chat_completion(
        &self,
        model: &str,
        messages: &[ChatCompletionMessage],
        params: &CompletionParams,
        trial_count: u32,
    ) -> Result<Option<ChatCompletionResult>> {
        let credentials = self.assert_authorize().await?;
        let provider = self.api.provider_name();

        for attempt in 0..=trial_count {
            if attempt > 0 && !self.retry_delay.is_zero() {
                let factor = 1u32 << (attempt - 1).min(MAX_BACKOFF_EXPONENT);
                tokio::time::sleep(self.retry_delay.saturating_mul(factor)).await;
            }

            if self.verbose {
                info!(provider, model, attempt, msg_count = messages.len(), "Running chat completion");
            } else {
                debug!(provider, model, attempt, msg_count = messages.len(), "Running chat completion");
            }

            match self.api.call_once(&credentials, model, messages, params).await? {
                CompletionAttempt::Completed(result) => return Ok(Some(result)),
                CompletionAttempt::RetryRequested(cause) => {
                    warn!(provider, attempt, error = %cause, "Chat completion requested retry");
                }
            }
        }

        warn!(provider, trial_count, "Chat completion retries exhausted");
        Ok(None)
    }
}
