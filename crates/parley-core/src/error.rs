//! Error taxonomy for the response-generation core.
//!
//! Soft signals (retry requests from a provider, regeneration requests from a
//! generator) are not errors: they are variants of
//! [`CompletionAttempt`](crate::llm::CompletionAttempt) and
//! [`Generation`](crate::generator::Generation) and never escape the loop
//! that owns them. Everything here is fatal and propagates to the caller.

use crate::llm::types::FinishReason;

/// Result type used throughout parley-core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Credentials could not be resolved and no interactive fallback exists.
    #[error("service unauthorized: {0}")]
    ServiceUnauthorized(String),

    /// The message list exceeds the provider budget and no handler is configured.
    #[error("token limit exceeded: {count} tokens, limit {limit} with tolerance {tolerance}")]
    TokenLimitExceeded {
        count: usize,
        limit: usize,
        tolerance: usize,
    },

    /// A regeneration was requested again after the single extra attempt.
    #[error("regeneration requested twice: {0}")]
    RegenerateExhausted(String),

    /// The provider stopped for a reason the caller cannot turn into text.
    #[error("unexpected finish reason: {0}")]
    UnexpectedFinishReason(FinishReason),

    /// The provider asked for tools again after one tool round was resolved.
    #[error("provider requested a second consecutive tool-call round")]
    UnresolvedToolCall,

    /// The provider requested a tool call but no function handler is configured.
    #[error("no function handler configured for tool call '{0}'")]
    MissingFunctionHandler(String),

    #[error("invalid arguments for tool call '{name}': {source}")]
    InvalidToolArguments {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("token limit unknown for model '{0}'")]
    UnknownModel(String),

    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Mapper output could not be converted after all retries were consumed.
    #[error("mapper output malformed after {attempts} attempts: {reason}")]
    MapperOutputMalformed { attempts: usize, reason: String },

    #[error("state error: {0}")]
    State(String),

    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}
