//! Token counting for provider message lists.
//!
//! The default [`CharEstimator`] needs no encoding tables: roughly four
//! characters per token plus a fixed framing overhead per message. It is
//! monotonic, so adding messages or text never lowers the count. With the
//! `tiktoken` feature enabled, [`TikTokenCounter`] counts with real BPE
//! encodings.

use super::types::ChatCompletionMessage;

/// Framing tokens added per message (role + delimiters).
const TOKENS_PER_MESSAGE: usize = 3;

/// Extra token for an explicit `name`.
const TOKENS_PER_NAME: usize = 1;

/// Every reply is primed with `<|start|>assistant<|message|>`.
const REPLY_PRIMING_TOKENS: usize = 3;

/// Counts tokens in a message list.
pub trait TokenCounter: Send + Sync {
    fn count_str(&self, text: &str) -> usize;

    fn count_messages(&self, messages: &[ChatCompletionMessage]) -> usize {
        let mut total = REPLY_PRIMING_TOKENS;
        for message in messages {
            total += TOKENS_PER_MESSAGE;
            if let Some(content) = &message.content {
                total += self.count_str(content);
            }
            if let Some(name) = &message.name {
                total += self.count_str(name) + TOKENS_PER_NAME;
            }
            if let Some(id) = &message.tool_call_id {
                total += self.count_str(id);
            }
            for call in message.tool_calls.iter().flatten() {
                total += self.count_str(&call.id)
                    + self.count_str(&call.function.name)
                    + self.count_str(&call.function.arguments);
            }
        }
        total
    }
}

/// Character-based estimator: `chars / chars_per_token + 1` per text field.
#[derive(Debug, Clone)]
pub struct CharEstimator {
    chars_per_token: usize,
}

impl CharEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenCounter for CharEstimator {
    fn count_str(&self, text: &str) -> usize {
        text.chars().count() / self.chars_per_token + 1
    }
}

#[cfg(feature = "tiktoken")]
/// BPE token counter backed by `tiktoken-rs`.
pub struct TikTokenCounter {
    encoder: tiktoken_rs::CoreBPE,
}

#[cfg(feature = "tiktoken")]
impl TikTokenCounter {
    /// Encoding for `model`, falling back to `cl100k_base` for unknown models.
    pub fn for_model(model: &str) -> anyhow::Result<Self> {
        let encoder = match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => bpe,
            Err(_) => {
                tracing::warn!(model, "Model not found, using cl100k_base encoding");
                tiktoken_rs::cl100k_base()?
            }
        };
        Ok(Self { encoder })
    }
}

#[cfg(feature = "tiktoken")]
impl TokenCounter for TikTokenCounter {
    fn count_str(&self, text: &str) -> usize {
        self.encoder.encode_with_special_tokens(text).len()
    }
}
