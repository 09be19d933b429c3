//! Response generators: turn a dialogue into the next system turn.
//!
//! [`ResponseGenerator::get_response`] is the shared pipeline. It:
//! 1. Runs the `prepare_response` hook
//! 2. Calls `generate_response_impl`
//! 3. On [`Generation::RegenerateRequested`], calls it exactly once more
//! 4. Runs the generator's [`TransformerChain`] over the reply
//! 5. Returns text, metadata and elapsed milliseconds
//!
//! Concrete generators live in [`chat_completion`] and [`state`].

pub mod chat_completion;
pub mod instruction;
pub mod state;

pub use chat_completion::{ChatCompletionResponseGenerator, ChatCompletionResponseGeneratorBuilder, SpecialToken};
pub use instruction::{InitialUserMessage, Instruction, InstructionTemplate, PromptTemplate};
pub use state::{NextState, PayloadMemory, StateBasedResponseGenerator, StatePolicy, StateRecord};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, warn};

use crate::dialogue::{DialogueTurn, Metadata};
use crate::error::{Error, Result};
use crate::llm::types::{ChatCompletionMessage, ChatCompletionResult};
use crate::transform::TransformerChain;

/// Metadata key holding the pre-transform text when transformers changed it.
pub const ORIGINAL_MESSAGE_KEY: &str = "original_message";

/// What one `generate_response_impl` call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Generation {
    Reply { text: String, metadata: Metadata },
    /// Soft failure; the pipeline grants exactly one more attempt.
    RegenerateRequested(String),
}

impl Generation {
    pub fn reply(text: impl Into<String>, metadata: Metadata) -> Self {
        Self::Reply {
            text: text.into(),
            metadata,
        }
    }
}

/// The final output of [`ResponseGenerator::get_response`].
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedResponse {
    pub text: String,
    pub metadata: Metadata,
    pub elapsed_ms: u64,
}

impl GeneratedResponse {
    /// Wrap into a system turn carrying this response's metadata and timing.
    pub fn into_turn(self) -> DialogueTurn {
        let metadata = if self.metadata.is_empty() { None } else { Some(self.metadata) };
        DialogueTurn::system(self.text, metadata, Some(self.elapsed_ms))
    }
}

/// Produces the next system turn for a dialogue.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// One-time async setup. No-op by default.
    async fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Hook run before every generation. No-op by default.
    async fn prepare_response(&mut self, _dialogue: &[DialogueTurn]) -> Result<()> {
        Ok(())
    }

    /// Generate raw text and metadata. With `dry` set, nothing may be committed.
    async fn generate_response_impl(&mut self, dialogue: &[DialogueTurn], dry: bool) -> Result<Generation>;

    /// Transformers applied to every reply.
    fn transformers(&self) -> Option<&TransformerChain> {
        None
    }

    /// Write this generator's configuration into `parcel`.
    fn write_to_json(&self, _parcel: &mut Metadata) -> Result<()> {
        Ok(())
    }

    /// Restore configuration written by [`write_to_json`](Self::write_to_json).
    async fn restore_from_json(&mut self, _parcel: &Metadata) -> Result<()> {
        Ok(())
    }

    async fn get_response(&mut self, dialogue: &[DialogueTurn], dry: bool) -> Result<GeneratedResponse> {
        let start = Instant::now();

        self.prepare_response(dialogue).await?;

        let (text, metadata) = match self.generate_response_impl(dialogue, dry).await? {
            Generation::Reply { text, metadata } => (text, metadata),
            Generation::RegenerateRequested(reason) => {
                warn!(reason = %reason, "Regenerating response");
                match self.generate_response_impl(dialogue, dry).await? {
                    Generation::Reply { text, metadata } => (text, metadata),
                    Generation::RegenerateRequested(reason) => return Err(Error::RegenerateExhausted(reason)),
                }
            }
        };

        let (text, metadata) = match self.transformers() {
            Some(chain) if !chain.is_empty() => {
                let out = chain.run(&text, metadata);
                let mut metadata = out.metadata;
                if out.text != text {
                    debug!(transformers = ?chain, "Transformers changed the response text");
                    metadata.insert(ORIGINAL_MESSAGE_KEY.into(), Value::String(text));
                }
                (out.text, metadata)
            }
            _ => (text, metadata),
        };

        Ok(GeneratedResponse {
            text,
            metadata,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Resolves a tool call requested by the model.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    /// `args` is the parsed JSON arguments object.
    async fn call(&self, name: &str, args: Value) -> Result<String>;
}

/// A [`FunctionHandler`] backed by a closure.
pub struct FnFunctionHandler<F>(pub F);

#[async_trait]
impl<F> FunctionHandler for FnFunctionHandler<F>
where
    F: Fn(String, Value) -> BoxFuture<'static, Result<String>> + Send + Sync,
{
    async fn call(&self, name: &str, args: Value) -> Result<String> {
        (self.0)(name.to_string(), args).await
    }
}

/// Called instead of the provider when the message list is over budget.
///
/// Receives the dialogue and the pending message list and must produce the
/// result itself (e.g. by summarizing and calling a larger model). `Ok(None)`
/// has the same meaning as exhausted provider retries.
#[async_trait]
pub trait TokenLimitExceedHandler: Send + Sync {
    async fn handle(
        &self,
        dialogue: &[DialogueTurn],
        messages: &[ChatCompletionMessage],
    ) -> Result<Option<ChatCompletionResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::SingleTokenExtractor;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Replays scripted generations in order.
    struct ScriptedGenerator {
        script: VecDeque<Generation>,
        calls: usize,
        chain: TransformerChain,
    }

    impl ScriptedGenerator {
        fn new(script: Vec<Generation>) -> Self {
            Self {
                script: script.into(),
                calls: 0,
                chain: TransformerChain::default(),
            }
        }
    }

    #[async_trait]
    impl ResponseGenerator for ScriptedGenerator {
        async fn generate_response_impl(&mut self, _dialogue: &[DialogueTurn], _dry: bool) -> Result<Generation> {
            self.calls += 1;
            self.script
                .pop_front()
                .ok_or_else(|| Error::State("script exhausted".into()))
        }

        fn transformers(&self) -> Option<&TransformerChain> {
            Some(&self.chain)
        }
    }

    #[tokio::test]
    async fn test_single_regeneration_retry() {
        let mut generator = ScriptedGenerator::new(vec![
            Generation::RegenerateRequested("bad output".into()),
            Generation::reply("fine", Metadata::new()),
        ]);

        let response = generator.get_response(&[], false).await.unwrap();
        assert_eq!(response.text, "fine");
        assert_eq!(generator.calls, 2);
    }

    #[tokio::test]
    async fn test_second_regeneration_is_fatal() {
        let mut generator = ScriptedGenerator::new(vec![
            Generation::RegenerateRequested("first".into()),
            Generation::RegenerateRequested("second".into()),
            Generation::reply("never", Metadata::new()),
        ]);

        let err = generator.get_response(&[], false).await.unwrap_err();
        assert!(matches!(err, Error::RegenerateExhausted(ref reason) if reason == "second"));
        assert_eq!(generator.calls, 2);
    }

    #[tokio::test]
    async fn test_other_errors_propagate_unchanged() {
        let mut generator = ScriptedGenerator::new(vec![]);
        let err = generator.get_response(&[], false).await.unwrap_err();
        assert!(matches!(err, Error::State(_)));
        assert_eq!(generator.calls, 1);
    }

    #[tokio::test]
    async fn test_transformed_text_keeps_original() {
        let mut generator = ScriptedGenerator::new(vec![Generation::reply("Bye<END>", Metadata::new())]);
        generator.chain = TransformerChain::new(vec![Box::new(SingleTokenExtractor::literal("end", "<END>"))]);

        let response = generator.get_response(&[], false).await.unwrap();
        assert_eq!(response.text, "Bye");
        assert_eq!(response.metadata[ORIGINAL_MESSAGE_KEY], json!("Bye<END>"));
        assert_eq!(response.metadata["transformers"]["end"], json!(true));
    }

    #[tokio::test]
    async fn test_untouched_text_has_no_original() {
        let mut generator = ScriptedGenerator::new(vec![Generation::reply("Hello", Metadata::new())]);
        generator.chain = TransformerChain::new(vec![Box::new(SingleTokenExtractor::literal("end", "<END>"))]);

        let response = generator.get_response(&[], false).await.unwrap();
        assert!(!response.metadata.contains_key(ORIGINAL_MESSAGE_KEY));
        assert!(response.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_closure_function_handler() {
        let handler = FnFunctionHandler(|name: String, args: Value| -> BoxFuture<'static, Result<String>> {
            Box::pin(async move { Ok(format!("{name}:{}", args["x"])) })
        });
        assert_eq!(handler.call("f", json!({"x": 1})).await.unwrap(), "f:1");
    }
}
