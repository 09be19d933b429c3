//! Few-shot mappers: typed input to typed output through a chat model.
//!
//! A [`FewShotMapper`] renders its input into a single user message, places
//! example pairs ahead of it and parses the model's reply with a
//! [`MapperConverter`]. Unparseable replies are retried a bounded number of
//! times.

use serde_json::{json, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use tera::{Context, Tera};
use tracing::warn;

use crate::dialogue::{DialogueTurn, Metadata};
use crate::error::{Error, Result};
use crate::generator::{
    ChatCompletionResponseGenerator, InitialUserMessage, Instruction, ResponseGenerator, TokenLimitExceedHandler,
};
use crate::llm::types::{ChatCompletionMessage, CompletionParams};
use crate::llm::ChatCompletionClient;

/// Default number of retries after a malformed reply.
pub const DEFAULT_OUTPUT_MALFORMED_RETRY_COUNT: usize = 5;

/// Tolerance used by mappers; they tend to send long inputs.
const MAPPER_TOKEN_LIMIT_TOLERANCE: usize = 1024;

/// Converts mapper input to message text and model output back.
pub trait MapperConverter<I, O>: Send + Sync {
    fn input_to_message(&self, input: &I) -> Result<String>;

    /// `Err(reason)` marks the output as malformed and triggers a retry.
    fn parse_output(&self, output: &str) -> std::result::Result<O, String>;
}

pub struct FewShotMapper<I, O, C> {
    generator: ChatCompletionResponseGenerator,
    base_instruction: Instruction,
    converter: C,
    examples: Vec<(I, String)>,
    output_malformed_retry_count: usize,
    _output: PhantomData<fn() -> O>,
}

impl<I, O, C> FewShotMapper<I, O, C>
where
    I: Send + Sync,
    C: MapperConverter<I, O>,
{
    pub fn new(
        client: Arc<ChatCompletionClient>,
        model: impl Into<String>,
        base_instruction: impl Into<Instruction>,
        converter: C,
    ) -> Result<Self> {
        let base_instruction = base_instruction.into();
        let generator = ChatCompletionResponseGenerator::builder(client, model)
            .instruction(base_instruction.clone())
            .token_limit_tolerance(MAPPER_TOKEN_LIMIT_TOLERANCE)
            .build()?;
        Ok(Self {
            generator,
            base_instruction,
            converter,
            examples: Vec::new(),
            output_malformed_retry_count: DEFAULT_OUTPUT_MALFORMED_RETRY_COUNT,
            _output: PhantomData,
        })
    }

    /// Rebuild the inner generator with call parameters and an optional exceed handler.
    pub fn with_generator_options(
        mut self,
        client: Arc<ChatCompletionClient>,
        params: CompletionParams,
        token_limit_handler: Option<Arc<dyn TokenLimitExceedHandler>>,
    ) -> Result<Self> {
        let mut builder = ChatCompletionResponseGenerator::builder(client, self.generator.model())
            .instruction(self.base_instruction.clone())
            .params(params)
            .token_limit_tolerance(MAPPER_TOKEN_LIMIT_TOLERANCE);
        if let Some(handler) = token_limit_handler {
            builder = builder.token_limit_handler(handler);
        }
        self.generator = builder.build()?;
        Ok(self)
    }

    /// `(input, expected output)` pairs shown to the model before the real input.
    pub fn with_examples(mut self, examples: Vec<(I, String)>) -> Self {
        self.examples = examples;
        self
    }

    pub fn with_output_malformed_retry_count(mut self, count: usize) -> Self {
        self.output_malformed_retry_count = count;
        self
    }

    pub fn converter(&self) -> &C {
        &self.converter
    }

    fn example_messages(&self) -> Result<Vec<ChatCompletionMessage>> {
        let mut messages = Vec::with_capacity(self.examples.len() * 2);
        for (sample, label) in &self.examples {
            messages.push(
                ChatCompletionMessage::system(self.converter.input_to_message(sample)?).with_name("example_user"),
            );
            messages.push(ChatCompletionMessage::system(label.clone()).with_name("example_assistant"));
        }
        Ok(messages)
    }

    /// Map `input`, rendering the instruction with `instruction_params` if given.
    pub async fn run(&mut self, input: &I, instruction_params: Option<Metadata>) -> Result<O> {
        let examples = self.example_messages()?;
        self.generator
            .set_initial_user_message((!examples.is_empty()).then_some(InitialUserMessage::Messages(examples)));

        if let Some(params) = instruction_params {
            self.generator.update_instruction_parameters(params)?;
        }

        let dialogue = vec![DialogueTurn::user(self.converter.input_to_message(input)?)];
        let attempts = self.output_malformed_retry_count + 1;
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            let response = self.generator.get_response(&dialogue, false).await?;
            match self.converter.parse_output(&response.text) {
                Ok(output) => return Ok(output),
                Err(reason) => {
                    warn!(attempt, attempts, reason = %reason, "Mapper output malformed, retrying");
                    last_reason = reason;
                }
            }
        }

        Err(Error::MapperOutputMalformed {
            attempts,
            reason: last_reason,
        })
    }
}

const DIALOGUE_TEMPLATE: &str = "<dialogue>
{% for turn in dialogue -%}
{% if turn.is_user %}{{ user_alias }}{% else %}{{ system_alias }}{% endif %}: <msg>{{ turn.message }}</msg>
{% endfor -%}
</dialogue>";

pub const DEFAULT_USER_ALIAS: &str = "User";
pub const DEFAULT_SYSTEM_ALIAS: &str = "AI";

/// Renders a dialogue for summarization and parses a JSON object reply.
#[derive(Debug, Clone)]
pub struct DialogueSummarizer {
    pub user_alias: String,
    pub system_alias: String,
}

impl Default for DialogueSummarizer {
    fn default() -> Self {
        Self {
            user_alias: DEFAULT_USER_ALIAS.into(),
            system_alias: DEFAULT_SYSTEM_ALIAS.into(),
        }
    }
}

impl DialogueSummarizer {
    pub fn with_aliases(user_alias: impl Into<String>, system_alias: impl Into<String>) -> Self {
        Self {
            user_alias: user_alias.into(),
            system_alias: system_alias.into(),
        }
    }
}

impl MapperConverter<Vec<DialogueTurn>, Value> for DialogueSummarizer {
    fn input_to_message(&self, input: &Vec<DialogueTurn>) -> Result<String> {
        let context = Context::from_value(json!({
            "dialogue": input,
            "user_alias": self.user_alias,
            "system_alias": self.system_alias,
        }))?;
        Ok(Tera::one_off(DIALOGUE_TEMPLATE, &context, false)?)
    }

    fn parse_output(&self, output: &str) -> std::result::Result<Value, String> {
        serde_json::from_str::<Value>(output.trim()).map_err(|e| format!("malformed JSON ({e}): {output}"))
    }
}

/// A mapper that summarizes dialogues into JSON.
pub type DialogueSummaryMapper = FewShotMapper<Vec<DialogueTurn>, Value, DialogueSummarizer>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialogue_rendering() {
        let summarizer = DialogueSummarizer::default();
        let dialogue = vec![DialogueTurn::user("Hi"), DialogueTurn::system("Hello!", None, None)];

        let rendered = summarizer.input_to_message(&dialogue).unwrap();
        assert_eq!(rendered, "<dialogue>\nUser: <msg>Hi</msg>\nAI: <msg>Hello!</msg>\n</dialogue>");
    }

    #[test]
    fn test_parse_output() {
        let summarizer = DialogueSummarizer::with_aliases("Patient", "Bot");
        assert_eq!(
            summarizer.parse_output(" {\"mood\": \"calm\"} ").unwrap(),
            json!({"mood": "calm"})
        );
        assert!(summarizer.parse_output("not json").is_err());
    }
}
