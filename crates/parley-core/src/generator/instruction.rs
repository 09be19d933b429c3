//! System instructions and seed messages for chat-completion generators.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tera::{Context, Tera};

use crate::dialogue::Metadata;
use crate::error::Result;
use crate::llm::types::ChatCompletionMessage;

/// Renders an instruction against a parameter object.
pub trait InstructionTemplate: Send + Sync {
    /// Template source as written by the author.
    fn source(&self) -> &str;

    fn render(&self, params: Option<&Metadata>) -> Result<String>;
}

/// Jinja-style instruction template rendered with `tera`.
///
/// Serialized as `{"template": "<source>"}` so it can be told apart from a
/// plain text instruction on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(rename = "template")]
    source: String,
}

impl PromptTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into() }
    }
}

impl InstructionTemplate for PromptTemplate {
    fn source(&self) -> &str {
        &self.source
    }

    fn render(&self, params: Option<&Metadata>) -> Result<String> {
        let context = match params {
            Some(params) => Context::from_value(Value::Object(params.clone()))?,
            None => Context::new(),
        };
        Ok(Tera::one_off(&self.source, &context, false)?)
    }
}

/// A base instruction: literal text or a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Instruction {
    Text(String),
    Template(PromptTemplate),
}

impl Instruction {
    pub fn template(source: impl Into<String>) -> Self {
        Self::Template(PromptTemplate::new(source))
    }

    /// Resolve to the text sent as the `system` message.
    ///
    /// Plain text ignores `params`.
    pub fn resolve(&self, params: Option<&Metadata>) -> Result<String> {
        match self {
            Self::Text(text) => Ok(text.clone()),
            Self::Template(template) => template.render(params),
        }
    }
}

impl From<&str> for Instruction {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Instruction {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<PromptTemplate> for Instruction {
    fn from(template: PromptTemplate) -> Self {
        Self::Template(template)
    }
}

/// Messages placed between the instruction and the dialogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitialUserMessage {
    /// Sent as a single `user` message.
    Text(String),
    Messages(Vec<ChatCompletionMessage>),
}

impl InitialUserMessage {
    pub fn to_messages(&self) -> Vec<ChatCompletionMessage> {
        match self {
            Self::Text(text) => vec![ChatCompletionMessage::user(text.clone())],
            Self::Messages(messages) => messages.clone(),
        }
    }
}

impl From<&str> for InitialUserMessage {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<ChatCompletionMessage>> for InitialUserMessage {
    fn from(messages: Vec<ChatCompletionMessage>) -> Self {
        Self::Messages(messages)
    }
}
