//! parley-core: the response-generation core for parley chat agents.
//!
//! This crate turns a linear dialogue into the next turn's text by dispatching
//! to interchangeable LLM back ends:
//!
//! - [`auth`]: Credential variables, sources, the shared cache and the authorization manager
//! - [`llm`]: The `ChatCompletionApi` adapter contract, the retrying client and provider adapters
//! - [`dialogue`]: Dialogue turns and nested metadata helpers
//! - [`transform`]: Message transformers that extract control tokens from model output
//! - [`generator`]: The response generator pipeline, chat-completion and state-based generators
//! - [`mapper`]: Few-shot mappers built on top of the chat-completion client
//! - [`session`]: Turn-taking chat sessions with JSON persistence
//! - [`tools`]: Tool trait and registry used to resolve model tool calls
//! - [`config`]: Typed configuration loading from JSON
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use parley_core::auth::{AuthorizationManager, EnvVariableSource};
//! use parley_core::generator::{ChatCompletionResponseGenerator, ResponseGenerator};
//! use parley_core::llm::openai::OpenAiApi;
//! use parley_core::llm::ChatCompletionClient;
//! use parley_core::dialogue::DialogueTurn;
//!
//! # async fn example() -> parley_core::Result<()> {
//! let auth = Arc::new(AuthorizationManager::new(Arc::new(EnvVariableSource::new())));
//! let api = OpenAiApi::new(None, reqwest::Client::new());
//! let client = Arc::new(ChatCompletionClient::new(Arc::new(api), auth));
//!
//! let mut generator = ChatCompletionResponseGenerator::builder(client, "gpt-4o")
//!     .instruction("You are a helpful assistant.")
//!     .special_token("<|Terminate|>", "terminate", serde_json::Value::Bool(true))
//!     .build()?;
//!
//! let dialogue = vec![DialogueTurn::user("Hi!")];
//! let response = generator.get_response(&dialogue, false).await?;
//! println!("{} ({} ms)", response.text, response.elapsed_ms);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod generator;
pub mod llm;
pub mod mapper;
pub mod session;
pub mod tools;
pub mod transform;

pub use error::{Error, Result};
