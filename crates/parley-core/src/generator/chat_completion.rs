//! Generator that answers through a [`ChatCompletionClient`].
//!
//! Builds the provider message list from the instruction, seed messages and
//! the dialogue, gates it on the provider's token budget, calls the model and
//! resolves at most one round of tool calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::instruction::{InitialUserMessage, Instruction};
use super::{FunctionHandler, Generation, ResponseGenerator, TokenLimitExceedHandler};
use crate::dialogue::{set_nested, DialogueTurn, Metadata};
use crate::error::{Error, Result};
use crate::llm::types::{ChatCompletionMessage, ChatCompletionResult, CompletionParams, FinishReason, Role};
use crate::llm::{ChatCompletionClient, DEFAULT_TRIAL_COUNT};
use crate::transform::{TokenListExtractor, TransformerChain};

/// Metadata namespace for this generator's bookkeeping.
pub const CHATCOMPLETION_KEY: &str = "chatcompletion";

/// Tool exchange of a turn, replayed before it on the next call.
pub const FUNCTION_MESSAGES_KEY: &str = "function_messages";

/// Reply text before special tokens were removed.
pub const TOKEN_UNCLEANED_MESSAGE_KEY: &str = "token_uncleaned_message";

/// Name of the transformer built from special tokens.
pub const SPECIAL_TOKENS_TRANSFORMER: &str = "special_tokens";

/// Default budget kept free below the provider's limit.
pub const DEFAULT_TOKEN_LIMIT_TOLERANCE: usize = 1024;

/// A hidden token the model can emit to steer metadata.
///
/// When `token` appears in a reply it is removed and `key` (a dot-separated
/// path) is set to `value` in the turn metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecialToken {
    pub token: String,
    pub key: String,
    pub value: Value,
}

impl SpecialToken {
    pub fn new(token: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        Self {
            token: token.into(),
            key: key.into(),
            value,
        }
    }
}

fn special_token_chain(tokens: &[SpecialToken]) -> TransformerChain {
    if tokens.is_empty() {
        return TransformerChain::default();
    }

    let table = tokens.to_vec();
    let extractor = TokenListExtractor::new(
        SPECIAL_TOKENS_TRANSFORMER,
        tokens.iter().map(|t| t.token.clone()).collect(),
    )
    .on_token_found(move |found, original, cleaned, mut metadata| {
        for token in found {
            if let Some(entry) = table.iter().find(|t| &t.token == token) {
                let path: Vec<&str> = entry.key.split('.').collect();
                set_nested(&mut metadata, &path, entry.value.clone());
            }
        }
        set_nested(
            &mut metadata,
            &[CHATCOMPLETION_KEY, TOKEN_UNCLEANED_MESSAGE_KEY],
            Value::String(original.to_string()),
        );
        (cleaned, metadata)
    });

    TransformerChain::new(vec![Box::new(extractor)])
}

/// Persisted configuration.
#[derive(Debug, Serialize, Deserialize)]
struct Parcel {
    model: String,
    params: CompletionParams,
    initial_user_message: Option<InitialUserMessage>,
    base_instruction: Option<Instruction>,
    instruction_parameters: Option<Metadata>,
    #[serde(default)]
    verbose: bool,
}

/// Generates responses with a single chat-completion model.
pub struct ChatCompletionResponseGenerator {
    client: Arc<ChatCompletionClient>,
    model: String,
    params: CompletionParams,
    base_instruction: Option<Instruction>,
    instruction_parameters: Option<Metadata>,
    /// `base_instruction` rendered against `instruction_parameters`.
    instruction: Option<String>,
    initial_user_message: Option<InitialUserMessage>,
    function_handler: Option<Arc<dyn FunctionHandler>>,
    special_tokens: Vec<SpecialToken>,
    transformers: TransformerChain,
    token_limit_handler: Option<Arc<dyn TokenLimitExceedHandler>>,
    token_limit_tolerance: usize,
    trial_count: u32,
    verbose: bool,
}

impl ChatCompletionResponseGenerator {
    pub fn builder(client: Arc<ChatCompletionClient>, model: impl Into<String>) -> ChatCompletionResponseGeneratorBuilder {
        ChatCompletionResponseGeneratorBuilder::new(client, model)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn params(&self) -> &CompletionParams {
        &self.params
    }

    /// The rendered instruction, if any.
    pub fn instruction(&self) -> Option<&str> {
        self.instruction.as_deref()
    }

    pub fn base_instruction(&self) -> Option<&Instruction> {
        self.base_instruction.as_ref()
    }

    pub fn instruction_parameters(&self) -> Option<&Metadata> {
        self.instruction_parameters.as_ref()
    }

    pub fn initial_user_message(&self) -> Option<&InitialUserMessage> {
        self.initial_user_message.as_ref()
    }

    pub fn special_tokens(&self) -> &[SpecialToken] {
        &self.special_tokens
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Replace the base instruction and re-render it.
    pub fn set_base_instruction(&mut self, instruction: Option<Instruction>) -> Result<()> {
        self.base_instruction = instruction;
        self.resolve_instruction()
    }

    /// Merge `params` into the instruction parameters and re-render.
    pub fn update_instruction_parameters(&mut self, params: Metadata) -> Result<()> {
        match self.instruction_parameters.as_mut() {
            Some(existing) => existing.extend(params),
            None => self.instruction_parameters = Some(params),
        }
        self.resolve_instruction()
    }

    pub fn set_initial_user_message(&mut self, message: Option<InitialUserMessage>) {
        self.initial_user_message = message;
    }

    fn resolve_instruction(&mut self) -> Result<()> {
        self.instruction = match &self.base_instruction {
            Some(instruction) => Some(instruction.resolve(self.instruction_parameters.as_ref())?),
            None => None,
        };
        Ok(())
    }

    /// Expand dialogue turns into provider messages.
    ///
    /// A turn's stashed tool exchange goes first, then the turn itself with
    /// its pre-cleaning text when special tokens were removed.
    pub fn convert_dialogue(dialogue: &[DialogueTurn]) -> Result<Vec<ChatCompletionMessage>> {
        let mut messages = Vec::with_capacity(dialogue.len());
        for turn in dialogue {
            if let Some(stashed) = turn.metadata_value(&[CHATCOMPLETION_KEY, FUNCTION_MESSAGES_KEY]) {
                let exchange: Vec<ChatCompletionMessage> = serde_json::from_value(stashed.clone())?;
                messages.extend(exchange);
            }

            let content = turn
                .metadata_value(&[CHATCOMPLETION_KEY, TOKEN_UNCLEANED_MESSAGE_KEY])
                .and_then(Value::as_str)
                .unwrap_or(turn.message.as_str());
            let role = if turn.is_user { Role::User } else { Role::Assistant };
            messages.push(ChatCompletionMessage::new(role, content));
        }
        Ok(messages)
    }

    /// The exact message list sent for `dialogue`.
    pub fn build_messages(&self, dialogue: &[DialogueTurn]) -> Result<Vec<ChatCompletionMessage>> {
        let converted = Self::convert_dialogue(dialogue)?;
        let Some(instruction) = &self.instruction else {
            return Ok(converted);
        };

        let mut messages = vec![ChatCompletionMessage::system(instruction.clone())];
        if let Some(seed) = &self.initial_user_message {
            messages.extend(seed.to_messages());
        }
        messages.extend(converted);
        Ok(messages)
    }

    fn base_metadata(result: &ChatCompletionResult) -> Metadata {
        let mut metadata = Map::new();
        metadata.insert(
            CHATCOMPLETION_KEY.into(),
            json!({
                "provider": result.provider,
                "model": result.model,
                "usage": result.usage(),
            }),
        );
        metadata
    }

    fn exhausted(&self) -> Generation {
        Generation::RegenerateRequested(format!(
            "{} chat completion retries exhausted",
            self.client.provider_name()
        ))
    }

    async fn resolve_tool_calls(
        &self,
        messages: Vec<ChatCompletionMessage>,
        result: ChatCompletionResult,
    ) -> Result<Generation> {
        let calls = result.message.tool_calls.clone().unwrap_or_default();
        let Some(handler) = &self.function_handler else {
            let name = calls.first().map(|c| c.function.name.clone()).unwrap_or_default();
            return Err(Error::MissingFunctionHandler(name));
        };

        let mut function_messages = vec![result.message.clone()];
        for call in &calls {
            let name = &call.function.name;
            let args: Value = if call.function.arguments.trim().is_empty() {
                Value::Object(Map::new())
            } else {
                serde_json::from_str(&call.function.arguments).map_err(|source| Error::InvalidToolArguments {
                    name: name.clone(),
                    source,
                })?
            };

            if self.verbose {
                info!(tool = %name, id = %call.id, args = %args, "Calling function");
            } else {
                debug!(tool = %name, id = %call.id, "Calling function");
            }

            let output = handler.call(name, args).await?;
            function_messages.push(ChatCompletionMessage::tool_result(&call.id, name, output));
        }

        let mut followup = messages;
        followup.extend(function_messages.iter().cloned());

        let Some(mut second) = self
            .client
            .run_chat_completion(&self.model, &followup, &self.params, self.trial_count)
            .await?
        else {
            return Ok(self.exhausted());
        };

        match second.finish_reason {
            FinishReason::Stop => {
                second.accumulate_usage(&result);
                let mut metadata = Self::base_metadata(&second);
                set_nested(
                    &mut metadata,
                    &[CHATCOMPLETION_KEY, FUNCTION_MESSAGES_KEY],
                    serde_json::to_value(&function_messages)?,
                );
                Ok(Generation::reply(second.message.content_as_str(), metadata))
            }
            FinishReason::ToolCalls => {
                error!(
                    provider = %second.provider,
                    model = %second.model,
                    "Model requested tool calls again after a resolved round"
                );
                Err(Error::UnresolvedToolCall)
            }
            other => Err(Error::UnexpectedFinishReason(other)),
        }
    }
}

#[async_trait]
impl ResponseGenerator for ChatCompletionResponseGenerator {
    async fn generate_response_impl(&mut self, dialogue: &[DialogueTurn], _dry: bool) -> Result<Generation> {
        let messages = self.build_messages(dialogue)?;

        let result = if self
            .client
            .is_within_token_limit(&messages, &self.model, self.token_limit_tolerance)?
        {
            self.client
                .run_chat_completion(&self.model, &messages, &self.params, self.trial_count)
                .await?
        } else {
            let count = self.client.count_tokens(&messages, &self.model);
            warn!(count, msg_count = messages.len(), model = %self.model, "Token limit exceeded");
            match &self.token_limit_handler {
                Some(handler) => handler.handle(dialogue, &messages).await?,
                None => {
                    return Err(Error::TokenLimitExceeded {
                        count,
                        limit: self.client.api().token_limit(&self.model)?,
                        tolerance: self.token_limit_tolerance,
                    })
                }
            }
        };

        let Some(result) = result else {
            return Ok(self.exhausted());
        };

        match result.finish_reason {
            FinishReason::Stop => {
                let metadata = Self::base_metadata(&result);
                Ok(Generation::reply(result.message.content_as_str(), metadata))
            }
            FinishReason::ToolCalls => self.resolve_tool_calls(messages, result).await,
            other => Err(Error::UnexpectedFinishReason(other)),
        }
    }

    fn transformers(&self) -> Option<&TransformerChain> {
        Some(&self.transformers)
    }

    fn write_to_json(&self, parcel: &mut Metadata) -> Result<()> {
        let value = serde_json::to_value(Parcel {
            model: self.model.clone(),
            params: self.params.clone(),
            initial_user_message: self.initial_user_message.clone(),
            base_instruction: self.base_instruction.clone(),
            instruction_parameters: self.instruction_parameters.clone(),
            verbose: self.verbose,
        })?;
        if let Value::Object(fields) = value {
            parcel.extend(fields);
        }
        Ok(())
    }

    async fn restore_from_json(&mut self, parcel: &Metadata) -> Result<()> {
        let restored: Parcel = serde_json::from_value(Value::Object(parcel.clone()))?;
        self.model = restored.model;
        self.params = restored.params;
        self.initial_user_message = restored.initial_user_message;
        self.base_instruction = restored.base_instruction;
        self.instruction_parameters = restored.instruction_parameters;
        self.verbose = restored.verbose;
        self.resolve_instruction()
    }
}

/// Builder for [`ChatCompletionResponseGenerator`].
pub struct ChatCompletionResponseGeneratorBuilder {
    client: Arc<ChatCompletionClient>,
    model: String,
    params: CompletionParams,
    base_instruction: Option<Instruction>,
    instruction_parameters: Option<Metadata>,
    initial_user_message: Option<InitialUserMessage>,
    function_handler: Option<Arc<dyn FunctionHandler>>,
    special_tokens: Vec<SpecialToken>,
    token_limit_handler: Option<Arc<dyn TokenLimitExceedHandler>>,
    token_limit_tolerance: usize,
    trial_count: u32,
    verbose: bool,
}

impl ChatCompletionResponseGeneratorBuilder {
    pub fn new(client: Arc<ChatCompletionClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            params: CompletionParams::default(),
            base_instruction: None,
            instruction_parameters: None,
            initial_user_message: None,
            function_handler: None,
            special_tokens: Vec::new(),
            token_limit_handler: None,
            token_limit_tolerance: DEFAULT_TOKEN_LIMIT_TOLERANCE,
            trial_count: DEFAULT_TRIAL_COUNT,
            verbose: false,
        }
    }

    pub fn instruction(mut self, instruction: impl Into<Instruction>) -> Self {
        self.base_instruction = Some(instruction.into());
        self
    }

    pub fn instruction_parameters(mut self, params: Metadata) -> Self {
        self.instruction_parameters = Some(params);
        self
    }

    pub fn initial_user_message(mut self, message: impl Into<InitialUserMessage>) -> Self {
        self.initial_user_message = Some(message.into());
        self
    }

    pub fn params(mut self, params: CompletionParams) -> Self {
        self.params = params;
        self
    }

    pub fn function_handler(mut self, handler: Arc<dyn FunctionHandler>) -> Self {
        self.function_handler = Some(handler);
        self
    }

    /// Add a hidden token mapped to `key = value` in metadata.
    pub fn special_token(mut self, token: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        self.special_tokens.push(SpecialToken::new(token, key, value));
        self
    }

    pub fn token_limit_handler(mut self, handler: Arc<dyn TokenLimitExceedHandler>) -> Self {
        self.token_limit_handler = Some(handler);
        self
    }

    pub fn token_limit_tolerance(mut self, tolerance: usize) -> Self {
        self.token_limit_tolerance = tolerance;
        self
    }

    pub fn trial_count(mut self, trial_count: u32) -> Self {
        self.trial_count = trial_count;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Fails only if the instruction template cannot be rendered.
    pub fn build(self) -> Result<ChatCompletionResponseGenerator> {
        let transformers = special_token_chain(&self.special_tokens);
        let mut generator = ChatCompletionResponseGenerator {
            client: self.client,
            model: self.model,
            params: self.params,
            base_instruction: self.base_instruction,
            instruction_parameters: self.instruction_parameters,
            instruction: None,
            initial_user_message: self.initial_user_message,
            function_handler: self.function_handler,
            special_tokens: self.special_tokens,
            transformers,
            token_limit_handler: self.token_limit_handler,
            token_limit_tolerance: self.token_limit_tolerance,
            trial_count: self.trial_count,
            verbose: self.verbose,
        };
        generator.resolve_instruction()?;
        Ok(generator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthorizationManager, AuthorizationVariableKind, AuthorizationVariableSpec, Credentials, VariableSource};
    use crate::generator::FnFunctionHandler;
    use crate::llm::types::ToolCall;
    use crate::llm::{ChatCompletionApi, CompletionAttempt};
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct KeySource;

    impl VariableSource for KeySource {
        fn get(&self, _provider_name: &str, _kind: AuthorizationVariableKind) -> Option<String> {
            Some("test-key".into())
        }
    }

    /// Returns scripted messages and records every request.
    struct FakeApi {
        replies: Mutex<VecDeque<CompletionAttempt>>,
        requests: Mutex<Vec<Vec<ChatCompletionMessage>>>,
        limit: usize,
    }

    impl FakeApi {
        fn new(replies: Vec<CompletionAttempt>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
                limit: 100_000,
            }
        }

        fn requests(&self) -> Vec<Vec<ChatCompletionMessage>> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn completed(message: ChatCompletionMessage, finish_reason: FinishReason) -> CompletionAttempt {
        CompletionAttempt::Completed(ChatCompletionResult {
            message,
            finish_reason,
            provider: "Fake".into(),
            model: "fake-1".into(),
            prompt_tokens: Some(10),
            completion_tokens: Some(5),
            total_tokens: Some(15),
        })
    }

    #[async_trait]
    impl ChatCompletionApi for FakeApi {
        fn provider_name(&self) -> &str {
            "Fake"
        }

        fn auth_variable_specs(&self) -> Vec<AuthorizationVariableSpec> {
            vec![AuthorizationVariableSpec::API_KEY]
        }

        fn token_limit(&self, _model: &str) -> Result<usize> {
            Ok(self.limit)
        }

        fn count_tokens(&self, messages: &[ChatCompletionMessage], _model: &str) -> usize {
            messages.iter().map(|m| m.content_as_str().len()).sum()
        }

        async fn call_once(
            &self,
            _credentials: &Credentials,
            _model: &str,
            messages: &[ChatCompletionMessage],
            _params: &CompletionParams,
        ) -> Result<CompletionAttempt> {
            self.requests.lock().unwrap().push(messages.to_vec());
            Ok(self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| CompletionAttempt::RetryRequested(anyhow::anyhow!("empty script"))))
        }
    }

    fn client(api: Arc<FakeApi>) -> Arc<ChatCompletionClient> {
        let auth = Arc::new(AuthorizationManager::new(Arc::new(KeySource)));
        Arc::new(ChatCompletionClient::new(api, auth).with_retry_delay(Duration::ZERO))
    }

    #[tokio::test]
    async fn test_special_token_round_trip() {
        let api = Arc::new(FakeApi::new(vec![completed(
            ChatCompletionMessage::assistant("Hello<|Terminate|>"),
            FinishReason::Stop,
        )]));
        let mut generator = ChatCompletionResponseGenerator::builder(client(api), "fake-1")
            .special_token("<|Terminate|>", "terminate", json!(true))
            .build()
            .unwrap();

        let response = generator.get_response(&[DialogueTurn::user("Bye")], false).await.unwrap();
        assert_eq!(response.text, "Hello");
        assert_eq!(response.metadata["terminate"], json!(true));
        assert_eq!(response.metadata["original_message"], json!("Hello<|Terminate|>"));
        assert_eq!(
            response.metadata["chatcompletion"]["token_uncleaned_message"],
            json!("Hello<|Terminate|>")
        );
        assert_eq!(response.metadata["chatcompletion"]["usage"]["total_tokens"], json!(15));
    }

    #[tokio::test]
    async fn test_messages_include_instruction_and_seed() {
        let api = Arc::new(FakeApi::new(vec![completed(
            ChatCompletionMessage::assistant("ok"),
            FinishReason::Stop,
        )]));
        let mut generator = ChatCompletionResponseGenerator::builder(client(api.clone()), "fake-1")
            .instruction(Instruction::template("You talk to {{ user }}."))
            .instruction_parameters(json!({"user": "Ada"}).as_object().cloned().unwrap())
            .initial_user_message("Hi!")
            .build()
            .unwrap();

        let mut uncleaned = Metadata::new();
        set_nested(&mut uncleaned, &[CHATCOMPLETION_KEY, TOKEN_UNCLEANED_MESSAGE_KEY], json!("Earlier<|T|>"));
        let dialogue = vec![
            DialogueTurn::system("Earlier", Some(uncleaned), None),
            DialogueTurn::user("Now"),
        ];
        generator.get_response(&dialogue, false).await.unwrap();

        let sent = &api.requests()[0];
        assert_eq!(
            sent,
            &vec![
                ChatCompletionMessage::system("You talk to Ada."),
                ChatCompletionMessage::user("Hi!"),
                ChatCompletionMessage::assistant("Earlier<|T|>"),
                ChatCompletionMessage::user("Now"),
            ]
        );
    }

    #[tokio::test]
    async fn test_token_limit_exceeded_without_handler() {
        let mut fake = FakeApi::new(vec![]);
        fake.limit = 1030;
        let api = Arc::new(fake);
        let mut generator = ChatCompletionResponseGenerator::builder(client(api.clone()), "fake-1")
            .build()
            .unwrap();

        let err = generator
            .get_response(&[DialogueTurn::user("x".repeat(10))], false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TokenLimitExceeded { count: 10, limit: 1030, tolerance: 1024 }
        ));
        assert!(api.requests().is_empty());
    }

    struct CannedHandler;

    #[async_trait]
    impl TokenLimitExceedHandler for CannedHandler {
        async fn handle(
            &self,
            dialogue: &[DialogueTurn],
            _messages: &[ChatCompletionMessage],
        ) -> Result<Option<ChatCompletionResult>> {
            Ok(Some(ChatCompletionResult {
                message: ChatCompletionMessage::assistant(format!("summarized {}", dialogue.len())),
                finish_reason: FinishReason::Stop,
                provider: "Handler".into(),
                model: "big".into(),
                prompt_tokens: None,
                completion_tokens: None,
                total_tokens: None,
            }))
        }
    }

    #[tokio::test]
    async fn test_token_limit_handler_replaces_call() {
        let mut fake = FakeApi::new(vec![]);
        fake.limit = 1030;
        let api = Arc::new(fake);
        let mut generator = ChatCompletionResponseGenerator::builder(client(api.clone()), "fake-1")
            .token_limit_handler(Arc::new(CannedHandler))
            .build()
            .unwrap();

        let response = generator
            .get_response(&[DialogueTurn::user("x".repeat(10))], false)
            .await
            .unwrap();
        assert_eq!(response.text, "summarized 1");
        assert_eq!(response.metadata["chatcompletion"]["provider"], json!("Handler"));
        assert!(api.requests().is_empty());
    }

    fn weather_handler() -> Arc<dyn FunctionHandler> {
        Arc::new(FnFunctionHandler(
            |name: String, args: Value| -> BoxFuture<'static, Result<String>> {
                Box::pin(async move { Ok(format!("{name}: sunny in {}", args["city"].as_str().unwrap_or("?"))) })
            },
        ))
    }

    fn tool_call_message() -> ChatCompletionMessage {
        ChatCompletionMessage::assistant_with_tool_calls(
            None,
            vec![ToolCall::function("call_1", "weather", r#"{"city":"Paris"}"#)],
        )
    }

    #[tokio::test]
    async fn test_tool_round_trip_is_stashed_and_replayed() {
        let api = Arc::new(FakeApi::new(vec![
            completed(tool_call_message(), FinishReason::ToolCalls),
            completed(ChatCompletionMessage::assistant("It is sunny."), FinishReason::Stop),
            completed(ChatCompletionMessage::assistant("You're welcome."), FinishReason::Stop),
        ]));
        let mut generator = ChatCompletionResponseGenerator::builder(client(api.clone()), "fake-1")
            .function_handler(weather_handler())
            .build()
            .unwrap();

        let mut dialogue = vec![DialogueTurn::user("Weather?")];
        let response = generator.get_response(&dialogue, false).await.unwrap();
        assert_eq!(response.text, "It is sunny.");

        let requests = api.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].len(), 3);
        assert_eq!(requests[1][2].role, Role::Tool);
        assert_eq!(requests[1][2].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(requests[1][2].content_as_str(), "weather: sunny in Paris");

        dialogue.push(response.into_turn());
        dialogue.push(DialogueTurn::user("Thanks"));
        generator.get_response(&dialogue, false).await.unwrap();

        let replay = &api.requests()[2];
        let roles: Vec<Role> = replay.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant, Role::User]
        );
    }

    #[tokio::test]
    async fn test_tool_round_usage_covers_both_calls() {
        let api = Arc::new(FakeApi::new(vec![
            completed(tool_call_message(), FinishReason::ToolCalls),
            completed(ChatCompletionMessage::assistant("It is sunny."), FinishReason::Stop),
        ]));
        let mut generator = ChatCompletionResponseGenerator::builder(client(api), "fake-1")
            .function_handler(weather_handler())
            .build()
            .unwrap();

        let response = generator.get_response(&[DialogueTurn::user("Weather?")], false).await.unwrap();
        assert_eq!(
            response.metadata["chatcompletion"]["usage"],
            json!({"prompt_tokens": 20, "completion_tokens": 10, "total_tokens": 30})
        );
    }

    #[tokio::test]
    async fn test_second_tool_round_is_not_resolved() {
        let api = Arc::new(FakeApi::new(vec![
            completed(tool_call_message(), FinishReason::ToolCalls),
            completed(tool_call_message(), FinishReason::ToolCalls),
        ]));
        let mut generator = ChatCompletionResponseGenerator::builder(client(api.clone()), "fake-1")
            .function_handler(weather_handler())
            .build()
            .unwrap();

        let err = generator.get_response(&[DialogueTurn::user("Weather?")], false).await.unwrap_err();
        assert!(matches!(err, Error::UnresolvedToolCall));
        assert_eq!(api.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_tool_call_without_handler_is_fatal() {
        let api = Arc::new(FakeApi::new(vec![completed(tool_call_message(), FinishReason::ToolCalls)]));
        let mut generator = ChatCompletionResponseGenerator::builder(client(api), "fake-1")
            .build()
            .unwrap();

        let err = generator.get_response(&[DialogueTurn::user("Weather?")], false).await.unwrap_err();
        assert!(matches!(err, Error::MissingFunctionHandler(ref name) if name == "weather"));
    }

    #[tokio::test]
    async fn test_unexpected_finish_reason_is_fatal() {
        let api = Arc::new(FakeApi::new(vec![completed(
            ChatCompletionMessage::assistant("cut"),
            FinishReason::Length,
        )]));
        let mut generator = ChatCompletionResponseGenerator::builder(client(api), "fake-1")
            .build()
            .unwrap();

        let err = generator.get_response(&[DialogueTurn::user("Hi")], false).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedFinishReason(FinishReason::Length)));
    }

    #[tokio::test]
    async fn test_exhausted_retries_regenerate_once() {
        let api = Arc::new(FakeApi::new(vec![]));
        let mut generator = ChatCompletionResponseGenerator::builder(client(api.clone()), "fake-1")
            .trial_count(1)
            .build()
            .unwrap();

        let err = generator.get_response(&[DialogueTurn::user("Hi")], false).await.unwrap_err();
        assert!(matches!(err, Error::RegenerateExhausted(_)));
        // Two generation attempts, each with trial_count + 1 calls.
        assert_eq!(api.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let api = Arc::new(FakeApi::new(vec![]));
        let source = ChatCompletionResponseGenerator::builder(client(api.clone()), "fake-1")
            .instruction(Instruction::template("Hello {{ name }}"))
            .instruction_parameters(json!({"name": "Ada"}).as_object().cloned().unwrap())
            .initial_user_message("Hi!")
            .params(CompletionParams::default().with_temperature(0.5))
            .verbose(true)
            .build()
            .unwrap();

        let mut parcel = Metadata::new();
        source.write_to_json(&mut parcel).unwrap();
        assert_eq!(parcel["base_instruction"], json!({"template": "Hello {{ name }}"}));

        let mut restored = ChatCompletionResponseGenerator::builder(client(api), "other")
            .build()
            .unwrap();
        restored.restore_from_json(&parcel).await.unwrap();

        assert_eq!(restored.model(), "fake-1");
        assert_eq!(restored.instruction(), Some("Hello Ada"));
        assert_eq!(restored.params().temperature, Some(0.5));
        assert!(restored.verbose());
        assert_eq!(restored.initial_user_message(), Some(&InitialUserMessage::Text("Hi!".into())));
    }

    #[test]
    fn test_update_instruction_parameters_merges() {
        let api = Arc::new(FakeApi::new(vec![]));
        let mut generator = ChatCompletionResponseGenerator::builder(client(api), "fake-1")
            .instruction(Instruction::template("{{ a }}-{{ b }}"))
            .instruction_parameters(json!({"a": 1, "b": 2}).as_object().cloned().unwrap())
            .build()
            .unwrap();

        generator
            .update_instruction_parameters(json!({"b": 3}).as_object().cloned().unwrap())
            .unwrap();
        assert_eq!(generator.instruction(), Some("1-3"));
    }
}
