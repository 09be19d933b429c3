//! parley CLI: chat with an agent, onboarding, status and sessions.
//!
//! Usage:
//!   parley chat         Start an interactive chat session
//!   parley onboard      Create a default configuration
//!   parley status       Show configuration and credential status
//!   parley sessions     List saved chat sessions

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use parley_core::auth::{
    env_key_for, AuthorizationManager, AuthorizationVariableKind, AuthorizationVariableSpec, ChainedVariableSource,
    ConfigVariableSource, CredentialCollector, EnvVariableSource, VariableSource,
};
use parley_core::config::Config;
use parley_core::dialogue::DialogueTurn;
use parley_core::generator::ChatCompletionResponseGenerator;
use parley_core::llm::anthropic::AnthropicApi;
use parley_core::llm::openai::OpenAiApi;
use parley_core::llm::types::CompletionParams;
use parley_core::llm::{ChatCompletionApi, ChatCompletionClient};
use parley_core::session::{ChatSession, SessionStore, TERMINATE_KEY};
use parley_core::tools::{CurrentTimeTool, ToolRegistry};

const TERMINATE_TOKEN: &str = "<|Terminate|>";

const DEFAULT_INSTRUCTION: &str = "You are a friendly and supportive conversational partner. \
Keep your replies short. When the user wants to end the conversation, say goodbye and \
append the special token <|Terminate|> to the end of your message.";

#[derive(Parser)]
#[command(
    name = "parley",
    version,
    about = "Turn-taking chat agents on top of interchangeable LLM providers"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat {
        /// Provider to use: openai or anthropic (overrides config)
        #[arg(short, long)]
        provider: Option<String>,

        /// Model to use (overrides config)
        #[arg(short, long)]
        model: Option<String>,

        /// System instruction for the agent
        #[arg(short, long)]
        instruction: Option<String>,

        /// Resume or create a named session
        #[arg(short, long)]
        session: Option<String>,

        /// Let the model call built-in tools
        #[arg(long)]
        tools: bool,
    },

    /// Create or reset the default configuration
    Onboard,

    /// Show configuration and credential status
    Status,

    /// List saved chat sessions
    Sessions,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Chat {
            provider,
            model,
            instruction,
            session,
            tools,
        }) => {
            cmd_chat(ChatOptions {
                provider,
                model,
                instruction,
                session,
                tools,
            })
            .await?
        }
        Some(Commands::Onboard) => cmd_onboard()?,
        Some(Commands::Status) => cmd_status()?,
        Some(Commands::Sessions) => cmd_sessions()?,
        None => cmd_chat(ChatOptions::default()).await?,
    }

    Ok(())
}

// ── Credentials ─────────────────────────────────────────────────────

/// Prompts for missing credentials and appends them to a `.env` file.
struct TerminalCollector {
    dotenv_path: PathBuf,
}

#[async_trait]
impl CredentialCollector for TerminalCollector {
    async fn collect(
        &self,
        provider_name: &str,
        specs: &[AuthorizationVariableSpec],
    ) -> Result<Vec<(AuthorizationVariableKind, String)>> {
        let provider = provider_name.to_string();
        let specs = specs.to_vec();
        let path = self.dotenv_path.clone();
        tokio::task::spawn_blocking(move || prompt_and_persist(&provider, &specs, &path)).await?
    }
}

fn prompt_and_persist(
    provider: &str,
    specs: &[AuthorizationVariableSpec],
    dotenv_path: &Path,
) -> Result<Vec<(AuthorizationVariableKind, String)>> {
    let mut answers = Vec::with_capacity(specs.len());
    for spec in specs {
        let prompt = spec.prompt(provider);
        let value = if spec.kind.is_sensitive() {
            Password::new().with_prompt(prompt).interact()?
        } else {
            Input::<String>::new().with_prompt(prompt).interact_text()?
        };
        answers.push((spec.kind, value.trim().to_string()));
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dotenv_path)
        .with_context(|| format!("cannot open {}", dotenv_path.display()))?;
    for (kind, value) in &answers {
        writeln!(file, "{}={}", env_key_for(provider, *kind), value)?;
    }
    println!("  Saved credentials to {}", dotenv_path.display());

    Ok(answers)
}

fn build_auth(config: &Config, interactive: bool) -> Arc<AuthorizationManager> {
    let sources: Vec<Arc<dyn VariableSource>> = vec![
        Arc::new(EnvVariableSource::new()),
        Arc::new(ConfigVariableSource::from_config(config)),
    ];
    let source = ChainedVariableSource::new(sources);
    let auth = AuthorizationManager::new(Arc::new(source));
    let auth = if interactive {
        auth.with_collector(Arc::new(TerminalCollector {
            dotenv_path: PathBuf::from(".env"),
        }))
    } else {
        auth
    };
    Arc::new(auth)
}

fn build_api(config: &Config, provider: &str, http: reqwest::Client) -> Result<Arc<dyn ChatCompletionApi>> {
    match provider.to_ascii_lowercase().as_str() {
        "openai" => Ok(Arc::new(OpenAiApi::from_entry(config.providers.openai.as_ref(), http))),
        "anthropic" => Ok(Arc::new(AnthropicApi::from_entry(
            config.providers.anthropic.as_ref(),
            http,
        ))),
        other => anyhow::bail!("Unknown provider '{}'. Use openai or anthropic.", other),
    }
}

fn build_client(config: &Config, provider: &str, interactive: bool) -> Result<Arc<ChatCompletionClient>> {
    let api = build_api(config, provider, reqwest::Client::new())?;
    let client = ChatCompletionClient::new(api, build_auth(config, interactive))
        .with_retry_delay(Duration::from_millis(config.generator.retry_delay_ms))
        .with_verbose(config.generator.verbose);
    Ok(Arc::new(client))
}

// ── Chat Command ────────────────────────────────────────────────────

#[derive(Default)]
struct ChatOptions {
    provider: Option<String>,
    model: Option<String>,
    instruction: Option<String>,
    session: Option<String>,
    tools: bool,
}

fn print_turn(turn: &DialogueTurn) {
    if turn.is_user {
        println!("  \x1b[36m<You>\x1b[0m {}", turn.message);
    } else {
        match turn.processing_time {
            Some(ms) => println!("  \x1b[32m<AI>\x1b[0m {} \x1b[2m({} ms)\x1b[0m", turn.message, ms),
            None => println!("  \x1b[32m<AI>\x1b[0m {}", turn.message),
        }
    }
}

async fn cmd_chat(options: ChatOptions) -> Result<()> {
    let config = Config::load()?;
    let provider = options
        .provider
        .unwrap_or_else(|| config.generator.provider.clone());
    let model = options.model.unwrap_or_else(|| config.generator.model.clone());
    let interactive = config.interactive && std::io::stdin().is_terminal();

    let client = build_client(&config, &provider, interactive)?;

    let mut builder = ChatCompletionResponseGenerator::builder(client, model.clone())
        .instruction(options.instruction.unwrap_or_else(|| DEFAULT_INSTRUCTION.to_string()))
        .initial_user_message("Hi!")
        .special_token(TERMINATE_TOKEN, TERMINATE_KEY, serde_json::Value::Bool(true))
        .token_limit_tolerance(config.generator.token_limit_tolerance)
        .trial_count(config.generator.trial_count)
        .verbose(config.generator.verbose);

    if options.tools {
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(CurrentTimeTool));
        builder = builder
            .params(CompletionParams::default().with_tools(tools.definitions()))
            .function_handler(Arc::new(tools));
    }
    let generator = builder.build()?;

    let store = SessionStore::new(SessionStore::default_dir());
    let mut session = match &options.session {
        Some(id) => ChatSession::new(id.clone(), generator),
        None => ChatSession::with_generator(generator),
    };
    let resumed = store.exists(session.id());
    if resumed {
        let id = session.id().to_string();
        store.load_into(&id, &mut session).await?;
    }

    println!();
    println!("  parley v{}", env!("CARGO_PKG_VERSION"));
    println!("  Provider: {} | Model: {}", provider, model);
    println!("  Session: {}", session.id());
    println!();
    println!("  Type your message. /regen regenerates the last reply, /exit quits.");
    println!("  Ctrl+C cancels a pending reply.");
    println!("  ─────────────────────────────────────");
    println!();

    if resumed && !session.dialogue().is_empty() {
        for turn in session.dialogue() {
            print_turn(turn);
        }
        println!("  ───────── continue ─────────");
    } else {
        match run_cancellable(session.initialize()).await {
            Some(Ok(turn)) => print_turn(&turn),
            Some(Err(e)) => eprintln!("  \x1b[31mError: {}\x1b[0m", e),
            None => println!("  (cancelled)"),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while !session.is_terminated() {
        print!("  \x1b[36m>\x1b[0m ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let outcome = match input {
            "/exit" | "/quit" => break,
            "/regen" => match run_cancellable(session.regenerate_last_system_turn()).await {
                Some(Ok(None)) => {
                    println!("  Nothing to regenerate.");
                    continue;
                }
                Some(Ok(Some(turn))) => Some(Ok(turn)),
                Some(Err(e)) => Some(Err(e)),
                None => None,
            },
            _ => run_cancellable(session.push_user_message(input)).await,
        };

        match outcome {
            Some(Ok(turn)) => print_turn(&turn),
            Some(Err(e)) => eprintln!("  \x1b[31mError: {}\x1b[0m", e),
            None => println!("  (cancelled; type /regen to retry)"),
        }

        if let Err(e) = store.save(&session) {
            tracing::warn!(error = %e, "Failed to save session");
        }
    }

    if let Err(e) = store.save(&session) {
        tracing::warn!(error = %e, "Failed to save session");
    }
    println!("  Goodbye!");
    Ok(())
}

/// Run `fut` until it finishes or Ctrl+C is pressed.
///
/// Returns `None` when cancelled; the future is dropped.
async fn run_cancellable<F: std::future::Future>(fut: F) -> Option<F::Output> {
    tokio::select! {
        output = fut => Some(output),
        _ = tokio::signal::ctrl_c() => None,
    }
}

// ── Onboard Command ─────────────────────────────────────────────────

fn cmd_onboard() -> Result<()> {
    let path = Config::default_path();
    Config::write_default_template(&path)?;
    println!();
    println!("  Configuration created at:");
    println!("     {}", path.display());
    println!();
    println!("  Next steps:");
    println!("  1. Add your API key to the config file, or export OPENAI_API_KEY");
    println!("  2. Run `parley chat` to start chatting");
    println!();
    Ok(())
}

// ── Status Command ──────────────────────────────────────────────────

fn cmd_status() -> Result<()> {
    let config_path = Config::default_path();
    let config = Config::load()?;

    println!();
    println!("  parley status");
    println!("  ─────────────────────────────────────");

    if config_path.exists() {
        println!("  Config:    {}", config_path.display());
    } else {
        println!("  Config:    not found (run `parley onboard`)");
    }

    println!("  Provider:  {}", config.generator.provider);
    println!("  Model:     {}", config.generator.model);

    for provider in ["openai", "anthropic"] {
        let client = build_client(&config, provider, false)?;
        let state = if client.authorize() { "ready" } else { "no credentials" };
        println!("  {:<10} {}", format!("{}:", client.provider_name()), state);
    }

    let store = SessionStore::new(SessionStore::default_dir());
    println!("  Sessions:  {} saved", store.list_sessions().len());
    println!();
    Ok(())
}

// ── Sessions Command ────────────────────────────────────────────────

fn cmd_sessions() -> Result<()> {
    let store = SessionStore::new(SessionStore::default_dir());
    let sessions = store.list_sessions();
    if sessions.is_empty() {
        println!("  No saved sessions.");
        return Ok(());
    }

    println!();
    for (id, updated) in sessions {
        println!("  {} (updated: {})", id, updated);
    }
    println!();
    Ok(())
}
