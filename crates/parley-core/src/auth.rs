//! Credential resolution for provider adapters.
//!
//! Each provider declares the named variables it needs as
//! [`AuthorizationVariableSpec`]s. The [`AuthorizationManager`] resolves them
//! through a [`VariableSource`] (environment, `.env`, config file), caches the
//! results in a [`CredentialCache`] keyed by `(provider, kind)`, and can fall
//! back to an interactive [`CredentialCollector`] when running in a terminal.
//!
//! The cache is an explicit shared store: clone the `Arc` into several
//! managers to share it process-wide. Writes are last-write-wins, so
//! concurrent authorization of the same provider is idempotent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::config::{Config, ProviderEntry};
use crate::error::{Error, Result};

/// The kind of a named credential variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationVariableKind {
    ApiKey,
    Secret,
    Host,
    Key,
    ClientId,
}

impl AuthorizationVariableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Secret => "secret",
            Self::Host => "host",
            Self::Key => "key",
            Self::ClientId => "client_id",
        }
    }

    /// Whether the value should be hidden when typed interactively.
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::ApiKey | Self::Secret | Self::Key)
    }
}

/// Declares one credential variable a provider needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthorizationVariableSpec {
    pub kind: AuthorizationVariableKind,
}

impl AuthorizationVariableSpec {
    pub const API_KEY: Self = Self::new(AuthorizationVariableKind::ApiKey);
    pub const SECRET: Self = Self::new(AuthorizationVariableKind::Secret);
    pub const HOST: Self = Self::new(AuthorizationVariableKind::Host);
    pub const KEY: Self = Self::new(AuthorizationVariableKind::Key);
    pub const CLIENT_ID: Self = Self::new(AuthorizationVariableKind::ClientId);

    pub const fn new(kind: AuthorizationVariableKind) -> Self {
        Self { kind }
    }

    /// Prompt text shown by interactive collectors.
    pub fn prompt(&self, provider_name: &str) -> String {
        match self.kind {
            AuthorizationVariableKind::ApiKey => {
                format!("Please enter your API key for {provider_name}")
            }
            AuthorizationVariableKind::Secret => {
                format!("Please enter your secret for {provider_name}")
            }
            AuthorizationVariableKind::Host => {
                format!("Please enter a host address for {provider_name}")
            }
            AuthorizationVariableKind::Key => format!("Please enter your key for {provider_name}"),
            AuthorizationVariableKind::ClientId => {
                format!("Please enter your client id for {provider_name}")
            }
        }
    }
}

/// Resolved credential values for one provider.
pub type Credentials = HashMap<AuthorizationVariableKind, String>;

/// Environment variable name for a provider credential.
///
/// The provider name and kind are joined with `_`, upper-cased, every
/// non-alphanumeric character becomes `_` and runs of `_` collapse:
/// `("Open AI", ApiKey)` → `OPEN_AI_API_KEY`.
pub fn env_key_for(provider_name: &str, kind: AuthorizationVariableKind) -> String {
    let raw = format!("{}_{}", provider_name, kind.as_str());
    let mut key = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() {
            c.to_ascii_uppercase()
        } else {
            '_'
        };
        if c == '_' && key.ends_with('_') {
            continue;
        }
        key.push(c);
    }
    key.trim_matches('_').to_string()
}

// ── Variable sources ───────────────────────────────────────────────

/// External source of credential values keyed by provider and kind.
pub trait VariableSource: Send + Sync {
    fn get(&self, provider_name: &str, kind: AuthorizationVariableKind) -> Option<String>;
}

/// Reads credentials from the process environment, then from a `.env` file.
///
/// The `.env` file is read without modifying the process environment, so a
/// value written by an interactive collector is visible on the next lookup.
pub struct EnvVariableSource {
    dotenv_path: Option<PathBuf>,
}

impl EnvVariableSource {
    /// Use `.env` in the current working directory.
    pub fn new() -> Self {
        Self { dotenv_path: None }
    }

    /// Use a specific `.env` file.
    pub fn with_dotenv_path(path: impl Into<PathBuf>) -> Self {
        Self {
            dotenv_path: Some(path.into()),
        }
    }

    fn dotenv_file(&self) -> PathBuf {
        self.dotenv_path.clone().unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".env")
        })
    }

    fn dotenv_lookup(&self, key: &str) -> Option<String> {
        let iter = dotenvy::from_path_iter(self.dotenv_file()).ok()?;
        iter.filter_map(|item| item.ok())
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v)
            .last()
    }
}

impl Default for EnvVariableSource {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableSource for EnvVariableSource {
    fn get(&self, provider_name: &str, kind: AuthorizationVariableKind) -> Option<String> {
        let key = env_key_for(provider_name, kind);
        match std::env::var(&key) {
            Ok(value) if !value.is_empty() => Some(value),
            _ => self.dotenv_lookup(&key).filter(|v| !v.is_empty()),
        }
    }
}

/// Reads credentials from the `providers` section of the config file.
///
/// Provider names are matched case-insensitively with spaces and
/// punctuation removed (`"Open AI"` matches the `openai` entry).
pub struct ConfigVariableSource {
    entries: HashMap<String, ProviderEntry>,
}

impl ConfigVariableSource {
    pub fn new(entries: HashMap<String, ProviderEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(name, entry)| (normalize_provider_name(&name), entry))
            .collect();
        Self { entries }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.providers.entries())
    }
}

fn normalize_provider_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl VariableSource for ConfigVariableSource {
    fn get(&self, provider_name: &str, kind: AuthorizationVariableKind) -> Option<String> {
        let entry = self.entries.get(&normalize_provider_name(provider_name))?;
        let value = match kind {
            AuthorizationVariableKind::ApiKey | AuthorizationVariableKind::Key => Some(&entry.api_key),
            AuthorizationVariableKind::Host => entry.api_base.as_ref(),
            AuthorizationVariableKind::Secret => entry.secret.as_ref(),
            AuthorizationVariableKind::ClientId => entry.client_id.as_ref(),
        };
        value.filter(|v| !v.is_empty()).cloned()
    }
}

/// Tries each source in order and returns the first value found.
pub struct ChainedVariableSource {
    sources: Vec<Arc<dyn VariableSource>>,
}

impl ChainedVariableSource {
    pub fn new(sources: Vec<Arc<dyn VariableSource>>) -> Self {
        Self { sources }
    }
}

impl VariableSource for ChainedVariableSource {
    fn get(&self, provider_name: &str, kind: AuthorizationVariableKind) -> Option<String> {
        self.sources
            .iter()
            .find_map(|source| source.get(provider_name, kind))
    }
}

// ── Cache ───────────────────────────────────────────────────────────

/// Keyed credential store shared between authorization managers.
#[derive(Default)]
pub struct CredentialCache {
    values: RwLock<HashMap<(String, AuthorizationVariableKind), String>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, provider_name: &str, kind: AuthorizationVariableKind) -> Option<String> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(&(provider_name.to_string(), kind)).cloned()
    }

    pub fn insert(&self, provider_name: &str, kind: AuthorizationVariableKind, value: String) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert((provider_name.to_string(), kind), value);
    }

    pub fn invalidate(&self, provider_name: &str, kind: AuthorizationVariableKind) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.remove(&(provider_name.to_string(), kind));
    }

    /// Drop every cached value of a provider.
    pub fn invalidate_provider(&self, provider_name: &str) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.retain(|(name, _), _| name != provider_name);
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Interactive collection ─────────────────────────────────────────

/// Collects credentials from a person at a terminal.
///
/// Must return exactly one value per requested spec. Implementations are
/// also responsible for persisting the answers (e.g. into `.env`).
#[async_trait]
pub trait CredentialCollector: Send + Sync {
    async fn collect(
        &self,
        provider_name: &str,
        specs: &[AuthorizationVariableSpec],
    ) -> anyhow::Result<Vec<(AuthorizationVariableKind, String)>>;
}

// ── Manager ─────────────────────────────────────────────────────────

/// Resolves and caches provider credentials.
pub struct AuthorizationManager {
    source: Arc<dyn VariableSource>,
    cache: Arc<CredentialCache>,
    collector: Option<Arc<dyn CredentialCollector>>,
    interactive: bool,
}

impl AuthorizationManager {
    /// Create a non-interactive manager with its own cache.
    pub fn new(source: Arc<dyn VariableSource>) -> Self {
        Self {
            source,
            cache: Arc::new(CredentialCache::new()),
            collector: None,
            interactive: false,
        }
    }

    /// Share a cache with other managers.
    pub fn with_cache(mut self, cache: Arc<CredentialCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Enable interactive collection through `collector`.
    pub fn with_collector(mut self, collector: Arc<dyn CredentialCollector>) -> Self {
        self.collector = Some(collector);
        self.interactive = true;
        self
    }

    /// Toggle interactive mode without changing the collector.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive && self.collector.is_some()
    }

    pub fn cache(&self) -> &Arc<CredentialCache> {
        &self.cache
    }

    /// Resolve every spec, failing closed if any variable is missing.
    ///
    /// A miss clears the provider's cached values so the next attempt
    /// re-reads the source.
    pub fn resolve(&self, provider_name: &str, specs: &[AuthorizationVariableSpec]) -> Option<Credentials> {
        let mut credentials = Credentials::new();
        for spec in specs {
            let value = self.cache.get(provider_name, spec.kind).or_else(|| {
                let fetched = self.source.get(provider_name, spec.kind)?;
                self.cache.insert(provider_name, spec.kind, fetched.clone());
                Some(fetched)
            });

            match value {
                Some(v) => {
                    credentials.insert(spec.kind, v);
                }
                None => {
                    debug!(
                        provider = provider_name,
                        kind = spec.kind.as_str(),
                        "Credential variable missing"
                    );
                    self.cache.invalidate_provider(provider_name);
                    return None;
                }
            }
        }
        Some(credentials)
    }

    /// Write a credential value, replacing any cached one.
    pub fn store_credential(&self, provider_name: &str, kind: AuthorizationVariableKind, value: String) {
        self.cache.invalidate(provider_name, kind);
        self.cache.insert(provider_name, kind, value);
    }

    /// Ask the interactive collector for every spec and store the answers.
    pub async fn collect_interactively(
        &self,
        provider_name: &str,
        specs: &[AuthorizationVariableSpec],
    ) -> Result<()> {
        let collector = match (&self.collector, self.interactive) {
            (Some(c), true) => c,
            _ => return Err(Error::ServiceUnauthorized(provider_name.to_string())),
        };

        info!(provider = provider_name, "Requesting credentials interactively");
        let answers = collector.collect(provider_name, specs).await?;

        for spec in specs {
            match answers.iter().find(|(kind, _)| *kind == spec.kind) {
                Some((kind, value)) if !value.is_empty() => {
                    self.store_credential(provider_name, *kind, value.clone());
                }
                _ => {
                    warn!(
                        provider = provider_name,
                        kind = spec.kind.as_str(),
                        "Interactive collector returned no value"
                    );
                    return Err(Error::ServiceUnauthorized(provider_name.to_string()));
                }
            }
        }
        Ok(())
    }
}
