//! Message transformers applied to raw model output.
//!
//! A transformer rewrites `(text, metadata)` and reports whether it changed
//! anything. A [`TransformerChain`] folds its transformers left to right, so
//! each one sees the previous one's output. Whenever a transformer reports a
//! change, the chain records `metadata.transformers.<name> = true`.

use regex::Regex;
use serde_json::Value;

use crate::dialogue::{set_nested, Metadata};

/// Metadata key holding the transformer audit trail.
pub const TRANSFORMERS_KEY: &str = "transformers";

/// The output of one transformer (or a whole chain).
#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub text: String,
    pub metadata: Metadata,
    pub changed: bool,
}

/// A pure rewrite of model output text and its metadata.
pub trait MessageTransformer: Send + Sync {
    /// Name recorded in the audit trail.
    fn name(&self) -> &str;

    fn transform(&self, text: &str, metadata: Metadata) -> Transformed;
}

/// Called with the cleaned text when a single token was found.
pub type TokenFoundCallback = Box<dyn Fn(String, Metadata) -> (String, Metadata) + Send + Sync>;

/// Called once with `(found_tokens, original_text, cleaned_text, metadata)`.
pub type TokenListFoundCallback =
    Box<dyn Fn(&[String], &str, String, Metadata) -> (String, Metadata) + Send + Sync>;

/// What a [`SingleTokenExtractor`] removes.
#[derive(Debug, Clone)]
pub enum TokenPattern {
    Literal(String),
    Regex(Regex),
}

/// Removes a literal substring, or all matches of a regex.
pub struct SingleTokenExtractor {
    name: String,
    token: TokenPattern,
    on_token_found: Option<TokenFoundCallback>,
}

impl SingleTokenExtractor {
    pub fn new(name: impl Into<String>, token: TokenPattern) -> Self {
        Self {
            name: name.into(),
            token,
            on_token_found: None,
        }
    }

    pub fn literal(name: impl Into<String>, token: impl Into<String>) -> Self {
        Self::new(name, TokenPattern::Literal(token.into()))
    }

    /// Strip every match of `pattern`.
    pub fn remove_all_regex(name: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::new(name, TokenPattern::Regex(Regex::new(pattern)?)))
    }

    pub fn on_token_found<F>(mut self, callback: F) -> Self
    where
        F: Fn(String, Metadata) -> (String, Metadata) + Send + Sync + 'static,
    {
        self.on_token_found = Some(Box::new(callback));
        self
    }
}

impl MessageTransformer for SingleTokenExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(&self, text: &str, metadata: Metadata) -> Transformed {
        let cleaned = match &self.token {
            TokenPattern::Literal(token) if !token.is_empty() && text.contains(token.as_str()) => {
                Some(text.replace(token.as_str(), ""))
            }
            TokenPattern::Regex(re) if re.is_match(text) => Some(re.replace_all(text, "").into_owned()),
            _ => None,
        };

        match cleaned {
            None => Transformed {
                text: text.to_string(),
                metadata,
                changed: false,
            },
            Some(cleaned) => {
                let (text, metadata) = match &self.on_token_found {
                    Some(callback) => callback(cleaned, metadata),
                    None => (cleaned, metadata),
                };
                Transformed {
                    text,
                    metadata,
                    changed: true,
                }
            }
        }
    }
}

/// Removes every occurrence of each token in a fixed list.
///
/// The callback runs once per transform with the set of tokens found, not
/// once per token.
pub struct TokenListExtractor {
    name: String,
    tokens: Vec<String>,
    on_token_found: Option<TokenListFoundCallback>,
}

impl TokenListExtractor {
    pub fn new(name: impl Into<String>, tokens: Vec<String>) -> Self {
        Self {
            name: name.into(),
            tokens,
            on_token_found: None,
        }
    }

    pub fn on_token_found<F>(mut self, callback: F) -> Self
    where
        F: Fn(&[String], &str, String, Metadata) -> (String, Metadata) + Send + Sync + 'static,
    {
        self.on_token_found = Some(Box::new(callback));
        self
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

impl MessageTransformer for TokenListExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(&self, text: &str, metadata: Metadata) -> Transformed {
        let mut cleaned = text.to_string();
        let mut found: Vec<String> = Vec::new();

        for token in &self.tokens {
            if token.is_empty() || found.contains(token) {
                continue;
            }
            if text.contains(token.as_str()) {
                cleaned = cleaned.replace(token.as_str(), "");
                found.push(token.clone());
            }
        }

        if found.is_empty() {
            return Transformed {
                text: cleaned,
                metadata,
                changed: false,
            };
        }

        let (text, metadata) = match &self.on_token_found {
            Some(callback) => callback(&found, text, cleaned, metadata),
            None => (cleaned, metadata),
        };
        Transformed {
            text,
            metadata,
            changed: true,
        }
    }
}

/// An ordered, immutable list of transformers.
#[derive(Default)]
pub struct TransformerChain {
    transformers: Vec<Box<dyn MessageTransformer>>,
}

impl TransformerChain {
    pub fn new(transformers: Vec<Box<dyn MessageTransformer>>) -> Self {
        Self { transformers }
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.transformers.iter().map(|t| t.name()).collect()
    }

    /// Thread `(text, metadata)` through every transformer in order.
    pub fn run(&self, text: &str, metadata: Metadata) -> Transformed {
        let mut current = Transformed {
            text: text.to_string(),
            metadata,
            changed: false,
        };

        for transformer in &self.transformers {
            let step = transformer.transform(&current.text, current.metadata);
            let mut metadata = step.metadata;
            if step.changed {
                set_nested(&mut metadata, &[TRANSFORMERS_KEY, transformer.name()], Value::Bool(true));
            }
            current = Transformed {
                text: step.text,
                metadata,
                changed: current.changed || step.changed,
            };
        }

        current
    }
}

impl std::fmt::Debug for TransformerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
