//! Turn-taking chat sessions and their file-based persistence.
//!
//! A [`ChatSession`] owns a dialogue and the generator answering it. Turns
//! are committed only after a response is complete, so abandoning an
//! in-flight call leaves the dialogue as it was. Sessions are stored as
//! one JSON document per session id by [`SessionStore`].

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::dialogue::{Dialogue, DialogueTurn, Metadata};
use crate::error::{Error, Result};
use crate::generator::ResponseGenerator;

/// Metadata flag that ends a conversation.
pub const TERMINATE_KEY: &str = "terminate";

/// A dialogue plus the generator producing its system turns.
pub struct ChatSession<G: ResponseGenerator> {
    id: String,
    dialogue: Dialogue,
    generator: G,
    created_at: String,
    updated_at: String,
}

impl<G: ResponseGenerator> ChatSession<G> {
    pub fn new(id: impl Into<String>, generator: G) -> Self {
        let now = chrono::Local::now().to_rfc3339();
        Self {
            id: id.into(),
            dialogue: Vec::new(),
            generator,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// A session with a fresh random id.
    pub fn with_generator(generator: G) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), generator)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dialogue(&self) -> &[DialogueTurn] {
        &self.dialogue
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn generator_mut(&mut self) -> &mut G {
        &mut self.generator
    }

    pub fn updated_at(&self) -> &str {
        &self.updated_at
    }

    fn commit(&mut self, turn: DialogueTurn) {
        self.dialogue.push(turn);
        self.updated_at = chrono::Local::now().to_rfc3339();
    }

    /// Initialize the generator and produce the opening system turn.
    pub async fn initialize(&mut self) -> Result<DialogueTurn> {
        self.generator.initialize().await?;
        self.generate_system_turn().await
    }

    /// Commit a user turn and answer it.
    pub async fn push_user_message(&mut self, message: impl Into<String>) -> Result<DialogueTurn> {
        self.commit(DialogueTurn::user(message));
        self.generate_system_turn().await
    }

    /// Generate and commit the next system turn.
    pub async fn generate_system_turn(&mut self) -> Result<DialogueTurn> {
        let response = self.generator.get_response(&self.dialogue, false).await?;
        debug!(session = %self.id, elapsed_ms = response.elapsed_ms, "Generated system turn");
        let turn = response.into_turn();
        self.commit(turn.clone());
        Ok(turn)
    }

    /// Drop a trailing system turn and generate a replacement.
    ///
    /// Returns `None` when the dialogue is empty.
    pub async fn regenerate_last_system_turn(&mut self) -> Result<Option<DialogueTurn>> {
        let Some(last) = self.dialogue.last() else {
            return Ok(None);
        };
        if !last.is_user {
            let response = self
                .generator
                .get_response(&self.dialogue[..self.dialogue.len() - 1], false)
                .await?;
            self.dialogue.pop();
            let turn = response.into_turn();
            self.commit(turn.clone());
            return Ok(Some(turn));
        }
        self.generate_system_turn().await.map(Some)
    }

    /// Whether the last system turn carries `terminate = true`.
    pub fn is_terminated(&self) -> bool {
        self.dialogue
            .iter()
            .rev()
            .find(|t| !t.is_user)
            .and_then(|t| t.metadata_value(&[TERMINATE_KEY]))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Dialogue and generator configuration as one JSON document.
    pub fn write_to_json(&self) -> Result<Value> {
        let mut generator = Metadata::new();
        self.generator.write_to_json(&mut generator)?;
        Ok(json!({
            "id": self.id,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
            "dialogue": self.dialogue,
            "generator": generator,
        }))
    }

    /// Restore a document written by [`write_to_json`](Self::write_to_json).
    pub async fn restore_from_json(&mut self, data: &Value) -> Result<()> {
        let dialogue: Dialogue = serde_json::from_value(data["dialogue"].clone())?;
        if let Some(generator) = data["generator"].as_object() {
            self.generator.restore_from_json(generator).await?;
        }
        if let Some(id) = data["id"].as_str() {
            self.id = id.to_string();
        }
        if let Some(created_at) = data["created_at"].as_str() {
            self.created_at = created_at.to_string();
        }
        if let Some(updated_at) = data["updated_at"].as_str() {
            self.updated_at = updated_at.to_string();
        }
        self.dialogue = dialogue;
        Ok(())
    }
}

/// Session documents under a directory, one `<id>.json` per session.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.parley/sessions`
    pub fn default_dir() -> PathBuf {
        crate::config::Config::config_dir().join("sessions")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, id: &str) -> PathBuf {
        let safe_name = id.replace([':', '/', '\\'], "_");
        self.dir.join(format!("{}.json", safe_name))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.session_path(id).exists()
    }

    pub fn save<G: ResponseGenerator>(&self, session: &ChatSession<G>) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.session_path(session.id());
        let document = session.write_to_json()?;
        std::fs::write(&path, serde_json::to_string_pretty(&document)?)?;
        Ok(path)
    }

    /// Restore session `id` into `session`.
    pub async fn load_into<G: ResponseGenerator>(&self, id: &str, session: &mut ChatSession<G>) -> Result<()> {
        let path = self.session_path(id);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::State(format!("cannot read session {}: {e}", path.display())))?;
        let document: Value = serde_json::from_str(&content)?;
        session.restore_from_json(&document).await
    }

    /// `(id, updated_at)` of every stored session, most recent first.
    pub fn list_sessions(&self) -> Vec<(String, String)> {
        let mut sessions = Vec::new();

        if let Ok(entries) = std::fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.extension().is_some_and(|e| e == "json") {
                    continue;
                }
                match std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|c| serde_json::from_str::<Value>(&c).ok())
                {
                    Some(doc) => sessions.push((
                        doc["id"].as_str().unwrap_or_default().to_string(),
                        doc["updated_at"].as_str().unwrap_or_default().to_string(),
                    )),
                    None => warn!(path = %path.display(), "Failed to parse session file"),
                }
            }
        }

        sessions.sort_by(|a, b| b.1.cmp(&a.1));
        sessions
    }
}
