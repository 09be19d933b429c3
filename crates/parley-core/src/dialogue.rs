//! Dialogue turns and turn metadata.
//!
//! A [`Dialogue`] is an ordered, append-only list of [`DialogueTurn`]s.
//! Turn metadata is a free-form JSON object; the generators store their
//! bookkeeping under nested keys (e.g. `chatcompletion.function_messages`),
//! so the helpers here read and write nested paths.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form metadata attached to a turn or a generated response.
pub type Metadata = Map<String, Value>;

/// Ordered conversation history. Chronological, never reordered.
pub type Dialogue = Vec<DialogueTurn>;

/// A single message in a dialogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub id: String,
    pub message: String,
    pub is_user: bool,
    /// Creation time in epoch milliseconds.
    pub timestamp: i64,
    /// Time spent generating this turn, for system turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl DialogueTurn {
    pub fn new(message: impl Into<String>, is_user: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
            is_user,
            timestamp: chrono::Utc::now().timestamp_millis(),
            processing_time: None,
            metadata: None,
        }
    }

    /// A turn authored by the user.
    pub fn user(message: impl Into<String>) -> Self {
        Self::new(message, true)
    }

    /// A turn produced by the generator pipeline.
    pub fn system(message: impl Into<String>, metadata: Option<Metadata>, processing_time: Option<u64>) -> Self {
        Self {
            processing_time,
            metadata,
            ..Self::new(message, false)
        }
    }

    /// Read a nested metadata value, if present.
    pub fn metadata_value(&self, path: &[&str]) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| get_nested(m, path))
    }
}

/// Look up `path` in nested JSON objects.
pub fn get_nested<'a>(metadata: &'a Metadata, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = metadata.get(*first)?;
    for key in rest {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

/// Set `path` to `value`, creating intermediate objects as needed.
///
/// An intermediate value that is not an object (including `null`) is
/// replaced by an empty object.
pub fn set_nested(metadata: &mut Metadata, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = metadata;
    for key in parents {
        let entry = current
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(map) = entry else {
            return;
        };
        current = map;
    }
    current.insert(last.to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_set_and_get() {
        let mut meta = Metadata::new();
        set_nested(&mut meta, &["chatcompletion", "usage", "total_tokens"], json!(42));
        assert_eq!(
            get_nested(&meta, &["chatcompletion", "usage", "total_tokens"]),
            Some(&json!(42))
        );
        assert!(get_nested(&meta, &["chatcompletion", "missing"]).is_none());
        assert!(get_nested(&meta, &[]).is_none());
    }

    #[test]
    fn test_set_nested_replaces_non_object_parent() {
        let mut meta = Metadata::new();
        meta.insert("transformers".into(), Value::Null);
        set_nested(&mut meta, &["transformers", "special_tokens"], json!(true));
        assert_eq!(meta["transformers"]["special_tokens"], json!(true));
    }

    #[test]
    fn test_turn_serialization_omits_empty_fields() {
        let turn = DialogueTurn::user("Hello");
        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(value["message"], "Hello");
        assert_eq!(value["is_user"], true);
        assert!(value.get("metadata").is_none());
        assert!(value.get("processing_time").is_none());

        let restored: DialogueTurn = serde_json::from_value(value).unwrap();
        assert_eq!(restored, turn);
    }

    #[test]
    fn test_system_turn_metadata_lookup() {
        let mut meta = Metadata::new();
        meta.insert("state".into(), json!("intro"));
        let turn = DialogueTurn::system("Hi", Some(meta), Some(120));
        assert!(!turn.is_user);
        assert_eq!(turn.metadata_value(&["state"]), Some(&json!("intro")));
        assert_eq!(turn.processing_time, Some(120));
    }
}
