//! Tools the model can call during a chat-completion round trip.
//!
//! Every tool implements [`Tool`] and is registered in a [`ToolRegistry`].
//! The registry exports its definitions for `CompletionParams::tools` and
//! implements [`FunctionHandler`], so it can be handed directly to a
//! `ChatCompletionResponseGenerator`.

use async_trait::async_trait;
use chrono::format::{Item, StrftimeItems};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::generator::FunctionHandler;
use crate::llm::types::{ToolDefinition, ToolFunctionDef};

/// A capability exposed to the model as a callable function.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Function name the model uses in tool calls (e.g. "current_time").
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn parameters(&self) -> Value;

    /// Run the tool. The returned text is sent back to the model.
    async fn execute(&self, args: Value) -> Result<String>;
}

/// Tools keyed by name.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        debug!(tool = tool.name(), "Registered tool");
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Definitions in OpenAI function-calling format, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                def_type: "function".into(),
                function: ToolFunctionDef {
                    name: tool.name().into(),
                    description: tool.description().into(),
                    parameters: tool.parameters(),
                },
            })
            .collect();
        definitions.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        definitions
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FunctionHandler for ToolRegistry {
    /// Unknown tools are reported back to the model as text so it can recover.
    async fn call(&self, name: &str, args: Value) -> Result<String> {
        match self.tools.get(name) {
            Some(tool) => {
                debug!(tool = name, "Executing tool");
                tool.execute(args).await
            }
            None => {
                error!(tool = name, "Tool not found");
                Ok(format!("Error: Tool '{}' not found", name))
            }
        }
    }
}

/// Reports the current UTC time, optionally in a `strftime` format.
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "format": {
                    "type": "string",
                    "description": "Optional strftime format, e.g. \"%Y-%m-%d\". Defaults to RFC 3339."
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<String> {
        let now = chrono::Utc::now();
        let Some(format) = args.get("format").and_then(Value::as_str) else {
            return Ok(now.to_rfc3339());
        };

        let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
        if items.iter().any(|item| matches!(item, Item::Error)) {
            warn!(format, "Rejected invalid time format");
            return Ok(format!("Error: invalid strftime format '{}'", format));
        }
        Ok(now.format_with_items(items.into_iter()).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the text argument"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, args: Value) -> Result<String> {
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    #[tokio::test]
    async fn test_register_and_call() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));

        assert!(registry.has("echo"));
        assert_eq!(registry.len(), 1);

        let result = registry.call("echo", json!({"text": "hi"})).await.unwrap();
        assert_eq!(result, "hi");
    }

    #[tokio::test]
    async fn test_missing_tool_reports_to_model() {
        let registry = ToolRegistry::new();
        let result = registry.call("nonexistent", json!({})).await.unwrap();
        assert!(result.contains("not found"));
    }

    #[test]
    fn test_definitions_are_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        registry.register(Box::new(CurrentTimeTool));

        let names: Vec<_> = registry.definitions().into_iter().map(|d| d.function.name).collect();
        assert_eq!(names, vec!["current_time", "echo"]);
    }

    #[tokio::test]
    async fn test_current_time_format() {
        let out = CurrentTimeTool.execute(json!({"format": "%Y"})).await.unwrap();
        assert_eq!(out.len(), 4);
        assert!(out.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_current_time_invalid_format_reports_to_model() {
        let out = CurrentTimeTool.execute(json!({"format": "%Q"})).await.unwrap();
        assert!(out.starts_with("Error: invalid strftime format"));

        let mut registry = ToolRegistry::new();
        registry.register(Box::new(CurrentTimeTool));
        let out = registry.call("current_time", json!({"format": "%Y-%"})).await.unwrap();
        assert!(out.contains("%Y-%"));
    }
}
