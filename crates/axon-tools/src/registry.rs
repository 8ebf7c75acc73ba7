// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use axon_config::AgentMode;
use serde_json::Value;

use crate::tool::OutputCategory;
use crate::{Tool, ToolCall, ToolOutput};

/// A tool schema – mirrors axon_model::ToolSchema but keeps tools crate
/// independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Recursively rewrite every object node so strict-mode backends accept it:
/// `additionalProperties: false` plus a `required` array enumerating every
/// declared property. Never mutates its input; returns a new [`Value`].
fn normalize_schema(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), normalize_schema(v));
            }
            if out.get("type").and_then(Value::as_str) == Some("object") {
                let required: Vec<Value> = out
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|props| props.keys().cloned().map(Value::String).collect())
                    .unwrap_or_default();
                out.insert("required".to_string(), Value::Array(required));
                out.insert("additionalProperties".to_string(), Value::Bool(false));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_schema).collect()),
        other => other.clone(),
    }
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    schema: ToolSchema,
}

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

// SAFETY: ToolRegistry is Sync because:
// - HashMap<String, Arc<dyn Tool>> is Sync (String is Sync, Arc<T: Send + Sync> is Sync)
// - Tools implement Send + Sync (required by the Tool trait)
// - No interior mutability exists after construction (all methods take &self)
// - Parallel tool execution is safe because tools are immutable after registration
unsafe impl Sync for ToolRegistry {}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    /// Register a tool, normalizing its declared schema once so every later
    /// read (`schemas`, `schemas_for_mode`) returns the strict-mode form
    /// without re-walking it per call.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let tool: Arc<dyn Tool> = Arc::new(tool);
        let schema = ToolSchema {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters: normalize_schema(&tool.parameters_schema()),
        };
        self.tools
            .insert(tool.name().to_string(), RegisteredTool { tool, schema });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| t.tool.clone())
    }

    /// Produce schemas for ALL registered tools (mode-unfiltered).
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> =
            self.tools.values().map(|t| t.schema.clone()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Produce schemas only for tools available in the given mode.
    pub fn schemas_for_mode(&self, mode: AgentMode) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values()
            .filter(|t| t.tool.modes().contains(&mode))
            .map(|t| t.schema.clone())
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(registered) => registered.tool.execute(call).await,
            None => ToolOutput::err(
                &call.id,
                format!("unknown tool: {}", call.name),
            ),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn names_for_mode(&self, mode: AgentMode) -> Vec<String> {
        let mut names: Vec<String> = self.tools.values()
            .filter(|t| t.tool.modes().contains(&mode))
            .map(|t| t.tool.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Output-truncation category for a registered tool, `Generic` for an
    /// unknown name (matches `Tool::output_category`'s own default).
    pub fn output_category(&self, name: &str) -> OutputCategory {
        self.tools
            .get(name)
            .map(|t| t.tool.output_category())
            .unwrap_or(OutputCategory::Generic)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self { Self::new() }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::policy::ApprovalPolicy;
    use crate::tool::{Tool, ToolCall, ToolOutput};

    /// Minimal no-op tool for registry tests.
    struct EchoTool { name: &'static str }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str { self.name }
        fn description(&self) -> &str { "echoes its input" }
        fn parameters_schema(&self) -> Value { json!({ "type": "object" }) }
        fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        assert!(reg.get("echo").is_some());
    }

    #[test]
    fn get_unknown_returns_none() {
        let reg = ToolRegistry::new();
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn names_returns_all_registered() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "a" });
        reg.register(EchoTool { name: "b" });
        let mut names = reg.names();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn schemas_contains_registered_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "my_tool" });
        let schemas = reg.schemas();
        assert!(schemas.iter().any(|s| s.name == "my_tool"));
    }

    #[test]
    fn schemas_include_description() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "t" });
        let schemas = reg.schemas();
        assert_eq!(schemas[0].description, "echoes its input");
    }

    #[tokio::test]
    async fn execute_known_tool_succeeds() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        let call = ToolCall { id: "1".into(), name: "echo".into(), args: json!({"x":1}) };
        let out = reg.execute(&call).await;
        assert!(!out.is_error);
        assert!(out.content.starts_with("echo:"));
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_error() {
        let reg = ToolRegistry::new();
        let call = ToolCall { id: "x".into(), name: "missing".into(), args: json!({}) };
        let out = reg.execute(&call).await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "t" });
        reg.register(EchoTool { name: "t" });
        assert_eq!(reg.names().len(), 1);
    }

    struct LooseSchemaTool;

    #[async_trait]
    impl Tool for LooseSchemaTool {
        fn name(&self) -> &str { "loose" }
        fn description(&self) -> &str { "has a permissive schema" }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "nested": {
                        "type": "object",
                        "properties": {"flag": {"type": "boolean"}}
                    }
                },
                "required": ["path"]
            })
        }
        fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, call.args.to_string())
        }
    }

    #[test]
    fn registered_schema_gets_additional_properties_false() {
        let mut reg = ToolRegistry::new();
        reg.register(LooseSchemaTool);
        let schema = reg.schemas().into_iter().find(|s| s.name == "loose").unwrap();
        assert_eq!(schema.parameters["additionalProperties"], Value::Bool(false));
    }

    #[test]
    fn registered_schema_required_is_exhaustive() {
        let mut reg = ToolRegistry::new();
        reg.register(LooseSchemaTool);
        let schema = reg.schemas().into_iter().find(|s| s.name == "loose").unwrap();
        let required = schema.parameters["required"].as_array().unwrap();
        assert_eq!(required.len(), 1);
        assert!(required.iter().any(|v| v.as_str() == Some("path")));
    }

    #[test]
    fn registered_schema_normalizes_nested_objects() {
        let mut reg = ToolRegistry::new();
        reg.register(LooseSchemaTool);
        let schema = reg.schemas().into_iter().find(|s| s.name == "loose").unwrap();
        let nested = &schema.parameters["properties"]["nested"];
        assert_eq!(nested["additionalProperties"], Value::Bool(false));
        let nested_required = nested["required"].as_array().unwrap();
        assert!(nested_required.iter().any(|v| v.as_str() == Some("flag")));
    }

    #[test]
    fn original_tool_schema_is_left_unmutated() {
        let t = LooseSchemaTool;
        let raw = t.parameters_schema();
        assert!(raw.get("additionalProperties").is_none());
    }
}
