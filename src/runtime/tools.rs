//! Tool registry owned by a runtime instance.

use super::types::{ToolCall, ToolConfig, ToolResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

/// Executes one tool. `Err` becomes `ToolResult.error`.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: Value, cancel: CancellationToken) -> Result<String, String>;
}

/// Adapter turning an async closure into a [`ToolHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn call(&self, input: Value, _cancel: CancellationToken) -> Result<String, String> {
        (self.0)(input).await
    }
}

struct RegisteredTool {
    config: ToolConfig,
    handler: Option<Arc<dyn ToolHandler>>,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a tool.
    pub fn register(&self, config: ToolConfig, handler: Option<Arc<dyn ToolHandler>>) {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        tools.insert(config.name.clone(), RegisteredTool { config, handler });
    }

    /// Register a declaration unless a tool of that name already exists.
    pub fn declare(&self, config: ToolConfig) {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        tools
            .entry(config.name.clone())
            .or_insert(RegisteredTool { config, handler: None });
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        tools.remove(name).is_some()
    }

    /// Declarations sorted by name.
    pub fn list(&self) -> Vec<ToolConfig> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        let mut configs: Vec<ToolConfig> = tools.values().map(|t| t.config.clone()).collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// Run a tool call. Failures are reported in the result, never raised.
    pub async fn execute(&self, call: &ToolCall, cancel: CancellationToken) -> ToolResult {
        let handler = {
            let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
            match tools.get(&call.name) {
                None => return ToolResult::err(&call.id, format!("unknown tool: {}", call.name)),
                Some(tool) => tool.handler.clone(),
            }
        };

        let Some(handler) = handler else {
            return ToolResult::err(&call.id, format!("tool {} has no handler", call.name));
        };

        tokio::select! {
            _ = cancel.cancelled() => ToolResult::err(&call.id, "cancelled"),
            outcome = handler.call(call.input.clone(), cancel.clone()) => match outcome {
                Ok(output) => ToolResult::ok(&call.id, output),
                Err(error) => ToolResult::err(&call.id, error),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(name: &str) -> ToolConfig {
        ToolConfig {
            name: name.to_string(),
            description: format!("{} tool", name),
            input_schema: json!({"type": "object"}),
        }
    }

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: "call-1".to_string(),
            name: name.to_string(),
            input: json!({"text": "hi"}),
        }
    }

    fn echo() -> Arc<dyn ToolHandler> {
        Arc::new(FnHandler(|input: Value| async move {
            Ok::<_, String>(input["text"].as_str().unwrap_or_default().to_string())
        }))
    }

    #[tokio::test]
    async fn test_execute_registered() {
        let registry = ToolRegistry::new();
        registry.register(config("echo"), Some(echo()));

        let result = registry.execute(&call("echo"), CancellationToken::new()).await;
        assert_eq!(result, ToolResult::ok("call-1", "hi"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let result = registry.execute(&call("nope"), CancellationToken::new()).await;
        assert_eq!(result.error.as_deref(), Some("unknown tool: nope"));
    }

    #[tokio::test]
    async fn test_declared_without_handler() {
        let registry = ToolRegistry::new();
        registry.declare(config("grep"));
        let result = registry.execute(&call("grep"), CancellationToken::new()).await;
        assert_eq!(result.error.as_deref(), Some("tool grep has no handler"));
    }

    #[tokio::test]
    async fn test_handler_error_is_reported() {
        let registry = ToolRegistry::new();
        let failing: Arc<dyn ToolHandler> =
            Arc::new(FnHandler(|_: Value| async { Err::<String, _>("boom".to_string()) }));
        registry.register(config("fail"), Some(failing));

        let result = registry.execute(&call("fail"), CancellationToken::new()).await;
        assert!(result.is_error());
        assert_eq!(result.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_declare_keeps_existing_handler() {
        let registry = ToolRegistry::new();
        registry.register(config("echo"), Some(echo()));
        registry.declare(config("echo"));
        registry.declare(config("alpha"));

        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["alpha", "echo"]);
        assert!(registry.unregister("alpha"));
        assert!(!registry.unregister("alpha"));
    }
}
