//! In-process tool servers: named collections of locally implemented tools.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tether_types::{BoxFuture, ToolError, ToolOutput};

/// Handler behind an in-process tool.
///
/// Implemented for any `Fn(Value) -> Future` closure.
pub trait ToolHandler: Send + Sync {
    fn call(&self, arguments: Value) -> BoxFuture<'_, Result<ToolOutput, ToolError>>;
}

impl<F, Fut> ToolHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
{
    fn call(&self, arguments: Value) -> BoxFuture<'_, Result<ToolOutput, ToolError>> {
        Box::pin(self(arguments))
    }
}

/// A single named tool exposed to the agent.
#[derive(Clone)]
pub struct SdkTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    handler: Arc<dyn ToolHandler>,
}

impl SdkTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: Arc::new(handler),
        }
    }

    /// Build from a closure; pins down the argument type for inference.
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, ToolError>> + Send + 'static,
    {
        Self::new(name, description, input_schema, f)
    }

    /// Invoke the handler with the call's arguments.
    pub async fn call(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        self.handler.call(arguments).await
    }

    /// The `tools/list` entry for this tool.
    pub fn listing(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

impl std::fmt::Debug for SdkTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// A named, versioned set of tools served in-process.
///
/// Supplied once at session construction and read-only afterwards.
#[derive(Debug, Clone)]
pub struct SdkMcpServer {
    name: String,
    version: String,
    tools: Vec<SdkTool>,
}

impl SdkMcpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tools: Vec::new(),
        }
    }

    /// Add a tool. Tools are listed in the order they were added.
    pub fn tool(mut self, tool: SdkTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn tools(&self) -> &[SdkTool] {
        &self.tools
    }

    pub fn find_tool(&self, name: &str) -> Option<&SdkTool> {
        self.tools.iter().find(|t| t.name == name)
    }
}
