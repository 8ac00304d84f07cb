//! Embedded tool router: answers the small JSON-RPC method set the agent
//! uses to talk to in-process tool servers.

use crate::error::McpError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::server::SdkMcpServer;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Protocol version reported in `initialize` results.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Routes embedded messages to registered tool servers by name.
#[derive(Debug, Clone, Default)]
pub struct McpRouter {
    servers: HashMap<String, Arc<SdkMcpServer>>,
}

impl McpRouter {
    pub fn new(servers: impl IntoIterator<Item = SdkMcpServer>) -> Self {
        let servers = servers
            .into_iter()
            .map(|s| (s.name().to_string(), Arc::new(s)))
            .collect();
        Self { servers }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn server(&self, name: &str) -> Option<&SdkMcpServer> {
        self.servers.get(name).map(Arc::as_ref)
    }

    pub fn server_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.servers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Answer one embedded message addressed to `server_name`.
    ///
    /// Always produces a JSON-RPC response object; routing failures become
    /// JSON-RPC errors rather than failing the surrounding control request.
    pub async fn handle(&self, server_name: &str, message: Value) -> Value {
        let request: JsonRpcRequest = match serde_json::from_value(message) {
            Ok(req) => req,
            Err(e) => {
                let err = McpError::InvalidRequest(e.to_string());
                return JsonRpcResponse::error(None, err.code(), err.to_string()).into_value();
            }
        };
        let id = request.id.clone();

        match self.route(server_name, request).await {
            Ok(response) => response.into_value(),
            Err(err) => {
                tracing::debug!("Tool server '{}' request failed: {}", server_name, err);
                JsonRpcResponse::error(id, err.code(), err.to_string()).into_value()
            }
        }
    }

    async fn route(
        &self,
        server_name: &str,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, McpError> {
        let server = self
            .server(server_name)
            .ok_or_else(|| McpError::ServerNotFound {
                name: server_name.to_string(),
            })?;
        let method = request
            .method
            .as_deref()
            .ok_or_else(|| McpError::InvalidRequest("message has no method".into()))?;

        match method {
            "initialize" => Ok(JsonRpcResponse::result(
                request.id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {
                        "name": server.name(),
                        "version": server.version(),
                    },
                }),
            )),
            "tools/list" => {
                let tools: Vec<Value> = server.tools().iter().map(|t| t.listing()).collect();
                Ok(JsonRpcResponse::result(request.id, json!({"tools": tools})))
            }
            "tools/call" => {
                let params = request.params.unwrap_or(Value::Null);
                let tool_name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let tool = server
                    .find_tool(tool_name)
                    .ok_or_else(|| McpError::ToolNotFound {
                        name: tool_name.to_string(),
                    })?;
                let arguments = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));

                let output = tool.call(arguments).await?;
                let mut result = json!({"content": output.content});
                if output.is_error {
                    result["isError"] = Value::Bool(true);
                }
                Ok(JsonRpcResponse::result(request.id, result))
            }
            "notifications/initialized" => Ok(JsonRpcResponse::result(None, json!({}))),
            other => Err(McpError::MethodNotFound {
                method: other.to_string(),
            }),
        }
    }
}
