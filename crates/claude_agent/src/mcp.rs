//! In-process MCP servers addressed through the CLI's control plane.
//!
//! An [`SdkMcpServer`] is a tool registry that answers the JSON-RPC subset
//! the CLI speaks at it (`initialize`, `tools/list`, `tools/call`) without a
//! separate subprocess. Tool handlers are untrusted host code: failures and
//! panics are folded into JSON-RPC errors and never take the shim down.

use std::{collections::BTreeMap, fmt, future::Future, sync::Arc};

use serde_json::{json, Value};
use tracing::warn;

use crate::callbacks::{CallbackFuture, CallbackResult};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;
const JSONRPC_INVALID_PARAMS: i64 = -32602;
const JSONRPC_INTERNAL_ERROR: i64 = -32603;

/// Result of a tool invocation: MCP content blocks plus an error marker.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: Vec<Value>,
    pub is_error: bool,
}

impl ToolOutput {
    /// Single text block, the common case.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![json!({"type": "text", "text": text.into()})],
            is_error: false,
        }
    }

    pub fn blocks(content: Vec<Value>) -> Self {
        Self {
            content,
            is_error: false,
        }
    }
}

pub type ToolHandler =
    Arc<dyn Fn(Value) -> CallbackFuture<CallbackResult<ToolOutput>> + Send + Sync>;

/// One registered tool: name, description, JSON-schema input descriptor,
/// async handler.
#[derive(Clone)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    handler: ToolHandler,
}

impl fmt::Debug for McpTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

/// Builds an [`McpTool`] from an async closure taking the decoded input map.
pub fn tool<F, Fut>(
    name: impl Into<String>,
    description: impl Into<String>,
    input_schema: Value,
    handler: F,
) -> McpTool
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallbackResult<ToolOutput>> + Send + 'static,
{
    McpTool {
        name: name.into(),
        description: description.into(),
        input_schema,
        handler: Arc::new(move |input| {
            let future: CallbackFuture<CallbackResult<ToolOutput>> = Box::pin(handler(input));
            future
        }),
    }
}

/// An in-process tool registry answering the CLI's MCP JSON-RPC requests.
#[derive(Debug, Clone)]
pub struct SdkMcpServer {
    name: String,
    version: String,
    tools: BTreeMap<String, McpTool>,
}

impl SdkMcpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            tools: BTreeMap::new(),
        }
    }

    pub fn tool(mut self, tool: McpTool) -> Self {
        self.tools.insert(tool.name.clone(), tool);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Answers one embedded JSON-RPC message. Returns `None` for
    /// notifications, which take no reply.
    pub async fn handle_message(&self, message: &Value) -> Option<Value> {
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let Some(id) = message.get("id").cloned() else {
            return None;
        };

        let reply = match method {
            "initialize" => rpc_result(
                id,
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": self.name, "version": self.version},
                }),
            ),
            "tools/list" => {
                let tools: Vec<Value> = self
                    .tools
                    .values()
                    .map(|tool| {
                        json!({
                            "name": tool.name,
                            "description": tool.description,
                            "inputSchema": tool.input_schema,
                        })
                    })
                    .collect();
                rpc_result(id, json!({"tools": tools}))
            }
            "tools/call" => self.call_tool(id, message.get("params")).await,
            other => rpc_error(
                id,
                JSONRPC_METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            ),
        };
        Some(reply)
    }

    async fn call_tool(&self, id: Value, params: Option<&Value>) -> Value {
        let name = params
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let arguments = params
            .and_then(|p| p.get("arguments"))
            .cloned()
            .unwrap_or_else(|| json!({}));

        let Some(tool) = self.tools.get(name) else {
            return rpc_error(id, JSONRPC_INVALID_PARAMS, format!("unknown tool: {name}"));
        };

        // The handler runs in its own task so a panic surfaces as a join
        // error instead of unwinding through the shim.
        let future = (tool.handler)(arguments);
        match tokio::spawn(future).await {
            Ok(Ok(output)) => rpc_result(
                id,
                json!({"content": output.content, "isError": output.is_error}),
            ),
            Ok(Err(err)) => rpc_error(id, JSONRPC_INTERNAL_ERROR, err.to_string()),
            Err(join_err) => {
                warn!(tool = name, error = %join_err, "tool handler panicked");
                rpc_error(
                    id,
                    JSONRPC_INTERNAL_ERROR,
                    format!("tool handler panicked: {join_err}"),
                )
            }
        }
    }
}

fn rpc_result(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn rpc_error(id: Value, code: i64, message: String) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
