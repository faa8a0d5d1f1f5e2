//! MCP (Model Context Protocol) Server Implementation
//!
//! JSON-RPC 2.0, one request per line. `run` serves stdio; `serve` takes any
//! reader/writer pair.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::panic;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// JSON-RPC Request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC Response
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC Error
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError { code, message }),
        }
    }
}

/// A tool failure reported as a JSON-RPC error instead of an `isError`
/// tool result.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: message.into(),
        }
    }
}

/// MCP Tool Definition
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

type BoxedHandler = Box<dyn Fn(Value) -> Result<Value> + Send + Sync>;

pub struct McpServer {
    name: String,
    version: String,
    tools: Vec<Tool>,
    handlers: HashMap<String, BoxedHandler>,
}

impl McpServer {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            tools: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    pub fn register_tool<F>(&mut self, tool: Tool, handler: F)
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(tool.name.clone(), Box::new(handler));
        self.tools.push(tool);
    }

    /// Handle an incoming request with panic recovery.
    /// If a handler panics, the server stays alive and returns an error response.
    fn handle_request_safe(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        match panic::catch_unwind(panic::AssertUnwindSafe(|| self.handle_request(request))) {
            Ok(response) => response,
            Err(panic_info) => {
                let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                error!("Handler panicked: {}", msg);
                JsonRpcResponse::error(
                    request.id.clone(),
                    INTERNAL_ERROR,
                    format!("Internal error: handler panicked: {}", msg),
                )
            }
        }
    }

    pub fn handle_request(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        debug!("Handling request: {}", request.method);

        match request.method.as_str() {
            "initialize" => self.handle_initialize(request),
            "initialized" | "notifications/initialized" => {
                JsonRpcResponse::success(request.id.clone(), json!({}))
            }
            "tools/list" => self.handle_list_tools(request),
            "tools/call" => self.handle_call_tool(request),
            "ping" => JsonRpcResponse::success(request.id.clone(), json!({})),
            _ => {
                if request.id.is_none() {
                    debug!("Ignoring unknown notification: {}", request.method);
                    JsonRpcResponse::success(None, json!({}))
                } else {
                    error!("Unknown method: {}", request.method);
                    JsonRpcResponse::error(
                        request.id.clone(),
                        METHOD_NOT_FOUND,
                        format!("Method not found: {}", request.method),
                    )
                }
            }
        }
    }

    fn handle_initialize(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        info!("Initializing MCP server: {} v{}", self.name, self.version);

        let protocol_version = request
            .params
            .as_ref()
            .and_then(|params| params.get("protocolVersion"))
            .and_then(|value| value.as_str())
            .unwrap_or("2024-11-05");

        JsonRpcResponse::success(
            request.id.clone(),
            json!({
                "protocolVersion": protocol_version,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": self.name,
                    "version": self.version
                }
            }),
        )
    }

    fn handle_list_tools(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        debug!("Listing {} tools", self.tools.len());
        JsonRpcResponse::success(request.id.clone(), json!({ "tools": self.tools }))
    }

    fn handle_call_tool(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let Some(params) = &request.params else {
            return JsonRpcResponse::error(
                request.id.clone(),
                INVALID_PARAMS,
                "Missing params".to_string(),
            );
        };

        let tool_name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        debug!("Calling tool: {} with args: {}", tool_name, arguments);

        let Some(handler) = self.handlers.get(tool_name) else {
            error!("Tool not found: {}", tool_name);
            return JsonRpcResponse::error(
                request.id.clone(),
                INVALID_PARAMS,
                format!("Tool not found: {}", tool_name),
            );
        };

        match handler(arguments) {
            Ok(result) => {
                let content = json!([{ "type": "text", "text": result.to_string() }]);
                JsonRpcResponse::success(request.id.clone(), json!({ "content": content }))
            }
            Err(e) => {
                if let Some(rpc) = e.downcast_ref::<RpcError>() {
                    warn!("Tool {} rejected ({}): {}", tool_name, rpc.code, rpc.message);
                    return JsonRpcResponse::error(
                        request.id.clone(),
                        rpc.code,
                        rpc.message.clone(),
                    );
                }
                error!("Tool {} failed: {:#}", tool_name, e);
                let content = json!([{
                    "type": "text",
                    "text": json!({ "error": format!("{:#}", e) }).to_string()
                }]);
                JsonRpcResponse::success(
                    request.id.clone(),
                    json!({ "content": content, "isError": true }),
                )
            }
        }
    }

    /// Process one input line. `None` when nothing should be written back.
    pub fn handle_line(&self, line: &str) -> Result<Option<String>> {
        if line.trim().is_empty() {
            return Ok(None);
        }
        debug!("Received: {} bytes", line.len());

        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse request: {}", e);
                let response = JsonRpcResponse::error(None, PARSE_ERROR, "Parse error".to_string());
                return Ok(Some(serde_json::to_string(&response)?));
            }
        };

        let response = self.handle_request_safe(&request);

        // Notifications (no id) get no response unless they failed
        if request.id.is_some() || response.error.is_some() {
            Ok(Some(serde_json::to_string(&response)?))
        } else {
            Ok(None)
        }
    }

    pub fn serve<R: BufRead, W: Write>(&self, reader: R, mut writer: W) -> Result<()> {
        for line in reader.lines() {
            let line = line.context("Failed to read line")?;
            if let Some(out) = self.handle_line(&line)? {
                debug!("Sending: {} bytes", out.len());
                writeln!(writer, "{}", out)?;
                writer.flush()?;
            }
        }
        Ok(())
    }

    pub fn run(&self) -> Result<()> {
        info!("Starting MCP server on stdio");
        let stdin = io::stdin();
        let reader = BufReader::with_capacity(1024 * 1024, stdin.lock());
        self.serve(reader, io::stdout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn echo_server() -> McpServer {
        let mut server = McpServer::new("test", "0.0.1");
        server.register_tool(
            Tool {
                name: "echo".to_string(),
                description: "Echo arguments".to_string(),
                input_schema: json!({ "type": "object" }),
            },
            |args| Ok(json!({ "echo": args })),
        );
        server.register_tool(
            Tool {
                name: "fail".to_string(),
                description: "Always fails".to_string(),
                input_schema: json!({ "type": "object" }),
            },
            |_| anyhow::bail!("nope"),
        );
        server.register_tool(
            Tool {
                name: "boom".to_string(),
                description: "Panics".to_string(),
                input_schema: json!({ "type": "object" }),
            },
            |_| panic!("kaboom"),
        );
        server.register_tool(
            Tool {
                name: "strict".to_string(),
                description: "Rejects its arguments".to_string(),
                input_schema: json!({ "type": "object" }),
            },
            |_| Err(RpcError::invalid_params("x must be an integer").into()),
        );
        server
    }

    fn call(server: &McpServer, line: &str) -> Value {
        let out = server.handle_line(line).unwrap().unwrap();
        serde_json::from_str(&out).unwrap()
    }

    #[test]
    fn test_initialize_and_list() {
        let server = echo_server();
        let init = call(&server, r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#);
        assert_eq!(init["result"]["serverInfo"]["name"], "test");

        let list = call(&server, r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#);
        let names: Vec<&str> = list["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["echo", "fail", "boom", "strict"]);
        assert!(list["result"]["tools"][0]["inputSchema"].is_object());
    }

    #[test]
    fn test_tool_results_and_errors() {
        let server = echo_server();
        let ok = call(
            &server,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"echo","arguments":{"x":1}}}"#,
        );
        let text = ok["result"]["content"][0]["text"].as_str().unwrap();
        assert_eq!(serde_json::from_str::<Value>(text).unwrap()["echo"]["x"], 1);

        let err = call(
            &server,
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"fail"}}"#,
        );
        assert_eq!(err["result"]["isError"], true);

        let missing = call(
            &server,
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"nope"}}"#,
        );
        assert_eq!(missing["error"]["code"], INVALID_PARAMS);

        let rejected = call(
            &server,
            r#"{"jsonrpc":"2.0","id":8,"method":"tools/call","params":{"name":"strict"}}"#,
        );
        assert_eq!(rejected["error"]["code"], INVALID_PARAMS);
        assert_eq!(rejected["error"]["message"], "x must be an integer");
        assert!(rejected["result"].is_null());
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let server = echo_server();
        let resp = call(
            &server,
            r#"{"jsonrpc":"2.0","id":6,"method":"tools/call","params":{"name":"boom"}}"#,
        );
        assert_eq!(resp["error"]["code"], INTERNAL_ERROR);
        // Still serving afterwards
        let pong = call(&server, r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#);
        assert!(pong["result"].is_object());
    }

    #[test]
    fn test_serve_skips_notifications_and_reports_parse_errors() {
        let server = echo_server();
        let input = concat!(
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n\nnot json\n",
            r#"{"jsonrpc":"2.0","id":9,"method":"unknown/method"}"#,
            "\n"
        );
        let mut out = Vec::new();
        server.serve(Cursor::new(input), &mut out).unwrap();

        let lines: Vec<Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["error"]["code"], PARSE_ERROR);
        assert_eq!(lines[1]["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(lines[1]["id"], 9);
    }
}
