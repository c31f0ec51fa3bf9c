use anyhow::{bail, Result};
use async_trait::async_trait;
use kora_core::managers::mcp_protocol::{JsonRpcRequest, JsonRpcResponse, McpServerConfig, McpTool, TransportKind};
use kora_core::managers::{McpTransport, TransportConnector};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Tools every mock server offers unless overridden.
pub const DEFAULT_TOOLS: &[&str] = &["echo", "fail", "slow"];

pub fn mcp_tool(name: &str) -> McpTool {
    McpTool {
        name: name.to_string(),
        description: Some(format!("mock {}", name)),
        input_schema: json!({ "type": "object" }),
    }
}

/// In-memory MCP server. `echo` returns its arguments, `fail` answers with
/// `isError`, `slow` sleeps `ms` milliseconds (default 500) before echoing.
pub struct MockTransport {
    server_id: String,
    kind: TransportKind,
    tools: Mutex<Vec<McpTool>>,
    alive: AtomicBool,
    /// Answers `initialize` with something that is not a handshake result.
    garbled: bool,
    requests: Mutex<Vec<JsonRpcRequest>>,
    notifications: Mutex<Vec<JsonRpcRequest>>,
}

impl MockTransport {
    pub fn new(config: &McpServerConfig, tools: Vec<McpTool>) -> Self {
        Self {
            server_id: config.id.clone(),
            kind: config.transport,
            tools: Mutex::new(tools),
            alive: AtomicBool::new(false),
            garbled: false,
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Simulates the peer going away.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Makes `name` show up in the next `tools/list`.
    pub fn add_tool(&self, name: &str) {
        self.tools.lock().unwrap().push(mcp_tool(name));
    }

    pub fn methods(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|r| r.method.clone()).collect()
    }

    pub fn notifications(&self) -> Vec<JsonRpcRequest> {
        self.notifications.lock().unwrap().clone()
    }

    fn tool_call(&self, request: &JsonRpcRequest) -> Option<(String, Value)> {
        let params = request.params.as_ref()?;
        let name = params.get("name")?.as_str()?.to_string();
        let args = params.get("arguments").cloned().unwrap_or(Value::Null);
        Some((name, args))
    }

    async fn answer(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        match request.method.as_str() {
            "initialize" if self.garbled => JsonRpcResponse::success(id, json!("ready")),
            "initialize" => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": self.server_id, "version": "0.1.0" }
                }),
            ),
            "tools/list" => {
                let tools = self.tools.lock().unwrap().clone();
                JsonRpcResponse::success(id, json!({ "tools": tools }))
            }
            "tools/call" => {
                let Some((name, args)) = self.tool_call(request) else {
                    return JsonRpcResponse::failure(id, -32602, "missing tool name");
                };
                if !self.tools.lock().unwrap().iter().any(|t| t.name == name) {
                    return JsonRpcResponse::failure(id, -32602, format!("unknown tool {}", name));
                }
                match name.as_str() {
                    "fail" => JsonRpcResponse::success(
                        id,
                        json!({ "content": [{ "type": "text", "text": "tool exploded" }], "isError": true }),
                    ),
                    "slow" => {
                        let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(500);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        echo(id, &args)
                    }
                    _ => echo(id, &args),
                }
            }
            other => JsonRpcResponse::failure(id, -32601, format!("method not found: {}", other)),
        }
    }
}

fn echo(id: Option<Value>, args: &Value) -> JsonRpcResponse {
    JsonRpcResponse::success(
        id,
        json!({ "content": [{ "type": "text", "text": args.to_string() }] }),
    )
}

#[async_trait]
impl McpTransport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self) -> Result<()> {
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        if !self.is_alive() {
            bail!("transport closed");
        }
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.answer(&request).await)
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<()> {
        if !self.is_alive() {
            bail!("transport closed");
        }
        self.notifications.lock().unwrap().push(notification);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Hands out [`MockTransport`]s and keeps every one it created.
#[derive(Default)]
pub struct MockConnector {
    unreachable: Mutex<HashSet<String>>,
    garbled: Mutex<HashSet<String>>,
    tools: Mutex<HashMap<String, Vec<McpTool>>>,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockConnector {
    /// Connections to `server_id` fail until [`MockConnector::restore`].
    pub fn make_unreachable(&self, server_id: &str) {
        self.unreachable.lock().unwrap().insert(server_id.to_string());
    }

    /// `server_id` answers the handshake with a malformed result.
    pub fn garble_handshake(&self, server_id: &str) {
        self.garbled.lock().unwrap().insert(server_id.to_string());
    }

    pub fn restore(&self, server_id: &str) {
        self.unreachable.lock().unwrap().remove(server_id);
    }

    pub fn serve_tools(&self, server_id: &str, names: &[&str]) {
        let tools = names.iter().map(|n| mcp_tool(n)).collect();
        self.tools.lock().unwrap().insert(server_id.to_string(), tools);
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Most recent transport opened for `server_id`.
    pub fn transport(&self, server_id: &str) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.server_id() == server_id)
            .cloned()
    }
}

impl TransportConnector for MockConnector {
    fn create(&self, config: &McpServerConfig) -> Result<Arc<dyn McpTransport>> {
        if self.unreachable.lock().unwrap().contains(&config.id) {
            bail!("connection refused: {}", config.id);
        }
        let tools = self
            .tools
            .lock()
            .unwrap()
            .get(&config.id)
            .cloned()
            .unwrap_or_else(|| DEFAULT_TOOLS.iter().map(|n| mcp_tool(n)).collect());
        let mut transport = MockTransport::new(config, tools);
        transport.garbled = self.garbled.lock().unwrap().contains(&config.id);
        let transport = Arc::new(transport);
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}
