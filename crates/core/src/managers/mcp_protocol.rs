use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const CLIENT_NAME: &str = "kora";

// ============================================================
// JSON-RPC 2.0 Types
// ============================================================

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::Number(id.into())),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }

    #[must_use]
    pub fn id_i64(&self) -> Option<i64> {
        self.id.as_ref().and_then(Value::as_i64)
    }
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

    pub fn failure(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    #[must_use]
    pub fn id_i64(&self) -> Option<i64> {
        self.id.as_ref().and_then(Value::as_i64)
    }

    /// Unwraps the result, turning an RPC error object into an `Err`.
    pub fn into_result(self) -> anyhow::Result<Value> {
        match self.error {
            Some(error) => Err(anyhow::anyhow!("RPC Error {}: {}", error.code, error.message)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ============================================================
// MCP Standard Types
// ============================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities {},
            client_info: ClientInfo {
                name: CLIENT_NAME.to_string(),
                version: kora_shared::SDK_VERSION.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<ClientInfo>,
}

impl InitializeResult {
    /// Top-level capability names the server advertised (`tools`, `resources`, ...).
    #[must_use]
    pub fn capability_names(&self) -> Vec<String> {
        self.capabilities
            .as_object()
            .map(|caps| caps.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<McpTool>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
pub enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image", rename_all = "camelCase")]
    Image { data: String, mime_type: String },
    #[serde(rename = "resource")]
    Resource { resource: Value },
}

impl CallToolResult {
    /// Flattens the content parts into one JSON value. A single text part
    /// holding JSON is returned as that JSON.
    #[must_use]
    pub fn output(&self) -> Value {
        match self.content.as_slice() {
            [] => Value::Null,
            [ToolContent::Text { text }] => {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
            }
            parts => serde_json::to_value(parts).unwrap_or(Value::Null),
        }
    }

    /// Concatenated text parts, used as the error message when `isError` is set.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ToolContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: i64,
    pub reason: String,
}

// ============================================================
// Server configuration (mcp.toml)
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
    Sse,
    Websocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
            Self::Websocket => "websocket",
        };
        write!(f, "{}", s)
    }
}

/// One tool server entry from mcp.toml or a session's settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub auto_reconnect: bool,
}

impl McpServerConfig {
    pub fn stdio(id: &str, command: &str, args: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            transport: TransportKind::Stdio,
            command: Some(command.to_string()),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            auto_reconnect: false,
        }
    }

    pub fn remote(id: &str, transport: TransportKind, url: &str) -> Self {
        Self {
            transport,
            command: None,
            url: Some(url.to_string()),
            ..Self::stdio(id, "", &[])
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Structural checks that do not touch the network.
    pub fn check(&self) -> anyhow::Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("MCP server id must not be empty");
        }
        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    anyhow::bail!("MCP server '{}' uses stdio but has no command", self.id);
                }
            }
            TransportKind::Http | TransportKind::Sse | TransportKind::Websocket => {
                let Some(url) = self.url.as_deref() else {
                    anyhow::bail!("MCP server '{}' uses {} but has no url", self.id, self.transport);
                };
                let expected: &[&str] = if self.transport == TransportKind::Websocket {
                    &["ws://", "wss://"]
                } else {
                    &["http://", "https://"]
                };
                if !expected.iter().any(|p| url.starts_with(p)) {
                    anyhow::bail!(
                        "MCP server '{}' url '{}' does not match transport {}",
                        self.id,
                        url,
                        self.transport
                    );
                }
            }
        }
        Ok(())
    }
}

/// Top-level config structure for mcp.toml
#[derive(Debug, Deserialize, Default)]
pub struct McpConfigFile {
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

/// Resolve `${ENV_VAR}` references in a value string to actual environment variables.
#[must_use]
pub fn resolve_env_value(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_default()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_config_file() {
        let raw = r#"
            [[servers]]
            id = "files"
            command = "npx"
            args = ["-y", "@modelcontextprotocol/server-filesystem"]
            auto_reconnect = true

            [[servers]]
            id = "search"
            name = "Web Search"
            transport = "sse"
            url = "https://search.example.com/sse"
            headers = { Authorization = "${SEARCH_TOKEN}" }
        "#;
        let config: McpConfigFile = toml::from_str(raw).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].transport, TransportKind::Stdio);
        assert!(config.servers[0].auto_reconnect);
        assert_eq!(config.servers[1].transport, TransportKind::Sse);
        assert_eq!(config.servers[1].display_name(), "Web Search");
        assert!(config.servers.iter().all(|s| s.check().is_ok()));
    }

    #[test]
    fn test_check_rejects_mismatched_url() {
        let config = McpServerConfig::remote("ws", TransportKind::Websocket, "https://x.test");
        assert!(config.check().is_err());
        let config = McpServerConfig::remote("h", TransportKind::Http, "");
        assert!(config.check().is_err());
    }

    #[test]
    fn test_list_tools_result_camel_case() {
        let result: ListToolsResult = serde_json::from_value(json!({
            "tools": [{ "name": "read", "inputSchema": { "type": "object" } }],
            "nextCursor": "page-2"
        }))
        .unwrap();
        assert_eq!(result.tools[0].input_schema["type"], "object");
        assert_eq!(result.next_cursor.as_deref(), Some("page-2"));
    }

    #[test]
    fn test_call_tool_result_output() {
        let json_text = CallToolResult {
            content: vec![ToolContent::Text { text: r#"{"ok":true}"#.into() }],
            is_error: None,
        };
        assert_eq!(json_text.output(), json!({ "ok": true }));

        let plain = CallToolResult {
            content: vec![ToolContent::Text { text: "done".into() }],
            is_error: None,
        };
        assert_eq!(plain.output(), json!("done"));
    }

    #[test]
    fn test_response_into_result() {
        let err = JsonRpcResponse::failure(Some(json!(1)), -32601, "Method not found");
        assert!(err.into_result().unwrap_err().to_string().contains("-32601"));
        let ok = JsonRpcResponse::success(Some(json!(2)), json!({ "a": 1 }));
        assert_eq!(ok.into_result().unwrap(), json!({ "a": 1 }));
    }

    #[test]
    fn test_initialize_params_announce_client() {
        let params = serde_json::to_value(InitializeParams::default()).unwrap();
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(params["clientInfo"]["version"], kora_shared::SDK_VERSION);
    }

    #[test]
    fn test_resolve_env_value() {
        assert_eq!(resolve_env_value("plain"), "plain");
        assert_eq!(resolve_env_value("${NONEXISTENT_KORA_VAR_12345}"), "");
    }
}
