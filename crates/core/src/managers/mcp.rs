use super::mcp_protocol::{
    CallToolParams, CallToolResult, CancelledParams, ClientInfo, InitializeParams,
    InitializeResult, JsonRpcRequest, ListToolsResult, McpConfigFile, McpServerConfig, McpTool,
    TransportKind,
};
use super::mcp_transport::{DefaultTransportConnector, McpTransport, TransportConnector};
use crate::events::EventBus;
use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kora_shared::{
    KoraError, KoraEventData, KoraResult, ResourceKind, ToolError, ToolSource, ToolSpec,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

const MAX_TOOL_PAGES: usize = 100;

#[derive(Debug, Clone)]
pub struct McpClientSettings {
    pub connect_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub initial_backoff: Duration,
    pub request_timeout: Duration,
    pub health_interval: Duration,
}

impl Default for McpClientSettings {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(120),
            health_interval: Duration::from_secs(30),
        }
    }
}

// ============================================================
// McpClient: JSON-RPC client for a single MCP server
// ============================================================

pub struct McpClient {
    server_id: String,
    transport: Arc<dyn McpTransport>,
    next_id: AtomicI64,
    request_timeout: Duration,
}

impl McpClient {
    pub fn new(server_id: &str, transport: Arc<dyn McpTransport>, request_timeout: Duration) -> Self {
        Self {
            server_id: server_id.to_string(),
            transport,
            next_id: AtomicI64::new(1),
            request_timeout,
        }
    }

    /// Opens the transport and runs the `initialize` handshake.
    pub async fn initialize(&self) -> KoraResult<InitializeResult> {
        self.transport
            .open()
            .await
            .map_err(|e| KoraError::Connection(format!("{:#}", e)))?;

        let params = serde_json::to_value(InitializeParams::default())
            .map_err(|e| KoraError::Internal(e.to_string()))?;
        let result = self.call("initialize", Some(params)).await?;
        let result: InitializeResult = serde_json::from_value(result).map_err(|e| {
            KoraError::Connection(format!("malformed initialize result from '{}': {}", self.server_id, e))
        })?;
        debug!(server_id = %self.server_id, "MCP Initialized: {:?}", result);

        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    pub async fn call(&self, method: &str, params: Option<Value>) -> KoraResult<Value> {
        self.call_with_timeout(method, params, self.request_timeout).await
    }

    /// Sends one request and waits at most `timeout`. On timeout the pending
    /// slot is released and the peer is asked to cancel; the peer may still
    /// finish the work.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> KoraResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(Ok(response)) => response
                .into_result()
                .map_err(|e| KoraError::Execution(e.to_string())),
            Ok(Err(e)) => Err(KoraError::Connection(format!("{:#}", e))),
            Err(_) => {
                self.cancel(id, "timeout").await;
                Err(KoraError::Timeout(format!(
                    "{} on '{}' exceeded {}ms",
                    method,
                    self.server_id,
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn cancel(&self, request_id: i64, reason: &str) {
        let params = CancelledParams {
            request_id,
            reason: reason.to_string(),
        };
        let Ok(params) = serde_json::to_value(params) else {
            return;
        };
        if let Err(e) = self.notify("notifications/cancelled", Some(params)).await {
            debug!(server_id = %self.server_id, error = %e, "Cancellation notice not delivered");
        }
    }

    /// Send a JSON-RPC notification (fire-and-forget, no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> KoraResult<()> {
        self.transport
            .notify(JsonRpcRequest::notification(method, params))
            .await
            .map_err(|e| KoraError::Connection(format!("{:#}", e)))
    }

    /// All tools, following `nextCursor` pagination.
    pub async fn list_tools(&self) -> KoraResult<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.take().map(|c| serde_json::json!({ "cursor": c }));
            let value = self.call("tools/list", params).await?;
            let page: ListToolsResult = serde_json::from_value(value)
                .map_err(|e| KoraError::Execution(format!("Malformed tools/list result: {}", e)))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
        warn!(server_id = %self.server_id, "tools/list pagination stopped after {} pages", MAX_TOOL_PAGES);
        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, args: Value, timeout: Duration) -> KoraResult<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments: args,
        };
        let params = serde_json::to_value(params).map_err(|e| KoraError::Internal(e.to_string()))?;
        let value = self.call_with_timeout("tools/call", Some(params), timeout).await?;
        serde_json::from_value(value)
            .map_err(|e| KoraError::Execution(format!("Malformed tools/call result: {}", e)))
    }

    pub async fn close(&self) {
        if let Err(e) = self.transport.close().await {
            debug!(server_id = %self.server_id, error = %e, "MCP transport close failed");
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }
}

// ============================================================
// Protocol sessions
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProtocolStats {
    pub request_count: u64,
    pub error_count: u64,
    pub average_latency_ms: f64,
}

impl ProtocolStats {
    pub fn record(&mut self, latency_ms: f64, success: bool) {
        self.request_count += 1;
        if !success {
            self.error_count += 1;
        }
        let n = self.request_count as f64;
        self.average_latency_ms = (self.average_latency_ms * (n - 1.0) + latency_ms) / n;
    }
}

/// Snapshot of one live connection to a tool server.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolSession {
    pub server_id: String,
    pub name: String,
    pub transport: TransportKind,
    pub status: ConnectionStatus,
    pub capabilities: Vec<String>,
    pub server_info: Option<ClientInfo>,
    pub tools: Vec<ToolSpec>,
    pub stats: ProtocolStats,
    pub connected_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl ProtocolSession {
    #[must_use]
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }
}

/// Outcome of a tool execution. Failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub content: Value,
    pub error: Option<ToolError>,
    pub duration_ms: u64,
}

impl ToolResult {
    #[must_use]
    pub fn ok(content: Value, duration_ms: u64) -> Self {
        Self {
            success: true,
            content,
            error: None,
            duration_ms,
        }
    }

    #[must_use]
    pub fn failed(error: &KoraError, duration_ms: u64) -> Self {
        Self {
            success: false,
            content: Value::Null,
            error: Some(ToolError::from(error)),
            duration_ms,
        }
    }

    pub fn into_result(self) -> Result<Value, ToolError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.content),
        }
    }
}

fn tool_spec(server_id: &str, tool: McpTool) -> ToolSpec {
    ToolSpec {
        name: tool.name,
        description: tool.description,
        input_schema: if tool.input_schema.is_null() {
            serde_json::json!({ "type": "object", "properties": {} })
        } else {
            tool.input_schema
        },
        source: Some(ToolSource::Mcp {
            server_id: server_id.to_string(),
        }),
    }
}

struct ServerHandle {
    session: ProtocolSession,
    config: McpServerConfig,
    client: Arc<McpClient>,
}

// ============================================================
// McpClientManager: one protocol session per server id
// ============================================================

pub struct McpClientManager {
    servers: RwLock<HashMap<String, ServerHandle>>,
    /// Tool name → server ID index for fast routing
    tool_index: RwLock<HashMap<String, String>>,
    /// Last known config per server id, kept across disconnects for `reconnect`.
    configs: RwLock<HashMap<String, McpServerConfig>>,
    /// Servers whose last connect attempt failed, with the reason.
    failures: RwLock<HashMap<String, String>>,
    connect_locks: DashMap<String, Arc<Mutex<()>>>,
    connector: Arc<dyn TransportConnector>,
    settings: McpClientSettings,
    events: EventBus,
}

impl McpClientManager {
    #[must_use]
    pub fn new(settings: McpClientSettings, events: EventBus) -> Self {
        Self::with_connector(settings, events, Arc::new(DefaultTransportConnector::default()))
    }

    #[must_use]
    pub fn with_connector(
        settings: McpClientSettings,
        events: EventBus,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            tool_index: RwLock::new(HashMap::new()),
            configs: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
            connect_locks: DashMap::new(),
            connector,
            settings,
            events,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &McpClientSettings {
        &self.settings
    }

    /// Connects, handshakes and discovers tools, retrying with exponential
    /// backoff. Nothing is registered unless the whole sequence succeeds.
    pub async fn connect(&self, config: McpServerConfig) -> KoraResult<ProtocolSession> {
        config
            .check()
            .map_err(|e| KoraError::InvalidConfig(format!("{:#}", e)))?;
        let id = config.id.clone();

        let gate = self
            .connect_locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        {
            let servers = self.servers.read().await;
            if let Some(existing) = servers.get(&id) {
                if existing.session.status == ConnectionStatus::Connected && existing.client.is_alive() {
                    if existing.config == config {
                        return Ok(existing.session.clone());
                    }
                    return Err(KoraError::DuplicateId(id));
                }
            }
        }

        self.configs.write().await.insert(id.clone(), config.clone());

        let attempts = self.settings.connect_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.establish(&config).await {
                Ok((client, init, tools)) => {
                    return Ok(self.register(config, client, init, tools).await);
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        server_id = %id,
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %e,
                        "❌ MCP connect attempt failed"
                    );
                    if attempt < attempts {
                        let delay = self.settings.initial_backoff * 2u32.saturating_pow(attempt - 1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.failures.write().await.insert(id.clone(), last_error.clone());
        self.events
            .publish(KoraEventData::McpServerError {
                server_id: id.clone(),
                message: last_error.clone(),
            })
            .await;
        Err(KoraError::Connection(format!(
            "MCP server '{}' unreachable after {} attempt(s): {}",
            id, attempts, last_error
        )))
    }

    async fn establish(
        &self,
        config: &McpServerConfig,
    ) -> KoraResult<(Arc<McpClient>, InitializeResult, Vec<McpTool>)> {
        let transport = self
            .connector
            .create(config)
            .map_err(|e| KoraError::Connection(format!("{:#}", e)))?;
        let client = Arc::new(McpClient::new(&config.id, transport, self.settings.request_timeout));
        let handshake = async {
            let init = client.initialize().await?;
            let tools = client.list_tools().await?;
            Ok::<_, KoraError>((init, tools))
        };
        match handshake.await {
            Ok((init, tools)) => Ok((client, init, tools)),
            Err(e) => {
                client.close().await;
                Err(e)
            }
        }
    }

    async fn register(
        &self,
        config: McpServerConfig,
        client: Arc<McpClient>,
        init: InitializeResult,
        tools: Vec<McpTool>,
    ) -> ProtocolSession {
        let id = config.id.clone();
        let specs: Vec<ToolSpec> = tools.into_iter().map(|t| tool_spec(&id, t)).collect();
        let session = ProtocolSession {
            server_id: id.clone(),
            name: config.display_name().to_string(),
            transport: config.transport,
            status: ConnectionStatus::Connected,
            capabilities: init.capability_names(),
            server_info: init.server_info.clone(),
            tools: specs.clone(),
            stats: ProtocolStats::default(),
            connected_at: Utc::now(),
            last_error: None,
        };

        let previous = self.servers.write().await.insert(
            id.clone(),
            ServerHandle {
                session: session.clone(),
                config,
                client,
            },
        );
        if let Some(previous) = previous {
            previous.client.close().await;
        }
        self.reindex(&id, &specs).await;
        self.failures.write().await.remove(&id);

        info!(server_id = %id, tools = specs.len(), "✅ MCP server connected");
        self.events
            .publish(KoraEventData::McpServerConnected {
                server_id: id.clone(),
                tool_count: specs.len(),
            })
            .await;
        for tool in specs {
            self.events
                .publish(KoraEventData::McpToolDiscovered {
                    server_id: id.clone(),
                    tool,
                })
                .await;
        }
        session
    }

    async fn reindex(&self, server_id: &str, tools: &[ToolSpec]) {
        let mut index = self.tool_index.write().await;
        index.retain(|_, owner| owner != server_id);
        for tool in tools {
            if let Some(existing) = index.get(&tool.name) {
                warn!(
                    tool = %tool.name,
                    existing_server = %existing,
                    new_server = %server_id,
                    "Tool name collision, overwriting routing"
                );
            }
            index.insert(tool.name.clone(), server_id.to_string());
        }
    }

    /// Idempotent: an unknown or already disconnected server is a no-op.
    pub async fn disconnect(&self, server_id: &str) -> KoraResult<()> {
        self.failures.write().await.remove(server_id);
        let Some(handle) = self.servers.write().await.remove(server_id) else {
            debug!(server_id = %server_id, "MCP server already disconnected");
            return Ok(());
        };
        self.tool_index
            .write()
            .await
            .retain(|_, owner| owner != server_id);
        handle.client.close().await;

        info!(server_id = %server_id, "🧹 MCP server disconnected");
        self.events
            .publish(KoraEventData::McpServerDisconnected {
                server_id: server_id.to_string(),
            })
            .await;
        Ok(())
    }

    /// Disconnect, then connect with the last known configuration.
    pub async fn reconnect(&self, server_id: &str) -> KoraResult<ProtocolSession> {
        let config = self
            .configs
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| KoraError::not_found(ResourceKind::Server, server_id))?;
        self.disconnect(server_id).await?;
        self.connect(config).await
    }

    async fn connected_client(&self, server_id: &str) -> KoraResult<Arc<McpClient>> {
        let servers = self.servers.read().await;
        let handle = servers
            .get(server_id)
            .ok_or_else(|| KoraError::not_found(ResourceKind::Server, server_id))?;
        if handle.session.status != ConnectionStatus::Connected {
            return Err(KoraError::Connection(format!(
                "MCP server '{}' is temporarily unavailable ({:?})",
                server_id, handle.session.status
            )));
        }
        Ok(handle.client.clone())
    }

    /// Refreshes the tool list; emits a discovery event per newly seen tool.
    pub async fn discover_tools(&self, server_id: &str) -> KoraResult<Vec<ToolSpec>> {
        let client = self.connected_client(server_id).await?;
        let started = Instant::now();
        let listed = client.list_tools().await;
        let latency = started.elapsed().as_secs_f64() * 1000.0;
        self.record_request(server_id, latency, listed.is_ok()).await;

        let tools = match listed {
            Ok(tools) => tools,
            Err(e) => {
                if matches!(e, KoraError::Connection(_)) {
                    self.mark_error(server_id, &e.to_string()).await;
                }
                return Err(e);
            }
        };
        let specs: Vec<ToolSpec> = tools.into_iter().map(|t| tool_spec(server_id, t)).collect();

        let newly_seen: Vec<ToolSpec> = {
            let mut servers = self.servers.write().await;
            let Some(handle) = servers.get_mut(server_id) else {
                return Err(KoraError::not_found(ResourceKind::Server, server_id));
            };
            let known: HashSet<&str> = handle.session.tools.iter().map(|t| t.name.as_str()).collect();
            let fresh = specs
                .iter()
                .filter(|t| !known.contains(t.name.as_str()))
                .cloned()
                .collect();
            handle.session.tools = specs.clone();
            fresh
        };
        self.reindex(server_id, &specs).await;

        for tool in newly_seen {
            self.events
                .publish(KoraEventData::McpToolDiscovered {
                    server_id: server_id.to_string(),
                    tool,
                })
                .await;
        }
        Ok(specs)
    }

    pub async fn execute_tool(&self, server_id: &str, tool_name: &str, parameters: Value) -> ToolResult {
        self.execute_tool_with_timeout(server_id, tool_name, parameters, self.settings.request_timeout)
            .await
    }

    /// Never returns an error: every failure, including an unknown tool or a
    /// timeout, is a failed [`ToolResult`].
    pub async fn execute_tool_with_timeout(
        &self,
        server_id: &str,
        tool_name: &str,
        parameters: Value,
        timeout: Duration,
    ) -> ToolResult {
        let started = Instant::now();
        let elapsed_ms = |started: Instant| u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let client = {
            let servers = self.servers.read().await;
            let Some(handle) = servers.get(server_id) else {
                let err = KoraError::not_found(ResourceKind::Server, server_id);
                return ToolResult::failed(&err, 0);
            };
            if !handle.session.has_tool(tool_name) {
                let err = KoraError::ToolNotFound(format!("{} on server '{}'", tool_name, server_id));
                return ToolResult::failed(&err, 0);
            }
            if handle.session.status != ConnectionStatus::Connected {
                let err = KoraError::Connection(format!(
                    "MCP server '{}' is temporarily unavailable",
                    server_id
                ));
                return ToolResult::failed(&err, 0);
            }
            handle.client.clone()
        };

        let outcome = client.call_tool(tool_name, parameters, timeout).await;
        let duration_ms = elapsed_ms(started);
        let latency = started.elapsed().as_secs_f64() * 1000.0;

        let result = match outcome {
            Ok(call) if call.is_error.unwrap_or(false) => {
                let message = call.text();
                ToolResult::failed(&KoraError::Execution(message), duration_ms)
            }
            Ok(call) => ToolResult::ok(call.output(), duration_ms),
            Err(e) => {
                match &e {
                    KoraError::Timeout(_) => {
                        warn!(server_id = %server_id, tool = %tool_name, timeout_ms = timeout.as_millis() as u64, "⏱️ MCP tool call timed out");
                    }
                    KoraError::Connection(msg) => self.mark_error(server_id, msg).await,
                    _ => warn!(server_id = %server_id, tool = %tool_name, error = %e, "❌ MCP tool call failed"),
                }
                ToolResult::failed(&e, duration_ms)
            }
        };
        self.record_request(server_id, latency, result.success).await;
        result
    }

    async fn record_request(&self, server_id: &str, latency_ms: f64, success: bool) {
        if let Some(handle) = self.servers.write().await.get_mut(server_id) {
            handle.session.stats.record(latency_ms, success);
        }
    }

    /// Transport failure: the session stays registered with status `error`.
    async fn mark_error(&self, server_id: &str, message: &str) {
        {
            let mut servers = self.servers.write().await;
            let Some(handle) = servers.get_mut(server_id) else {
                return;
            };
            handle.session.status = ConnectionStatus::Error;
            handle.session.last_error = Some(message.to_string());
        }
        error!(server_id = %server_id, error = %message, "MCP transport error");
        self.events
            .publish(KoraEventData::McpServerError {
                server_id: server_id.to_string(),
                message: message.to_string(),
            })
            .await;
    }

    pub async fn list_sessions(&self) -> Vec<ProtocolSession> {
        let servers = self.servers.read().await;
        let mut sessions: Vec<ProtocolSession> = servers.values().map(|h| h.session.clone()).collect();
        sessions.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        sessions
    }

    pub async fn get_session(&self, server_id: &str) -> Option<ProtocolSession> {
        self.servers
            .read()
            .await
            .get(server_id)
            .map(|h| h.session.clone())
    }

    pub async fn is_connected(&self, server_id: &str) -> bool {
        self.servers
            .read()
            .await
            .get(server_id)
            .is_some_and(|h| h.session.status == ConnectionStatus::Connected)
    }

    /// Failed connect attempts awaiting a retry, keyed by server id.
    pub async fn failures(&self) -> HashMap<String, String> {
        self.failures.read().await.clone()
    }

    pub async fn server_for_tool(&self, tool_name: &str) -> Option<String> {
        self.tool_index.read().await.get(tool_name).cloned()
    }

    /// Tools of connected servers, restricted to `server_ids` when given.
    pub async fn tool_specs(&self, server_ids: Option<&[String]>) -> Vec<ToolSpec> {
        let servers = self.servers.read().await;
        let mut specs: Vec<ToolSpec> = servers
            .values()
            .filter(|h| h.session.status == ConnectionStatus::Connected)
            .filter(|h| server_ids.map_or(true, |ids| ids.contains(&h.session.server_id)))
            .flat_map(|h| h.session.tools.iter().cloned())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Load server configs from mcp.toml and connect each one. Returns the
    /// number of servers that connected.
    pub async fn load_config_file(&self, config_path: &str) -> anyhow::Result<usize> {
        let path = std::path::Path::new(config_path);
        if !path.exists() {
            info!("No MCP config file at {}, skipping", config_path);
            return Ok(0);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read MCP config file")?;
        let config: McpConfigFile = toml::from_str(&content).context("Failed to parse MCP config file")?;

        let total = config.servers.len();
        info!("Loading {} MCP server(s) from {}", total, config_path);

        let results = futures::future::join_all(config.servers.into_iter().map(|server| async move {
            let id = server.id.clone();
            match self.connect(server).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(server_id = %id, error = %e, "Failed to connect MCP server from config");
                    false
                }
            }
        }))
        .await;
        let connected = results.into_iter().filter(|ok| *ok).count();

        if connected < total {
            warn!(
                total = total,
                failed = total - connected,
                "MCP config loaded with failures ({}/{} servers failed)",
                total - connected,
                total
            );
        }
        Ok(connected)
    }

    /// Spawn a background task that periodically reconnects dead servers
    /// whose config has `auto_reconnect` set.
    pub fn spawn_health_monitor(self: Arc<Self>, shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.health_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.notified() => {
                        info!("MCP health monitor shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.check_and_reconnect().await;
                    }
                }
            }
        })
    }

    /// Returns the ids it attempted to reconnect.
    pub async fn check_and_reconnect(&self) -> Vec<String> {
        let mut candidates: Vec<String> = {
            let servers = self.servers.read().await;
            servers
                .iter()
                .filter(|(_, h)| h.config.auto_reconnect)
                .filter(|(_, h)| !h.client.is_alive() || h.session.status == ConnectionStatus::Error)
                .map(|(id, _)| id.clone())
                .collect()
        };
        {
            let failures = self.failures.read().await;
            let configs = self.configs.read().await;
            candidates.extend(
                failures
                    .keys()
                    .filter(|id| configs.get(*id).is_some_and(|c| c.auto_reconnect))
                    .filter(|id| !candidates.contains(id))
                    .cloned()
                    .collect::<Vec<_>>(),
            );
        }

        for server_id in &candidates {
            warn!(server_id = %server_id, "MCP server down, attempting reconnect");
            match self.reconnect(server_id).await {
                Ok(session) => info!(
                    server_id = %server_id,
                    tools = session.tools.len(),
                    "✅ MCP server reconnected"
                ),
                Err(e) => error!(server_id = %server_id, error = %e, "MCP server reconnect failed"),
            }
        }
        candidates
    }

    /// Disconnect every server.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.servers.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.disconnect(&id).await {
                warn!(server_id = %id, error = %e, "MCP disconnect during shutdown failed");
            }
        }
    }
}
