use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::mcp_http::{SseTransport, StreamableHttpTransport};
use super::mcp_protocol::{
    resolve_env_value, JsonRpcRequest, JsonRpcResponse, McpServerConfig, TransportKind,
};
use super::mcp_websocket::WebSocketTransport;

/// Allowed commands for MCP server execution (security whitelist)
const ALLOWED_COMMANDS: &[&str] = &["npx", "node", "python", "python3", "deno", "bun", "uv", "uvx"];

const MAX_PENDING_REQUESTS: usize = 100;

/// Validate command against whitelist (bare command names only, no paths)
pub fn validate_command(command: &str) -> Result<String> {
    if command.contains('/') || command.contains('\\') {
        bail!(
            "Command must not contain path separators: '{}'. Use bare command names only.",
            command
        );
    }

    if !ALLOWED_COMMANDS.contains(&command) {
        bail!(
            "Command '{}' not in whitelist. Allowed commands: {:?}",
            command,
            ALLOWED_COMMANDS
        );
    }

    Ok(command.to_string())
}

// ============================================================
// Transport abstraction
// ============================================================

/// One wire to a tool server. Implementations correlate responses to
/// requests themselves, so `send` may be called concurrently.
#[async_trait]
pub trait McpTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn open(&self) -> Result<()>;

    /// Sends a request and waits for the response with the same id.
    /// Dropping the returned future releases the pending slot.
    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Fire-and-forget message, no response expected.
    async fn notify(&self, notification: JsonRpcRequest) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_alive(&self) -> bool;
}

/// Builds a transport for a server config. Swappable so tests can inject
/// in-memory peers.
pub trait TransportConnector: Send + Sync {
    fn create(&self, config: &McpServerConfig) -> Result<Arc<dyn McpTransport>>;
}

#[derive(Default)]
pub struct DefaultTransportConnector {
    http: reqwest::Client,
}

impl DefaultTransportConnector {
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl TransportConnector for DefaultTransportConnector {
    fn create(&self, config: &McpServerConfig) -> Result<Arc<dyn McpTransport>> {
        config.check()?;
        let transport: Arc<dyn McpTransport> = match config.transport {
            TransportKind::Stdio => Arc::new(StdioTransport::new(config.clone())?),
            TransportKind::Http => Arc::new(StreamableHttpTransport::new(self.http.clone(), config)?),
            TransportKind::Sse => Arc::new(SseTransport::new(self.http.clone(), config)?),
            TransportKind::Websocket => Arc::new(WebSocketTransport::new(config)?),
        };
        Ok(transport)
    }
}

/// `headers` with `${VAR}` references resolved.
pub(crate) fn resolved_headers(config: &McpServerConfig) -> HashMap<String, String> {
    config
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), resolve_env_value(v)))
        .collect()
}

// ============================================================
// Request correlation
// ============================================================

/// In-flight requests keyed by JSON-RPC id, shared between the sending side
/// and a transport's reader task.
#[derive(Clone, Default)]
pub struct PendingRequests {
    slots: Arc<DashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingRequests {
    pub fn register(&self, request: &JsonRpcRequest) -> Result<PendingSlot> {
        let id = request
            .id_i64()
            .context("JSON-RPC request has no numeric id")?;
        if self.slots.len() >= MAX_PENDING_REQUESTS {
            bail!("MCP pending request limit reached ({})", MAX_PENDING_REQUESTS);
        }
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id, tx);
        Ok(PendingSlot {
            id,
            slots: self.slots.clone(),
            rx: Some(rx),
        })
    }

    /// Hands a response to its waiter. Returns false if nobody is waiting.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id_i64() else {
            return false;
        };
        match self.slots.remove(&id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drops every waiter; their `wait` resolves with a closed-connection error.
    pub fn fail_all(&self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Routes one inbound frame. Server-initiated requests and notifications
    /// are logged and ignored.
    pub fn dispatch_frame(&self, frame: &str) {
        let value: Value = match serde_json::from_str(frame) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "Ignoring non-JSON MCP frame");
                return;
            }
        };
        if value.get("method").is_some() {
            debug!("Received server-initiated MCP message: {}", frame);
            return;
        }
        match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(response) => {
                if !self.resolve(response) {
                    debug!("MCP response with no waiting request (late or cancelled)");
                }
            }
            Err(e) => debug!(error = %e, "Received malformed JSON-RPC response"),
        }
    }
}

/// A registered request. The slot is removed when this value is dropped,
/// whether or not a response arrived.
pub struct PendingSlot {
    id: i64,
    slots: Arc<DashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
    rx: Option<oneshot::Receiver<JsonRpcResponse>>,
}

impl PendingSlot {
    pub async fn wait(mut self) -> Result<JsonRpcResponse> {
        let rx = self.rx.take().context("pending slot already consumed")?;
        rx.await.context("MCP connection closed before a response arrived")
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.slots.remove(&self.id);
    }
}

// ============================================================
// Stdio
// ============================================================

struct StdioProcess {
    child: Child,
    writer: mpsc::Sender<String>,
    tasks: Vec<JoinHandle<()>>,
}

/// Spawns the server as a child process and speaks newline-delimited JSON
/// over its stdin/stdout. Stderr is forwarded to the log.
pub struct StdioTransport {
    config: McpServerConfig,
    command: String,
    pending: PendingRequests,
    process: Mutex<Option<StdioProcess>>,
    alive: Arc<AtomicBool>,
}

impl StdioTransport {
    pub fn new(config: McpServerConfig) -> Result<Self> {
        let command = validate_command(config.command.as_deref().unwrap_or_default())
            .context("Command validation failed")?;
        Ok(Self {
            config,
            command,
            pending: PendingRequests::default(),
            process: Mutex::new(None),
            alive: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn writer(&self) -> Result<mpsc::Sender<String>> {
        let process = self.process.lock().await;
        process
            .as_ref()
            .map(|p| p.writer.clone())
            .context("MCP stdio transport is not open")
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn open(&self) -> Result<()> {
        let mut slot = self.process.lock().await;
        if slot.is_some() && self.alive.load(Ordering::Acquire) {
            return Ok(());
        }

        info!("Starting MCP Server: {} {:?}", self.command, self.config.args);

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.config.env {
            cmd.env(key, resolve_env_value(value));
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn MCP server: {}", self.command))?;

        let stdin = child.stdin.take().context("Failed to open stdin")?;
        let stdout = child.stdout.take().context("Failed to open stdout")?;
        let stderr = child.stderr.take().context("Failed to open stderr")?;

        let (req_tx, mut req_rx) = mpsc::channel::<String>(100);
        self.alive.store(true, Ordering::Release);

        let writer_task = tokio::spawn(async move {
            let mut writer = stdin;
            while let Some(msg) = req_rx.recv().await {
                let line = format!("{}\n", msg);
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!("Failed to write to MCP server stdin: {}", e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    error!("Failed to flush MCP server stdin: {}", e);
                    break;
                }
            }
        });

        let pending = self.pending.clone();
        let alive = self.alive.clone();
        let server_id = self.config.id.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if !line.trim().is_empty() {
                    pending.dispatch_frame(&line);
                }
            }
            alive.store(false, Ordering::Release);
            let failed = pending.fail_all();
            warn!(server_id = %server_id, failed_requests = failed, "MCP Server stdout closed.");
        });

        let server_id = self.config.id.clone();
        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                warn!("[MCP:{}] {}", server_id, line);
            }
        });

        *slot = Some(StdioProcess {
            child,
            writer: req_tx,
            tasks: vec![writer_task, reader_task, stderr_task],
        });
        Ok(())
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let writer = self.writer().await?;
        let slot = self.pending.register(&request)?;
        writer
            .send(serde_json::to_string(&request)?)
            .await
            .context("Failed to send request to MCP transport")?;
        slot.wait().await
    }

    async fn notify(&self, notification: JsonRpcRequest) -> Result<()> {
        let writer = self.writer().await?;
        writer
            .send(serde_json::to_string(&notification)?)
            .await
            .context("Failed to send notification to MCP transport")
    }

    async fn close(&self) -> Result<()> {
        let process = self.process.lock().await.take();
        self.alive.store(false, Ordering::Release);
        if let Some(mut process) = process {
            for task in process.tasks.drain(..) {
                task.abort();
            }
            if let Err(e) = process.child.kill().await {
                debug!(error = %e, "MCP child already exited");
            }
        }
        self.pending.fail_all();
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}
