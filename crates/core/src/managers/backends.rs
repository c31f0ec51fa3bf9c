//! The four kinds of capability provider behind one `Plugin` interface.
//!
//! Builtin and native plugins already implement `Plugin`. Protocol-backed
//! and external plugins get thin adapters here so the manager dispatches
//! every kind the same way.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use kora_shared::{
    capabilities, Plugin, PluginConfig, PluginDescriptor, PluginFactory, PluginInitContext,
    PluginInvocation, PluginKind, ToolSource, ToolSpec,
};
use reqwest::Url;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

use super::mcp::McpClientManager;
use super::mcp_protocol::McpServerConfig;

/// Registration-time source of a plugin.
#[derive(Clone)]
pub enum PluginBackend {
    /// Compiled in, discovered through `inventory`.
    Builtin(Arc<dyn PluginFactory>),
    /// In-process instance handed over at runtime.
    Native(Arc<dyn Plugin>),
    Mcp(McpPluginSpec),
    External(ExternalPluginSpec),
}

#[derive(Debug, Clone)]
pub struct McpPluginSpec {
    pub descriptor: PluginDescriptor,
    pub server_id: String,
    /// Used to connect on init when the server is not connected yet.
    pub connect: Option<McpServerConfig>,
}

impl McpPluginSpec {
    pub fn new(id: &str, name: &str, server_id: &str) -> Self {
        Self {
            descriptor: PluginDescriptor::new(id, name, PluginKind::Mcp)
                .with_capability(capabilities::MCP_TOOLS),
            server_id: server_id.to_string(),
            connect: None,
        }
    }

    #[must_use]
    pub fn with_connect(mut self, config: McpServerConfig) -> Self {
        self.connect = Some(config);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ExternalPluginSpec {
    pub descriptor: PluginDescriptor,
    pub endpoint: String,
    pub headers: HashMap<String, String>,
}

impl ExternalPluginSpec {
    pub fn new(descriptor: PluginDescriptor, endpoint: &str) -> Self {
        Self {
            descriptor: PluginDescriptor {
                kind: PluginKind::External,
                ..descriptor
            },
            endpoint: endpoint.to_string(),
            headers: HashMap::new(),
        }
    }
}

/// What a backend may need to build its instance.
#[derive(Clone)]
pub struct BackendContext {
    pub mcp: Option<Arc<McpClientManager>>,
    pub http: reqwest::Client,
    pub allowed_hosts: Vec<String>,
    pub request_timeout: Duration,
}

impl PluginBackend {
    #[must_use]
    pub fn kind(&self) -> PluginKind {
        match self {
            Self::Builtin(_) => PluginKind::Builtin,
            Self::Native(_) => PluginKind::Native,
            Self::Mcp(_) => PluginKind::Mcp,
            Self::External(_) => PluginKind::External,
        }
    }

    /// Descriptor with `kind` matching the backend.
    #[must_use]
    pub fn descriptor(&self) -> PluginDescriptor {
        let descriptor = match self {
            Self::Builtin(factory) => factory.descriptor(),
            Self::Native(plugin) => plugin.descriptor(),
            Self::Mcp(spec) => spec.descriptor.clone(),
            Self::External(spec) => spec.descriptor.clone(),
        };
        PluginDescriptor {
            kind: self.kind(),
            ..descriptor
        }
    }

    /// Checks that need the runtime context but no I/O.
    pub fn check(&self, ctx: &BackendContext) -> Result<()> {
        match self {
            Self::Builtin(_) | Self::Native(_) => Ok(()),
            Self::Mcp(spec) => {
                if ctx.mcp.is_none() {
                    bail!("no protocol client available for MCP plugin '{}'", spec.descriptor.id);
                }
                if let Some(config) = &spec.connect {
                    if config.id != spec.server_id {
                        bail!(
                            "MCP plugin '{}' connect config is for '{}', expected '{}'",
                            spec.descriptor.id,
                            config.id,
                            spec.server_id
                        );
                    }
                    config.check()?;
                }
                Ok(())
            }
            Self::External(spec) => check_host(&spec.endpoint, &ctx.allowed_hosts).map(|_| ()),
        }
    }

    pub async fn instantiate(&self, ctx: &BackendContext, config: PluginConfig) -> Result<Arc<dyn Plugin>> {
        match self {
            Self::Builtin(factory) => factory.create(config).await,
            Self::Native(plugin) => Ok(plugin.clone()),
            Self::Mcp(spec) => {
                let mcp = ctx.mcp.clone().context("no protocol client available")?;
                Ok(Arc::new(McpPlugin::new(spec.clone(), mcp)))
            }
            Self::External(spec) => {
                let url = check_host(&spec.endpoint, &ctx.allowed_hosts)?;
                Ok(Arc::new(ExternalPlugin {
                    spec: spec.clone(),
                    url,
                    http: ctx.http.clone(),
                    timeout: ctx.request_timeout,
                }))
            }
        }
    }
}

fn check_host(endpoint: &str, allowed_hosts: &[String]) -> Result<Url> {
    let url = Url::parse(endpoint).with_context(|| format!("invalid plugin endpoint '{}'", endpoint))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("plugin endpoint must be http(s): '{}'", endpoint);
    }
    let host = url.host_str().unwrap_or_default().to_lowercase();
    if !allowed_hosts.iter().any(|h| *h == host) {
        bail!("host '{}' is not in the allowed host list", host);
    }
    Ok(url)
}

// ============================================================
// MCP-backed plugin
// ============================================================

/// Fronts one protocol server. The protocol session belongs to the
/// `McpClientManager` and outlives this plugin.
pub struct McpPlugin {
    spec: McpPluginSpec,
    mcp: Arc<McpClientManager>,
    tools: RwLock<Vec<ToolSpec>>,
}

impl McpPlugin {
    fn new(spec: McpPluginSpec, mcp: Arc<McpClientManager>) -> Self {
        Self {
            spec,
            mcp,
            tools: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Plugin for McpPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        let mut descriptor = self.spec.descriptor.clone();
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        descriptor.provided_tools = tools
            .iter()
            .cloned()
            .map(|t| {
                t.with_source(ToolSource::Plugin {
                    plugin_id: self.spec.descriptor.id.clone(),
                })
            })
            .collect();
        descriptor
    }

    async fn on_init(&self, _ctx: PluginInitContext) -> Result<()> {
        if !self.mcp.is_connected(&self.spec.server_id).await {
            let config = self.spec.connect.clone().with_context(|| {
                format!("MCP server '{}' is not connected", self.spec.server_id)
            })?;
            self.mcp.connect(config).await?;
        }
        Ok(())
    }

    async fn on_activate(&self) -> Result<()> {
        let session = self
            .mcp
            .get_session(&self.spec.server_id)
            .await
            .with_context(|| format!("MCP server '{}' is not connected", self.spec.server_id))?;
        info!(
            plugin_id = %self.spec.descriptor.id,
            server_id = %self.spec.server_id,
            tools = session.tools.len(),
            "🔌 MCP plugin bound to server"
        );
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = session.tools;
        Ok(())
    }

    async fn execute(&self, invocation: PluginInvocation) -> Result<Value> {
        let result = self
            .mcp
            .execute_tool(&self.spec.server_id, &invocation.operation, invocation.parameters)
            .await;
        result
            .into_result()
            .map_err(|e| anyhow::anyhow!("[{}] {}", e.code, e.message))
    }
}

// ============================================================
// External (HTTP) plugin
// ============================================================

pub struct ExternalPlugin {
    spec: ExternalPluginSpec,
    url: Url,
    http: reqwest::Client,
    timeout: Duration,
}

#[async_trait]
impl Plugin for ExternalPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        self.spec.descriptor.clone()
    }

    async fn execute(&self, invocation: PluginInvocation) -> Result<Value> {
        let mut request = self
            .http
            .post(self.url.clone())
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "plugin_id": self.spec.descriptor.id,
                "invocation": invocation,
            }));
        for (key, value) in &self.spec.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let body: Value = request
            .send()
            .await
            .with_context(|| format!("external plugin '{}' unreachable", self.spec.descriptor.id))?
            .error_for_status()?
            .json()
            .await
            .context("external plugin returned invalid JSON")?;

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            let message = error.as_str().map_or_else(|| error.to_string(), str::to_string);
            bail!("{}", message);
        }
        debug!(plugin_id = %self.spec.descriptor.id, "External plugin call succeeded");
        Ok(body.get("result").cloned().unwrap_or(body))
    }
}
