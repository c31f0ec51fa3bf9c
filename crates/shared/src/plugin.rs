use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use validator::Validate;

use crate::{ContentUnit, KoraError, KoraId, KoraResult, ToolSpec};

pub type ConfigMap = serde_json::Map<String, Value>;

/// Well-known capability names.
pub mod capabilities {
    /// In-process plugin that may rewrite user content before generation.
    pub const MESSAGE_INTERCEPT: &str = "message.intercept";
    /// Invocations of the plugin are run one at a time.
    pub const SERIALIZE: &str = "runtime.serialize";
    /// Plugin exposes function tools listed in `provided_tools`.
    pub const FUNCTION_TOOLS: &str = "tools.function";
    /// Plugin fronts a protocol server.
    pub const MCP_TOOLS: &str = "tools.mcp";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Mcp,
    Native,
    External,
    Builtin,
}

impl PluginKind {
    /// Whether the plugin runs inside this process.
    #[must_use]
    pub fn is_in_process(self) -> bool {
        matches!(self, Self::Native | Self::Builtin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Initializing,
    Active,
    Suspended,
    Error,
    Unloading,
}

impl PluginState {
    /// `unloaded -> loading -> loaded -> initializing -> active <-> suspended`,
    /// `error` from anywhere, and `unloading -> unloaded` for teardown.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use PluginState::{Active, Error, Initializing, Loaded, Loading, Suspended, Unloaded, Unloading};
        matches!(
            (self, next),
            (_, Error)
                | (Unloaded, Loading)
                | (Loading, Loaded)
                | (Loaded, Initializing)
                | (Initializing, Active)
                | (Active, Suspended)
                | (Suspended, Active)
                | (Loaded | Initializing | Active | Suspended | Error, Unloading)
                | (Unloading, Unloaded)
        )
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Static description of a capability provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PluginDescriptor {
    #[validate(length(min = 1, max = 128))]
    pub id: String,
    #[validate(length(min = 1, max = 256))]
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub kind: PluginKind,
    #[validate(length(min = 1))]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub provided_tools: Vec<ToolSpec>,
    #[serde(default)]
    pub default_config: ConfigMap,
    #[serde(default)]
    pub required_config_keys: Vec<String>,
}

impl PluginDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: PluginKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: "0.1.0".to_string(),
            description: String::new(),
            kind,
            capabilities: Vec::new(),
            dependencies: Vec::new(),
            provided_tools: Vec::new(),
            default_config: ConfigMap::new(),
            required_config_keys: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, plugin_id: impl Into<String>) -> Self {
        self.dependencies.push(plugin_id.into());
        self
    }

    #[must_use]
    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.provided_tools.push(tool);
        self
    }

    #[must_use]
    pub fn with_default_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.default_config.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_required_key(mut self, key: impl Into<String>) -> Self {
        self.required_config_keys.push(key.into());
        self
    }

    #[must_use]
    pub fn declares(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    #[must_use]
    pub fn provides_tool(&self, tool_name: &str) -> bool {
        self.provided_tools.iter().any(|t| t.name == tool_name)
    }

    /// Field checks performed at registration time.
    pub fn check(&self) -> KoraResult<()> {
        self.validate()
            .map_err(|e| KoraError::InvalidConfig(format!("plugin '{}': {}", self.id, e)))?;
        if self.id.trim().is_empty() || self.name.trim().is_empty() {
            return Err(KoraError::InvalidConfig(
                "plugin id and name must not be blank".to_string(),
            ));
        }
        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(KoraError::InvalidConfig(format!(
                "plugin '{}' declares a blank capability",
                self.id
            )));
        }
        semver::Version::parse(&self.version).map_err(|e| {
            KoraError::InvalidConfig(format!(
                "plugin '{}' has invalid version '{}': {}",
                self.id, self.version, e
            ))
        })?;
        if self.dependencies.iter().any(|d| d == &self.id) {
            return Err(KoraError::InvalidConfig(format!(
                "plugin '{}' depends on itself",
                self.id
            )));
        }
        Ok(())
    }
}

/// Handed to a plugin's init hook.
#[derive(Debug, Clone)]
pub struct PluginInitContext {
    pub plugin_id: String,
    pub config: ConfigMap,
}

/// A direct invocation of a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInvocation {
    /// Tool or operation name.
    pub operation: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<KoraId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl PluginInvocation {
    pub fn new(operation: impl Into<String>, parameters: Value) -> Self {
        Self {
            operation: operation.into(),
            parameters,
            session_id: None,
            user_id: None,
        }
    }
}

/// Content offered to message interceptors.
#[derive(Debug, Clone)]
pub struct InterceptRequest {
    pub session_id: KoraId,
    pub user_id: String,
    pub content: Vec<ContentUnit>,
}

/// In-process capability provider.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn descriptor(&self) -> PluginDescriptor;

    async fn on_init(&self, _ctx: PluginInitContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_activate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_deactivate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_unload(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Plugin-specific checks on a merged configuration. Must not mutate state.
    fn validate_config(&self, _config: &ConfigMap) -> Result<(), String> {
        Ok(())
    }

    async fn on_config_changed(&self, _config: &ConfigMap) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, invocation: PluginInvocation) -> anyhow::Result<Value> {
        Err(anyhow::anyhow!(
            "plugin does not support operation '{}'",
            invocation.operation
        ))
    }

    /// Returning `Some` replaces the content passed on to generation.
    async fn intercept_message(
        &self,
        _request: &InterceptRequest,
    ) -> anyhow::Result<Option<Vec<ContentUnit>>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PluginConfig {
    pub id: String,
    pub values: ConfigMap,
}

#[async_trait]
pub trait PluginFactory: Send + Sync {
    fn name(&self) -> &str;
    fn descriptor(&self) -> PluginDescriptor;
    async fn create(&self, config: PluginConfig) -> anyhow::Result<Arc<dyn Plugin>>;
}

pub struct PluginRegistrar {
    pub factory: fn() -> Arc<dyn PluginFactory>,
}

inventory::collect!(PluginRegistrar);
