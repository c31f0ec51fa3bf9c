use std::sync::Arc;
use std::time::Duration;

use kora_shared::{
    KoraError, KoraId, KoraResult, PluginInvocation, Session, ToolCall, ToolCallKind, ToolError,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::managers::{McpClientManager, PluginManager};

const TIMEOUT_CODE: &str = "TIMEOUT";

/// Who a tool call runs on behalf of, and which plugins and protocol
/// servers it may reach.
#[derive(Debug, Clone)]
pub(crate) struct DispatchScope {
    pub session_id: KoraId,
    pub user_id: String,
    /// Only these plugins serve the session's calls.
    pub enabled_plugins: Vec<String>,
    /// Empty means every connected server is eligible.
    pub mcp_servers: Vec<String>,
}

impl DispatchScope {
    pub(crate) fn for_session(session: &Session, user_id: &str) -> Self {
        Self {
            session_id: session.id,
            user_id: user_id.to_string(),
            enabled_plugins: session.settings.enabled_plugins.clone(),
            mcp_servers: session.settings.mcp_servers.clone(),
        }
    }
}

/// Routes a running tool call to the subsystem that serves it.
#[derive(Clone)]
pub(crate) struct ToolDispatcher {
    plugins: Arc<PluginManager>,
    mcp: Arc<McpClientManager>,
    tool_timeout: Duration,
}

impl ToolDispatcher {
    pub(crate) fn new(plugins: Arc<PluginManager>, mcp: Arc<McpClientManager>, tool_timeout: Duration) -> Self {
        Self {
            plugins,
            mcp,
            tool_timeout,
        }
    }

    /// Resolves a call that is already `running`. Never returns it unresolved.
    pub(crate) async fn run(&self, scope: &DispatchScope, mut call: ToolCall) -> ToolCall {
        let outcome = self.route(scope, &call).await;
        let resolved = match outcome {
            Ok(value) => {
                let resolved = call.complete(value);
                info!(
                    session_id = %scope.session_id,
                    tool_call_id = %call.id,
                    tool = %call.name,
                    duration_ms = call.duration_ms().unwrap_or(0),
                    "✅ Tool call completed"
                );
                resolved
            }
            Err(e) => {
                if e.code == TIMEOUT_CODE {
                    warn!(session_id = %scope.session_id, tool_call_id = %call.id, tool = %call.name, "⏱️ Tool call timed out");
                } else {
                    warn!(session_id = %scope.session_id, tool_call_id = %call.id, tool = %call.name, code = %e.code, error = %e.message, "❌ Tool call failed");
                }
                call.fail(e)
            }
        };
        if let Err(e) = resolved {
            warn!(tool_call_id = %call.id, error = %e, "Tool call could not be resolved");
        }
        call
    }

    async fn route(&self, scope: &DispatchScope, call: &ToolCall) -> Result<Value, ToolError> {
        match call.kind {
            ToolCallKind::Function => {
                if let Some(plugin_id) = self
                    .plugins
                    .find_tool_provider(&call.name, &scope.enabled_plugins)
                    .await
                {
                    return self.run_plugin(scope, &plugin_id, call).await;
                }
                // Generators do not always tell plugin functions and protocol tools apart.
                let server_id = self.mcp_server_for(scope, call).await.map_err(|e| ToolError::from(&e))?;
                self.run_mcp(&server_id, call).await
            }
            ToolCallKind::Plugin => {
                let plugin_id = self.plugin_for(scope, call).await.map_err(|e| ToolError::from(&e))?;
                self.run_plugin(scope, &plugin_id, call).await
            }
            ToolCallKind::McpTool => {
                let server_id = self.mcp_server_for(scope, call).await.map_err(|e| ToolError::from(&e))?;
                self.run_mcp(&server_id, call).await
            }
        }
    }

    async fn run_plugin(&self, scope: &DispatchScope, plugin_id: &str, call: &ToolCall) -> Result<Value, ToolError> {
        let invocation = PluginInvocation {
            operation: call.name.clone(),
            parameters: call.parameters.clone(),
            session_id: Some(scope.session_id),
            user_id: Some(scope.user_id.clone()),
        };
        self.plugins
            .execute_plugin(plugin_id, invocation)
            .await
            .map_err(|e| ToolError::from(&e))
    }

    async fn run_mcp(&self, server_id: &str, call: &ToolCall) -> Result<Value, ToolError> {
        self.mcp
            .execute_tool_with_timeout(server_id, &call.name, call.parameters.clone(), self.tool_timeout)
            .await
            .into_result()
    }

    /// The explicit plugin, else the first enabled provider of the tool.
    async fn plugin_for(&self, scope: &DispatchScope, call: &ToolCall) -> KoraResult<String> {
        let Some(plugin_id) = &call.server_id else {
            return self
                .plugins
                .find_tool_provider(&call.name, &scope.enabled_plugins)
                .await
                .ok_or_else(|| KoraError::ToolNotFound(call.name.clone()));
        };
        if !scope.enabled_plugins.contains(plugin_id) {
            return Err(KoraError::ToolNotFound(format!(
                "{} (plugin '{}' is not enabled for this session)",
                call.name, plugin_id
            )));
        }
        Ok(plugin_id.clone())
    }

    /// The explicit server, else the routing index. Sessions that list
    /// servers may only reach those.
    async fn mcp_server_for(&self, scope: &DispatchScope, call: &ToolCall) -> KoraResult<String> {
        let server_id = match &call.server_id {
            Some(id) => id.clone(),
            None => self
                .mcp
                .server_for_tool(&call.name)
                .await
                .ok_or_else(|| KoraError::ToolNotFound(call.name.clone()))?,
        };
        if !scope.mcp_servers.is_empty() && !scope.mcp_servers.contains(&server_id) {
            return Err(KoraError::ToolNotFound(format!(
                "{} (server '{}' is not enabled for this session)",
                call.name, server_id
            )));
        }
        Ok(server_id)
    }
}
