mod backends;
pub mod mcp;
pub mod mcp_http;
pub mod mcp_protocol;
pub mod mcp_transport;
pub mod mcp_websocket;
mod plugin;
mod registry;

pub use backends::{BackendContext, ExternalPluginSpec, McpPluginSpec, PluginBackend};
pub use mcp::{
    ConnectionStatus, McpClient, McpClientManager, McpClientSettings, ProtocolSession,
    ProtocolStats, ToolResult,
};
pub use mcp_protocol::{McpConfigFile, McpServerConfig, TransportKind};
pub use mcp_transport::{DefaultTransportConnector, McpTransport, PendingRequests, TransportConnector};
pub use plugin::{PluginManager, PluginPolicy};
pub use registry::{PluginRegistry, PluginSnapshot};
