#![allow(dead_code)]

mod mock_generator;
mod mock_plugin;
mod mock_store;
mod mock_transport;

pub use mock_generator::*;
pub use mock_plugin::*;
pub use mock_store::*;
pub use mock_transport::*;

use std::sync::Arc;

use kora_core::content::ContentPipeline;
use kora_core::events::EventBus;
use kora_core::managers::{McpClientManager, McpClientSettings, PluginManager, PluginPolicy};
use kora_core::{AgentEngine, EngineServices, EngineSettings};
use kora_shared::Generator;
use std::time::Duration;

/// Connect settings that fail fast instead of backing off for seconds.
pub fn fast_mcp_settings() -> McpClientSettings {
    McpClientSettings {
        connect_attempts: 1,
        initial_backoff: Duration::from_millis(1),
        request_timeout: Duration::from_secs(5),
        health_interval: Duration::from_secs(3600),
    }
}

/// Everything an engine test needs, with handles kept for inspection.
pub struct Harness {
    pub engine: Arc<AgentEngine>,
    pub plugins: Arc<PluginManager>,
    pub mcp: Arc<McpClientManager>,
    pub store: Arc<FlakyStore>,
    pub connector: Arc<MockConnector>,
    pub events: EventBus,
}

pub fn harness(generator: Arc<dyn Generator>) -> Harness {
    harness_with(generator, EngineSettings::default(), PluginPolicy::default())
}

pub fn harness_with(generator: Arc<dyn Generator>, settings: EngineSettings, policy: PluginPolicy) -> Harness {
    let events = EventBus::new(500);
    let connector = Arc::new(MockConnector::default());
    let mcp = Arc::new(McpClientManager::with_connector(
        fast_mcp_settings(),
        events.clone(),
        connector.clone(),
    ));
    let plugins = Arc::new(PluginManager::new(policy, events.clone()).with_mcp(mcp.clone()));
    let store = Arc::new(FlakyStore::default());

    let engine = Arc::new(AgentEngine::new(
        settings,
        EngineServices {
            generator,
            store: store.clone(),
            plugins: plugins.clone(),
            mcp: mcp.clone(),
            content: Arc::new(ContentPipeline::default()),
            events: events.clone(),
        },
    ));

    Harness {
        engine,
        plugins,
        mcp,
        store,
        connector,
        events,
    }
}
