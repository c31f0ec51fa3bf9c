pub mod cli;
pub mod config;
pub mod content;
pub mod db;
pub mod engine;
pub mod events;
pub mod managers;

// Builtin plugins register through `inventory`; referencing the crates keeps
// them linked into the final binary.
use plugin_datetime as _;
use plugin_redactor as _;

pub use engine::{
    AgentEngine, AgentResponse, ContentRejection, EngineServices, EngineSettings,
    InterceptionMode, SessionUpdate,
};

use std::sync::Arc;

use kora_shared::{Generator, SessionStore};
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::content::ContentPipeline;
use crate::events::EventBus;
use crate::managers::{McpClientManager, PluginManager};

/// Opens (creating if needed) the SQLite database named by `database_url`
/// and ensures the schema.
pub async fn open_database(database_url: &str) -> anyhow::Result<SqlitePool> {
    use sqlx::sqlite::SqliteConnectOptions;
    use std::str::FromStr;

    if let Some(path_str) = database_url.strip_prefix("sqlite:") {
        let db_path = std::path::Path::new(path_str);
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && parent != std::path::Path::new(".") && !path_str.contains(":memory:") {
                std::fs::create_dir_all(parent)?;
                info!("📁 Data directory: {}", parent.display());
            }
        }
    }

    let opts = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePool::connect_with(opts).await?;
    db::init_db(&pool).await?;
    Ok(pool)
}

/// Builds the plugin manager, discovers compiled-in plugins and activates
/// them. A plugin that fails to load stays registered in `error`.
pub async fn start_plugins(config: &AppConfig, events: EventBus, mcp: Arc<McpClientManager>) -> anyhow::Result<Arc<PluginManager>> {
    let mut manager = PluginManager::new(config.plugin_policy(), events).with_mcp(mcp);
    manager.discover_builtins();
    let manager = Arc::new(manager);

    for plugin_id in manager.register_builtins().await? {
        if let Err(e) = manager.load(&plugin_id).await {
            warn!(plugin_id = %plugin_id, error = %e, "Builtin plugin failed to load");
        }
    }
    Ok(manager)
}

/// A fully wired orchestration core: event bus, protocol client, plugin
/// manager and engine, plus their background tasks.
pub struct Runtime {
    pub config: AppConfig,
    pub events: EventBus,
    pub mcp: Arc<McpClientManager>,
    pub plugins: Arc<PluginManager>,
    pub engine: Arc<AgentEngine>,
    pub shutdown: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Wires every component around the given generator and store.
    pub async fn start(
        config: AppConfig,
        generator: Arc<dyn Generator>,
        store: Arc<dyn SessionStore>,
    ) -> anyhow::Result<Self> {
        info!("+---------------------------------------+");
        info!("|        Kora Orchestration Core        |");
        info!("|             Version {:<10}        |", env!("CARGO_PKG_VERSION"));
        info!("+---------------------------------------+");

        let shutdown = Arc::new(Notify::new());
        let events = EventBus::new(config.event_history_size);

        let mcp = Arc::new(McpClientManager::new(config.mcp_settings(), events.clone()));
        if let Some(path) = &config.mcp_config_path {
            if let Err(e) = mcp.load_config_file(path).await {
                warn!(error = %e, "Failed to load MCP config file");
            }
        }

        let plugins = start_plugins(&config, events.clone(), mcp.clone()).await?;

        let engine = Arc::new(AgentEngine::new(
            config.engine_settings(),
            EngineServices {
                generator,
                store,
                plugins: plugins.clone(),
                mcp: mcp.clone(),
                content: Arc::new(ContentPipeline::new(config.content_limits.clone())),
                events: events.clone(),
            },
        ));

        let mut tasks = vec![mcp.clone().spawn_health_monitor(shutdown.clone())];
        tasks.extend(engine.clone().spawn_eviction_task(shutdown.clone()));

        info!(
            plugins = plugins.list_plugins().await.len(),
            mcp_servers = mcp.list_sessions().await.len(),
            "✅ Kora runtime ready"
        );
        Ok(Self {
            config,
            events,
            mcp,
            plugins,
            engine,
            shutdown,
            tasks,
        })
    }

    /// Stops background tasks, unloads plugins and disconnects servers.
    pub async fn stop(self) {
        info!("🛑 Shutting down Kora runtime");
        self.shutdown.notify_waiters();
        for mut task in self.tasks {
            // A task busy with a tick misses the notification; give it a
            // moment, then abort.
            match tokio::time::timeout(std::time::Duration::from_secs(5), &mut task).await {
                Ok(Err(e)) => warn!(error = %e, "Background task ended abnormally"),
                Ok(Ok(())) => {}
                Err(_) => task.abort(),
            }
        }
        self.plugins.shutdown().await;
        self.mcp.shutdown().await;
    }
}
