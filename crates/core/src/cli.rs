use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::db::SqliteSessionStore;
use crate::events::EventBus;
use crate::managers::{McpClientManager, McpConfigFile, PluginManager};
use kora_shared::SessionStore;

#[derive(Parser)]
#[command(
    name = "kora",
    version = env!("CARGO_PKG_VERSION"),
    about = "Kora - Agent Orchestration Core"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List compiled-in plugins and their descriptors
    Plugins,
    /// Connect the configured MCP servers and print their tools
    Mcp {
        /// Path to an mcp.toml (defaults to KORA_MCP_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List persisted sessions for a user
    Sessions {
        #[arg(long)]
        user: String,
    },
    /// Validate configuration and exit
    Check,
}

/// Dispatch CLI subcommands
pub async fn dispatch(cmd: Commands) -> anyhow::Result<()> {
    match cmd {
        Commands::Plugins => list_plugins(),
        Commands::Mcp { config } => list_mcp_tools(config).await,
        Commands::Sessions { user } => list_sessions(&user).await,
        Commands::Check => check().await,
    }
}

fn list_plugins() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let mut manager = PluginManager::new(config.plugin_policy(), EventBus::default());
    manager.discover_builtins();

    for factory in manager.factories() {
        let d = factory.descriptor();
        println!("{} v{} ({:?}) - {}", d.id, d.version, d.kind, d.name);
        if !d.description.is_empty() {
            println!("    {}", d.description);
        }
        println!("    capabilities: {}", d.capabilities.join(", "));
        if !d.dependencies.is_empty() {
            println!("    depends on:   {}", d.dependencies.join(", "));
        }
        for tool in &d.provided_tools {
            println!(
                "    tool {:<24} {}",
                tool.name,
                tool.description.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

fn mcp_config_path(explicit: Option<PathBuf>, config: &AppConfig) -> anyhow::Result<String> {
    match explicit {
        Some(path) => Ok(path.to_string_lossy().to_string()),
        None => config
            .mcp_config_path
            .clone()
            .context("No MCP config given: pass --config or set KORA_MCP_CONFIG"),
    }
}

async fn list_mcp_tools(explicit: Option<PathBuf>) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let path = mcp_config_path(explicit, &config)?;
    let manager = Arc::new(McpClientManager::new(config.mcp_settings(), EventBus::default()));

    let connected = manager.load_config_file(&path).await?;
    info!("🔌 Connected {} MCP server(s)", connected);

    for session in manager.list_sessions().await {
        println!(
            "{} ({}, {}) - {} tool(s)",
            session.server_id,
            session.name,
            session.transport,
            session.tools.len()
        );
        for tool in &session.tools {
            println!(
                "    {:<28} {}",
                tool.name,
                tool.description.as_deref().unwrap_or("")
            );
        }
    }
    for (server_id, error) in manager.failures().await {
        println!("{} - FAILED: {}", server_id, error);
    }

    manager.shutdown().await;
    Ok(())
}

async fn list_sessions(user: &str) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let pool = crate::open_database(&config.database_url).await?;
    let store = SqliteSessionStore::new(pool);

    let sessions = store.list_for_user(user).await?;
    if sessions.is_empty() {
        println!("No sessions for user '{}'", user);
        return Ok(());
    }
    for s in sessions {
        println!(
            "{}  {:<9} {:<8} {:>4} msgs  {}  {}",
            s.id,
            format!("{:?}", s.status).to_lowercase(),
            format!("{:?}", s.mode).to_lowercase(),
            s.message_count,
            s.last_activity.format("%Y-%m-%d %H:%M"),
            s.title
        );
    }
    Ok(())
}

async fn check() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    println!("✅ Environment configuration is valid");
    println!("    database:          {}", config.database_url);
    println!("    interception mode: {:?}", config.interception_mode);
    println!("    failure threshold: {}", config.plugin_failure_threshold);
    println!("    tool timeout:      {}s", config.tool_timeout_secs);

    if let Some(path) = &config.mcp_config_path {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read MCP config {}", path))?;
        let file: McpConfigFile =
            toml::from_str(&raw).with_context(|| format!("Failed to parse MCP config {}", path))?;
        for server in &file.servers {
            server
                .check()
                .with_context(|| format!("MCP server '{}' is misconfigured", server.id))?;
        }
        println!("✅ MCP config {} ({} server(s))", path, file.servers.len());
    }
    Ok(())
}
