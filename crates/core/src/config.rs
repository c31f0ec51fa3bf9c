use anyhow::Context;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::content::ContentLimits;
use crate::engine::{EngineSettings, InterceptionMode};
use crate::managers::{McpClientSettings, PluginPolicy};

/// Returns the directory containing the running executable.
/// Falls back to CWD if the exe path cannot be determined.
#[must_use]
pub fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub mcp_config_path: Option<String>,
    pub allowed_hosts: Vec<String>,
    pub plugin_failure_threshold: u32,
    pub plugin_hook_timeout_secs: u64,
    pub plugin_exec_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub mcp_connect_attempts: u32,
    pub mcp_request_timeout_secs: u64,
    pub max_history: usize,
    pub event_history_size: usize,
    /// 0 disables idle eviction.
    pub session_idle_secs: u64,
    pub interception_mode: InterceptionMode,
    pub system_prompt: String,
    pub content_limits: ContentLimits,
}

fn parse_var<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Failed to parse {} (got '{}')", key, raw)),
        Err(_) => Ok(default),
    }
}

fn in_range<T: PartialOrd + std::fmt::Display>(key: &str, value: T, min: T, max: T) -> anyhow::Result<T> {
    if value < min || value > max {
        anyhow::bail!("{} must be between {} and {} (got {})", key, min, max, value);
    }
    Ok(value)
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let database_url = env::var("KORA_DATABASE_URL").unwrap_or_else(|_| {
            let db_path = exe_dir().join("data").join("kora.db");
            format!("sqlite:{}", db_path.display())
        });

        let mcp_config_path = env::var("KORA_MCP_CONFIG").ok().filter(|p| !p.trim().is_empty());

        let allowed_hosts = env::var("KORA_ALLOWED_HOSTS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let plugin_failure_threshold = in_range(
            "KORA_PLUGIN_FAILURE_THRESHOLD",
            parse_var("KORA_PLUGIN_FAILURE_THRESHOLD", 5u32)?,
            1,
            100,
        )?;
        let plugin_hook_timeout_secs = in_range(
            "KORA_PLUGIN_HOOK_TIMEOUT_SECS",
            parse_var("KORA_PLUGIN_HOOK_TIMEOUT_SECS", 30u64)?,
            1,
            300,
        )?;
        let plugin_exec_timeout_secs = in_range(
            "KORA_PLUGIN_EXEC_TIMEOUT_SECS",
            parse_var("KORA_PLUGIN_EXEC_TIMEOUT_SECS", 60u64)?,
            1,
            600,
        )?;
        let tool_timeout_secs = in_range(
            "KORA_TOOL_TIMEOUT_SECS",
            parse_var("KORA_TOOL_TIMEOUT_SECS", 30u64)?,
            1,
            300,
        )?;
        let mcp_connect_attempts = in_range(
            "KORA_MCP_CONNECT_ATTEMPTS",
            parse_var("KORA_MCP_CONNECT_ATTEMPTS", 3u32)?,
            1,
            10,
        )?;
        let mcp_request_timeout_secs = in_range(
            "KORA_MCP_REQUEST_TIMEOUT_SECS",
            parse_var("KORA_MCP_REQUEST_TIMEOUT_SECS", 120u64)?,
            1,
            600,
        )?;
        let max_history = in_range(
            "KORA_MAX_HISTORY",
            parse_var("KORA_MAX_HISTORY", kora_shared::DEFAULT_MAX_HISTORY)?,
            1,
            10_000,
        )?;
        let event_history_size = parse_var("KORA_EVENT_HISTORY_SIZE", 1000usize)?;
        let session_idle_secs = parse_var("KORA_SESSION_IDLE_SECS", 3600u64)?;

        let interception_mode = match env::var("KORA_INTERCEPTION_MODE") {
            Ok(raw) => raw.parse::<InterceptionMode>()?,
            Err(_) => InterceptionMode::default(),
        };

        let system_prompt = env::var("KORA_SYSTEM_PROMPT")
            .unwrap_or_else(|_| EngineSettings::default().system_prompt);

        let defaults = ContentLimits::default();
        let content_limits = ContentLimits {
            max_text_chars: parse_var("KORA_MAX_TEXT_CHARS", defaults.max_text_chars)?,
            max_image_bytes: parse_var("KORA_MAX_IMAGE_BYTES", defaults.max_image_bytes)?,
            max_audio_bytes: parse_var("KORA_MAX_AUDIO_BYTES", defaults.max_audio_bytes)?,
            max_file_bytes: parse_var("KORA_MAX_FILE_BYTES", defaults.max_file_bytes)?,
            ..defaults
        };
        if content_limits.max_text_chars == 0 {
            anyhow::bail!("KORA_MAX_TEXT_CHARS must be greater than 0");
        }

        Ok(Self {
            database_url,
            mcp_config_path,
            allowed_hosts,
            plugin_failure_threshold,
            plugin_hook_timeout_secs,
            plugin_exec_timeout_secs,
            tool_timeout_secs,
            mcp_connect_attempts,
            mcp_request_timeout_secs,
            max_history,
            event_history_size,
            session_idle_secs,
            interception_mode,
            system_prompt,
            content_limits,
        })
    }

    #[must_use]
    pub fn plugin_policy(&self) -> PluginPolicy {
        PluginPolicy {
            failure_threshold: self.plugin_failure_threshold,
            hook_timeout: Duration::from_secs(self.plugin_hook_timeout_secs),
            execution_timeout: Duration::from_secs(self.plugin_exec_timeout_secs),
            allowed_hosts: self.allowed_hosts.clone(),
        }
    }

    #[must_use]
    pub fn mcp_settings(&self) -> McpClientSettings {
        McpClientSettings {
            connect_attempts: self.mcp_connect_attempts,
            request_timeout: Duration::from_secs(self.mcp_request_timeout_secs),
            ..McpClientSettings::default()
        }
    }

    #[must_use]
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            system_prompt: self.system_prompt.clone(),
            default_max_history: self.max_history,
            tool_timeout: Duration::from_secs(self.tool_timeout_secs),
            interception_mode: self.interception_mode,
            session_idle: (self.session_idle_secs > 0)
                .then(|| Duration::from_secs(self.session_idle_secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests run serially (prevents parallel test interference)
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // Guard to ensure env var cleanup even on panic
    struct EnvGuard(&'static str);

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            std::env::remove_var(self.0);
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let config = AppConfig::load().unwrap();
        assert_eq!(config.plugin_failure_threshold, 5);
        assert_eq!(config.mcp_connect_attempts, 3);
        assert_eq!(config.interception_mode, InterceptionMode::LastWins);
        assert!(config.database_url.starts_with("sqlite:"));
    }

    #[test]
    fn test_failure_threshold_out_of_range() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("KORA_PLUGIN_FAILURE_THRESHOLD", "0");
        let _guard = EnvGuard("KORA_PLUGIN_FAILURE_THRESHOLD");
        let err = AppConfig::load().unwrap_err();
        assert!(err.to_string().contains("KORA_PLUGIN_FAILURE_THRESHOLD"));
    }

    #[test]
    fn test_unparseable_timeout() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("KORA_TOOL_TIMEOUT_SECS", "soon");
        let _guard = EnvGuard("KORA_TOOL_TIMEOUT_SECS");
        assert!(AppConfig::load().is_err());
    }

    #[test]
    fn test_interception_mode_compose() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("KORA_INTERCEPTION_MODE", "compose");
        let _guard = EnvGuard("KORA_INTERCEPTION_MODE");
        let config = AppConfig::load().unwrap();
        assert_eq!(config.engine_settings().interception_mode, InterceptionMode::Compose);
    }

    #[test]
    fn test_allowed_hosts_whitespace_handling() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("KORA_ALLOWED_HOSTS", " Tools.Example.com , ,api.internal ");
        let _guard = EnvGuard("KORA_ALLOWED_HOSTS");
        let config = AppConfig::load().unwrap();
        assert_eq!(config.allowed_hosts, vec!["tools.example.com", "api.internal"]);
    }

    #[test]
    fn test_idle_zero_disables_eviction() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("KORA_SESSION_IDLE_SECS", "0");
        let _guard = EnvGuard("KORA_SESSION_IDLE_SECS");
        let config = AppConfig::load().unwrap();
        assert!(config.engine_settings().session_idle.is_none());
    }
}
