use chrono::Utc;
use futures::FutureExt;
use kora_shared::{
    capabilities, ConfigMap, ContentUnit, InterceptRequest, KoraError, KoraEventData, KoraResult,
    Plugin, PluginConfig, PluginFactory, PluginInitContext, PluginInvocation, PluginState,
    ResourceKind, ToolSource, ToolSpec,
};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::backends::{BackendContext, PluginBackend};
use super::mcp::McpClientManager;
use super::registry::{PluginEntry, PluginRegistry, PluginSnapshot};
use crate::events::EventBus;

#[derive(Debug, Clone)]
pub struct PluginPolicy {
    /// Consecutive failures that open the circuit breaker.
    pub failure_threshold: u32,
    pub hook_timeout: Duration,
    pub execution_timeout: Duration,
    /// Hosts external plugins may be reached at.
    pub allowed_hosts: Vec<String>,
}

impl Default for PluginPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            hook_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(60),
            allowed_hosts: Vec::new(),
        }
    }
}

#[derive(Debug)]
enum HookFailure {
    Failed(String),
    Panicked,
    TimedOut(Duration),
}

impl std::fmt::Display for HookFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(msg) => write!(f, "{}", msg),
            Self::Panicked => write!(f, "plugin panicked"),
            Self::TimedOut(d) => write!(f, "timed out after {}s", d.as_secs()),
        }
    }
}

pub struct PluginManager {
    registry: PluginRegistry,
    factories: HashMap<String, Arc<dyn PluginFactory>>,
    policy: PluginPolicy,
    events: EventBus,
    backend_ctx: BackendContext,
}

impl PluginManager {
    #[must_use]
    pub fn new(policy: PluginPolicy, events: EventBus) -> Self {
        let backend_ctx = BackendContext {
            mcp: None,
            http: reqwest::Client::new(),
            allowed_hosts: policy.allowed_hosts.clone(),
            request_timeout: policy.execution_timeout,
        };
        Self {
            registry: PluginRegistry::new(),
            factories: HashMap::new(),
            policy,
            events,
            backend_ctx,
        }
    }

    /// Enables MCP-backed plugins.
    #[must_use]
    pub fn with_mcp(mut self, mcp: Arc<McpClientManager>) -> Self {
        self.backend_ctx.mcp = Some(mcp);
        self
    }

    #[must_use]
    pub fn policy(&self) -> &PluginPolicy {
        &self.policy
    }

    pub fn register_factory(&mut self, factory: Arc<dyn PluginFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    /// Collect compiled-in plugin factories via inventory.
    pub fn discover_builtins(&mut self) -> usize {
        info!("🔍 Scanning for plugins via inventory...");

        let mut discovered_count = 0;
        for registrar in kora_shared::inventory::iter::<kora_shared::PluginRegistrar> {
            let factory = (registrar.factory)();
            info!("📦 Discovered plugin factory: {}", factory.name());
            self.register_factory(factory);
            discovered_count += 1;
        }

        if discovered_count == 0 {
            error!("⚠️ No plugin factories discovered! Check that plugin crates are linked into kora_core");
        } else {
            info!("✅ Discovered {} plugin factories", discovered_count);
        }
        discovered_count
    }

    #[must_use]
    pub fn factories(&self) -> Vec<Arc<dyn PluginFactory>> {
        let mut list: Vec<_> = self.factories.values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }

    /// Registers every discovered builtin factory. Already registered ids are skipped.
    pub async fn register_builtins(&self) -> KoraResult<Vec<String>> {
        let mut registered = Vec::new();
        for factory in self.factories() {
            let id = factory.name().to_string();
            if self.registry.contains(&id).await {
                continue;
            }
            self.register(PluginBackend::Builtin(factory)).await?;
            registered.push(id);
        }
        Ok(registered)
    }

    // ============================================================
    // Registration
    // ============================================================

    pub async fn register(&self, backend: PluginBackend) -> KoraResult<()> {
        let descriptor = backend.descriptor();
        descriptor.check()?;
        backend
            .check(&self.backend_ctx)
            .map_err(|e| KoraError::InvalidConfig(format!("plugin '{}': {:#}", descriptor.id, e)))?;

        let id = descriptor.id.clone();
        let kind = descriptor.kind;
        self.registry.insert(PluginEntry::new(backend)).await?;
        info!(plugin_id = %id, kind = ?kind, "🔌 Plugin registered");
        Ok(())
    }

    pub async fn register_native(&self, plugin: Arc<dyn Plugin>) -> KoraResult<()> {
        self.register(PluginBackend::Native(plugin)).await
    }

    /// Unloads if needed, then forgets the plugin.
    pub async fn unregister(&self, plugin_id: &str) -> KoraResult<()> {
        let state = self.registry.read(plugin_id, |e| e.state).await?;
        if state != PluginState::Unloaded {
            self.unload(plugin_id).await?;
        }
        self.registry.remove(plugin_id).await;
        info!(plugin_id = %plugin_id, "🧹 Plugin unregistered");
        Ok(())
    }

    // ============================================================
    // Lifecycle
    // ============================================================

    async fn transition(&self, plugin_id: &str, next: PluginState) -> KoraResult<PluginState> {
        let previous = self
            .registry
            .update(plugin_id, |entry| {
                let from = entry.state;
                if !from.can_transition_to(next) {
                    return Err(KoraError::Execution(format!(
                        "plugin '{}' cannot move from {} to {}",
                        plugin_id, from, next
                    )));
                }
                entry.state = next;
                Ok(from)
            })
            .await?;
        debug!(plugin_id = %plugin_id, from = %previous, to = %next, "Plugin state changed");
        self.events
            .publish(KoraEventData::PluginStateChanged {
                plugin_id: plugin_id.to_string(),
                from: previous,
                to: next,
            })
            .await;
        Ok(previous)
    }

    async fn fail(&self, plugin_id: &str, message: String) -> KoraError {
        if let Err(e) = self
            .registry
            .update(plugin_id, |entry| {
                entry.last_error = Some(message.clone());
                entry.error_count += 1;
                Ok(())
            })
            .await
        {
            warn!(plugin_id = %plugin_id, error = %e, "Could not record plugin failure");
        }
        if let Err(e) = self.transition(plugin_id, PluginState::Error).await {
            warn!(plugin_id = %plugin_id, error = %e, "Could not mark plugin as failed");
        }
        error!(plugin_id = %plugin_id, error = %message, "❌ Plugin lifecycle failure");
        KoraError::Execution(message)
    }

    /// Runs plugin code under a timeout; a panic is a failure.
    async fn guarded<T, Fut>(&self, timeout: Duration, fut: Fut) -> Result<T, HookFailure>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(timeout, std::panic::AssertUnwindSafe(fut).catch_unwind()).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(HookFailure::Failed(format!("{:#}", e))),
            Ok(Err(_)) => Err(HookFailure::Panicked),
            Err(_) => Err(HookFailure::TimedOut(timeout)),
        }
    }

    /// `unloaded → loading → loaded → initializing → active`. Any hook
    /// failure leaves the plugin in `error`; there is no automatic retry.
    pub async fn load(&self, plugin_id: &str) -> KoraResult<()> {
        let (state, dependencies, required_keys, config) = self
            .registry
            .read(plugin_id, |e| {
                (
                    e.state,
                    e.descriptor.dependencies.clone(),
                    e.descriptor.required_config_keys.clone(),
                    e.config.clone(),
                )
            })
            .await?;
        if state == PluginState::Active {
            return Ok(());
        }

        for dep in &dependencies {
            let dep_state = self
                .registry
                .read(dep, |e| e.state)
                .await
                .map_err(|_| KoraError::not_found(ResourceKind::Plugin, dep.clone()))?;
            if dep_state != PluginState::Active {
                return Err(KoraError::NotActive(dep.clone()));
            }
        }

        self.transition(plugin_id, PluginState::Loading).await?;
        info!(plugin_id = %plugin_id, "🔌 Loading plugin");

        if let Some(missing) = required_keys
            .iter()
            .find(|k| config.get(*k).map_or(true, Value::is_null))
        {
            let message = format!("missing required config key '{}'", missing);
            self.fail(plugin_id, message.clone()).await;
            return Err(KoraError::InvalidConfig(format!("plugin '{}': {}", plugin_id, message)));
        }

        let plugin_config = PluginConfig {
            id: plugin_id.to_string(),
            values: config.clone(),
        };
        let ctx = self.backend_ctx.clone();
        let backend = self.registry.read(plugin_id, |e| e.backend.clone()).await?;
        let instance = match self
            .guarded(self.policy.hook_timeout, backend.instantiate(&ctx, plugin_config))
            .await
        {
            Ok(instance) => instance,
            Err(message) => return Err(self.fail(plugin_id, format!("instantiate: {}", message)).await),
        };
        self.registry
            .update(plugin_id, |e| {
                e.instance = Some(instance.clone());
                Ok(())
            })
            .await?;
        self.transition(plugin_id, PluginState::Loaded).await?;

        self.transition(plugin_id, PluginState::Initializing).await?;
        let init_ctx = PluginInitContext {
            plugin_id: plugin_id.to_string(),
            config,
        };
        if let Err(message) = self.guarded(self.policy.hook_timeout, instance.on_init(init_ctx)).await {
            return Err(self.fail(plugin_id, format!("on_init: {}", message)).await);
        }
        if let Err(message) = self.guarded(self.policy.hook_timeout, instance.on_activate()).await {
            return Err(self.fail(plugin_id, format!("on_activate: {}", message)).await);
        }

        self.registry.refresh_descriptor(plugin_id, instance.descriptor()).await;
        self.registry
            .update(plugin_id, |e| {
                e.enabled = true;
                e.consecutive_failures = 0;
                e.last_error = None;
                e.last_activity = Some(Utc::now());
                Ok(())
            })
            .await?;
        self.transition(plugin_id, PluginState::Active).await?;
        info!(plugin_id = %plugin_id, "✅ Plugin active");
        Ok(())
    }

    /// `… → unloading → unloaded`. Hook failures during teardown are logged.
    pub async fn unload(&self, plugin_id: &str) -> KoraResult<()> {
        let (state, instance) = self
            .registry
            .read(plugin_id, |e| (e.state, e.instance.clone()))
            .await?;
        if state == PluginState::Unloaded {
            return Ok(());
        }
        self.transition(plugin_id, PluginState::Unloading).await?;

        if let Some(instance) = instance {
            if state == PluginState::Active {
                if let Err(message) = self.guarded(self.policy.hook_timeout, instance.on_deactivate()).await {
                    warn!(plugin_id = %plugin_id, error = %message, "on_deactivate failed during unload");
                }
            }
            if let Err(message) = self.guarded(self.policy.hook_timeout, instance.on_unload()).await {
                warn!(plugin_id = %plugin_id, error = %message, "on_unload failed");
            }
        }

        self.registry
            .update(plugin_id, |e| {
                e.instance = None;
                e.enabled = false;
                Ok(())
            })
            .await?;
        self.transition(plugin_id, PluginState::Unloaded).await?;
        info!(plugin_id = %plugin_id, "🧹 Plugin unloaded");
        Ok(())
    }

    /// Unload then load; the only way out of a tripped breaker.
    pub async fn reload(&self, plugin_id: &str) -> KoraResult<()> {
        self.unload(plugin_id).await?;
        self.load(plugin_id).await
    }

    pub async fn suspend(&self, plugin_id: &str) -> KoraResult<()> {
        let instance = self.registry.read(plugin_id, |e| e.instance.clone()).await?;
        self.transition(plugin_id, PluginState::Suspended).await?;
        if let Some(instance) = instance {
            if let Err(message) = self.guarded(self.policy.hook_timeout, instance.on_deactivate()).await {
                return Err(self.fail(plugin_id, format!("on_deactivate: {}", message)).await);
            }
        }
        Ok(())
    }

    pub async fn resume(&self, plugin_id: &str) -> KoraResult<()> {
        let (state, instance) = self
            .registry
            .read(plugin_id, |e| (e.state, e.instance.clone()))
            .await?;
        if state != PluginState::Suspended {
            return Err(KoraError::Execution(format!(
                "plugin '{}' is {} and cannot be resumed",
                plugin_id, state
            )));
        }
        if let Some(instance) = instance {
            if let Err(message) = self.guarded(self.policy.hook_timeout, instance.on_activate()).await {
                return Err(self.fail(plugin_id, format!("on_activate: {}", message)).await);
            }
        }
        self.transition(plugin_id, PluginState::Active).await?;
        Ok(())
    }

    pub async fn enable(&self, plugin_id: &str) -> KoraResult<()> {
        self.set_enabled(plugin_id, true).await
    }

    pub async fn disable(&self, plugin_id: &str) -> KoraResult<()> {
        self.set_enabled(plugin_id, false).await
    }

    async fn set_enabled(&self, plugin_id: &str, enabled: bool) -> KoraResult<()> {
        self.registry
            .update(plugin_id, |e| {
                e.enabled = enabled;
                Ok(())
            })
            .await?;
        info!(plugin_id = %plugin_id, enabled = enabled, "Plugin dispatch toggled");
        Ok(())
    }

    // ============================================================
    // Execution
    // ============================================================

    /// Executes one invocation. Fails fast with `PluginInErrorState` once the
    /// breaker has opened; a timeout counts as a failure.
    pub async fn execute_plugin(&self, plugin_id: &str, invocation: PluginInvocation) -> KoraResult<Value> {
        self.invoke(plugin_id, move |plugin| async move { plugin.execute(invocation).await })
            .await
    }

    /// Offers content to one interceptor, with the same accounting as
    /// `execute_plugin`.
    pub async fn intercept(
        &self,
        plugin_id: &str,
        request: &InterceptRequest,
    ) -> KoraResult<Option<Vec<ContentUnit>>> {
        let request = request.clone();
        self.invoke(plugin_id, move |plugin| async move {
            plugin.intercept_message(&request).await
        })
        .await
    }

    async fn invoke<T, F, Fut>(&self, plugin_id: &str, call: F) -> KoraResult<T>
    where
        F: FnOnce(Arc<dyn Plugin>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let (instance, serial) = self
            .registry
            .read(plugin_id, |e| match e.state {
                PluginState::Error => Err(KoraError::PluginInErrorState(plugin_id.to_string())),
                PluginState::Active if e.enabled => e
                    .instance
                    .clone()
                    .map(|i| (i, e.serial.clone()))
                    .ok_or_else(|| KoraError::NotActive(plugin_id.to_string())),
                _ => Err(KoraError::NotActive(plugin_id.to_string())),
            })
            .await??;

        let _turn = match &serial {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let outcome = self.guarded(self.policy.execution_timeout, call(instance)).await;
        match outcome {
            Ok(value) => {
                // The plugin may have been unregistered while it ran.
                if let Err(e) = self
                    .registry
                    .update(plugin_id, |e| {
                        e.consecutive_failures = 0;
                        e.execution_count += 1;
                        e.last_activity = Some(Utc::now());
                        Ok(())
                    })
                    .await
                {
                    warn!(plugin_id = %plugin_id, error = %e, "Could not record plugin execution");
                }
                Ok(value)
            }
            Err(failure) => Err(self.record_failure(plugin_id, failure).await),
        }
    }

    async fn record_failure(&self, plugin_id: &str, failure: HookFailure) -> KoraError {
        let threshold = self.policy.failure_threshold;
        let message = failure.to_string();
        let tripped = self
            .registry
            .update(plugin_id, |e| {
                e.consecutive_failures += 1;
                e.error_count += 1;
                e.execution_count += 1;
                e.last_activity = Some(Utc::now());
                e.last_error = Some(message.clone());
                Ok((e.consecutive_failures >= threshold && e.state != PluginState::Error)
                    .then_some(e.consecutive_failures))
            })
            .await
            .ok()
            .flatten();

        warn!(plugin_id = %plugin_id, error = %message, "❌ Plugin execution failed");
        if let Some(failures) = tripped {
            if self.transition(plugin_id, PluginState::Error).await.is_ok() {
                error!(
                    plugin_id = %plugin_id,
                    consecutive_failures = failures,
                    "🛑 Circuit breaker opened; plugin moved to error state"
                );
                self.events
                    .publish(KoraEventData::PluginCircuitOpened {
                        plugin_id: plugin_id.to_string(),
                        consecutive_failures: failures,
                    })
                    .await;
            }
        }

        match failure {
            HookFailure::TimedOut(_) => KoraError::Timeout(format!("plugin '{}' {}", plugin_id, message)),
            _ => KoraError::Execution(message),
        }
    }

    // ============================================================
    // Queries
    // ============================================================

    pub async fn get_plugins_by_capability(&self, capability: &str) -> Vec<String> {
        self.registry.by_capability(capability).await
    }

    pub async fn find_plugins_for_capabilities(&self, required: &[&str]) -> Vec<String> {
        self.registry.for_capabilities(required).await
    }

    pub async fn list_plugins(&self) -> Vec<PluginSnapshot> {
        self.registry.snapshots().await
    }

    pub async fn get_plugin(&self, plugin_id: &str) -> Option<PluginSnapshot> {
        self.registry.read(plugin_id, PluginEntry::snapshot).await.ok()
    }

    /// First dispatchable plugin among `allowed` that provides `tool_name`,
    /// by id order.
    pub async fn find_tool_provider(&self, tool_name: &str, allowed: &[String]) -> Option<String> {
        let mut ids = self
            .registry
            .collect(
                |e| {
                    e.is_dispatchable()
                        && allowed.contains(&e.descriptor.id)
                        && e.descriptor.provides_tool(tool_name)
                },
                |e| e.descriptor.id.clone(),
            )
            .await;
        ids.sort();
        ids.into_iter().next()
    }

    /// Function tools offered by the given dispatchable plugins.
    pub async fn tool_specs(&self, plugin_ids: &[String]) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .registry
            .collect(
                |e| e.is_dispatchable() && plugin_ids.contains(&e.descriptor.id),
                |e| {
                    e.descriptor
                        .provided_tools
                        .iter()
                        .cloned()
                        .map(|t| {
                            t.with_source(ToolSource::Plugin {
                                plugin_id: e.descriptor.id.clone(),
                            })
                        })
                        .collect::<Vec<_>>()
                },
            )
            .await
            .into_iter()
            .flatten()
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// In-process `message.intercept` plugins that are dispatchable, in the
    /// order given.
    pub async fn interceptors(&self, order: &[String]) -> Vec<String> {
        let eligible = self
            .registry
            .collect(
                |e| {
                    e.is_dispatchable()
                        && e.descriptor.kind.is_in_process()
                        && e.descriptor.declares(capabilities::MESSAGE_INTERCEPT)
                },
                |e| e.descriptor.id.clone(),
            )
            .await;
        order.iter().filter(|id| eligible.contains(id)).cloned().collect()
    }

    // ============================================================
    // Configuration
    // ============================================================

    /// Merges `partial` into the current config, validates the result and
    /// applies it. Invalid input leaves the plugin untouched.
    pub async fn update_plugin_config(&self, plugin_id: &str, partial: ConfigMap) -> KoraResult<ConfigMap> {
        let (mut merged, required, instance) = self
            .registry
            .read(plugin_id, |e| {
                (
                    e.config.clone(),
                    e.descriptor.required_config_keys.clone(),
                    e.instance.clone(),
                )
            })
            .await?;
        for (key, value) in partial {
            merged.insert(key, value);
        }
        self.apply_config(plugin_id, merged, &required, instance).await
    }

    /// Restores the descriptor's default configuration.
    pub async fn reset_plugin_config(&self, plugin_id: &str) -> KoraResult<ConfigMap> {
        let (defaults, required, instance) = self
            .registry
            .read(plugin_id, |e| {
                (
                    e.descriptor.default_config.clone(),
                    e.descriptor.required_config_keys.clone(),
                    e.instance.clone(),
                )
            })
            .await?;
        self.apply_config(plugin_id, defaults, &required, instance).await
    }

    async fn apply_config(
        &self,
        plugin_id: &str,
        config: ConfigMap,
        required: &[String],
        instance: Option<Arc<dyn Plugin>>,
    ) -> KoraResult<ConfigMap> {
        if let Some(missing) = required.iter().find(|k| config.get(*k).map_or(true, Value::is_null)) {
            return Err(KoraError::InvalidConfig(format!(
                "plugin '{}': required key '{}' is missing",
                plugin_id, missing
            )));
        }
        if let Some(instance) = &instance {
            instance
                .validate_config(&config)
                .map_err(|msg| KoraError::InvalidConfig(format!("plugin '{}': {}", plugin_id, msg)))?;
        }

        self.registry
            .update(plugin_id, |e| {
                e.config = config.clone();
                Ok(())
            })
            .await?;
        if let Some(instance) = instance {
            if let Err(message) = self
                .guarded(self.policy.hook_timeout, instance.on_config_changed(&config))
                .await
            {
                warn!(plugin_id = %plugin_id, error = %message, "on_config_changed failed");
            }
        }
        info!(plugin_id = %plugin_id, "Plugin configuration updated");
        Ok(config)
    }

    /// Unloads every plugin in registration order.
    pub async fn shutdown(&self) {
        for id in self.registry.ids().await {
            if let Err(e) = self.unload(&id).await {
                warn!(plugin_id = %id, error = %e, "Plugin unload during shutdown failed");
            }
        }
    }
}
