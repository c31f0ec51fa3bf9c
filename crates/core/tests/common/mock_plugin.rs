use anyhow::Result;
use async_trait::async_trait;
use kora_shared::{
    capabilities, ContentUnit, InterceptRequest, Plugin, PluginDescriptor, PluginInitContext,
    PluginInvocation, PluginKind, ToolSpec,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Echo,
    Fail,
    Panic,
    Sleep(Duration),
}

type Rewrite = Box<dyn Fn(&[ContentUnit]) -> Vec<ContentUnit> + Send + Sync>;

/// Configurable native plugin that counts what the manager asks of it.
pub struct MockPlugin {
    descriptor: PluginDescriptor,
    behavior: Behavior,
    rewrite: Option<Rewrite>,
    init_fails: bool,
    executions: AtomicUsize,
    intercepts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockPlugin {
    fn base(descriptor: PluginDescriptor) -> Self {
        Self {
            descriptor,
            behavior: Behavior::Echo,
            rewrite: None,
            init_fails: false,
            executions: AtomicUsize::new(0),
            intercepts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Native plugin providing one function tool.
    pub fn tool(id: &str, tool_name: &str) -> Self {
        Self::base(
            PluginDescriptor::new(id, format!("Mock {}", id), PluginKind::Native)
                .with_capability(capabilities::FUNCTION_TOOLS)
                .with_tool(ToolSpec::new(tool_name, "mock tool")),
        )
    }

    /// Message interceptor that rewrites content with `rewrite`.
    pub fn interceptor<F>(id: &str, rewrite: F) -> Self
    where
        F: Fn(&[ContentUnit]) -> Vec<ContentUnit> + Send + Sync + 'static,
    {
        let mut plugin = Self::base(
            PluginDescriptor::new(id, format!("Mock {}", id), PluginKind::Native)
                .with_capability(capabilities::MESSAGE_INTERCEPT),
        );
        plugin.rewrite = Some(Box::new(rewrite));
        plugin
    }

    #[must_use]
    pub fn behaving(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    #[must_use]
    pub fn serialized(mut self) -> Self {
        self.descriptor = self.descriptor.with_capability(capabilities::SERIALIZE);
        self
    }

    #[must_use]
    pub fn depends_on(mut self, plugin_id: &str) -> Self {
        self.descriptor = self.descriptor.with_dependency(plugin_id);
        self
    }

    #[must_use]
    pub fn requiring(mut self, key: &str) -> Self {
        self.descriptor = self.descriptor.with_required_key(key);
        self
    }

    #[must_use]
    pub fn failing_init(mut self) -> Self {
        self.init_fails = true;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn intercepts(&self) -> usize {
        self.intercepts.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `execute` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn run(&self) -> Result<()> {
        match self.behavior {
            Behavior::Echo => Ok(()),
            Behavior::Fail => Err(anyhow::anyhow!("intentional failure")),
            Behavior::Panic => panic!("Intentional test panic"),
            Behavior::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Plugin for MockPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        self.descriptor.clone()
    }

    async fn on_init(&self, _ctx: PluginInitContext) -> Result<()> {
        if self.init_fails {
            anyhow::bail!("init refused");
        }
        Ok(())
    }

    async fn execute(&self, invocation: PluginInvocation) -> Result<Value> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let outcome = self.run().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome?;
        Ok(json!({
            "plugin": self.descriptor.id,
            "operation": invocation.operation,
            "parameters": invocation.parameters,
            "session_id": invocation.session_id.map(|id| id.to_string()),
        }))
    }

    async fn intercept_message(&self, request: &InterceptRequest) -> Result<Option<Vec<ContentUnit>>> {
        self.intercepts.fetch_add(1, Ordering::SeqCst);
        self.run().await?;
        Ok(self.rewrite.as_ref().map(|f| f(&request.content)))
    }
}
