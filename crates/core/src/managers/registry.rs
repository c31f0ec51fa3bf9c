use chrono::{DateTime, Utc};
use kora_shared::{
    capabilities, ConfigMap, KoraError, KoraResult, Plugin, PluginDescriptor, PluginKind,
    PluginState, ResourceKind,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::backends::PluginBackend;

/// Registry-side record of one plugin.
pub struct PluginEntry {
    pub descriptor: PluginDescriptor,
    pub backend: PluginBackend,
    /// Present from `loaded` until teardown.
    pub instance: Option<Arc<dyn Plugin>>,
    pub state: PluginState,
    pub enabled: bool,
    pub config: ConfigMap,
    pub consecutive_failures: u32,
    pub error_count: u64,
    pub execution_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set when the plugin declares `runtime.serialize`.
    pub serial: Option<Arc<Mutex<()>>>,
}

impl PluginEntry {
    #[must_use]
    pub fn new(backend: PluginBackend) -> Self {
        let descriptor = backend.descriptor();
        let serial = descriptor
            .declares(capabilities::SERIALIZE)
            .then(|| Arc::new(Mutex::new(())));
        Self {
            config: descriptor.default_config.clone(),
            descriptor,
            backend,
            instance: None,
            state: PluginState::Unloaded,
            enabled: false,
            consecutive_failures: 0,
            error_count: 0,
            execution_count: 0,
            last_activity: None,
            last_error: None,
            serial,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PluginSnapshot {
        PluginSnapshot {
            id: self.descriptor.id.clone(),
            name: self.descriptor.name.clone(),
            version: self.descriptor.version.clone(),
            kind: self.descriptor.kind,
            state: self.state,
            enabled: self.enabled,
            capabilities: self.descriptor.capabilities.clone(),
            tools: self.descriptor.provided_tools.iter().map(|t| t.name.clone()).collect(),
            config: self.config.clone(),
            consecutive_failures: self.consecutive_failures,
            error_count: self.error_count,
            execution_count: self.execution_count,
            last_activity: self.last_activity,
            last_error: self.last_error.clone(),
        }
    }

    /// Whether the plugin takes part in dispatch right now.
    #[must_use]
    pub fn is_dispatchable(&self) -> bool {
        self.state == PluginState::Active && self.enabled && self.instance.is_some()
    }
}

/// Read-only view handed out by the manager.
#[derive(Debug, Clone, Serialize)]
pub struct PluginSnapshot {
    pub id: String,
    pub name: String,
    pub version: String,
    pub kind: PluginKind,
    pub state: PluginState,
    pub enabled: bool,
    pub capabilities: Vec<String>,
    pub tools: Vec<String>,
    pub config: ConfigMap,
    pub consecutive_failures: u32,
    pub error_count: u64,
    pub execution_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, PluginEntry>,
    /// capability → plugin ids declaring it
    capability_index: HashMap<String, BTreeSet<String>>,
}

impl RegistryInner {
    fn index(&mut self, descriptor: &PluginDescriptor) {
        for cap in &descriptor.capabilities {
            self.capability_index
                .entry(cap.clone())
                .or_default()
                .insert(descriptor.id.clone());
        }
    }

    fn unindex(&mut self, plugin_id: &str) {
        self.capability_index.retain(|_, ids| {
            ids.remove(plugin_id);
            !ids.is_empty()
        });
    }
}

/// Shared plugin table plus the declared-capability index. All access goes
/// through short critical sections; no lock is held across plugin code.
#[derive(Default)]
pub struct PluginRegistry {
    inner: RwLock<RegistryInner>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, entry: PluginEntry) -> KoraResult<()> {
        let mut inner = self.inner.write().await;
        let id = entry.descriptor.id.clone();
        if inner.entries.contains_key(&id) {
            return Err(KoraError::DuplicateId(id));
        }
        inner.index(&entry.descriptor);
        inner.entries.insert(id, entry);
        Ok(())
    }

    pub async fn remove(&self, plugin_id: &str) -> Option<PluginEntry> {
        let mut inner = self.inner.write().await;
        let entry = inner.entries.remove(plugin_id)?;
        inner.unindex(plugin_id);
        Some(entry)
    }

    pub async fn contains(&self, plugin_id: &str) -> bool {
        self.inner.read().await.entries.contains_key(plugin_id)
    }

    /// Runs `f` against a shared view of the entry.
    pub async fn read<T>(&self, plugin_id: &str, f: impl FnOnce(&PluginEntry) -> T) -> KoraResult<T> {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(plugin_id)
            .map(f)
            .ok_or_else(|| KoraError::not_found(ResourceKind::Plugin, plugin_id))
    }

    /// Runs `f` against the entry under the write lock.
    pub async fn update<T>(
        &self,
        plugin_id: &str,
        f: impl FnOnce(&mut PluginEntry) -> KoraResult<T>,
    ) -> KoraResult<T> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(plugin_id)
            .ok_or_else(|| KoraError::not_found(ResourceKind::Plugin, plugin_id))?;
        f(entry)
    }

    /// Replaces a descriptor (tools may change after activation) and
    /// re-indexes its capabilities.
    pub async fn refresh_descriptor(&self, plugin_id: &str, descriptor: PluginDescriptor) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.entries.get_mut(plugin_id) else {
            return;
        };
        entry.descriptor = PluginDescriptor {
            id: plugin_id.to_string(),
            kind: entry.descriptor.kind,
            ..descriptor
        };
        let descriptor = entry.descriptor.clone();
        inner.unindex(plugin_id);
        inner.index(&descriptor);
    }

    pub async fn snapshots(&self) -> Vec<PluginSnapshot> {
        let inner = self.inner.read().await;
        let mut list: Vec<PluginSnapshot> = inner.entries.values().map(PluginEntry::snapshot).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn ids(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn by_capability(&self, capability: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .capability_index
            .get(capability)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Plugins whose declared capability set is a superset of `required`.
    pub async fn for_capabilities(&self, required: &[&str]) -> Vec<String> {
        let inner = self.inner.read().await;
        let Some((first, rest)) = required.split_first() else {
            let mut all: Vec<String> = inner.entries.keys().cloned().collect();
            all.sort();
            return all;
        };
        let Some(candidates) = inner.capability_index.get(*first) else {
            return Vec::new();
        };
        candidates
            .iter()
            .filter(|id| {
                rest.iter().all(|cap| {
                    inner
                        .capability_index
                        .get(*cap)
                        .is_some_and(|ids| ids.contains(*id))
                })
            })
            .cloned()
            .collect()
    }

    /// Picks entries matching `filter` and maps them while holding the read lock.
    pub async fn collect<T>(
        &self,
        filter: impl Fn(&PluginEntry) -> bool,
        map: impl Fn(&PluginEntry) -> T,
    ) -> Vec<T> {
        let inner = self.inner.read().await;
        inner.entries.values().filter(|e| filter(e)).map(map).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Dummy(PluginDescriptor);

    #[async_trait]
    impl Plugin for Dummy {
        fn descriptor(&self) -> PluginDescriptor {
            self.0.clone()
        }
    }

    fn entry(id: &str, caps: &[&str]) -> PluginEntry {
        let mut descriptor = PluginDescriptor::new(id, id, PluginKind::Native);
        for cap in caps {
            descriptor = descriptor.with_capability(*cap);
        }
        PluginEntry::new(PluginBackend::Native(Arc::new(Dummy(descriptor))))
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let registry = PluginRegistry::new();
        registry.insert(entry("a", &["x"])).await.unwrap();
        let err = registry.insert(entry("a", &["y"])).await.unwrap_err();
        assert!(matches!(err, KoraError::DuplicateId(_)));
        assert_eq!(registry.by_capability("y").await, Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_superset_query() {
        let registry = PluginRegistry::new();
        registry.insert(entry("a", &["x", "y"])).await.unwrap();
        registry.insert(entry("b", &["x"])).await.unwrap();
        registry.insert(entry("c", &["y", "z"])).await.unwrap();

        assert_eq!(registry.by_capability("x").await, vec!["a", "b"]);
        assert_eq!(registry.for_capabilities(&["x", "y"]).await, vec!["a"]);
        assert!(registry.for_capabilities(&["x", "z"]).await.is_empty());
        assert_eq!(registry.for_capabilities(&[]).await.len(), 3);
    }

    #[tokio::test]
    async fn test_remove_unindexes() {
        let registry = PluginRegistry::new();
        registry.insert(entry("a", &["x"])).await.unwrap();
        assert!(registry.remove("a").await.is_some());
        assert!(registry.by_capability("x").await.is_empty());
        assert!(registry.remove("a").await.is_none());
    }

    #[test]
    fn test_serialize_capability_creates_mutex() {
        assert!(entry("s", &[capabilities::SERIALIZE]).serial.is_some());
        assert!(entry("c", &["x"]).serial.is_none());
    }
}
