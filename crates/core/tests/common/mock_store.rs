use async_trait::async_trait;
use kora_core::db::MemorySessionStore;
use kora_shared::{KoraId, Session, SessionStore, SessionSummary};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// In-memory store whose writes can be switched to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemorySessionStore,
    failing: AtomicBool,
    failed_saves: AtomicUsize,
}

impl FlakyStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn failed_saves(&self) -> usize {
        self.failed_saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn save(&self, session: &Session) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            self.failed_saves.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("disk full");
        }
        self.inner.save(session).await
    }

    async fn load(&self, id: KoraId) -> anyhow::Result<Option<Session>> {
        self.inner.load(id).await
    }

    async fn delete(&self, id: KoraId) -> anyhow::Result<()> {
        self.inner.delete(id).await
    }

    async fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<SessionSummary>> {
        self.inner.list_for_user(user_id).await
    }
}
