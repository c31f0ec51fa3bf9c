use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use inventory;
pub use kora_macros::kora_plugin;

mod content;
mod error;
mod events;
mod plugin;
mod ports;
mod session;

pub use content::{ContentBody, ContentKind, ContentMeta, ContentUnit, Originator};
pub use error::{KoraError, KoraResult, ResourceKind, ValidationError, ValidationErrorKind};
pub use events::{KoraEvent, KoraEventData};
pub use plugin::{
    capabilities, ConfigMap, InterceptRequest, Plugin, PluginConfig, PluginDescriptor,
    PluginFactory, PluginInitContext, PluginInvocation, PluginKind, PluginRegistrar, PluginState,
};
pub use ports::{
    Generation, GenerationRequest, Generator, ProposedToolCall, SessionStore, ToolSource,
    ToolSpec, Usage,
};
pub use session::{
    Message, MessageMetadata, MessageStatus, Role, Session, SessionContext, SessionMode,
    SessionSettings, SessionStats, SessionStatus, SessionSummary, ToolCall, ToolCallKind,
    ToolCallStatus, ToolError, ToolExecutionRecord, DEFAULT_MAX_HISTORY,
};

/// Version of the Kora crates, announced to protocol servers on connect.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Unique identifier for sessions, messages, records and traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KoraId(Uuid);

impl std::fmt::Display for KoraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for KoraId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for KoraId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl KoraId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn new_trace_id() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id derived from a name (UUID v5).
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes()))
    }
}

/// Caller identity supplied by the authentication collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    user_id: Option<String>,
}

impl RequestContext {
    pub fn authenticated(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }

    #[must_use]
    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|u| !u.is_empty())
    }

    pub fn require_user(&self) -> KoraResult<&str> {
        self.user_id().ok_or(KoraError::Unauthenticated)
    }
}
