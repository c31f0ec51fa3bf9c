use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ContentUnit, KoraId, Message, Session, SessionSummary, ToolCallKind};

/// Where a tool offered to the generator is served from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ToolSource {
    Plugin { plugin_id: String },
    Mcp { server_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ToolSource>,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema: empty_schema(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: ToolSource) -> Self {
        self.source = Some(source);
        self
    }
}

// ============================================================
// Generator port
// ============================================================

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub session_id: KoraId,
    pub system_context: String,
    /// Prior conversation, capped to the session history limit.
    pub history: Vec<Message>,
    /// The (possibly intercepted) content of the current user turn.
    pub content: Vec<ContentUnit>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub kind: ToolCallKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

impl ProposedToolCall {
    pub fn new(kind: ToolCallKind, name: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: None,
            kind,
            name: name.into(),
            server_id: None,
            parameters,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub content: Vec<ContentUnit>,
    #[serde(default)]
    pub tool_calls: Vec<ProposedToolCall>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Opaque model backend: turns context into content and proposed tool calls.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str {
        "generator"
    }

    async fn generate(&self, request: GenerationRequest) -> anyhow::Result<Generation>;
}

// ============================================================
// Persistence port
// ============================================================

/// Durable session storage. Called write-through after every mutation.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session: &Session) -> anyhow::Result<()>;
    async fn load(&self, id: KoraId) -> anyhow::Result<Option<Session>>;
    async fn delete(&self, id: KoraId) -> anyhow::Result<()>;
    async fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<SessionSummary>>;
}
