use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ContentBody, ContentUnit, KoraError, KoraId, KoraResult};

pub const DEFAULT_MAX_HISTORY: usize = 50;

// ============================================================
// Session
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Simple,
    Advanced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Plugin ids participating in this session, in interception order.
    #[serde(default)]
    pub enabled_plugins: Vec<String>,
    /// Protocol server ids eligible for tool calls. Empty means any connected server.
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            enabled_plugins: Vec::new(),
            mcp_servers: Vec::new(),
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub shared_state: serde_json::Map<String, Value>,
    #[serde(default)]
    pub tool_history: Vec<ToolExecutionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub message_count: u64,
    pub tool_execution_count: u64,
    pub successful_tool_executions: u64,
    pub total_execution_ms: u64,
    pub error_count: u64,
    pub success_rate: f64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            message_count: 0,
            tool_execution_count: 0,
            successful_tool_executions: 0,
            total_execution_ms: 0,
            error_count: 0,
            success_rate: 1.0,
        }
    }
}

impl SessionStats {
    pub fn record_tool_execution(&mut self, record: &ToolExecutionRecord) {
        self.tool_execution_count += 1;
        if record.success {
            self.successful_tool_executions += 1;
        } else {
            self.error_count += 1;
        }
        self.refresh_success_rate();
    }

    fn refresh_success_rate(&mut self) {
        self.success_rate = if self.tool_execution_count == 0 {
            1.0
        } else {
            self.successful_tool_executions as f64 / self.tool_execution_count as f64
        };
    }
}

/// One continuous conversation, exclusively owned by `user_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: KoraId,
    pub user_id: String,
    pub title: String,
    pub status: SessionStatus,
    pub mode: SessionMode,
    pub settings: SessionSettings,
    pub context: SessionContext,
    pub stats: SessionStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, title: Option<String>, mode: SessionMode) -> Self {
        let now = Utc::now();
        Self {
            id: KoraId::new(),
            user_id: user_id.into(),
            title: title.unwrap_or_else(|| format!("Session {}", now.format("%Y-%m-%d %H:%M"))),
            status: SessionStatus::Active,
            mode,
            settings: SessionSettings::default(),
            context: SessionContext::default(),
            stats: SessionStats::default(),
            created_at: now,
            updated_at: now,
            last_activity: now,
        }
    }

    /// Stamps `updated_at`/`last_activity`. Never moves either backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = self.updated_at.max(now);
        self.last_activity = self.last_activity.max(now);
    }

    #[must_use]
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }

    /// Appends to the history, keeping creation timestamps non-decreasing.
    pub fn append_message(&mut self, mut message: Message) -> KoraResult<()> {
        if message.session_id != self.id {
            return Err(KoraError::Internal(format!(
                "message {} belongs to session {}, not {}",
                message.id, message.session_id, self.id
            )));
        }
        if let Some(last) = self.context.messages.last() {
            if message.created_at < last.created_at {
                message.created_at = last.created_at;
            }
        }
        self.context.messages.push(message);
        self.stats.message_count += 1;
        self.touch();
        Ok(())
    }

    pub fn message_mut(&mut self, id: KoraId) -> Option<&mut Message> {
        self.context.messages.iter_mut().find(|m| m.id == id)
    }

    /// Appends an execution record and folds it into the statistics.
    pub fn record_execution(&mut self, record: ToolExecutionRecord) {
        self.stats.record_tool_execution(&record);
        self.stats.total_execution_ms += record.duration_ms;
        self.context.tool_history.push(record);
        self.touch();
    }

    /// The most recent `max_history` messages.
    #[must_use]
    pub fn recent_history(&self) -> &[Message] {
        let messages = &self.context.messages;
        let cap = self.settings.max_history.max(1);
        &messages[messages.len().saturating_sub(cap)..]
    }

    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            user_id: self.user_id.clone(),
            title: self.title.clone(),
            status: self.status,
            mode: self.mode,
            message_count: self.stats.message_count,
            updated_at: self.updated_at,
            last_activity: self.last_activity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: KoraId,
    pub user_id: String,
    pub title: String,
    pub status: SessionStatus,
    pub mode: SessionMode,
    pub message_count: u64,
    pub updated_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

// ============================================================
// Message
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Pending,
    Streaming,
    Completed,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<KoraId>,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A message is frozen once `completed`: afterwards only the status and
/// streaming flag can change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: KoraId,
    session_id: KoraId,
    role: Role,
    content: Vec<ContentUnit>,
    metadata: MessageMetadata,
    created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: KoraId, role: Role, content: Vec<ContentUnit>) -> Self {
        Self {
            id: KoraId::new(),
            session_id,
            role,
            content,
            metadata: MessageMetadata::default(),
            created_at: Utc::now(),
        }
    }

    pub fn completed(session_id: KoraId, role: Role, content: Vec<ContentUnit>) -> Self {
        let mut message = Self::new(session_id, role, content);
        message.metadata.status = MessageStatus::Completed;
        message
    }

    pub fn id(&self) -> KoraId {
        self.id
    }

    pub fn session_id(&self) -> KoraId {
        self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &[ContentUnit] {
        &self.content
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> MessageStatus {
        self.metadata.status
    }

    pub fn is_frozen(&self) -> bool {
        self.metadata.status == MessageStatus::Completed
    }

    pub fn push_content(&mut self, unit: ContentUnit) -> KoraResult<()> {
        self.ensure_mutable()?;
        self.content.push(unit);
        Ok(())
    }

    pub fn metadata_mut(&mut self) -> KoraResult<&mut MessageMetadata> {
        self.ensure_mutable()?;
        Ok(&mut self.metadata)
    }

    pub fn set_status(&mut self, status: MessageStatus) {
        self.metadata.status = status;
    }

    pub fn set_streaming(&mut self, streaming: bool) {
        self.metadata.streaming = streaming;
    }

    /// Concatenated text of all text units.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentUnit::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn ensure_mutable(&self) -> KoraResult<()> {
        if self.is_frozen() {
            return Err(KoraError::Internal(format!(
                "message {} is completed and can no longer be edited",
                self.id
            )));
        }
        Ok(())
    }
}

// ============================================================
// Tool calls
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCallKind {
    Function,
    McpTool,
    Plugin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            stack: None,
        }
    }
}

impl From<&KoraError> for ToolError {
    fn from(e: &KoraError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

/// One invocation of a capability.
///
/// Moves `pending -> running -> completed | error` and is terminal once
/// resolved. A retry is a new call with a fresh id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub kind: ToolCallKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub parameters: Value,
    status: ToolCallStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    result: Option<Value>,
    error: Option<ToolError>,
}

impl ToolCall {
    pub fn new(kind: ToolCallKind, name: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: KoraId::new().to_string(),
            kind,
            name: name.into(),
            server_id: None,
            parameters,
            status: ToolCallStatus::Pending,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn status(&self) -> ToolCallStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&ToolError> {
        self.error.as_ref()
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.status, ToolCallStatus::Completed | ToolCallStatus::Error)
    }

    pub fn start(&mut self) -> KoraResult<()> {
        self.transition(ToolCallStatus::Pending, ToolCallStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, result: Value) -> KoraResult<()> {
        self.transition(ToolCallStatus::Running, ToolCallStatus::Completed)?;
        self.ended_at = Some(Utc::now());
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: ToolError) -> KoraResult<()> {
        self.transition(ToolCallStatus::Running, ToolCallStatus::Error)?;
        self.ended_at = Some(Utc::now());
        self.error = Some(error);
        Ok(())
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let (start, end) = (self.started_at?, self.ended_at?);
        Some(u64::try_from((end - start).num_milliseconds()).unwrap_or(0))
    }

    fn transition(&mut self, from: ToolCallStatus, to: ToolCallStatus) -> KoraResult<()> {
        if self.status != from {
            return Err(KoraError::Internal(format!(
                "tool call {} cannot move from {:?} to {:?}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }
}

/// Immutable audit entry for one resolved tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub id: KoraId,
    pub session_id: KoraId,
    pub tool_call: ToolCall,
    pub input: Value,
    pub output: Option<Value>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<ToolError>,
    pub recorded_at: DateTime<Utc>,
}

impl ToolExecutionRecord {
    pub fn from_resolved(session_id: KoraId, call: &ToolCall) -> KoraResult<Self> {
        if !call.is_resolved() {
            return Err(KoraError::Internal(format!(
                "tool call {} is still {:?}",
                call.id,
                call.status()
            )));
        }
        Ok(Self {
            id: KoraId::new(),
            session_id,
            tool_call: call.clone(),
            input: call.parameters.clone(),
            output: call.result().cloned(),
            duration_ms: call.duration_ms().unwrap_or(0),
            success: call.status() == ToolCallStatus::Completed,
            error: call.error().cloned(),
            recorded_at: Utc::now(),
        })
    }

    /// The record as a `tool-result` content unit.
    pub fn to_content(&self) -> ContentUnit {
        let output = match (&self.output, &self.error) {
            (Some(output), _) => output.clone(),
            (None, Some(err)) => serde_json::json!({ "code": err.code, "message": err.message }),
            (None, None) => Value::Null,
        };
        ContentUnit::new(
            ContentBody::ToolResult {
                tool_call_id: self.tool_call.id.clone(),
                output,
                is_error: !self.success,
            },
            crate::Originator::Tool,
        )
    }
}
