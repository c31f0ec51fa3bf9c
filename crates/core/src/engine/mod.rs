//! Agent Engine: turns a user message into a model response.
//!
//! Sessions live in a concurrent map of per-session slots. A slot's
//! `Mutex<Session>` serializes every mutation of that session, so messages
//! are appended strictly in order while different sessions progress in
//! parallel. Tool calls run on detached tasks and deliver their execution
//! records to the slot's inbox; a cancelled request therefore leaves its
//! tool calls running, and their records are folded into the history at the
//! next operation on the session. The abandoned assistant message receives
//! those results and is completed once its last call resolves.

mod dispatch;

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use kora_shared::{
    ContentUnit, Generation, GenerationRequest, Generator, InterceptRequest, KoraError,
    KoraEventData, KoraId, KoraResult, Message, MessageStatus, Originator, ProposedToolCall,
    RequestContext, ResourceKind, Role, Session, SessionMode, SessionSettings, SessionStatus,
    SessionStore, SessionSummary, ToolCall, ToolCallStatus, ToolError, ToolExecutionRecord,
    ToolSpec, Usage, ValidationError, DEFAULT_MAX_HISTORY,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::content::ContentPipeline;
use crate::events::EventBus;
use crate::managers::{McpClientManager, PluginManager};
use dispatch::{DispatchScope, ToolDispatcher};

/// How the outputs of several message interceptors combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterceptionMode {
    /// Every interceptor sees the original content; the last non-empty
    /// answer replaces it.
    #[default]
    LastWins,
    /// Each interceptor receives the previous one's output.
    Compose,
}

impl FromStr for InterceptionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last-wins" | "last_wins" => Ok(Self::LastWins),
            "compose" => Ok(Self::Compose),
            other => anyhow::bail!(
                "Unknown interception mode '{}' (expected 'last-wins' or 'compose')",
                other
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub system_prompt: String,
    /// History cap given to new sessions.
    pub default_max_history: usize,
    /// Upper bound for one protocol tool call.
    pub tool_timeout: Duration,
    pub interception_mode: InterceptionMode,
    /// Resident sessions idle for longer are dropped from memory.
    pub session_idle: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful assistant. Use the available tools when they help answer the user."
                .to_string(),
            default_max_history: DEFAULT_MAX_HISTORY,
            tool_timeout: Duration::from_secs(30),
            interception_mode: InterceptionMode::LastWins,
            session_idle: Some(Duration::from_secs(3600)),
        }
    }
}

/// Collaborators the engine coordinates.
#[derive(Clone)]
pub struct EngineServices {
    pub generator: Arc<dyn Generator>,
    pub store: Arc<dyn SessionStore>,
    pub plugins: Arc<PluginManager>,
    pub mcp: Arc<McpClientManager>,
    pub content: Arc<ContentPipeline>,
    pub events: EventBus,
}

/// Fields of a session a caller may change. `None` leaves a field as is;
/// `shared_state` entries are merged key by key.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub title: Option<String>,
    pub status: Option<SessionStatus>,
    pub mode: Option<SessionMode>,
    pub settings: Option<SessionSettings>,
    pub shared_state: Option<serde_json::Map<String, Value>>,
}

/// An attachment that failed validation and was left out of the message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentRejection {
    /// Position in the attachment list passed to `process_message`.
    pub index: usize,
    pub error: ValidationError,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentResponse {
    pub session_id: KoraId,
    /// The assistant message, including one `tool-result` unit per tool call.
    pub message: Message,
    pub tool_calls: Vec<ToolCall>,
    pub rejected_content: Vec<ContentRejection>,
    pub usage: Usage,
    /// Set when generation failed; the user message is still recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl AgentResponse {
    #[must_use]
    pub fn failed_tool_calls(&self) -> Vec<&ToolCall> {
        self.tool_calls
            .iter()
            .filter(|c| c.status() == ToolCallStatus::Error)
            .collect()
    }
}

struct SessionSlot {
    id: KoraId,
    owner: String,
    session: Arc<Mutex<Session>>,
    inbox: std::sync::Mutex<Vec<ToolExecutionRecord>>,
    /// Tool call id to the assistant message still waiting for its result.
    replies: std::sync::Mutex<HashMap<String, KoraId>>,
    in_flight: AtomicUsize,
    /// Set, under the session lock, once the slot leaves the map.
    retired: AtomicBool,
    /// The last save of this session failed.
    unsaved: AtomicBool,
}

impl SessionSlot {
    fn new(session: Session) -> Arc<Self> {
        Arc::new(Self {
            id: session.id,
            owner: session.user_id.clone(),
            session: Arc::new(Mutex::new(session)),
            inbox: std::sync::Mutex::new(Vec::new()),
            replies: std::sync::Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            unsaved: AtomicBool::new(false),
        })
    }

    fn expect_reply(&self, tool_call_id: &str, message_id: KoraId) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tool_call_id.to_string(), message_id);
    }

    /// The message's owner attaches the results itself.
    fn claim_replies(&self, message_id: KoraId) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, waiting| *waiting != message_id);
    }

    fn deliver(&self, record: ToolExecutionRecord) {
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    fn take_inbox(&self) -> Vec<ToolExecutionRecord> {
        std::mem::take(&mut *self.inbox.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
            || !self
                .inbox
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
    }
}

/// Counts a tool call as running on the slot until dropped, including
/// when the task unwinds.
struct InFlight(Arc<SessionSlot>);

impl InFlight {
    fn enter(slot: &Arc<SessionSlot>) -> Self {
        slot.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(slot.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Folds delivered execution records into the session. Results of calls
/// whose request was abandoned go to the message that proposed them.
fn drain_inbox(slot: &SessionSlot, session: &mut Session) -> Vec<ToolExecutionRecord> {
    let records = slot.take_inbox();
    if records.is_empty() {
        return records;
    }

    let mut replies = slot.replies.lock().unwrap_or_else(PoisonError::into_inner);
    let mut answered: Vec<KoraId> = Vec::new();
    for record in &records {
        session.record_execution(record.clone());
        let Some(message_id) = replies.remove(&record.tool_call.id) else {
            continue;
        };
        if let Some(message) = session.message_mut(message_id) {
            if let Err(e) = message.push_content(record.to_content()) {
                warn!(message_id = %message_id, tool_call_id = %record.tool_call.id, error = %e, "Could not attach orphaned tool result");
            }
        }
        if !answered.contains(&message_id) {
            answered.push(message_id);
        }
    }

    for message_id in answered {
        if replies.values().any(|waiting| *waiting == message_id) {
            continue;
        }
        if let Some(message) = session.message_mut(message_id) {
            if message.status() == MessageStatus::Pending {
                message.set_status(MessageStatus::Completed);
                debug!(session_id = %session.id, message_id = %message_id, "Completed message of an abandoned request");
            }
        }
    }
    records
}

fn session_not_found(id: KoraId) -> KoraError {
    KoraError::not_found(ResourceKind::Session, id.to_string())
}

pub struct AgentEngine {
    sessions: DashMap<KoraId, Arc<SessionSlot>>,
    dispatcher: ToolDispatcher,
    services: EngineServices,
    settings: EngineSettings,
}

impl AgentEngine {
    pub fn new(settings: EngineSettings, services: EngineServices) -> Self {
        let dispatcher = ToolDispatcher::new(
            services.plugins.clone(),
            services.mcp.clone(),
            settings.tool_timeout,
        );
        Self {
            sessions: DashMap::new(),
            dispatcher,
            services,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.services.events
    }

    #[must_use]
    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.services.plugins
    }

    #[must_use]
    pub fn mcp(&self) -> &Arc<McpClientManager> {
        &self.services.mcp
    }

    /// Number of sessions currently held in memory.
    #[must_use]
    pub fn resident_sessions(&self) -> usize {
        self.sessions.len()
    }

    // ============================================================
    // Session lifecycle
    // ============================================================

    pub async fn create_session(
        &self,
        ctx: &RequestContext,
        title: Option<String>,
        mode: SessionMode,
    ) -> KoraResult<Session> {
        let user_id = ctx.require_user()?;
        let mut session = Session::new(user_id, title.filter(|t| !t.trim().is_empty()), mode);
        session.settings.max_history = self.settings.default_max_history;
        let snapshot = session.clone();

        let slot = SessionSlot::new(session);
        self.sessions.insert(snapshot.id, slot.clone());
        self.persist(&slot, &snapshot).await;
        info!(session_id = %snapshot.id, user_id = %user_id, mode = ?mode, "✅ Session created");
        self.services
            .events
            .publish(KoraEventData::SessionCreated {
                session_id: snapshot.id,
                user_id: user_id.to_string(),
            })
            .await;
        Ok(snapshot)
    }

    /// Pure lookup: never stamps `last_activity`. Soft-deleted sessions are
    /// still visible to their owner.
    pub async fn get_session(&self, ctx: &RequestContext, id: KoraId) -> KoraResult<Option<Session>> {
        let user_id = ctx.require_user()?;
        match self.acquire(user_id, id).await {
            Ok((_, session)) => Ok(Some((*session).clone())),
            Err(KoraError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn update_session(&self, ctx: &RequestContext, id: KoraId, update: SessionUpdate) -> KoraResult<()> {
        let user_id = ctx.require_user()?;
        if let Some(settings) = &update.settings {
            if settings.max_history == 0 {
                return Err(KoraError::InvalidConfig(
                    "max_history must be at least 1".to_string(),
                ));
            }
        }
        if update.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(KoraError::InvalidConfig("title must not be empty".to_string()));
        }

        let (slot, mut session) = self.acquire(user_id, id).await?;
        drain_inbox(&slot, &mut session);
        if let Some(title) = update.title {
            session.title = title;
        }
        if let Some(status) = update.status {
            session.status = status;
        }
        if let Some(mode) = update.mode {
            session.mode = mode;
        }
        if let Some(settings) = update.settings {
            session.settings = settings;
        }
        if let Some(state) = update.shared_state {
            session.context.shared_state.extend(state);
        }
        session.touch();

        self.persist(&slot, &session).await;
        drop(session);
        self.services
            .events
            .publish(KoraEventData::SessionUpdated { session_id: id })
            .await;
        Ok(())
    }

    /// `permanent` removes the session and its stored copy; otherwise the
    /// session moves to `deleted` and stays readable by its owner.
    pub async fn delete_session(&self, ctx: &RequestContext, id: KoraId, permanent: bool) -> KoraResult<()> {
        let user_id = ctx.require_user()?;
        let (slot, mut session) = self.acquire(user_id, id).await?;

        if permanent {
            slot.retired.store(true, Ordering::Release);
            self.sessions.remove(&id);
            if let Err(e) = self.services.store.delete(id).await {
                error!(session_id = %id, error = %e, "❌ Failed to delete persisted session");
            }
            info!(session_id = %id, "🧹 Session permanently deleted");
        } else {
            drain_inbox(&slot, &mut session);
            session.status = SessionStatus::Deleted;
            session.touch();
            self.persist(&slot, &session).await;
            info!(session_id = %id, "Session soft-deleted");
        }
        drop(session);

        self.services
            .events
            .publish(KoraEventData::SessionDeleted {
                session_id: id,
                permanent,
            })
            .await;
        Ok(())
    }

    /// The caller's sessions, resident and persisted, newest activity first.
    pub async fn list_sessions(&self, ctx: &RequestContext) -> KoraResult<Vec<SessionSummary>> {
        let user_id = ctx.require_user()?;
        let resident: Vec<Arc<SessionSlot>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().owner == user_id)
            .map(|entry| entry.value().clone())
            .collect();

        let mut summaries = Vec::with_capacity(resident.len());
        for slot in resident {
            summaries.push(slot.session.lock().await.summary());
        }
        let mut seen: HashSet<KoraId> = summaries.iter().map(|s| s.id).collect();

        match self.services.store.list_for_user(user_id).await {
            Ok(stored) => summaries.extend(stored.into_iter().filter(|s| seen.insert(s.id))),
            Err(e) => warn!(user_id = %user_id, error = %e, "Could not list persisted sessions"),
        }
        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(summaries)
    }

    // ============================================================
    // Messages
    // ============================================================

    /// Appends the user turn, runs interception and generation, dispatches
    /// the proposed tool calls and records their results.
    ///
    /// Only failures that prevent recording the user message are returned
    /// as errors. Rejected attachments, interceptor failures, a failed
    /// generation and failed tool calls are reported inside the response.
    pub async fn process_message(
        &self,
        ctx: &RequestContext,
        session_id: KoraId,
        text: &str,
        attachments: Vec<ContentUnit>,
    ) -> KoraResult<AgentResponse> {
        let started = Instant::now();
        let trace_id = KoraId::new_trace_id();
        let user_id = ctx.require_user()?.to_string();
        let (slot, mut session) = self.acquire(&user_id, session_id).await?;
        if session.status == SessionStatus::Deleted {
            return Err(session_not_found(session_id));
        }
        drain_inbox(&slot, &mut session);

        let (content, rejected) = self.prepare_content(text, attachments)?;
        for rejection in &rejected {
            warn!(
                session_id = %session_id,
                index = rejection.index,
                error = %rejection.error,
                "❌ Dropped invalid content unit"
            );
            session.stats.error_count += 1;
            self.services
                .events
                .publish_traced(
                    trace_id,
                    KoraEventData::ContentDropped {
                        session_id,
                        index: rejection.index,
                        reason: rejection.error.to_string(),
                    },
                )
                .await;
        }

        let history = session.recent_history().to_vec();
        let user_message = Message::completed(session_id, Role::User, content.clone());
        let user_message_id = user_message.id();
        session.append_message(user_message)?;
        self.message_appended(trace_id, session_id, user_message_id).await;

        let content = self.intercept(&session, &user_id, content).await;
        let request = GenerationRequest {
            session_id,
            system_context: self.settings.system_prompt.clone(),
            history,
            content,
            tools: self.available_tools(&session.settings).await,
        };
        debug!(
            session_id = %session_id,
            history = request.history.len(),
            tools = request.tools.len(),
            generator = %self.services.generator.name(),
            "Requesting generation"
        );

        let generation = match self.services.generator.generate(request).await {
            Ok(generation) => generation,
            Err(e) => {
                let reason = format!("{:#}", e);
                error!(session_id = %session_id, error = %reason, "❌ Generation failed");
                let mut message = Message::new(session_id, Role::Assistant, Vec::new());
                let meta = message.metadata_mut()?;
                meta.parent_id = Some(user_message_id);
                meta.error = Some(reason.clone());
                message.set_status(MessageStatus::Error);
                let message_id = message.id();
                session.stats.error_count += 1;
                session.append_message(message)?;
                self.message_appended(trace_id, session_id, message_id).await;

                let message = find_message(&session, message_id)?;
                self.persist(&slot, &session).await;
                drop(session);
                return Ok(AgentResponse {
                    session_id,
                    message,
                    tool_calls: Vec::new(),
                    rejected_content: rejected,
                    usage: Usage::default(),
                    error: Some(reason),
                    duration_ms: elapsed_ms(started),
                });
            }
        };

        let Generation {
            content: generated,
            tool_calls: proposed,
            usage,
            model,
        } = generation;
        let mut assistant = Message::new(session_id, Role::Assistant, generated);
        let meta = assistant.metadata_mut()?;
        meta.model = model;
        meta.prompt_tokens = Some(usage.prompt_tokens);
        meta.completion_tokens = Some(usage.completion_tokens);
        meta.parent_id = Some(user_message_id);
        let assistant_id = assistant.id();
        session.append_message(assistant)?;

        // Calls start before the next await so an abandoned request always
        // leaves the message with replies to wait for.
        let scope = DispatchScope::for_session(&session, &user_id);
        let mut pending = Vec::with_capacity(proposed.len());
        let mut seen_ids = HashSet::new();
        for proposal in proposed {
            let call = tool_call_from(proposal, &mut seen_ids);
            slot.expect_reply(&call.id, assistant_id);
            pending.push(self.spawn_tool_call(trace_id, &slot, &scope, call)?);
        }
        if pending.is_empty() {
            if let Some(message) = session.message_mut(assistant_id) {
                message.metadata_mut()?.execution_ms = Some(elapsed_ms(started));
                message.set_status(MessageStatus::Completed);
            }
        }
        self.message_appended(trace_id, session_id, assistant_id).await;
        let tool_calls = self.settle(&slot, pending).await;

        slot.claim_replies(assistant_id);
        let records = drain_inbox(&slot, &mut session);
        let elapsed = elapsed_ms(started);
        if let Some(message) = session.message_mut(assistant_id).filter(|m| m.status() == MessageStatus::Pending) {
            for call in &tool_calls {
                if let Some(record) = records.iter().find(|r| r.tool_call.id == call.id) {
                    message.push_content(record.to_content())?;
                }
            }
            if let Ok(meta) = message.metadata_mut() {
                meta.execution_ms = Some(elapsed);
            }
            message.set_status(MessageStatus::Completed);
        }
        session.touch();
        let message = find_message(&session, assistant_id)?;

        self.persist(&slot, &session).await;
        drop(session);
        self.services
            .events
            .publish_traced(trace_id, KoraEventData::SessionUpdated { session_id })
            .await;

        let failed = tool_calls
            .iter()
            .filter(|c| c.status() == ToolCallStatus::Error)
            .count();
        info!(
            session_id = %session_id,
            tool_calls = tool_calls.len(),
            failed_tool_calls = failed,
            duration_ms = elapsed,
            "✅ Message processed"
        );

        Ok(AgentResponse {
            session_id,
            message,
            tool_calls,
            rejected_content: rejected,
            usage,
            error: None,
            duration_ms: elapsed,
        })
    }

    /// Runs one tool call for the session and records it, whatever the
    /// outcome. The call must still be `pending`.
    pub async fn execute_tool_call(&self, ctx: &RequestContext, session_id: KoraId, call: ToolCall) -> KoraResult<ToolCall> {
        let user_id = ctx.require_user()?.to_string();
        let (slot, session) = self.acquire(&user_id, session_id).await?;
        if session.status == SessionStatus::Deleted {
            return Err(session_not_found(session_id));
        }
        let scope = DispatchScope::for_session(&session, &user_id);
        // Spawned under the lock so the slot cannot be evicted before the
        // record lands in its inbox.
        let pending = self.spawn_tool_call(KoraId::new_trace_id(), &slot, &scope, call)?;
        drop(session);

        let call = self
            .settle(&slot, vec![pending])
            .await
            .pop()
            .ok_or_else(|| KoraError::Internal("tool call vanished during dispatch".to_string()))?;

        let (slot, mut session) = self.acquire(&scope.user_id, session_id).await?;
        drain_inbox(&slot, &mut session);
        self.persist(&slot, &session).await;
        drop(session);
        self.services
            .events
            .publish(KoraEventData::SessionUpdated { session_id })
            .await;
        Ok(call)
    }

    /// Normalizes the turn's content. The message text must be valid;
    /// attachments that fail are set aside.
    fn prepare_content(
        &self,
        text: &str,
        attachments: Vec<ContentUnit>,
    ) -> KoraResult<(Vec<ContentUnit>, Vec<ContentRejection>)> {
        let mut content = Vec::with_capacity(attachments.len() + 1);
        if !text.trim().is_empty() {
            content.push(
                self.services
                    .content
                    .process(ContentUnit::text(text, Originator::User), None)?,
            );
        }

        let mut rejected = Vec::new();
        for (index, unit) in attachments.into_iter().enumerate() {
            match self.services.content.process(unit, None) {
                Ok(unit) => content.push(unit),
                Err(error) => rejected.push(ContentRejection { index, error }),
            }
        }

        if content.is_empty() {
            return Err(match rejected.into_iter().next() {
                Some(rejection) => KoraError::Validation(rejection.error),
                None => KoraError::Validation(ValidationError::empty("message")),
            });
        }
        Ok((content, rejected))
    }

    async fn intercept(&self, session: &Session, user_id: &str, original: Vec<ContentUnit>) -> Vec<ContentUnit> {
        let interceptors = self
            .services
            .plugins
            .interceptors(&session.settings.enabled_plugins)
            .await;
        if interceptors.is_empty() {
            return original;
        }

        let mode = self.settings.interception_mode;
        let mut current = original;
        let mut winner: Option<Vec<ContentUnit>> = None;
        for plugin_id in interceptors {
            let request = InterceptRequest {
                session_id: session.id,
                user_id: user_id.to_string(),
                content: current.clone(),
            };
            match self.services.plugins.intercept(&plugin_id, &request).await {
                Ok(Some(replaced)) => {
                    debug!(session_id = %session.id, plugin_id = %plugin_id, "Interceptor replaced message content");
                    match mode {
                        InterceptionMode::LastWins => winner = Some(replaced),
                        InterceptionMode::Compose => current = replaced,
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(
                    session_id = %session.id,
                    plugin_id = %plugin_id,
                    error = %e,
                    "❌ Interceptor failed, content passed through unchanged"
                ),
            }
        }
        winner.unwrap_or(current)
    }

    /// Function tools of the session's plugins plus tools of its eligible
    /// protocol servers.
    async fn available_tools(&self, settings: &SessionSettings) -> Vec<ToolSpec> {
        let mut tools = self.services.plugins.tool_specs(&settings.enabled_plugins).await;
        let servers = (!settings.mcp_servers.is_empty()).then_some(settings.mcp_servers.as_slice());
        tools.extend(self.services.mcp.tool_specs(servers).await);
        tools
    }

    /// Starts the call on a detached task. The returned copy stands in for
    /// the call if the task dies before resolving it.
    fn spawn_tool_call(
        &self,
        trace_id: KoraId,
        slot: &Arc<SessionSlot>,
        scope: &DispatchScope,
        mut call: ToolCall,
    ) -> KoraResult<(ToolCall, JoinHandle<ToolCall>)> {
        call.start()?;
        let fallback = call.clone();

        let in_flight = InFlight::enter(slot);
        let scope = scope.clone();
        let dispatcher = self.dispatcher.clone();
        let events = self.services.events.clone();
        let handle = tokio::spawn(async move {
            events
                .publish_traced(
                    trace_id,
                    KoraEventData::ToolCallStarted {
                        session_id: scope.session_id,
                        tool_call_id: call.id.clone(),
                        name: call.name.clone(),
                    },
                )
                .await;
            let call = dispatcher.run(&scope, call).await;
            match ToolExecutionRecord::from_resolved(scope.session_id, &call) {
                Ok(record) => in_flight.0.deliver(record),
                Err(e) => error!(tool_call_id = %call.id, error = %e, "Tool call left unresolved"),
            }
            drop(in_flight);
            events
                .publish_traced(
                    trace_id,
                    KoraEventData::ToolCallFinished {
                        session_id: scope.session_id,
                        tool_call_id: call.id.clone(),
                        status: call.status(),
                        duration_ms: call.duration_ms().unwrap_or(0),
                    },
                )
                .await;
            call
        });
        Ok((fallback, handle))
    }

    /// Waits for every call. A failing call never cancels its siblings.
    async fn settle(&self, slot: &SessionSlot, pending: Vec<(ToolCall, JoinHandle<ToolCall>)>) -> Vec<ToolCall> {
        let (fallbacks, handles): (Vec<_>, Vec<_>) = pending.into_iter().unzip();
        let outcomes = join_all(handles).await;

        fallbacks
            .into_iter()
            .zip(outcomes)
            .map(|(mut fallback, outcome)| match outcome {
                Ok(call) => call,
                Err(e) => {
                    error!(tool_call_id = %fallback.id, error = %e, "❌ Tool call task aborted");
                    let error = ToolError::new("InternalError", format!("tool call task aborted: {}", e));
                    if fallback.fail(error).is_ok() {
                        match ToolExecutionRecord::from_resolved(slot.id, &fallback) {
                            Ok(record) => slot.deliver(record),
                            Err(e) => error!(tool_call_id = %fallback.id, error = %e, "Tool call left unresolved"),
                        }
                    }
                    fallback
                }
            })
            .collect()
    }

    // ============================================================
    // Residency
    // ============================================================

    /// The resident slot, else the stored session. Sessions owned by another
    /// user are reported as missing.
    async fn resolve(&self, user_id: &str, id: KoraId) -> KoraResult<Arc<SessionSlot>> {
        let resident = self.sessions.get(&id).map(|entry| entry.value().clone());
        if let Some(slot) = resident {
            return if slot.owner == user_id {
                Ok(slot)
            } else {
                Err(session_not_found(id))
            };
        }

        let stored = self
            .services
            .store
            .load(id)
            .await
            .map_err(|e| KoraError::Persistence(format!("load session {}: {:#}", id, e)))?;
        match stored {
            Some(session) if session.is_owned_by(user_id) => {
                debug!(session_id = %id, "Session restored from store");
                Ok(self
                    .sessions
                    .entry(id)
                    .or_insert_with(|| SessionSlot::new(session))
                    .value()
                    .clone())
            }
            _ => Err(session_not_found(id)),
        }
    }

    /// Resolves and locks a live slot, retrying if it was evicted meanwhile.
    async fn acquire(&self, user_id: &str, id: KoraId) -> KoraResult<(Arc<SessionSlot>, OwnedMutexGuard<Session>)> {
        loop {
            let slot = self.resolve(user_id, id).await?;
            let guard = slot.session.clone().lock_owned().await;
            if !slot.retired.load(Ordering::Acquire) {
                return Ok((slot, guard));
            }
        }
    }

    /// Write-through. A failed save is logged and marks the slot unsaved,
    /// which keeps it resident until a later save succeeds.
    async fn persist(&self, slot: &SessionSlot, session: &Session) -> bool {
        match self.services.store.save(session).await {
            Ok(()) => {
                slot.unsaved.store(false, Ordering::Release);
                true
            }
            Err(e) => {
                slot.unsaved.store(true, Ordering::Release);
                error!(session_id = %session.id, error = %e, "❌ Failed to persist session");
                false
            }
        }
    }

    /// Retries the save of every resident session whose last save failed.
    /// Returns how many are now persisted.
    pub async fn flush_unsaved(&self) -> usize {
        let unsaved: Vec<Arc<SessionSlot>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().unsaved.load(Ordering::Acquire))
            .map(|entry| entry.value().clone())
            .collect();

        let mut flushed = 0;
        for slot in unsaved {
            let session = slot.session.lock().await;
            if slot.retired.load(Ordering::Acquire) {
                continue;
            }
            if self.persist(&slot, &session).await {
                flushed += 1;
            }
        }
        if flushed > 0 {
            info!(flushed, "💾 Persisted sessions after earlier save failures");
        }
        flushed
    }

    async fn message_appended(&self, trace_id: KoraId, session_id: KoraId, message_id: KoraId) {
        self.services
            .events
            .publish_traced(
                trace_id,
                KoraEventData::MessageAppended {
                    session_id,
                    message_id,
                },
            )
            .await;
    }

    /// Drops resident sessions idle for longer than `idle`. Sessions with
    /// tool calls still running, undrained records or a failed last save
    /// stay.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let Ok(idle) = chrono::Duration::from_std(idle) else {
            return 0;
        };
        let cutoff = Utc::now() - idle;
        let mut evicted = 0;
        self.sessions.retain(|id, slot| {
            let Ok(session) = slot.session.try_lock() else {
                return true;
            };
            if session.last_activity >= cutoff || slot.is_busy() {
                return true;
            }
            if slot.unsaved.load(Ordering::Acquire) {
                debug!(session_id = %id, "Keeping idle session with unsaved changes");
                return true;
            }
            slot.retired.store(true, Ordering::Release);
            debug!(session_id = %id, "Evicting idle session");
            evicted += 1;
            false
        });
        if evicted > 0 {
            info!(evicted, "🧹 Evicted idle sessions");
        }
        evicted
    }

    /// Periodically evicts idle sessions. `None` when eviction is disabled.
    pub fn spawn_eviction_task(self: Arc<Self>, shutdown: Arc<Notify>) -> Option<JoinHandle<()>> {
        let idle = self.settings.session_idle?;
        let period = (idle / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.notified() => {
                        info!("Session eviction task shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.flush_unsaved().await;
                        self.evict_idle(idle);
                    }
                }
            }
        }))
    }
}

fn find_message(session: &Session, id: KoraId) -> KoraResult<Message> {
    session
        .context
        .messages
        .iter()
        .find(|m| m.id() == id)
        .cloned()
        .ok_or_else(|| KoraError::not_found(ResourceKind::Message, id.to_string()))
}

/// Builds a fresh call from a proposal. Ids already used in this batch
/// are replaced so records stay distinguishable.
fn tool_call_from(proposal: ProposedToolCall, seen: &mut HashSet<String>) -> ToolCall {
    let mut call = ToolCall::new(proposal.kind, proposal.name, proposal.parameters);
    if let Some(id) = proposal.id.filter(|id| !id.trim().is_empty()) {
        if !seen.contains(&id) {
            call = call.with_id(id);
        }
    }
    seen.insert(call.id.clone());
    if let Some(server_id) = proposal.server_id {
        call = call.with_server(server_id);
    }
    call
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
