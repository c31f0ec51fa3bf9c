//! Message processing: history, content rejection, generation failure,
//! interception and tool dispatch across plugins and protocol servers.

mod common;

use common::{echo_reply, harness, harness_with, Behavior, MockGenerator, MockPlugin};
use kora_core::managers::mcp_protocol::McpServerConfig;
use kora_core::{EngineSettings, InterceptionMode, SessionUpdate};
use kora_shared::{
    ContentBody, ContentKind, ContentUnit, KoraEventData, KoraId, MessageStatus, Originator,
    ProposedToolCall, RequestContext, Role, SessionMode, SessionSettings, SessionStore, ToolCall,
    ToolCallKind, ToolCallStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn alice() -> RequestContext {
    RequestContext::authenticated("alice")
}

fn image(format: &str) -> ContentUnit {
    ContentUnit::new(
        ContentBody::Image {
            format: format.into(),
            data: "iVBORw0KGgo=".into(),
            alt: None,
            width: None,
            height: None,
        },
        Originator::User,
    )
}

fn code(source: &str) -> ContentUnit {
    ContentUnit::new(
        ContentBody::Code {
            language: "rust".into(),
            source: source.into(),
            executable: false,
        },
        Originator::User,
    )
}

fn tagged(tag: &'static str) -> impl Fn(&[ContentUnit]) -> Vec<ContentUnit> + Send + Sync + 'static {
    move |units| {
        units
            .iter()
            .map(|u| match u.as_text() {
                Some(text) => ContentUnit::text(format!("{} {}", text, tag), Originator::User),
                None => u.clone(),
            })
            .collect()
    }
}

async fn enable(h: &common::Harness, session_id: KoraId, plugins: &[&str], servers: &[&str]) {
    h.engine
        .update_session(&alice(), session_id, SessionUpdate {
            settings: Some(SessionSettings {
                enabled_plugins: plugins.iter().map(ToString::to_string).collect(),
                mcp_servers: servers.iter().map(ToString::to_string).collect(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_message_round_trip() {
    let generator = MockGenerator::echo();
    let h = harness(generator.clone());
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();

    let response = h
        .engine
        .process_message(&alice(), session.id, "hello", Vec::new())
        .await
        .unwrap();

    assert_eq!(response.session_id, session.id);
    assert!(response.error.is_none());
    assert_eq!(response.message.role(), Role::Assistant);
    assert_eq!(response.message.status(), MessageStatus::Completed);
    assert_eq!(response.message.text(), "echo: hello");
    assert_eq!(response.usage.prompt_tokens, 12);
    assert!(response.tool_calls.is_empty());

    let stored = h.engine.get_session(&alice(), session.id).await.unwrap().unwrap();
    assert_eq!(stored.stats.message_count, 2);
    assert_eq!(stored.context.messages[0].role(), Role::User);
    assert_eq!(stored.context.messages[0].text(), "hello");
    assert_eq!(stored.context.messages[1].metadata().parent_id, Some(stored.context.messages[0].id()));
    assert_eq!(stored.context.messages[1].metadata().model.as_deref(), Some("mock-model"));

    let request = generator.last_request().unwrap();
    assert!(request.history.is_empty());
    assert_eq!(request.content.len(), 1);
}

#[tokio::test]
async fn test_history_window_is_capped() {
    let generator = MockGenerator::echo();
    let h = harness(generator.clone());
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();
    h.engine
        .update_session(&alice(), session.id, SessionUpdate {
            settings: Some(SessionSettings {
                max_history: 3,
                ..Default::default()
            }),
            ..Default::default()
        })
        .await
        .unwrap();

    for turn in ["one", "two", "three"] {
        h.engine.process_message(&alice(), session.id, turn, Vec::new()).await.unwrap();
    }

    let requests = generator.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[1].history.len(), 2);
    assert_eq!(requests[2].history.len(), 3);
    assert_eq!(requests[2].history[2].text(), "echo: two");

    let stored = h.engine.get_session(&alice(), session.id).await.unwrap().unwrap();
    assert_eq!(stored.context.messages.len(), 6);
}

#[tokio::test]
async fn test_invalid_attachment_is_dropped_not_fatal() {
    let h = harness(MockGenerator::echo());
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();

    let response = h
        .engine
        .process_message(&alice(), session.id, "look", vec![code("fn main() {}"), image("bmp")])
        .await
        .unwrap();

    assert_eq!(response.rejected_content.len(), 1);
    assert_eq!(response.rejected_content[0].index, 1);
    assert_eq!(response.message.status(), MessageStatus::Completed);

    let stored = h.engine.get_session(&alice(), session.id).await.unwrap().unwrap();
    let user = &stored.context.messages[0];
    let kinds: Vec<ContentKind> = user.content().iter().map(ContentUnit::kind).collect();
    assert_eq!(kinds, vec![ContentKind::Text, ContentKind::Code]);
    assert_eq!(stored.stats.error_count, 1);

    let dropped = h
        .events
        .recent(100)
        .await
        .iter()
        .filter(|e| matches!(e.data, KoraEventData::ContentDropped { index: 1, .. }))
        .count();
    assert_eq!(dropped, 1);
}

#[tokio::test]
async fn test_middle_attachment_rejected_others_kept_in_order() {
    let h = harness(MockGenerator::echo());
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();

    let response = h
        .engine
        .process_message(
            &alice(),
            session.id,
            "three files",
            vec![code("let first = 1;"), image("bmp"), code("let third = 3;")],
        )
        .await
        .unwrap();

    assert_eq!(response.rejected_content.len(), 1);
    assert_eq!(response.rejected_content[0].index, 1);
    assert!(response.error.is_none());

    let stored = h.engine.get_session(&alice(), session.id).await.unwrap().unwrap();
    let user = &stored.context.messages[0];
    let kinds: Vec<ContentKind> = user.content().iter().map(ContentUnit::kind).collect();
    assert_eq!(kinds, vec![ContentKind::Text, ContentKind::Code, ContentKind::Code]);
    let sources: Vec<&str> = user
        .content()
        .iter()
        .filter_map(|u| match &u.body {
            ContentBody::Code { source, .. } => Some(source.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(sources, vec!["let first = 1;", "let third = 3;"]);
    assert_eq!(stored.stats.error_count, 1);
}

#[tokio::test]
async fn test_message_without_valid_content_is_rejected() {
    let generator = MockGenerator::echo();
    let h = harness(generator.clone());
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();

    let err = h
        .engine
        .process_message(&alice(), session.id, "   ", vec![image("bmp")])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ValidationError");

    let err = h
        .engine
        .process_message(&alice(), session.id, "", Vec::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ValidationError");

    let stored = h.engine.get_session(&alice(), session.id).await.unwrap().unwrap();
    assert!(stored.context.messages.is_empty());
    assert!(generator.requests().is_empty());
}

#[tokio::test]
async fn test_generation_failure_keeps_user_message() {
    let h = harness(MockGenerator::failing("model offline"));
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();

    let response = h
        .engine
        .process_message(&alice(), session.id, "anyone?", Vec::new())
        .await
        .unwrap();

    let reason = response.error.expect("generation error reported");
    assert!(reason.contains("model offline"));
    assert_eq!(response.message.status(), MessageStatus::Error);
    assert_eq!(response.message.metadata().error.as_deref(), Some(reason.as_str()));

    let stored = h.engine.get_session(&alice(), session.id).await.unwrap().unwrap();
    assert_eq!(stored.context.messages.len(), 2);
    assert_eq!(stored.context.messages[0].text(), "anyone?");
    assert_eq!(stored.stats.error_count, 1);
}

#[tokio::test]
async fn test_sessions_are_isolated_under_concurrency() {
    let generator = Arc::new(MockGenerator::from_fn(echo_reply).with_delay(Duration::from_millis(20)));
    let h = harness(generator);
    let a = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();
    let b = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();

    let ctx = alice();
    let (ra, rb) = tokio::join!(
        h.engine.process_message(&ctx, a.id, "for a", Vec::new()),
        h.engine.process_message(&ctx, b.id, "for b", Vec::new()),
    );
    assert_eq!(ra.unwrap().message.text(), "echo: for a");
    assert_eq!(rb.unwrap().message.text(), "echo: for b");

    let a = h.engine.get_session(&alice(), a.id).await.unwrap().unwrap();
    let b = h.engine.get_session(&alice(), b.id).await.unwrap().unwrap();
    assert_eq!(a.context.messages.len(), 2);
    assert_eq!(b.context.messages.len(), 2);
    assert_eq!(a.context.messages[0].text(), "for a");
    assert_eq!(b.context.messages[0].text(), "for b");
}

#[tokio::test]
async fn test_messages_on_one_session_are_serialized() {
    let generator = Arc::new(MockGenerator::from_fn(echo_reply).with_delay(Duration::from_millis(10)));
    let h = harness(generator);
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();

    let ctx = alice();
    let (first, second) = tokio::join!(
        h.engine.process_message(&ctx, session.id, "one", Vec::new()),
        h.engine.process_message(&ctx, session.id, "two", Vec::new()),
    );
    first.unwrap();
    second.unwrap();

    let stored = h.engine.get_session(&alice(), session.id).await.unwrap().unwrap();
    let roles: Vec<Role> = stored.context.messages.iter().map(|m| m.role()).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
    for pair in stored.context.messages.windows(2) {
        assert!(pair[0].created_at() <= pair[1].created_at());
    }
}

#[tokio::test]
async fn test_plugin_tool_call_is_recorded() {
    let generator = MockGenerator::with_tool_calls(vec![ProposedToolCall::new(
        ToolCallKind::Function,
        "add",
        json!({ "a": 1, "b": 2 }),
    )]);
    let h = harness(generator.clone());
    h.plugins.register_native(MockPlugin::tool("mock.calc", "add").into_arc()).await.unwrap();
    h.plugins.load("mock.calc").await.unwrap();
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();
    enable(&h, session.id, &["mock.calc"], &[]).await;

    let response = h
        .engine
        .process_message(&alice(), session.id, "add please", Vec::new())
        .await
        .unwrap();

    let tools = &generator.last_request().unwrap().tools;
    assert!(tools.iter().any(|t| t.name == "add"));

    assert_eq!(response.tool_calls.len(), 1);
    let call = &response.tool_calls[0];
    assert_eq!(call.status(), ToolCallStatus::Completed);
    assert_eq!(call.result().unwrap()["operation"], "add");
    assert_eq!(call.result().unwrap()["session_id"], session.id.to_string());

    let results: Vec<&ContentUnit> = response
        .message
        .content()
        .iter()
        .filter(|u| u.kind() == ContentKind::ToolResult)
        .collect();
    assert_eq!(results.len(), 1);

    let stored = h.engine.get_session(&alice(), session.id).await.unwrap().unwrap();
    assert_eq!(stored.context.tool_history.len(), 1);
    assert_eq!(stored.context.tool_history[0].tool_call.id, call.id);
    assert_eq!(stored.stats.tool_execution_count, 1);
    assert_eq!(stored.stats.successful_tool_executions, 1);
}

#[tokio::test]
async fn test_plugin_tools_limited_to_enabled_plugins() {
    let mut explicit = ProposedToolCall::new(ToolCallKind::Plugin, "add", json!({}));
    explicit.server_id = Some("mock.calc".into());
    let generator = MockGenerator::with_tool_calls(vec![
        ProposedToolCall::new(ToolCallKind::Function, "add", json!({ "a": 1 })),
        explicit,
    ]);
    let h = harness(generator.clone());
    let calc = MockPlugin::tool("mock.calc", "add").into_arc();
    h.plugins.register_native(calc.clone()).await.unwrap();
    h.plugins.load("mock.calc").await.unwrap();
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();

    let response = h
        .engine
        .process_message(&alice(), session.id, "add without permission", Vec::new())
        .await
        .unwrap();

    assert!(generator.last_request().unwrap().tools.is_empty());
    assert_eq!(response.tool_calls.len(), 2);
    for call in &response.tool_calls {
        assert_eq!(call.status(), ToolCallStatus::Error);
        assert_eq!(call.error().unwrap().code, "ToolNotFound");
    }
    assert!(response.tool_calls[1].error().unwrap().message.contains("not enabled"));
    assert_eq!(calc.executions(), 0);

    let direct = ToolCall::new(ToolCallKind::Function, "add", json!({}));
    let resolved = h.engine.execute_tool_call(&alice(), session.id, direct).await.unwrap();
    assert_eq!(resolved.error().unwrap().code, "ToolNotFound");
    assert_eq!(calc.executions(), 0);
}

#[tokio::test]
async fn test_abandoned_request_completes_message_with_results() {
    let generator = MockGenerator::with_tool_calls(vec![ProposedToolCall::new(
        ToolCallKind::Function,
        "nap",
        json!({}),
    )]);
    let h = harness(generator);
    let napper = MockPlugin::tool("mock.nap", "nap")
        .behaving(Behavior::Sleep(Duration::from_millis(200)))
        .into_arc();
    h.plugins.register_native(napper).await.unwrap();
    h.plugins.load("mock.nap").await.unwrap();
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();
    enable(&h, session.id, &["mock.nap"], &[]).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        h.engine.process_message(&alice(), session.id, "take a nap", Vec::new()),
    )
    .await;
    assert!(abandoned.is_err());
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The next operation on the session folds in the finished call.
    enable(&h, session.id, &["mock.nap"], &[]).await;

    let stored = h.engine.get_session(&alice(), session.id).await.unwrap().unwrap();
    assert_eq!(stored.context.tool_history.len(), 1);
    assert_eq!(stored.context.tool_history[0].tool_call.status(), ToolCallStatus::Completed);
    assert_eq!(stored.context.messages.len(), 2);
    let assistant = &stored.context.messages[1];
    assert_eq!(assistant.role(), Role::Assistant);
    assert_eq!(assistant.status(), MessageStatus::Completed);
    let results = assistant
        .content()
        .iter()
        .filter(|u| u.kind() == ContentKind::ToolResult)
        .count();
    assert_eq!(results, 1);

    let persisted = h.store.load(session.id).await.unwrap().unwrap();
    assert_eq!(persisted.context.messages[1].status(), MessageStatus::Completed);

    // Later turns see a completed history.
    let response = h
        .engine
        .process_message(&alice(), session.id, "again", Vec::new())
        .await
        .unwrap();
    assert_eq!(response.message.status(), MessageStatus::Completed);
}

#[tokio::test]
async fn test_failed_tool_calls_do_not_affect_siblings() {
    let generator = MockGenerator::with_tool_calls(vec![
        ProposedToolCall::new(ToolCallKind::Function, "add", json!({})),
        ProposedToolCall::new(ToolCallKind::McpTool, "fail", json!({})),
        ProposedToolCall::new(ToolCallKind::Function, "nope", json!({})),
        ProposedToolCall::new(ToolCallKind::McpTool, "echo", json!({ "x": 1 })),
    ]);
    let h = harness(generator);
    h.plugins.register_native(MockPlugin::tool("mock.calc", "add").into_arc()).await.unwrap();
    h.plugins.load("mock.calc").await.unwrap();
    h.mcp.connect(McpServerConfig::stdio("fs", "npx", &["server-fs"])).await.unwrap();
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();
    enable(&h, session.id, &["mock.calc"], &[]).await;

    let response = h
        .engine
        .process_message(&alice(), session.id, "do everything", Vec::new())
        .await
        .unwrap();

    let statuses: Vec<ToolCallStatus> = response.tool_calls.iter().map(ToolCall::status).collect();
    assert_eq!(
        statuses,
        vec![
            ToolCallStatus::Completed,
            ToolCallStatus::Error,
            ToolCallStatus::Error,
            ToolCallStatus::Completed,
        ]
    );
    assert_eq!(response.tool_calls[1].error().unwrap().code, "ExecutionError");
    assert_eq!(response.tool_calls[2].error().unwrap().code, "ToolNotFound");
    assert_eq!(response.tool_calls[3].result().unwrap(), &json!({ "x": 1 }));
    assert_eq!(response.failed_tool_calls().len(), 2);
    assert!(response.error.is_none());

    let stored = h.engine.get_session(&alice(), session.id).await.unwrap().unwrap();
    assert_eq!(stored.context.tool_history.len(), 4);
    assert_eq!(stored.stats.tool_execution_count, 4);
    assert!((stored.stats.success_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_session_server_list_limits_protocol_tools() {
    let generator = MockGenerator::with_tool_calls(vec![ProposedToolCall::new(
        ToolCallKind::McpTool,
        "echo",
        json!({}),
    )]);
    let h = harness(generator.clone());
    h.mcp.connect(McpServerConfig::stdio("fs", "npx", &[])).await.unwrap();
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();
    enable(&h, session.id, &[], &["search"]).await;

    let response = h
        .engine
        .process_message(&alice(), session.id, "echo", Vec::new())
        .await
        .unwrap();

    assert!(generator.last_request().unwrap().tools.is_empty());
    assert_eq!(response.tool_calls[0].status(), ToolCallStatus::Error);
    assert_eq!(response.tool_calls[0].error().unwrap().code, "ToolNotFound");
}

#[tokio::test]
async fn test_slow_protocol_tool_times_out_and_is_cancelled() {
    let mut proposal = ProposedToolCall::new(ToolCallKind::McpTool, "slow", json!({ "ms": 2000 }));
    proposal.server_id = Some("fs".into());
    let generator = MockGenerator::with_tool_calls(vec![proposal]);
    let settings = EngineSettings {
        tool_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let h = harness_with(generator, settings, Default::default());
    h.mcp.connect(McpServerConfig::stdio("fs", "npx", &[])).await.unwrap();
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();

    let response = h
        .engine
        .process_message(&alice(), session.id, "take your time", Vec::new())
        .await
        .unwrap();

    let call = &response.tool_calls[0];
    assert_eq!(call.status(), ToolCallStatus::Error);
    assert_eq!(call.error().unwrap().code, "TIMEOUT");
    assert!(response.duration_ms < 2000);

    let transport = h.connector.transport("fs").unwrap();
    let cancelled: Vec<_> = transport
        .notifications()
        .into_iter()
        .filter(|n| n.method == "notifications/cancelled")
        .collect();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].params.as_ref().unwrap()["reason"], "timeout");
    assert!(h.mcp.is_connected("fs").await);
}

#[tokio::test]
async fn test_interceptors_last_wins() {
    let generator = MockGenerator::echo();
    let h = harness(generator.clone());
    h.plugins.register_native(MockPlugin::interceptor("icpt.a", tagged("A")).into_arc()).await.unwrap();
    h.plugins.register_native(MockPlugin::interceptor("icpt.b", tagged("B")).into_arc()).await.unwrap();
    h.plugins.load("icpt.a").await.unwrap();
    h.plugins.load("icpt.b").await.unwrap();
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();
    enable(&h, session.id, &["icpt.a", "icpt.b"], &[]).await;

    let response = h
        .engine
        .process_message(&alice(), session.id, "hello", Vec::new())
        .await
        .unwrap();

    assert_eq!(response.message.text(), "echo: hello B");
    let stored = h.engine.get_session(&alice(), session.id).await.unwrap().unwrap();
    assert_eq!(stored.context.messages[0].text(), "hello");
}

#[tokio::test]
async fn test_interceptors_compose() {
    let generator = MockGenerator::echo();
    let settings = EngineSettings {
        interception_mode: InterceptionMode::Compose,
        ..Default::default()
    };
    let h = harness_with(generator, settings, Default::default());
    h.plugins.register_native(MockPlugin::interceptor("icpt.a", tagged("A")).into_arc()).await.unwrap();
    h.plugins.register_native(MockPlugin::interceptor("icpt.b", tagged("B")).into_arc()).await.unwrap();
    h.plugins.load("icpt.a").await.unwrap();
    h.plugins.load("icpt.b").await.unwrap();
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();
    enable(&h, session.id, &["icpt.b", "icpt.a"], &[]).await;

    let response = h
        .engine
        .process_message(&alice(), session.id, "hello", Vec::new())
        .await
        .unwrap();
    assert_eq!(response.message.text(), "echo: hello B A");
}

#[tokio::test]
async fn test_failing_interceptor_passes_content_through() {
    let generator = MockGenerator::echo();
    let h = harness(generator);
    let broken = MockPlugin::interceptor("icpt.broken", tagged("X")).behaving(Behavior::Fail).into_arc();
    h.plugins.register_native(broken.clone()).await.unwrap();
    h.plugins.load("icpt.broken").await.unwrap();
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();
    enable(&h, session.id, &["icpt.broken"], &[]).await;

    let response = h
        .engine
        .process_message(&alice(), session.id, "hello", Vec::new())
        .await
        .unwrap();
    assert_eq!(response.message.text(), "echo: hello");
    assert_eq!(broken.intercepts(), 1);
}

#[tokio::test]
async fn test_execute_tool_call_directly() {
    let h = harness(MockGenerator::echo());
    h.plugins.register_native(MockPlugin::tool("mock.calc", "add").into_arc()).await.unwrap();
    h.plugins.load("mock.calc").await.unwrap();
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();
    enable(&h, session.id, &["mock.calc"], &[]).await;

    let call = ToolCall::new(ToolCallKind::Function, "add", json!({ "a": 2 }));
    let resolved = h.engine.execute_tool_call(&alice(), session.id, call).await.unwrap();
    assert_eq!(resolved.status(), ToolCallStatus::Completed);
    assert_eq!(resolved.result().unwrap()["parameters"]["a"], 2);

    let mut started = ToolCall::new(ToolCallKind::Function, "add", json!({}));
    started.start().unwrap();
    assert!(h.engine.execute_tool_call(&alice(), session.id, started).await.is_err());

    let stored = h.engine.get_session(&alice(), session.id).await.unwrap().unwrap();
    assert_eq!(stored.context.tool_history.len(), 1);
    assert_eq!(stored.context.tool_history[0].input, json!({ "a": 2 }));
}

#[tokio::test]
async fn test_one_trace_per_message() {
    let generator = MockGenerator::with_tool_calls(vec![ProposedToolCall::new(
        ToolCallKind::Function,
        "add",
        json!({}),
    )]);
    let h = harness(generator);
    h.plugins.register_native(MockPlugin::tool("mock.calc", "add").into_arc()).await.unwrap();
    h.plugins.load("mock.calc").await.unwrap();
    let session = h.engine.create_session(&alice(), None, SessionMode::Simple).await.unwrap();
    enable(&h, session.id, &["mock.calc"], &[]).await;
    let before = h.events.recent(1000).await.len();

    h.engine
        .process_message(&alice(), session.id, "trace me", Vec::new())
        .await
        .unwrap();

    let events = h.events.recent(1000).await;
    let turn: Vec<_> = events
        .iter()
        .skip(before)
        .filter(|e| {
            matches!(
                e.data,
                KoraEventData::MessageAppended { .. }
                    | KoraEventData::ToolCallStarted { .. }
                    | KoraEventData::ToolCallFinished { .. }
                    | KoraEventData::SessionUpdated { .. }
            )
        })
        .collect();
    assert_eq!(turn.len(), 5);
    assert!(turn.iter().all(|e| e.trace_id == turn[0].trace_id));
}
