//! End-to-end agent loop tests against a scripted provider.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use quill_core::agent::{Agent, AgentEvent, AgentServices};
use quill_core::error::QuillError;
use quill_core::lsp::LspCoordinator;
use quill_core::message::{FinishReason, Message, Part, Role, TokenUsage};
use quill_core::models::{Model, CLAUDE_37_SONNET};
use quill_core::permission::PermissionService;
use quill_core::provider::{
    Provider, ProviderEvent, ProviderResponse, ProviderToolCall,
};
use quill_core::pubsub::EventBus;
use quill_core::storage::{Database, FileStore, MessageStore, SessionStore};
use quill_core::tools::implementations::WriteTool;
use quill_core::tools::{
    FileRecords, Tool, ToolCall, ToolContext, ToolInfo, ToolRegistry, ToolResponse, ToolServices,
};

// ── Scripted provider ──────────────────────────────────────────────────

struct ScriptedProvider {
    model: Model,
    scripts: Mutex<VecDeque<Vec<ProviderEvent>>>,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Vec<ProviderEvent>>) -> Arc<Self> {
        Arc::new(Self {
            model: CLAUDE_37_SONNET,
            scripts: Mutex::new(scripts.into()),
        })
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn model(&self) -> &Model {
        &self.model
    }

    async fn send(
        &self,
        _cancel: CancellationToken,
        _history: &[Message],
        _tools: &[ToolInfo],
    ) -> Result<ProviderResponse, QuillError> {
        Ok(ProviderResponse::default())
    }

    fn stream(
        &self,
        _cancel: CancellationToken,
        _history: Vec<Message>,
        _tools: Vec<ToolInfo>,
    ) -> mpsc::UnboundedReceiver<ProviderEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("provider called more times than scripted");
        tokio::spawn(async move {
            for event in script {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        rx
    }
}

fn complete(
    content: &str,
    tool_calls: Vec<ProviderToolCall>,
    finish_reason: FinishReason,
) -> ProviderEvent {
    ProviderEvent::Complete {
        response: ProviderResponse {
            content: content.to_string(),
            reasoning: None,
            tool_calls,
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 10,
                ..Default::default()
            },
            finish_reason,
        },
    }
}

// ── Test tools ─────────────────────────────────────────────────────────

/// Sleeps for the requested delay, recording when it started. Returns a
/// "canceled" error promptly when its token fires.
struct TimerTool {
    starts: Arc<Mutex<Vec<(String, Instant)>>>,
}

#[async_trait]
impl Tool for TimerTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "timer".into(),
            description: "sleep for delay_ms".into(),
            parameters: json!({"delay_ms": {"type": "integer"}}),
            required: vec!["delay_ms".into()],
        }
    }

    async fn run(&self, ctx: &ToolContext, call: ToolCall) -> ToolResponse {
        self.starts
            .lock()
            .unwrap()
            .push((call.id.clone(), Instant::now()));
        let delay: u64 = serde_json::from_str::<serde_json::Value>(&call.input)
            .ok()
            .and_then(|v| v.get("delay_ms").and_then(|d| d.as_u64()))
            .unwrap_or(0);

        tokio::select! {
            _ = ctx.cancel.cancelled() => ToolResponse::error("canceled"),
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                ToolResponse::text(format!("slept {delay}ms"))
            }
        }
    }
}

// ── Harness ────────────────────────────────────────────────────────────

struct Harness {
    agent: Arc<Agent>,
    sessions: Arc<SessionStore>,
    messages: Arc<MessageStore>,
    files: Arc<FileStore>,
    session_id: String,
    _workdir: tempfile::TempDir,
}

fn harness(extra_tools: Vec<Arc<dyn Tool>>, scripts: Vec<Vec<ProviderEvent>>) -> Harness {
    let workdir = tempfile::tempdir().unwrap();
    let bus = EventBus::new();
    let db = Database::in_memory().unwrap();

    let sessions = Arc::new(SessionStore::new(
        db.clone(),
        Arc::new(quill_core::pubsub::Broker::new()),
    ));
    let messages = Arc::new(MessageStore::new(
        db.clone(),
        Arc::new(quill_core::pubsub::Broker::new()),
    ));
    let files = Arc::new(FileStore::new(
        db,
        Arc::new(quill_core::pubsub::Broker::new()),
    ));

    let permissions = Arc::new(PermissionService::new(
        Arc::new(quill_core::pubsub::Broker::new()),
        Arc::new(quill_core::pubsub::Broker::new()),
    ));
    permissions.set_skip_all(true);

    let tool_services = Arc::new(ToolServices {
        permissions,
        files: files.clone(),
        records: Arc::new(FileRecords::new()),
        lsp: Arc::new(LspCoordinator::disabled()),
    });

    let mut tools: Vec<Arc<dyn Tool>> = vec![Arc::new(WriteTool)];
    tools.extend(extra_tools);

    let provider = ScriptedProvider::new(scripts);
    let agent = Agent::new(AgentServices {
        bus,
        sessions: sessions.clone(),
        messages: messages.clone(),
        registry: Arc::new(ToolRegistry::new(tools)),
        tool_services,
        provider: provider.clone(),
        title_provider: provider,
        working_dir: workdir.path().to_path_buf(),
    });

    let session = sessions.create(None, "test session").unwrap();
    Harness {
        agent,
        sessions,
        messages,
        files,
        session_id: session.id,
        _workdir: workdir,
    }
}

/// Drain events until RunFinished, with a guard timeout.
async fn drain(mut rx: mpsc::UnboundedReceiver<AgentEvent>) -> (Vec<AgentEvent>, FinishReason) {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("run did not finish in time")
            .expect("event channel closed before RunFinished");
        if let AgentEvent::RunFinished { reason } = &event {
            let reason = *reason;
            events.push(event);
            return (events, reason);
        }
        events.push(event);
    }
}

fn tool_results(messages: &[Message]) -> Vec<(String, String, bool)> {
    messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .flat_map(|m| &m.parts)
        .filter_map(|p| match p {
            Part::ToolResult {
                tool_call_id,
                content,
                is_error,
                ..
            } => Some((tool_call_id.clone(), content.clone(), *is_error)),
            _ => None,
        })
        .collect()
}

// ── Tests ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn plain_turn_persists_messages_and_usage() {
    let h = harness(
        vec![],
        vec![vec![
            ProviderEvent::ContentStart,
            ProviderEvent::ContentDelta { text: "Hel".into() },
            ProviderEvent::ContentDelta { text: "lo".into() },
            ProviderEvent::ContentStop,
            complete("Hello", vec![], FinishReason::EndTurn),
        ]],
    );

    let rx = h.agent.run(&h.session_id, "say hello").unwrap();
    let (events, reason) = drain(rx).await;
    assert_eq!(reason, FinishReason::EndTurn);

    // Incremental updates were visible.
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::MessageUpdated { .. })));

    let stored = h.messages.list_by_session(&h.session_id).unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].role, Role::User);
    assert_eq!(stored[0].text(), "say hello");
    assert_eq!(stored[1].role, Role::Assistant);
    assert_eq!(stored[1].text(), "Hello");
    assert_eq!(stored[1].finish_reason(), Some(FinishReason::EndTurn));

    // No message is ever persisted with zero parts.
    assert!(stored.iter().all(|m| !m.parts.is_empty()));

    let session = h.sessions.get(&h.session_id).unwrap();
    assert_eq!(session.prompt_tokens, 100);
    assert_eq!(session.completion_tokens, 10);
    let expected = 3.0 * 100.0 / 1e6 + 15.0 * 10.0 / 1e6;
    assert!((session.cost - expected).abs() < 1e-12);
}

#[tokio::test]
async fn tool_roundtrip_feeds_results_back() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let h = harness(
        vec![Arc::new(TimerTool {
            starts: starts.clone(),
        })],
        vec![
            vec![
                ProviderEvent::ToolUseStart {
                    id: "t1".into(),
                    name: "timer".into(),
                },
                ProviderEvent::ContentStop,
                complete(
                    "",
                    vec![ProviderToolCall {
                        id: "t1".into(),
                        name: "timer".into(),
                        input: json!({"delay_ms": 1}).to_string(),
                    }],
                    FinishReason::ToolUse,
                ),
            ],
            vec![complete("all done", vec![], FinishReason::EndTurn)],
        ],
    );

    let rx = h.agent.run(&h.session_id, "run the timer").unwrap();
    let (_events, reason) = drain(rx).await;
    assert_eq!(reason, FinishReason::EndTurn);

    let stored = h.messages.list_by_session(&h.session_id).unwrap();
    // user, assistant(tool_use), tool, assistant(end_turn)
    assert_eq!(stored.len(), 4);
    assert_eq!(stored[2].role, Role::Tool);

    // Invariant: every tool call has a later matching result.
    let results = tool_results(&stored);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, "t1");
    assert!(!results[0].2);

    // Tokens accumulated across both iterations.
    let session = h.sessions.get(&h.session_id).unwrap();
    assert_eq!(session.prompt_tokens, 200);
    assert_eq!(session.completion_tokens, 20);
}

#[tokio::test]
async fn parallel_tools_start_together_and_preserve_call_order() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let calls = vec![
        ("t-slow", 300u64),
        ("t-mid", 150),
        ("t-fast", 10),
    ];
    let tool_calls: Vec<ProviderToolCall> = calls
        .iter()
        .map(|(id, delay)| ProviderToolCall {
            id: (*id).into(),
            name: "timer".into(),
            input: json!({"delay_ms": delay}).to_string(),
        })
        .collect();

    let h = harness(
        vec![Arc::new(TimerTool {
            starts: starts.clone(),
        })],
        vec![
            vec![complete("", tool_calls, FinishReason::ToolUse)],
            vec![complete("done", vec![], FinishReason::EndTurn)],
        ],
    );

    let rx = h.agent.run(&h.session_id, "run three timers").unwrap();
    let (_events, reason) = drain(rx).await;
    assert_eq!(reason, FinishReason::EndTurn);

    // All three started within 50ms of each other.
    let starts = starts.lock().unwrap();
    assert_eq!(starts.len(), 3);
    let first = starts.iter().map(|(_, t)| *t).min().unwrap();
    let last = starts.iter().map(|(_, t)| *t).max().unwrap();
    assert!(last.duration_since(first) < Duration::from_millis(50));

    // Result order is call order, not completion order.
    let stored = h.messages.list_by_session(&h.session_id).unwrap();
    let results = tool_results(&stored);
    let ids: Vec<&str> = results.iter().map(|(id, _, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["t-slow", "t-mid", "t-fast"]);
}

#[tokio::test]
async fn cancellation_mid_tool_settles_within_a_second() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let h = harness(
        vec![Arc::new(TimerTool {
            starts: starts.clone(),
        })],
        vec![vec![complete(
            "",
            vec![ProviderToolCall {
                id: "t-long".into(),
                name: "timer".into(),
                input: json!({"delay_ms": 60_000}).to_string(),
            }],
            FinishReason::ToolUse,
        )]],
    );

    let mut rx = h.agent.run(&h.session_id, "sleep for a minute").unwrap();

    // Wait for the tool to start, then cancel.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(event, AgentEvent::ToolStarted { .. }) {
            break;
        }
    }
    let canceled_at = Instant::now();
    h.agent.cancel(&h.session_id);

    let (_events, reason) = drain(rx).await;
    assert_eq!(reason, FinishReason::Canceled);
    assert!(canceled_at.elapsed() < Duration::from_secs(1));

    let stored = h.messages.list_by_session(&h.session_id).unwrap();
    let results = tool_results(&stored);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1, "canceled");
    assert!(results[0].2);

    // Assistant finish reason rewritten to canceled.
    let assistant = stored.iter().find(|m| m.role == Role::Assistant).unwrap();
    assert_eq!(assistant.finish_reason(), Some(FinishReason::Canceled));

    // No unmatched tool calls remain.
    let rest: Vec<&Message> = stored.iter().collect();
    assert!(assistant.unmatched_tool_calls(&rest).is_empty());
}

#[tokio::test]
async fn busy_guard_rejects_second_run_until_unwound() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let h = harness(
        vec![Arc::new(TimerTool { starts })],
        vec![
            vec![complete(
                "",
                vec![ProviderToolCall {
                    id: "t1".into(),
                    name: "timer".into(),
                    input: json!({"delay_ms": 60_000}).to_string(),
                }],
                FinishReason::ToolUse,
            )],
            vec![complete("second run", vec![], FinishReason::EndTurn)],
        ],
    );

    let rx = h.agent.run(&h.session_id, "first").unwrap();
    assert!(h.agent.is_busy(&h.session_id));
    assert!(matches!(
        h.agent.run(&h.session_id, "second"),
        Err(QuillError::SessionBusy(_))
    ));

    h.agent.cancel(&h.session_id);
    let (_events, reason) = drain(rx).await;
    assert_eq!(reason, FinishReason::Canceled);

    // Fully unwound now; a new run is accepted.
    let rx = h.agent.run(&h.session_id, "third").unwrap();
    let (_events, reason) = drain(rx).await;
    assert_eq!(reason, FinishReason::EndTurn);
}

#[tokio::test]
async fn create_file_scenario_writes_snapshot_and_cost() {
    let h = harness(
        vec![],
        vec![
            vec![complete(
                "",
                vec![ProviderToolCall {
                    id: "w1".into(),
                    name: "write".into(),
                    input: json!({"file_path": "hello.txt", "content": "hi"}).to_string(),
                }],
                FinishReason::ToolUse,
            )],
            vec![complete("created it", vec![], FinishReason::EndTurn)],
        ],
    );

    let rx = h.agent.run(&h.session_id, "make hello.txt containing hi").unwrap();
    let (_events, reason) = drain(rx).await;
    assert_eq!(reason, FinishReason::EndTurn);

    let path = h._workdir.path().join("hello.txt");
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hi");

    let initial = h
        .files
        .get_initial(&h.session_id, &path.display().to_string())
        .unwrap()
        .expect("initial snapshot recorded");
    assert_eq!(initial.content, "hi");

    // Exactly one snapshot for a brand-new file.
    assert_eq!(h.files.list_by_session(&h.session_id).unwrap().len(), 1);

    let session = h.sessions.get(&h.session_id).unwrap();
    let expected = 2.0 * (3.0 * 100.0 / 1e6 + 15.0 * 10.0 / 1e6);
    assert!((session.cost - expected).abs() < 1e-12);
}

#[tokio::test]
async fn crash_gap_gets_synthetic_tool_result() {
    let h = harness(
        vec![],
        vec![vec![complete("recovered", vec![], FinishReason::EndTurn)]],
    );

    // Simulate a crash: an assistant message whose tool call has no result.
    h.messages
        .create(
            &h.session_id,
            Role::Assistant,
            vec![Part::ToolCall {
                id: "orphan".into(),
                name: "bash".into(),
                input: "{}".into(),
                finished: true,
            }],
        )
        .unwrap();

    let rx = h.agent.run(&h.session_id, "continue").unwrap();
    let (_events, reason) = drain(rx).await;
    assert_eq!(reason, FinishReason::EndTurn);

    let stored = h.messages.list_by_session(&h.session_id).unwrap();
    let results = tool_results(&stored);
    assert!(results
        .iter()
        .any(|(id, _, is_error)| id == "orphan" && *is_error));
}

#[tokio::test]
async fn provider_error_ends_run_with_error() {
    let h = harness(
        vec![],
        vec![vec![
            ProviderEvent::ContentDelta {
                text: "partial".into(),
            },
            ProviderEvent::Error {
                message: "529: overloaded".into(),
            },
        ]],
    );

    let rx = h.agent.run(&h.session_id, "hello").unwrap();
    let (events, reason) = drain(rx).await;
    assert_eq!(reason, FinishReason::Error);
    assert!(events
        .iter()
        .any(|e| matches!(e, AgentEvent::Error { message } if message.contains("529"))));

    let stored = h.messages.list_by_session(&h.session_id).unwrap();
    let assistant = stored.iter().find(|m| m.role == Role::Assistant).unwrap();
    assert_eq!(assistant.finish_reason(), Some(FinishReason::Error));
}

#[tokio::test]
async fn unknown_tool_yields_error_result_and_loop_continues() {
    let h = harness(
        vec![],
        vec![
            vec![complete(
                "",
                vec![ProviderToolCall {
                    id: "m1".into(),
                    name: "does_not_exist".into(),
                    input: "{}".into(),
                }],
                FinishReason::ToolUse,
            )],
            vec![complete("recovered", vec![], FinishReason::EndTurn)],
        ],
    );

    let rx = h.agent.run(&h.session_id, "use a bogus tool").unwrap();
    let (_events, reason) = drain(rx).await;
    assert_eq!(reason, FinishReason::EndTurn);

    let stored = h.messages.list_by_session(&h.session_id).unwrap();
    let results = tool_results(&stored);
    assert_eq!(results.len(), 1);
    assert!(results[0].2);
    assert!(results[0].1.contains("tool not found"));
}
