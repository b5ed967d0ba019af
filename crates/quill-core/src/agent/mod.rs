//! Agent loop.
//!
//! Drives one user turn to completion: persist the user message, stream a
//! completion into an assistant message, dispatch any tool calls in
//! parallel, persist the combined tool message, and go around again until
//! the model stops asking for tools. One run per session at a time; a
//! session-scoped cancellation token tears the whole tree down.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::QuillError;
use crate::message::{FinishReason, Message, Part, Role};
use crate::provider::{Provider, ProviderEvent, ProviderResponse};
use crate::pubsub::EventBus;
use crate::storage::{MessageStore, SessionStore};
use crate::tools::{ToolCall, ToolContext, ToolRegistry, ToolResponse, ToolServices};

mod events;
mod stream;
mod title;

pub use events::AgentEvent;
pub use stream::StreamAccumulator;

/// Backstop against a runaway tool loop.
const MAX_ITERATIONS: usize = 50;

pub struct AgentServices {
    pub bus: Arc<EventBus>,
    pub sessions: Arc<SessionStore>,
    pub messages: Arc<MessageStore>,
    pub registry: Arc<ToolRegistry>,
    pub tool_services: Arc<ToolServices>,
    pub provider: Arc<dyn Provider>,
    /// Cheap model used for side jobs (titles).
    pub title_provider: Arc<dyn Provider>,
    pub working_dir: PathBuf,
}

pub struct Agent {
    services: AgentServices,
    /// Busy guard: session id → cancellation handle for the active run.
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl Agent {
    pub fn new(services: AgentServices) -> Arc<Self> {
        Arc::new(Self {
            services,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.active
            .lock()
            .expect("active map lock poisoned")
            .contains_key(session_id)
    }

    /// Cancel the session's active run, if any. Pending permission prompts
    /// resolve as denied; in-flight provider streams and tools abort.
    pub fn cancel(&self, session_id: &str) {
        let token = self
            .active
            .lock()
            .expect("active map lock poisoned")
            .get(session_id)
            .cloned();
        if let Some(token) = token {
            token.cancel();
            self.services.tool_services.permissions.deny_session(session_id);
        }
    }

    /// Drive one user turn. Rejected while the session already has an
    /// active run, including a cancelled one that has not unwound yet.
    pub fn run(
        self: &Arc<Self>,
        session_id: &str,
        user_text: &str,
    ) -> Result<mpsc::UnboundedReceiver<AgentEvent>, QuillError> {
        let token = CancellationToken::new();
        {
            let mut active = self.active.lock().expect("active map lock poisoned");
            if active.contains_key(session_id) {
                return Err(QuillError::SessionBusy(session_id.to_string()));
            }
            active.insert(session_id.to_string(), token.clone());
        }

        let session = match self.services.sessions.get(session_id) {
            Ok(s) => s,
            Err(e) => {
                self.active
                    .lock()
                    .expect("active map lock poisoned")
                    .remove(session_id);
                return Err(QuillError::Internal(e.to_string()));
            }
        };

        if session.title.is_empty() {
            title::spawn_title_task(
                self.services.title_provider.clone(),
                self.services.sessions.clone(),
                session_id.to_string(),
                user_text.to_string(),
                token.child_token(),
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let agent = self.clone();
        let session_id = session_id.to_string();
        let user_text = user_text.to_string();
        tokio::spawn(async move {
            agent.drive(&session_id, &user_text, token, &tx).await;
        });

        Ok(rx)
    }

    async fn drive(
        &self,
        session_id: &str,
        user_text: &str,
        token: CancellationToken,
        tx: &mpsc::UnboundedSender<AgentEvent>,
    ) {
        // Forward this session's permission prompts to the consumer for the
        // lifetime of the run.
        let scope = CancellationToken::new();
        let mut permission_sub = self
            .services
            .bus
            .permission_requests
            .subscribe(scope.clone());
        let forward_tx = tx.clone();
        let forward_session = session_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = permission_sub.recv().await {
                if event.payload.session_id == forward_session {
                    let _ = forward_tx.send(AgentEvent::PermissionRequested {
                        request: event.payload,
                    });
                }
            }
        });

        let reason = self.drive_inner(session_id, user_text, &token, tx).await;
        scope.cancel();

        // Release the busy guard before announcing completion, so a caller
        // reacting to RunFinished can start the next run immediately.
        self.active
            .lock()
            .expect("active map lock poisoned")
            .remove(session_id);

        match reason {
            Ok(reason) => {
                let _ = tx.send(AgentEvent::RunFinished { reason });
            }
            Err(e) => {
                tracing::error!("run failed: {e}");
                let _ = tx.send(AgentEvent::Error {
                    message: e.to_string(),
                });
                let _ = tx.send(AgentEvent::RunFinished {
                    reason: FinishReason::Error,
                });
            }
        }
    }

    async fn drive_inner(
        &self,
        session_id: &str,
        user_text: &str,
        token: &CancellationToken,
        tx: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<FinishReason> {
        let user_message = self.services.messages.create(
            session_id,
            Role::User,
            vec![Part::Text {
                text: user_text.to_string(),
            }],
        )?;
        let _ = tx.send(AgentEvent::MessageCreated {
            message: user_message,
        });

        for _ in 0..MAX_ITERATIONS {
            let history = self.repaired_history(session_id)?;

            let events = self.services.provider.stream(
                token.child_token(),
                history,
                self.services.registry.infos(),
            );

            let outcome = self
                .accumulate(session_id, events, token, tx)
                .await?;

            let (response, assistant) = match outcome {
                StreamOutcome::Complete {
                    response,
                    assistant,
                } => (response, assistant),
                StreamOutcome::Canceled { assistant } => {
                    if let Some(assistant) = &assistant {
                        self.write_cancellation_results(session_id, assistant, tx)?;
                    }
                    return Ok(FinishReason::Canceled);
                }
                StreamOutcome::Failed { message, assistant } => {
                    if let Some(mut assistant) = assistant {
                        assistant.parts.push(Part::Finish {
                            reason: FinishReason::Error,
                            usage: Default::default(),
                        });
                        let updated = self.services.messages.update(&assistant)?;
                        let _ = tx.send(AgentEvent::MessageUpdated { message: updated });
                    }
                    let _ = tx.send(AgentEvent::Error { message });
                    return Ok(FinishReason::Error);
                }
            };

            let usage = response.usage;
            let cost = self.services.provider.model().completion_cost(
                usage.input_tokens,
                usage.output_tokens,
                usage.cache_creation_tokens,
                usage.cache_read_tokens,
            );
            self.services.sessions.add_usage(
                session_id,
                usage.input_tokens,
                usage.output_tokens,
                cost,
            )?;

            if response.finish_reason != FinishReason::ToolUse {
                return Ok(response.finish_reason);
            }

            let Some(assistant) = assistant else {
                // tool_use finish with no parts at all; nothing to dispatch.
                return Ok(FinishReason::Unknown);
            };

            self.dispatch_tools(session_id, &assistant, token, tx).await?;

            if token.is_cancelled() {
                self.mark_assistant_canceled(&assistant, tx)?;
                return Ok(FinishReason::Canceled);
            }
        }

        anyhow::bail!("maximum iterations ({MAX_ITERATIONS}) reached")
    }

    /// Pull the session history and make it well-formed: drop empty
    /// assistant messages, and give every dangling tool call a synthetic
    /// error result (crash-recovery gaps).
    fn repaired_history(&self, session_id: &str) -> Result<Vec<Message>> {
        let mut history = self.services.messages.list_by_session(session_id)?;

        history.retain(|m| {
            !(m.role == Role::Assistant
                && (m.parts.is_empty()
                    || m.parts.iter().all(
                        |p| matches!(p, Part::Text { text } if text.is_empty()),
                    )))
        });

        let answered: HashSet<String> = history
            .iter()
            .flat_map(|m| &m.parts)
            .filter_map(|p| match p {
                Part::ToolResult { tool_call_id, .. } => Some(tool_call_id.clone()),
                _ => None,
            })
            .collect();

        let mut repaired: Vec<Message> = Vec::with_capacity(history.len());
        for message in history {
            let unmatched: Vec<(String, String)> = if message.role == Role::Assistant {
                message
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::ToolCall { id, name, .. } if !answered.contains(id) => {
                            Some((id.clone(), name.clone()))
                        }
                        _ => None,
                    })
                    .collect()
            } else {
                Vec::new()
            };

            repaired.push(message);

            if !unmatched.is_empty() {
                let parts: Vec<Part> = unmatched
                    .into_iter()
                    .map(|(id, _name)| Part::ToolResult {
                        tool_call_id: id,
                        content: "tool execution was interrupted".into(),
                        is_error: true,
                        metadata: None,
                    })
                    .collect();
                let synthetic = self
                    .services
                    .messages
                    .create(session_id, Role::Tool, parts)?;
                repaired.push(synthetic);
            }
        }

        Ok(repaired)
    }

    async fn accumulate(
        &self,
        session_id: &str,
        mut events: mpsc::UnboundedReceiver<ProviderEvent>,
        token: &CancellationToken,
        tx: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<StreamOutcome> {
        let mut acc = StreamAccumulator::new();
        let mut assistant: Option<Message> = None;

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => {
                    let assistant = if acc.is_empty() {
                        None
                    } else {
                        acc.cancel();
                        Some(self.persist_parts(session_id, &mut assistant, &acc, tx)?)
                    };
                    return Ok(StreamOutcome::Canceled { assistant });
                }
                event = events.recv() => event,
            };

            let Some(event) = event else {
                return Ok(StreamOutcome::Failed {
                    message: "provider stream closed unexpectedly".into(),
                    assistant,
                });
            };

            match event {
                ProviderEvent::Complete { response } => {
                    acc.apply(&ProviderEvent::Complete {
                        response: response.clone(),
                    });
                    let message = self.persist_parts(session_id, &mut assistant, &acc, tx)?;
                    return Ok(StreamOutcome::Complete {
                        response,
                        assistant: Some(message),
                    });
                }
                ProviderEvent::Error { message } => {
                    if token.is_cancelled() {
                        let assistant = if acc.is_empty() {
                            None
                        } else {
                            acc.cancel();
                            Some(self.persist_parts(session_id, &mut assistant, &acc, tx)?)
                        };
                        return Ok(StreamOutcome::Canceled { assistant });
                    }
                    return Ok(StreamOutcome::Failed { message, assistant });
                }
                event => {
                    if acc.apply(&event) {
                        self.persist_parts(session_id, &mut assistant, &acc, tx)?;
                    }
                }
            }
        }
    }

    /// Create the assistant row on first content, update it afterwards, and
    /// mirror the store event to the consumer.
    fn persist_parts(
        &self,
        session_id: &str,
        assistant: &mut Option<Message>,
        acc: &StreamAccumulator,
        tx: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<Message> {
        match assistant {
            None => {
                let message = self.services.messages.create(
                    session_id,
                    Role::Assistant,
                    acc.parts().to_vec(),
                )?;
                let _ = tx.send(AgentEvent::MessageCreated {
                    message: message.clone(),
                });
                *assistant = Some(message.clone());
                Ok(message)
            }
            Some(existing) => {
                existing.parts = acc.parts().to_vec();
                let updated = self.services.messages.update(existing)?;
                let _ = tx.send(AgentEvent::MessageUpdated {
                    message: updated.clone(),
                });
                *existing = updated.clone();
                Ok(updated)
            }
        }
    }

    /// Run every finished tool call concurrently; persist one tool message
    /// whose parts preserve the original call order.
    async fn dispatch_tools(
        &self,
        session_id: &str,
        assistant: &Message,
        token: &CancellationToken,
        tx: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        let calls: Vec<(String, String, String)> = assistant
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall {
                    id,
                    name,
                    input,
                    finished: true,
                } => Some((id.clone(), name.clone(), input.clone())),
                _ => None,
            })
            .collect();
        if calls.is_empty() {
            return Ok(());
        }

        let mut join = JoinSet::new();
        for (index, (id, name, input)) in calls.iter().cloned().enumerate() {
            let _ = tx.send(AgentEvent::ToolStarted {
                call_id: id.clone(),
            });

            let tool = self.services.registry.get(&name);
            let ctx = ToolContext {
                session_id: Some(session_id.to_string()),
                message_id: Some(assistant.id.clone()),
                working_dir: self.services.working_dir.clone(),
                cancel: token.child_token(),
                services: self.services.tool_services.clone(),
            };
            join.spawn(async move {
                let response = match tool {
                    Some(tool) => {
                        tool.run(&ctx, ToolCall {
                            id: id.clone(),
                            name,
                            input,
                        })
                        .await
                    }
                    None => ToolResponse::error(format!("tool not found: {}", name)),
                };
                (index, id, response)
            });
        }

        let mut results: Vec<Option<(String, ToolResponse)>> = vec![None; calls.len()];
        while let Some(joined) = join.join_next().await {
            if let Ok((index, id, response)) = joined {
                let _ = tx.send(AgentEvent::ToolFinished {
                    call_id: id.clone(),
                    is_error: response.is_error,
                });
                results[index] = Some((id, response));
            }
        }

        let parts: Vec<Part> = calls
            .iter()
            .zip(results)
            .map(|((id, _, _), result)| match result {
                Some((id, response)) => Part::ToolResult {
                    tool_call_id: id,
                    content: response.content,
                    is_error: response.is_error,
                    metadata: response.metadata,
                },
                // A task that never reported (panic or teardown) still
                // leaves a well-formed history.
                None => Part::ToolResult {
                    tool_call_id: id.clone(),
                    content: "canceled".into(),
                    is_error: true,
                    metadata: None,
                },
            })
            .collect();

        let tool_message = self.services.messages.create(session_id, Role::Tool, parts)?;
        let _ = tx.send(AgentEvent::MessageCreated {
            message: tool_message,
        });
        Ok(())
    }

    /// After a cancelled stream, match every closed tool call with a
    /// synthetic "canceled" result so the history stays well-formed.
    fn write_cancellation_results(
        &self,
        session_id: &str,
        assistant: &Message,
        tx: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        let parts: Vec<Part> = assistant
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall { id, .. } => Some(Part::ToolResult {
                    tool_call_id: id.clone(),
                    content: "canceled".into(),
                    is_error: true,
                    metadata: None,
                }),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            return Ok(());
        }

        let tool_message = self.services.messages.create(session_id, Role::Tool, parts)?;
        let _ = tx.send(AgentEvent::MessageCreated {
            message: tool_message,
        });
        Ok(())
    }

    /// Rewrite the assistant's finish part as canceled after a mid-dispatch
    /// cancellation.
    fn mark_assistant_canceled(
        &self,
        assistant: &Message,
        tx: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Result<()> {
        let mut updated = assistant.clone();
        let mut rewrote = false;
        for part in updated.parts.iter_mut().rev() {
            if let Part::Finish { reason, .. } = part {
                *reason = FinishReason::Canceled;
                rewrote = true;
                break;
            }
        }
        if !rewrote {
            updated.parts.push(Part::Finish {
                reason: FinishReason::Canceled,
                usage: Default::default(),
            });
        }
        let updated = self.services.messages.update(&updated)?;
        let _ = tx.send(AgentEvent::MessageUpdated { message: updated });
        Ok(())
    }
}

enum StreamOutcome {
    Complete {
        response: ProviderResponse,
        assistant: Option<Message>,
    },
    Canceled {
        assistant: Option<Message>,
    },
    Failed {
        message: String,
        assistant: Option<Message>,
    },
}
