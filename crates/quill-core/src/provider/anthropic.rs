//! Anthropic Messages API adapter.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::QuillError;
use crate::message::{FinishReason, Message, Part, Role, TokenUsage};
use crate::models::Model;
use crate::tools::ToolInfo;

use super::retry::{anthropic_retryable, backoff_delay, parse_retry_after, MAX_RETRIES};
use super::sse::SseParser;
use super::{Provider, ProviderEvent, ProviderOptions, ProviderResponse, ProviderToolCall};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Share of `max_tokens` granted to extended thinking.
const THINKING_BUDGET_RATIO: f64 = 0.8;

pub struct AnthropicProvider {
    options: ProviderOptions,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(options: ProviderOptions) -> Self {
        Self {
            options,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        let base = self
            .options
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/v1/messages")
    }

    /// Translate the abstract history into the vendor request. Pure and
    /// deterministic: replaying the same history yields identical JSON.
    pub fn build_request(&self, history: &[Message], tools: &[ToolInfo], stream: bool) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        for message in history {
            match message.role {
                Role::User => {
                    let text = message.text();
                    messages.push(json!({
                        "role": "user",
                        "content": [{"type": "text", "text": text}],
                    }));
                }
                Role::Assistant => {
                    let mut blocks: Vec<Value> = Vec::new();
                    let text = message.text();
                    if !text.is_empty() {
                        blocks.push(json!({"type": "text", "text": text}));
                    }
                    for (id, name, input) in message.tool_calls() {
                        let input: Value =
                            serde_json::from_str(input).unwrap_or_else(|_| json!({}));
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": input,
                        }));
                    }
                    if blocks.is_empty() {
                        tracing::warn!("assistant message without content, skipping");
                        continue;
                    }
                    messages.push(json!({"role": "assistant", "content": blocks}));
                }
                Role::Tool => {
                    let mut blocks: Vec<Value> = Vec::new();
                    for part in &message.parts {
                        if let Part::ToolResult {
                            tool_call_id,
                            content,
                            is_error,
                            ..
                        } = part
                        {
                            blocks.push(json!({
                                "type": "tool_result",
                                "tool_use_id": tool_call_id,
                                "content": content,
                                "is_error": is_error,
                            }));
                        }
                    }
                    messages.push(json!({"role": "user", "content": blocks}));
                }
                // System text travels in the dedicated field below.
                Role::System => {}
            }
        }

        if !self.options.disable_cache {
            mark_recent_text_blocks(&mut messages, 2);
        }

        let mut anthropic_tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": {
                        "type": "object",
                        "properties": t.parameters,
                        "required": t.required,
                    },
                })
            })
            .collect();
        if !self.options.disable_cache {
            if let Some(last) = anthropic_tools.last_mut() {
                if let Some(obj) = last.as_object_mut() {
                    obj.insert("cache_control".into(), json!({"type": "ephemeral"}));
                }
            }
        }

        let thinking = self.thinking_config(history);
        let temperature = if thinking.is_some() { 1 } else { 0 };

        let mut request = Map::new();
        request.insert("model".into(), json!(self.options.model.api_model));
        request.insert("max_tokens".into(), json!(self.options.max_tokens));
        request.insert("temperature".into(), json!(temperature));
        request.insert("messages".into(), json!(messages));
        if !anthropic_tools.is_empty() {
            request.insert("tools".into(), json!(anthropic_tools));
        }
        if let Some(thinking) = thinking {
            request.insert("thinking".into(), thinking);
        }
        if !self.options.system_prompt.is_empty() {
            let mut system = Map::new();
            system.insert("type".into(), json!("text"));
            system.insert("text".into(), json!(self.options.system_prompt));
            if !self.options.disable_cache {
                system.insert("cache_control".into(), json!({"type": "ephemeral"}));
            }
            request.insert("system".into(), json!([Value::Object(system)]));
        }
        if stream {
            request.insert("stream".into(), json!(true));
        }
        Value::Object(request)
    }

    fn thinking_config(&self, history: &[Message]) -> Option<Value> {
        let should_think = self.options.should_think?;
        let last_user_text = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(Message::text)?;
        if last_user_text.is_empty() || !should_think(&last_user_text) {
            return None;
        }
        let budget = (f64::from(self.options.max_tokens) * THINKING_BUDGET_RATIO) as u64;
        Some(json!({"type": "enabled", "budget_tokens": budget}))
    }

    async fn post(
        &self,
        body: &Value,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(self.endpoint())
            .header("x-api-key", &self.options.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
    }
}

/// Add an ephemeral cache hint to the first text block of the `limit` most
/// recent user/assistant entries.
fn mark_recent_text_blocks(messages: &mut [Value], limit: usize) {
    let mut marked = 0;
    for message in messages.iter_mut().rev() {
        if marked >= limit {
            break;
        }
        let Some(blocks) = message.get_mut("content").and_then(Value::as_array_mut) else {
            continue;
        };
        let Some(block) = blocks
            .iter_mut()
            .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        else {
            continue;
        };
        if let Some(obj) = block.as_object_mut() {
            obj.insert("cache_control".into(), json!({"type": "ephemeral"}));
            marked += 1;
        }
    }
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::EndTurn,
        "max_tokens" => FinishReason::MaxTokens,
        "tool_use" => FinishReason::ToolUse,
        _ => FinishReason::Unknown,
    }
}

fn usage_from(value: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: value
            .get("input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        output_tokens: value
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cache_creation_tokens: value
            .get("cache_creation_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cache_read_tokens: value
            .get("cache_read_input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    }
}

fn response_from_body(body: &Value) -> ProviderResponse {
    let mut response = ProviderResponse::default();
    if let Some(blocks) = body.get("content").and_then(Value::as_array) {
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        response.content.push_str(text);
                    }
                }
                Some("thinking") => {
                    if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                        response
                            .reasoning
                            .get_or_insert_with(String::new)
                            .push_str(text);
                    }
                }
                Some("tool_use") => {
                    response.tool_calls.push(ProviderToolCall {
                        id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        input: block.get("input").map(Value::to_string).unwrap_or_default(),
                    });
                }
                _ => {}
            }
        }
    }
    if let Some(usage) = body.get("usage") {
        response.usage = usage_from(usage);
    }
    if let Some(reason) = body.get("stop_reason").and_then(Value::as_str) {
        response.finish_reason = map_stop_reason(reason);
    }
    response
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn model(&self) -> &Model {
        &self.options.model
    }

    async fn send(
        &self,
        cancel: CancellationToken,
        history: &[Message],
        tools: &[ToolInfo],
    ) -> Result<ProviderResponse, QuillError> {
        let request = self.build_request(history, tools, false);

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let response = self
                .post(&request)
                .await
                .map_err(|e| QuillError::ProviderFatal(e.to_string()))?;

            let status = response.status().as_u16();
            if response.status().is_success() {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| QuillError::ProviderFatal(e.to_string()))?;
                return Ok(response_from_body(&body));
            }

            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok()),
            );
            let body = response.text().await.unwrap_or_default();
            if !anthropic_retryable(status) {
                return Err(QuillError::ProviderFatal(format!("{status}: {body}")));
            }
            if attempts > MAX_RETRIES {
                return Err(QuillError::ProviderFatal(format!(
                    "maximum retry attempts reached for rate limit: {MAX_RETRIES} retries"
                )));
            }

            let delay = backoff_delay(attempts, retry_after);
            tracing::warn!(attempt = attempts, ?delay, "rate limited, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Err(QuillError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn stream(
        &self,
        cancel: CancellationToken,
        history: Vec<Message>,
        tools: Vec<ToolInfo>,
    ) -> mpsc::UnboundedReceiver<ProviderEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let request = self.build_request(&history, &tools, true);
        let client = self.client.clone();
        let endpoint = self.endpoint();
        let api_key = self.options.api_key.clone();

        tokio::spawn(async move {
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                let response = client
                    .post(&endpoint)
                    .header("x-api-key", &api_key)
                    .header("anthropic-version", API_VERSION)
                    .header("content-type", "application/json")
                    .json(&request)
                    .send()
                    .await;

                let response = match response {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = tx.send(ProviderEvent::Error {
                            message: e.to_string(),
                        });
                        return;
                    }
                };

                let status = response.status().as_u16();
                if !response.status().is_success() {
                    let retry_after = parse_retry_after(
                        response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok()),
                    );
                    let body = response.text().await.unwrap_or_default();
                    if anthropic_retryable(status) && attempts <= MAX_RETRIES {
                        let delay = backoff_delay(attempts, retry_after);
                        tracing::warn!(attempt = attempts, ?delay, "rate limited, retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                let _ = tx.send(ProviderEvent::Error { message: "canceled".into() });
                                return;
                            }
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                    let _ = tx.send(ProviderEvent::Error {
                        message: format!("{status}: {body}"),
                    });
                    return;
                }

                stream_events(response, &tx, &cancel).await;
                return;
            }
        });

        rx
    }
}

#[derive(Clone, Copy, PartialEq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
}

/// Drive one SSE response to completion, forwarding events and accumulating
/// the final [`ProviderResponse`].
async fn stream_events(
    response: reqwest::Response,
    tx: &mpsc::UnboundedSender<ProviderEvent>,
    cancel: &CancellationToken,
) {
    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();

    let mut accumulated = ProviderResponse::default();
    let mut blocks: Vec<BlockKind> = Vec::new();
    let mut tool_inputs: Vec<String> = Vec::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(ProviderEvent::Error { message: "canceled".into() });
                return;
            }
            chunk = stream.next() => chunk,
        };

        let Some(chunk) = chunk else {
            // Stream ended without message_stop; report what we have.
            let _ = tx.send(ProviderEvent::Error {
                message: "stream ended unexpectedly".into(),
            });
            return;
        };
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                let _ = tx.send(ProviderEvent::Error {
                    message: format!("stream read error: {e}"),
                });
                return;
            }
        };

        for sse in parser.push(&bytes) {
            let Ok(event) = serde_json::from_str::<Value>(&sse.data) else {
                continue;
            };
            match event.get("type").and_then(Value::as_str) {
                Some("message_start") => {
                    if let Some(usage) = event.pointer("/message/usage") {
                        accumulated.usage = usage_from(usage);
                    }
                }
                Some("content_block_start") => {
                    let block = event.get("content_block");
                    match block.and_then(|b| b.get("type")).and_then(Value::as_str) {
                        Some("tool_use") => {
                            let id = block
                                .and_then(|b| b.get("id"))
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            let name = block
                                .and_then(|b| b.get("name"))
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            blocks.push(BlockKind::ToolUse);
                            tool_inputs.push(String::new());
                            accumulated.tool_calls.push(ProviderToolCall {
                                id: id.clone(),
                                name: name.clone(),
                                input: String::new(),
                            });
                            let _ = tx.send(ProviderEvent::ToolUseStart { id, name });
                        }
                        Some("thinking") => {
                            blocks.push(BlockKind::Thinking);
                            let _ = tx.send(ProviderEvent::ContentStart);
                        }
                        _ => {
                            blocks.push(BlockKind::Text);
                            let _ = tx.send(ProviderEvent::ContentStart);
                        }
                    }
                }
                Some("content_block_delta") => {
                    match event.pointer("/delta/type").and_then(Value::as_str) {
                        Some("text_delta") => {
                            if let Some(text) =
                                event.pointer("/delta/text").and_then(Value::as_str)
                            {
                                accumulated.content.push_str(text);
                                let _ = tx.send(ProviderEvent::ContentDelta {
                                    text: text.to_string(),
                                });
                            }
                        }
                        Some("thinking_delta") => {
                            if let Some(text) =
                                event.pointer("/delta/thinking").and_then(Value::as_str)
                            {
                                accumulated
                                    .reasoning
                                    .get_or_insert_with(String::new)
                                    .push_str(text);
                                let _ = tx.send(ProviderEvent::ThinkingDelta {
                                    text: text.to_string(),
                                });
                            }
                        }
                        Some("input_json_delta") => {
                            if let Some(partial) =
                                event.pointer("/delta/partial_json").and_then(Value::as_str)
                            {
                                if let Some(input) = tool_inputs.last_mut() {
                                    input.push_str(partial);
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Some("content_block_stop") => {
                    if blocks.pop() == Some(BlockKind::ToolUse) {
                        if let (Some(input), Some(call)) =
                            (tool_inputs.last(), accumulated.tool_calls.last_mut())
                        {
                            call.input = if input.is_empty() {
                                "{}".to_string()
                            } else {
                                input.clone()
                            };
                        }
                    }
                    let _ = tx.send(ProviderEvent::ContentStop);
                }
                Some("message_delta") => {
                    if let Some(reason) =
                        event.pointer("/delta/stop_reason").and_then(Value::as_str)
                    {
                        accumulated.finish_reason = map_stop_reason(reason);
                    }
                    if let Some(output) =
                        event.pointer("/usage/output_tokens").and_then(Value::as_u64)
                    {
                        accumulated.usage.output_tokens = output;
                    }
                }
                Some("message_stop") => {
                    let _ = tx.send(ProviderEvent::Complete {
                        response: accumulated,
                    });
                    return;
                }
                Some("error") => {
                    let message = event
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown provider error")
                        .to_string();
                    let _ = tx.send(ProviderEvent::Error { message });
                    return;
                }
                _ => {}
            }
        }
    }
}
