//! OpenAI Chat Completions adapter.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::QuillError;
use crate::message::{FinishReason, Message, Part, Role, TokenUsage};
use crate::models::Model;
use crate::tools::ToolInfo;

use super::retry::{backoff_delay, openai_retryable, parse_retry_after, MAX_RETRIES};
use super::sse::SseParser;
use super::{Provider, ProviderEvent, ProviderOptions, ProviderResponse, ProviderToolCall};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    options: ProviderOptions,
    client: reqwest::Client,
}

impl OpenAiProvider {
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
        format!("{base}/v1/chat/completions")
    }

    /// Deterministic translation of the abstract history.
    pub fn build_request(&self, history: &[Message], tools: &[ToolInfo], stream: bool) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        if !self.options.system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": self.options.system_prompt}));
        }

        for message in history {
            match message.role {
                Role::User => {
                    messages.push(json!({"role": "user", "content": message.text()}));
                }
                Role::Assistant => {
                    let text = message.text();
                    let tool_calls: Vec<Value> = message
                        .tool_calls()
                        .into_iter()
                        .map(|(id, name, input)| {
                            json!({
                                "id": id,
                                "type": "function",
                                "function": {"name": name, "arguments": input},
                            })
                        })
                        .collect();

                    if text.is_empty() && tool_calls.is_empty() {
                        tracing::warn!("assistant message without content, skipping");
                        continue;
                    }

                    let mut entry = Map::new();
                    entry.insert("role".into(), json!("assistant"));
                    entry.insert(
                        "content".into(),
                        if text.is_empty() {
                            Value::Null
                        } else {
                            json!(text)
                        },
                    );
                    if !tool_calls.is_empty() {
                        entry.insert("tool_calls".into(), json!(tool_calls));
                    }
                    messages.push(Value::Object(entry));
                }
                Role::Tool => {
                    for part in &message.parts {
                        if let Part::ToolResult {
                            tool_call_id,
                            content,
                            ..
                        } = part
                        {
                            messages.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_call_id,
                                "content": content,
                            }));
                        }
                    }
                }
                Role::System => {
                    messages.push(json!({"role": "system", "content": message.text()}));
                }
            }
        }

        let openai_tools: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": {
                            "type": "object",
                            "properties": t.parameters,
                            "required": t.required,
                        },
                    },
                })
            })
            .collect();

        let mut request = Map::new();
        request.insert("model".into(), json!(self.options.model.api_model));
        request.insert("max_tokens".into(), json!(self.options.max_tokens));
        request.insert("temperature".into(), json!(0));
        request.insert("messages".into(), json!(messages));
        if !openai_tools.is_empty() {
            request.insert("tools".into(), json!(openai_tools));
        }
        if stream {
            request.insert("stream".into(), json!(true));
            request.insert("stream_options".into(), json!({"include_usage": true}));
        }
        Value::Object(request)
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::EndTurn,
        "length" => FinishReason::MaxTokens,
        "tool_calls" => FinishReason::ToolUse,
        _ => FinishReason::Unknown,
    }
}

fn usage_from(value: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: value
            .get("prompt_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        output_tokens: value
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        cache_creation_tokens: 0,
        cache_read_tokens: value
            .pointer("/prompt_tokens_details/cached_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
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
                .client
                .post(self.endpoint())
                .bearer_auth(&self.options.api_key)
                .json(&request)
                .send()
                .await
                .map_err(|e| QuillError::ProviderFatal(e.to_string()))?;

            let status = response.status().as_u16();
            if response.status().is_success() {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| QuillError::ProviderFatal(e.to_string()))?;

                let mut result = ProviderResponse::default();
                let message = body.pointer("/choices/0/message");
                if let Some(content) =
                    message.and_then(|m| m.get("content")).and_then(Value::as_str)
                {
                    result.content = content.to_string();
                }
                if let Some(calls) = message
                    .and_then(|m| m.get("tool_calls"))
                    .and_then(Value::as_array)
                {
                    for call in calls {
                        result.tool_calls.push(ProviderToolCall {
                            id: call
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            name: call
                                .pointer("/function/name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            input: call
                                .pointer("/function/arguments")
                                .and_then(Value::as_str)
                                .unwrap_or("{}")
                                .to_string(),
                        });
                    }
                }
                if let Some(reason) = body
                    .pointer("/choices/0/finish_reason")
                    .and_then(Value::as_str)
                {
                    result.finish_reason = map_finish_reason(reason);
                }
                if let Some(usage) = body.get("usage") {
                    result.usage = usage_from(usage);
                }
                return Ok(result);
            }

            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok()),
            );
            let body = response.text().await.unwrap_or_default();
            if !openai_retryable(status) {
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
                let response = match client
                    .post(&endpoint)
                    .bearer_auth(&api_key)
                    .json(&request)
                    .send()
                    .await
                {
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
                    if openai_retryable(status) && attempts <= MAX_RETRIES {
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

async fn stream_events(
    response: reqwest::Response,
    tx: &mpsc::UnboundedSender<ProviderEvent>,
    cancel: &CancellationToken,
) {
    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();

    let mut accumulated = ProviderResponse::default();
    let mut content_started = false;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(ProviderEvent::Error { message: "canceled".into() });
                return;
            }
            chunk = stream.next() => chunk,
        };

        let Some(chunk) = chunk else {
            // [DONE] closes the stream; reaching here means it never came.
            let _ = tx.send(ProviderEvent::Complete {
                response: accumulated,
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
            if sse.data == "[DONE]" {
                if content_started {
                    let _ = tx.send(ProviderEvent::ContentStop);
                }
                let _ = tx.send(ProviderEvent::Complete {
                    response: accumulated,
                });
                return;
            }
            let Ok(event) = serde_json::from_str::<Value>(&sse.data) else {
                continue;
            };

            if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
                accumulated.usage = usage_from(usage);
            }

            let Some(choice) = event.pointer("/choices/0") else {
                continue;
            };

            if let Some(text) = choice.pointer("/delta/content").and_then(Value::as_str) {
                if !text.is_empty() {
                    if !content_started {
                        content_started = true;
                        let _ = tx.send(ProviderEvent::ContentStart);
                    }
                    accumulated.content.push_str(text);
                    let _ = tx.send(ProviderEvent::ContentDelta {
                        text: text.to_string(),
                    });
                }
            }

            if let Some(calls) = choice.pointer("/delta/tool_calls").and_then(Value::as_array) {
                for call in calls {
                    let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                    if index >= accumulated.tool_calls.len() {
                        let id = call
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let name = call
                            .pointer("/function/name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        accumulated.tool_calls.push(ProviderToolCall {
                            id: id.clone(),
                            name: name.clone(),
                            input: String::new(),
                        });
                        let _ = tx.send(ProviderEvent::ToolUseStart { id, name });
                    }
                    if let Some(arguments) = call
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                    {
                        if let Some(existing) = accumulated.tool_calls.get_mut(index) {
                            existing.input.push_str(arguments);
                        }
                    }
                }
            }

            if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
                accumulated.finish_reason = map_finish_reason(reason);
                for call in &mut accumulated.tool_calls {
                    if call.input.is_empty() {
                        call.input = "{}".to_string();
                    }
                }
                let _ = tx.send(ProviderEvent::ContentStop);
                content_started = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GPT_4O;
    use chrono::Utc;

    fn msg(role: Role, parts: Vec<Part>) -> Message {
        Message {
            id: "m".into(),
            session_id: "s".into(),
            role,
            parts,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn provider() -> OpenAiProvider {
        let mut options = ProviderOptions::new("key", GPT_4O);
        options.system_prompt = "be helpful".into();
        OpenAiProvider::new(options)
    }

    #[test]
    fn tool_results_flatten_to_tool_messages() {
        let history = vec![
            msg(Role::User, vec![Part::Text { text: "go".into() }]),
            msg(
                Role::Assistant,
                vec![Part::ToolCall {
                    id: "t1".into(),
                    name: "ls".into(),
                    input: "{}".into(),
                    finished: true,
                }],
            ),
            msg(
                Role::Tool,
                vec![
                    Part::ToolResult {
                        tool_call_id: "t1".into(),
                        content: "a\nb".into(),
                        is_error: false,
                        metadata: None,
                    },
                ],
            ),
        ];
        let request = provider().build_request(&history, &[], false);
        let messages = request["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["name"], "ls");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "t1");
    }

    #[test]
    fn translation_is_deterministic() {
        let history = vec![msg(Role::User, vec![Part::Text { text: "hey".into() }])];
        let a = provider().build_request(&history, &[], true);
        let b = provider().build_request(&history, &[], true);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
        assert_eq!(a["stream_options"]["include_usage"], true);
    }

    #[test]
    fn finish_reasons_map() {
        assert_eq!(map_finish_reason("stop"), FinishReason::EndTurn);
        assert_eq!(map_finish_reason("length"), FinishReason::MaxTokens);
        assert_eq!(map_finish_reason("tool_calls"), FinishReason::ToolUse);
        assert_eq!(map_finish_reason("content_filter"), FinishReason::Unknown);
    }

    #[test]
    fn usage_includes_cached_tokens() {
        let usage = usage_from(&json!({
            "prompt_tokens": 100,
            "completion_tokens": 20,
            "prompt_tokens_details": {"cached_tokens": 60}
        }));
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 20);
        assert_eq!(usage.cache_read_tokens, 60);
    }
}
