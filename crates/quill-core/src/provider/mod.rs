//! Provider client.
//!
//! Adapters translate the abstract conversation history into each vendor's
//! wire shape and re-express the response as a shared event stream. The
//! translation is deterministic: the same history always produces the same
//! request JSON, byte for byte.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::QuillError;
use crate::message::{FinishReason, Message, TokenUsage};
use crate::models::Model;
use crate::tools::ToolInfo;

mod anthropic;
mod openai;
pub mod retry;
pub mod sse;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

/// A tool invocation extracted from a completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments.
    pub input: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ProviderToolCall>,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone)]
pub enum ProviderEvent {
    ContentStart,
    ContentDelta { text: String },
    ThinkingDelta { text: String },
    ContentStop,
    ToolUseStart { id: String, name: String },
    Complete { response: ProviderResponse },
    Error { message: String },
}

/// Construction options shared by all adapters.
#[derive(Clone)]
pub struct ProviderOptions {
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: Model,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub disable_cache: bool,
    /// Predicate over the last user message enabling the thinking budget.
    pub should_think: Option<fn(&str) -> bool>,
}

impl ProviderOptions {
    pub fn new(api_key: impl Into<String>, model: Model) -> Self {
        let max_tokens = model.default_max_tokens;
        Self {
            api_key: api_key.into(),
            base_url: None,
            model,
            max_tokens,
            system_prompt: String::new(),
            disable_cache: false,
            should_think: None,
        }
    }
}

/// Heuristic the original shipped: think when the user asks to.
pub fn default_should_think(message: &str) -> bool {
    message.to_lowercase().contains("think")
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn model(&self) -> &Model;

    /// One-shot completion. Retries transient failures internally.
    async fn send(
        &self,
        cancel: CancellationToken,
        history: &[Message],
        tools: &[ToolInfo],
    ) -> Result<ProviderResponse, QuillError>;

    /// Streaming completion. The receiver yields deltas and ends after a
    /// `Complete` or `Error` event.
    fn stream(
        &self,
        cancel: CancellationToken,
        history: Vec<Message>,
        tools: Vec<ToolInfo>,
    ) -> mpsc::UnboundedReceiver<ProviderEvent>;
}
