//! Streaming accumulation.
//!
//! Re-expresses the provider's delta stream as edits to an ordered part
//! list. The accumulator runs on the agent task; the store update after
//! each step is the only synchronization point observers rely on.

use crate::message::{FinishReason, Part};
use crate::provider::{ProviderEvent, ProviderResponse};

#[derive(Default)]
pub struct StreamAccumulator {
    parts: Vec<Part>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn into_parts(self) -> Vec<Part> {
        self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Fold one provider event in. Returns whether the parts changed and an
    /// observer should see the new state.
    pub fn apply(&mut self, event: &ProviderEvent) -> bool {
        match event {
            ProviderEvent::ContentStart => false,
            ProviderEvent::ContentDelta { text } => {
                if let Some(Part::Text { text: existing }) = self.parts.last_mut() {
                    existing.push_str(text);
                } else {
                    self.parts.push(Part::Text { text: text.clone() });
                }
                true
            }
            ProviderEvent::ThinkingDelta { text } => {
                if let Some(Part::Reasoning { text: existing }) = self.parts.last_mut() {
                    existing.push_str(text);
                } else {
                    self.parts.push(Part::Reasoning { text: text.clone() });
                }
                true
            }
            ProviderEvent::ToolUseStart { id, name } => {
                self.parts.push(Part::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: String::new(),
                    finished: false,
                });
                true
            }
            ProviderEvent::ContentStop => {
                if let Some(Part::ToolCall { finished, .. }) = self.parts.last_mut() {
                    if !*finished {
                        *finished = true;
                        return true;
                    }
                }
                false
            }
            ProviderEvent::Complete { response } => {
                self.finish(response);
                true
            }
            ProviderEvent::Error { .. } => false,
        }
    }

    /// Fill tool inputs from the final response and close the message.
    fn finish(&mut self, response: &ProviderResponse) {
        for part in &mut self.parts {
            if let Part::ToolCall {
                id,
                input,
                finished,
                ..
            } = part
            {
                if let Some(call) = response.tool_calls.iter().find(|c| &c.id == id) {
                    *input = call.input.clone();
                }
                *finished = true;
            }
        }

        // Tool calls the stream never surfaced individually (non-streaming
        // vendors) still land in the message.
        for call in &response.tool_calls {
            let seen = self.parts.iter().any(
                |p| matches!(p, Part::ToolCall { id, .. } if id == &call.id),
            );
            if !seen {
                self.parts.push(Part::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                    finished: true,
                });
            }
        }

        self.parts.push(Part::Finish {
            reason: response.finish_reason,
            usage: response.usage,
        });
    }

    /// Close the message as canceled, keeping whatever arrived so far.
    pub fn cancel(&mut self) {
        for part in &mut self.parts {
            if let Part::ToolCall { finished, .. } = part {
                *finished = true;
            }
        }
        self.parts.push(Part::Finish {
            reason: FinishReason::Canceled,
            usage: Default::default(),
        });
    }

    /// Finished tool calls, in message order.
    pub fn tool_calls(&self) -> Vec<(String, String, String)> {
        self.parts
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
            .collect()
    }
}
