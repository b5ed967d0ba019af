//! Conversation domain model.
//!
//! A message is an ordered list of typed parts. Parts are serialized as an
//! internally tagged JSON array and stored in a single column, so the full
//! message round-trips without a schema migration per part kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// Terminal classification of an assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    MaxTokens,
    /// Non-terminal: the model wants tool results before continuing.
    ToolUse,
    Canceled,
    Error,
    #[default]
    Unknown,
}

impl FinishReason {
    /// Whether the agent loop stops after seeing this reason.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FinishReason::ToolUse)
    }
}

/// Token counters reported by a provider for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        /// Raw JSON arguments as produced by the model.
        input: String,
        finished: bool,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    Finish {
        reason: FinishReason,
        usage: TokenUsage,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let Part::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    pub fn tool_calls(&self) -> Vec<(&str, &str, &str)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall {
                    id, name, input, ..
                } => Some((id.as_str(), name.as_str(), input.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.parts.iter().rev().find_map(|p| match p {
            Part::Finish { reason, .. } => Some(*reason),
            _ => None,
        })
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.parts.iter().rev().find_map(|p| match p {
            Part::Finish { usage, .. } => Some(*usage),
            _ => None,
        })
    }

    /// Ids of tool calls that have no matching result in `results`.
    pub fn unmatched_tool_calls<'a>(&'a self, results: &[&Message]) -> Vec<&'a str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .filter(|id| {
                !results.iter().any(|m| {
                    m.parts.iter().any(|p| {
                        matches!(p, Part::ToolResult { tool_call_id, .. } if tool_call_id == id)
                    })
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_round_trip_through_json() {
        let parts = vec![
            Part::Text {
                text: "hello".into(),
            },
            Part::Reasoning {
                text: "thinking".into(),
            },
            Part::ToolCall {
                id: "call_1".into(),
                name: "view".into(),
                input: r#"{"file_path":"/tmp/a"}"#.into(),
                finished: true,
            },
            Part::ToolResult {
                tool_call_id: "call_1".into(),
                content: "ok".into(),
                is_error: false,
                metadata: None,
            },
            Part::Finish {
                reason: FinishReason::EndTurn,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                },
            },
        ];

        let json = serde_json::to_string(&parts).unwrap();
        let back: Vec<Part> = serde_json::from_str(&json).unwrap();
        assert_eq!(parts, back);
    }

    #[test]
    fn tagged_representation_is_stable() {
        let part = Part::ToolCall {
            id: "c".into(),
            name: "ls".into(),
            input: "{}".into(),
            finished: false,
        };
        let value = serde_json::to_value(&part).unwrap();
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["finished"], false);
    }

    #[test]
    fn finish_reason_terminality() {
        assert!(FinishReason::EndTurn.is_terminal());
        assert!(FinishReason::Canceled.is_terminal());
        assert!(!FinishReason::ToolUse.is_terminal());
    }
}
