//! Events the agent emits to its consumer.

use crate::message::{FinishReason, Message};
use crate::permission::PermissionRequest;

#[derive(Debug, Clone)]
pub enum AgentEvent {
    MessageCreated { message: Message },
    MessageUpdated { message: Message },
    ToolStarted { call_id: String },
    ToolFinished { call_id: String, is_error: bool },
    PermissionRequested { request: PermissionRequest },
    RunFinished { reason: FinishReason },
    Error { message: String },
}
