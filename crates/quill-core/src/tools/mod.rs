//! Tool surface.
//!
//! Every tool exposes a JSON-schema description and a single `run` entry
//! point. Mutating tools share the read-before-write contract enforced by
//! [`file_record::FileRecords`] and gate every filesystem change behind the
//! permission broker with the generated diff attached.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::lsp::LspCoordinator;
use crate::permission::PermissionService;
use crate::storage::FileStore;

pub mod diff;
pub mod file_record;
pub mod implementations;

pub use file_record::FileRecords;

#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    /// JSON Schema `properties` object.
    pub parameters: Value,
    pub required: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments exactly as the model produced them.
    pub input: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Text,
    Image,
}

#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub response_type: ResponseType,
    pub content: String,
    pub metadata: Option<Value>,
    pub is_error: bool,
}

impl ToolResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Text,
            content: content.into(),
            metadata: None,
            is_error: false,
        }
    }

    /// Base64 image payload with its media type in metadata.
    pub fn image(content: impl Into<String>, media_type: &str) -> Self {
        Self {
            response_type: ResponseType::Image,
            content: content.into(),
            metadata: Some(serde_json::json!({ "media_type": media_type })),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Text,
            content: content.into(),
            metadata: None,
            is_error: true,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Services the tools share. Presentation layers build one per process.
pub struct ToolServices {
    pub permissions: Arc<PermissionService>,
    pub files: Arc<FileStore>,
    pub records: Arc<FileRecords>,
    pub lsp: Arc<LspCoordinator>,
}

/// Per-invocation context handed to every tool.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: Option<String>,
    pub message_id: Option<String>,
    pub working_dir: PathBuf,
    pub cancel: CancellationToken,
    pub services: Arc<ToolServices>,
}

impl ToolContext {
    /// Session and message ids are mandatory for anything that persists or
    /// asks for permission; their absence is a wiring bug, not bad input.
    pub fn require_ids(&self) -> Result<(&str, &str), ToolResponse> {
        match (self.session_id.as_deref(), self.message_id.as_deref()) {
            (Some(s), Some(m)) => Ok((s, m)),
            _ => Err(ToolResponse::error(
                "session_id and message_id are required",
            )),
        }
    }

    /// Absolute paths pass through; relative paths anchor at the working
    /// directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            self.working_dir.join(p)
        }
    }

    /// Path rendered relative to the working directory for display.
    pub fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.working_dir)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn info(&self) -> ToolInfo;
    async fn run(&self, ctx: &ToolContext, call: ToolCall) -> ToolResponse;
}

/// Parse tool parameters, mapping failures to an error response.
pub fn parse_params<T: serde::de::DeserializeOwned>(input: &str) -> Result<T, ToolResponse> {
    serde_json::from_str(input)
        .map_err(|e| ToolResponse::error(format!("invalid parameters: {e}")))
}

/// Name-indexed set of tools handed to the agent.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        let by_name = tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.info().name, i))
            .collect();
        Self { tools, by_name }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name.get(name).map(|&i| self.tools[i].clone())
    }

    pub fn infos(&self) -> Vec<ToolInfo> {
        self.tools.iter().map(|t| t.info()).collect()
    }
}
