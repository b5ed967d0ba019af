//! Write tool: create or overwrite a file.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::fs;

use crate::permission::CreatePermissionRequest;
use crate::tools::{diff, parse_params, Tool, ToolCall, ToolContext, ToolInfo, ToolResponse};

use super::{diagnostics_block, snapshot_mutation};

const DESCRIPTION: &str = "File writing tool that creates or overwrites files in the filesystem.

HOW TO USE:
- Provide the path to the file and the full content to write
- Parent directories are created automatically

FEATURES:
- Checks that an existing file was viewed first and has not changed on disk
- Refuses writes that would leave the file unchanged

LIMITATIONS:
- Cannot append; the whole file is rewritten
- Requires user approval, shown together with the diff";

pub struct WriteTool;

#[derive(Deserialize)]
struct Params {
    file_path: String,
    content: String,
}

#[async_trait]
impl Tool for WriteTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "write".into(),
            description: DESCRIPTION.into(),
            parameters: json!({
                "file_path": {
                    "type": "string",
                    "description": "The path to the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write to the file"
                }
            }),
            required: vec!["file_path".into(), "content".into()],
        }
    }

    async fn run(&self, ctx: &ToolContext, call: ToolCall) -> ToolResponse {
        let params = match parse_params::<Params>(&call.input) {
            Ok(p) => p,
            Err(e) => return e,
        };
        if params.file_path.is_empty() {
            return ToolResponse::error("file_path is required");
        }
        let (session_id, _message_id) = match ctx.require_ids() {
            Ok(ids) => ids,
            Err(e) => return e,
        };
        let session_id = session_id.to_string();

        let path = ctx.resolve_path(&params.file_path);
        let exists = path.exists();
        if exists && path.is_dir() {
            return ToolResponse::error(format!(
                "path is a directory, not a file: {}",
                path.display()
            ));
        }

        let old_content = if exists {
            if let Err(e) = ctx.services.records.check_mutable(&path) {
                return e;
            }
            match fs::read_to_string(&path).await {
                Ok(c) => Some(c),
                Err(e) => return ToolResponse::error(format!("failed to read file: {e}")),
            }
        } else {
            None
        };

        if old_content.as_deref() == Some(params.content.as_str()) {
            return ToolResponse::error(format!(
                "file {} already contains the exact content. No changes made.",
                path.display()
            ));
        }

        let display = ctx.display_path(&path);
        let (diff_text, stats) =
            diff::generate(&display, old_content.as_deref().unwrap_or(""), &params.content);

        let granted = ctx
            .services
            .permissions
            .request(CreatePermissionRequest {
                session_id: session_id.clone(),
                tool_name: "write".into(),
                action: "create".into(),
                path: path.display().to_string(),
                description: format!("Create file {}", path.display()),
                params: json!({
                    "file_path": path.display().to_string(),
                    "diff": diff_text,
                }),
            })
            .await;
        if !granted {
            return ToolResponse::error("permission denied");
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return ToolResponse::error(format!("failed to create parent directories: {e}"));
            }
        }
        if let Err(e) = fs::write(&path, &params.content).await {
            return ToolResponse::error(format!("failed to write file: {e}"));
        }

        ctx.services.records.record_write(&path);
        ctx.services.records.record_read(&path);

        if let Err(e) = snapshot_mutation(
            ctx,
            &session_id,
            &path.display().to_string(),
            old_content.as_deref(),
            &params.content,
        ) {
            tracing::error!("failed to record file snapshot: {e}");
        }

        let mut text = format!("File successfully written: {}", path.display());
        text.push_str(&diagnostics_block(ctx, &path).await);

        ToolResponse::text(text).with_metadata(json!({
            "diff": diff_text,
            "additions": stats.additions,
            "removals": stats.removals,
        }))
    }
}
