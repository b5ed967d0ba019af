//! Edit tool: targeted text replacement, file creation, content deletion.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::fs;

use crate::permission::CreatePermissionRequest;
use crate::tools::{diff, parse_params, Tool, ToolCall, ToolContext, ToolInfo, ToolResponse};

use super::{diagnostics_block, snapshot_mutation};

const DESCRIPTION: &str = "Edits files by replacing text, creating new files, or deleting content.

To make an edit, provide:
1. file_path: absolute path to the file
2. old_string: the text to replace (must match exactly, including whitespace,
   and must identify a single location — include several lines of context)
3. new_string: the replacement text

Special cases:
- Empty old_string creates a new file with new_string as its content
- Empty new_string deletes the matched text

The tool replaces ONE occurrence. It fails when old_string matches multiple
locations or none; add more surrounding context to disambiguate. View the
file first: edits to unviewed or since-modified files are refused.";

pub struct EditTool;

#[derive(Deserialize)]
struct Params {
    file_path: String,
    old_string: String,
    new_string: String,
}

#[async_trait]
impl Tool for EditTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "edit".into(),
            description: DESCRIPTION.into(),
            parameters: json!({
                "file_path": {
                    "type": "string",
                    "description": "The absolute path to the file to modify"
                },
                "old_string": {
                    "type": "string",
                    "description": "The text to replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "The text to replace it with"
                }
            }),
            required: vec!["file_path".into(), "old_string".into(), "new_string".into()],
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

        if params.old_string.is_empty() {
            return self
                .create_file(ctx, &session_id, &path, &params.new_string)
                .await;
        }
        self.replace(ctx, &session_id, &path, &params.old_string, &params.new_string)
            .await
    }
}

impl EditTool {
    async fn create_file(
        &self,
        ctx: &ToolContext,
        session_id: &str,
        path: &Path,
        content: &str,
    ) -> ToolResponse {
        if path.exists() {
            if path.is_dir() {
                return ToolResponse::error(format!(
                    "path is a directory, not a file: {}",
                    path.display()
                ));
            }
            return ToolResponse::error(format!(
                "file already exists: {}. Use the write tool to overwrite it",
                path.display()
            ));
        }

        let display = ctx.display_path(path);
        let (diff_text, stats) = diff::generate(&display, "", content);

        let granted = ctx
            .services
            .permissions
            .request(CreatePermissionRequest {
                session_id: session_id.to_string(),
                tool_name: "edit".into(),
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
        if let Err(e) = fs::write(path, content).await {
            return ToolResponse::error(format!("failed to write file: {e}"));
        }

        ctx.services.records.record_write(path);
        ctx.services.records.record_read(path);
        if let Err(e) =
            snapshot_mutation(ctx, session_id, &path.display().to_string(), None, content)
        {
            tracing::error!("failed to record file snapshot: {e}");
        }

        ToolResponse::text(format!("File created: {}", path.display())).with_metadata(json!({
            "diff": diff_text,
            "additions": stats.additions,
            "removals": stats.removals,
        }))
    }

    async fn replace(
        &self,
        ctx: &ToolContext,
        session_id: &str,
        path: &Path,
        old_string: &str,
        new_string: &str,
    ) -> ToolResponse {
        if old_string == new_string {
            return ToolResponse::error("old_string and new_string are identical; nothing to do");
        }
        if !path.exists() {
            return ToolResponse::error(format!("file not found: {}", path.display()));
        }
        if path.is_dir() {
            return ToolResponse::error(format!(
                "path is a directory, not a file: {}",
                path.display()
            ));
        }
        if let Err(e) = ctx.services.records.check_mutable(path) {
            return e;
        }

        let old_content = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => return ToolResponse::error(format!("failed to read file: {e}")),
        };

        let Some(index) = old_content.find(old_string) else {
            return ToolResponse::error(
                "old_string not found in file. Make sure it matches exactly, \
                 including whitespace and line breaks",
            );
        };
        if old_content.rfind(old_string) != Some(index) {
            return ToolResponse::error(
                "old_string appears multiple times in the file. \
                 Please provide more context to ensure a unique match",
            );
        }

        let new_content = format!(
            "{}{}{}",
            &old_content[..index],
            new_string,
            &old_content[index + old_string.len()..]
        );

        let deleting = new_string.is_empty();
        let display = ctx.display_path(path);
        let (diff_text, stats) = diff::generate(&display, &old_content, &new_content);

        let (action, description) = if deleting {
            ("delete", format!("Delete content from file {}", path.display()))
        } else {
            ("replace", format!("Replace content in file {}", path.display()))
        };

        let granted = ctx
            .services
            .permissions
            .request(CreatePermissionRequest {
                session_id: session_id.to_string(),
                tool_name: "edit".into(),
                action: action.into(),
                path: path.display().to_string(),
                description,
                params: json!({
                    "file_path": path.display().to_string(),
                    "diff": diff_text,
                }),
            })
            .await;
        if !granted {
            return ToolResponse::error("permission denied");
        }

        if let Err(e) = fs::write(path, &new_content).await {
            return ToolResponse::error(format!("failed to write file: {e}"));
        }

        ctx.services.records.record_write(path);
        ctx.services.records.record_read(path);
        if let Err(e) = snapshot_mutation(
            ctx,
            session_id,
            &path.display().to_string(),
            Some(&old_content),
            &new_content,
        ) {
            tracing::error!("failed to record file snapshot: {e}");
        }

        let mut text = if deleting {
            format!("Content deleted from file: {}", path.display())
        } else {
            format!("Content replaced in file: {}", path.display())
        };
        text.push_str(&diagnostics_block(ctx, path).await);

        ToolResponse::text(text).with_metadata(json!({
            "diff": diff_text,
            "additions": stats.additions,
            "removals": stats.removals,
        }))
    }
}
