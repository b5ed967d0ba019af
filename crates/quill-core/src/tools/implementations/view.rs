//! View tool: windowed file reads.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::json;
use tokio::fs;

use crate::tools::{parse_params, Tool, ToolCall, ToolContext, ToolInfo, ToolResponse};

const DEFAULT_LINE_LIMIT: usize = 2_000;
const MAX_LINE_LENGTH: usize = 2_000;
const MAX_SUGGESTIONS: usize = 5;

const DESCRIPTION: &str = "File viewing tool that reads and displays the contents of files, \
helping you understand code before changing it.

HOW TO USE:
- Provide the absolute path to the file
- Optionally give a 1-indexed line offset and a line limit (default 2000)

LIMITATIONS:
- Lines longer than 2000 characters are truncated
- Binary files are refused; common image formats are returned as images
- You must view a file before editing or overwriting it";

pub struct ViewTool;

#[derive(Deserialize)]
struct Params {
    file_path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl Tool for ViewTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "view".into(),
            description: DESCRIPTION.into(),
            parameters: json!({
                "file_path": {
                    "type": "string",
                    "description": "The absolute path to the file to read"
                },
                "offset": {
                    "type": "integer",
                    "description": "The line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "description": "The number of lines to read (defaults to 2000)"
                }
            }),
            required: vec!["file_path".into()],
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

        let path = ctx.resolve_path(&params.file_path);
        if !path.exists() {
            let mut msg = format!("file not found: {}", path.display());
            let suggestions = find_suggestions(&params.file_path, ctx);
            if !suggestions.is_empty() {
                msg.push_str("\n\nDid you mean one of these?\n");
                for s in &suggestions {
                    msg.push_str(&format!("  {s}\n"));
                }
            }
            return ToolResponse::error(msg);
        }
        if path.is_dir() {
            return ToolResponse::error(format!(
                "path is a directory, not a file: {}",
                path.display()
            ));
        }

        if let Some(media_type) = image_media_type(&path) {
            let bytes = match fs::read(&path).await {
                Ok(b) => b,
                Err(e) => return ToolResponse::error(format!("failed to read file: {e}")),
            };
            ctx.services.records.record_read(&path);
            return ToolResponse::image(BASE64.encode(bytes), media_type);
        }

        let bytes = match fs::read(&path).await {
            Ok(b) => b,
            Err(e) => return ToolResponse::error(format!("failed to read file: {e}")),
        };

        let probe = bytes.len().min(8_192);
        if bytes[..probe].contains(&0) {
            return ToolResponse::error(format!(
                "cannot read binary file: {}",
                path.display()
            ));
        }

        let content = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => return ToolResponse::error(format!("file is not valid UTF-8: {e}")),
        };

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let start = params.offset.unwrap_or(1).saturating_sub(1);
        let limit = params.limit.unwrap_or(DEFAULT_LINE_LIMIT);

        if start > 0 && start >= total_lines {
            return ToolResponse::error(format!(
                "offset {} is beyond the end of the file ({} lines)",
                start + 1,
                total_lines
            ));
        }

        let end = (start + limit).min(total_lines);
        let mut out = String::new();
        for (i, line) in lines[start..end].iter().enumerate() {
            let mut shown: &str = line;
            let mut truncated_line = false;
            if shown.len() > MAX_LINE_LENGTH {
                let mut cut = MAX_LINE_LENGTH;
                while !shown.is_char_boundary(cut) {
                    cut -= 1;
                }
                shown = &shown[..cut];
                truncated_line = true;
            }
            out.push_str(&format!("{}|{}", start + i + 1, shown));
            if truncated_line {
                out.push_str("...");
            }
            out.push('\n');
        }
        if end < total_lines {
            out.push_str(&format!(
                "\n(file has more lines; use offset {} to continue)\n",
                end + 1
            ));
        }

        // Reading establishes the baseline: the mutate tools require it, and
        // the first snapshot for the path records what we saw.
        ctx.services.records.record_read(&path);
        if let Ok((session_id, _)) = ctx.require_ids() {
            let key = path.display().to_string();
            if let Ok(None) = ctx.services.files.get_initial(session_id, &key) {
                if let Err(e) = ctx.services.files.create_version(session_id, &key, &content) {
                    tracing::warn!("failed to record initial snapshot: {e}");
                }
            }
        }

        ToolResponse::text(out).with_metadata(json!({
            "total_lines": total_lines,
            "lines_returned": end - start,
            "start_line": start + 1,
        }))
    }
}

fn image_media_type(path: &std::path::Path) -> Option<&'static str> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => Some("image/png"),
        Some("jpg" | "jpeg") => Some("image/jpeg"),
        Some("gif") => Some("image/gif"),
        Some("webp") => Some("image/webp"),
        Some("bmp") => Some("image/bmp"),
        _ => None,
    }
}

fn find_suggestions(file_path: &str, ctx: &ToolContext) -> Vec<String> {
    let filename = match std::path::Path::new(file_path)
        .file_name()
        .and_then(|f| f.to_str())
    {
        Some(f) => f,
        None => return Vec::new(),
    };

    let pattern = format!("{}/**/{}", ctx.working_dir.display(), filename);
    let mut suggestions = Vec::new();
    if let Ok(paths) = glob::glob(&pattern) {
        for entry in paths.flatten() {
            suggestions.push(entry.display().to_string());
            if suggestions.len() >= MAX_SUGGESTIONS {
                break;
            }
        }
    }
    suggestions
}
