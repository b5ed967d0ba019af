//! Grep tool: regex search across the tree.

use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::tools::{parse_params, Tool, ToolCall, ToolContext, ToolInfo, ToolResponse};

const MAX_RESULTS: usize = 100;
const MAX_PREVIEW_LENGTH: usize = 200;

/// Directories skipped during the walk, matching the ls tool.
const NOISE_DIRS: &[&str] = &["node_modules", "__pycache__", "target", "dist", "vendor"];

const DESCRIPTION: &str = "Content search tool that scans file contents line by line with a \
regular expression.

HOW TO USE:
- Provide the regex pattern (Rust regex syntax)
- Optionally restrict the search to a directory and an include glob such as \"*.rs\"

FEATURES:
- Matches report path, line, column and a preview
- Files are ordered by modification time, newest first

LIMITATIONS:
- Capped at 100 matches; hidden and noise directories are skipped
- Binary files are ignored";

pub struct GrepTool;

#[derive(Deserialize)]
struct Params {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    include: Option<String>,
}

#[derive(Debug)]
struct Match {
    path: String,
    line: usize,
    column: usize,
    preview: String,
    modified: SystemTime,
}

#[async_trait]
impl Tool for GrepTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "grep".into(),
            description: DESCRIPTION.into(),
            parameters: json!({
                "pattern": {
                    "type": "string",
                    "description": "The regex pattern to search for in file contents"
                },
                "path": {
                    "type": "string",
                    "description": "The directory to search in (defaults to the working directory)"
                },
                "include": {
                    "type": "string",
                    "description": "File pattern to include in the search (e.g. \"*.rs\")"
                }
            }),
            required: vec!["pattern".into()],
        }
    }

    async fn run(&self, ctx: &ToolContext, call: ToolCall) -> ToolResponse {
        let params = match parse_params::<Params>(&call.input) {
            Ok(p) => p,
            Err(e) => return e,
        };
        if params.pattern.is_empty() {
            return ToolResponse::error("pattern is required");
        }

        let regex = match regex::Regex::new(&params.pattern) {
            Ok(r) => r,
            Err(e) => return ToolResponse::error(format!("invalid regex pattern: {e}")),
        };

        let include = match params.include.as_deref() {
            Some(p) if !p.is_empty() => {
                match globset::GlobBuilder::new(p).literal_separator(false).build() {
                    Ok(g) => Some(g.compile_matcher()),
                    Err(e) => return ToolResponse::error(format!("invalid include pattern: {e}")),
                }
            }
            _ => None,
        };

        let root = match params.path.as_deref() {
            Some(p) if !p.is_empty() => ctx.resolve_path(p),
            _ => ctx.working_dir.clone(),
        };
        if !root.is_dir() {
            return ToolResponse::error(format!("path is not a directory: {}", root.display()));
        }

        let mut matches = search(&root, &regex, include.as_ref());
        // Newest files first, stable within a file.
        matches.sort_by(|a, b| b.modified.cmp(&a.modified).then(a.line.cmp(&b.line)));
        let truncated = matches.len() > MAX_RESULTS;
        matches.truncate(MAX_RESULTS);

        if matches.is_empty() {
            return ToolResponse::text("No matches found").with_metadata(json!({
                "count": 0,
                "truncated": false,
            }));
        }

        let mut output = format!("Found {} match(es)\n\n", matches.len());
        let mut current_file = "";
        for m in &matches {
            if m.path != current_file {
                output.push_str(&format!("{}:\n", m.path));
                current_file = &m.path;
            }
            output.push_str(&format!("  {}:{}: {}\n", m.line, m.column, m.preview));
        }
        if truncated {
            output.push_str("\n(results truncated; use a more specific pattern or path)\n");
        }

        ToolResponse::text(output).with_metadata(json!({
            "count": matches.len(),
            "truncated": truncated,
        }))
    }
}

fn search(root: &Path, regex: &regex::Regex, include: Option<&globset::GlobMatcher>) -> Vec<Match> {
    let mut out = Vec::new();

    let walker = walkdir::WalkDir::new(root).into_iter().filter_entry(|e| {
        let name = e.file_name().to_string_lossy();
        if e.depth() > 0 && name.starts_with('.') {
            return false;
        }
        !(e.file_type().is_dir() && NOISE_DIRS.contains(&name.as_ref()))
    });

    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(include) = include {
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            if !include.is_match(rel) && !include.is_match(entry.file_name()) {
                continue;
            }
        }

        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue; // binary or unreadable
        };
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        for (i, line) in content.lines().enumerate() {
            if let Some(found) = regex.find(line) {
                let mut preview = line.trim_end().to_string();
                if preview.len() > MAX_PREVIEW_LENGTH {
                    let mut cut = MAX_PREVIEW_LENGTH;
                    while !preview.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    preview.truncate(cut);
                    preview.push_str("...");
                }
                out.push(Match {
                    path: entry.path().display().to_string(),
                    line: i + 1,
                    column: found.start() + 1,
                    preview,
                    modified,
                });
            }
        }
    }

    out
}
