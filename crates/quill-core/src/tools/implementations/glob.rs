//! Glob tool: pattern-based file search.

use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::tools::{parse_params, Tool, ToolCall, ToolContext, ToolInfo, ToolResponse};

const MAX_RESULTS: usize = 100;

const DESCRIPTION: &str = "Fast file pattern matching tool that finds files by name using glob \
patterns like \"**/*.rs\" or \"src/**/*.ts\".

HOW TO USE:
- Provide the glob pattern; `**` crosses directory boundaries
- Optionally give a directory to search in (defaults to the working directory)

FEATURES:
- Results are sorted by modification time, newest first

LIMITATIONS:
- Capped at 100 results; narrow the pattern if you hit the cap
- Hidden directories are not searched";

pub struct GlobTool;

#[derive(Deserialize)]
struct Params {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

#[async_trait]
impl Tool for GlobTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "glob".into(),
            description: DESCRIPTION.into(),
            parameters: json!({
                "pattern": {
                    "type": "string",
                    "description": "The glob pattern to match files against"
                },
                "path": {
                    "type": "string",
                    "description": "The directory to search in (defaults to the working directory)"
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

        let root = match params.path.as_deref() {
            Some(p) if !p.is_empty() => ctx.resolve_path(p),
            _ => ctx.working_dir.clone(),
        };
        if !root.is_dir() {
            return ToolResponse::error(format!("path is not a directory: {}", root.display()));
        }

        let matcher = match globset::GlobBuilder::new(&params.pattern)
            .literal_separator(false)
            .build()
        {
            Ok(g) => g.compile_matcher(),
            Err(e) => return ToolResponse::error(format!("invalid glob pattern: {e}")),
        };

        let mut matches = collect_matches(&root, &matcher);
        matches.sort_by(|a, b| b.1.cmp(&a.1));
        let truncated = matches.len() > MAX_RESULTS;
        matches.truncate(MAX_RESULTS);

        if matches.is_empty() {
            return ToolResponse::text("No files found").with_metadata(json!({
                "count": 0,
                "truncated": false,
            }));
        }

        let mut output = String::new();
        for (path, _) in &matches {
            output.push_str(path);
            output.push('\n');
        }
        if truncated {
            output.push_str("\n(results truncated; use a more specific pattern)\n");
        }

        ToolResponse::text(output).with_metadata(json!({
            "count": matches.len(),
            "truncated": truncated,
        }))
    }
}

fn collect_matches(root: &Path, matcher: &globset::GlobMatcher) -> Vec<(String, SystemTime)> {
    let mut out = Vec::new();
    let walker = walkdir::WalkDir::new(root).into_iter().filter_entry(|e| {
        let name = e.file_name().to_string_lossy();
        !(e.depth() > 0 && name.starts_with('.') && e.file_type().is_dir())
    });

    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if !matcher.is_match(rel) && !matcher.is_match(entry.file_name()) {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        out.push((entry.path().display().to_string(), modified));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{call, context};
    use std::time::Duration;

    #[tokio::test]
    async fn matches_recursive_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/sub")).unwrap();
        std::fs::write(dir.path().join("src/a.rs"), "x").unwrap();
        std::fs::write(dir.path().join("src/sub/b.rs"), "x").unwrap();
        std::fs::write(dir.path().join("src/c.txt"), "x").unwrap();
        let (ctx, _session) = context(dir.path());

        let resp = GlobTool
            .run(&ctx, call("glob", json!({"pattern": "**/*.rs"})))
            .await;
        assert!(!resp.is_error);
        assert!(resp.content.contains("a.rs"));
        assert!(resp.content.contains("b.rs"));
        assert!(!resp.content.contains("c.txt"));
    }

    #[tokio::test]
    async fn newest_files_come_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.rs"), "x").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(dir.path().join("new.rs"), "x").unwrap();
        let (ctx, _session) = context(dir.path());

        let resp = GlobTool
            .run(&ctx, call("glob", json!({"pattern": "*.rs"})))
            .await;
        let first = resp.content.lines().next().unwrap();
        assert!(first.contains("new.rs"), "got: {first}");
    }

    #[tokio::test]
    async fn caps_results() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..150 {
            std::fs::write(dir.path().join(format!("f{i}.rs")), "x").unwrap();
        }
        let (ctx, _session) = context(dir.path());

        let resp = GlobTool
            .run(&ctx, call("glob", json!({"pattern": "*.rs"})))
            .await;
        let meta = resp.metadata.unwrap();
        assert_eq!(meta["count"], 100);
        assert_eq!(meta["truncated"], true);
    }

    #[tokio::test]
    async fn no_matches_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _session) = context(dir.path());
        let resp = GlobTool
            .run(&ctx, call("glob", json!({"pattern": "*.zig"})))
            .await;
        assert!(!resp.is_error);
        assert!(resp.content.contains("No files found"));
    }
}
