//! Ls tool: tree view of a directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::tools::{parse_params, Tool, ToolCall, ToolContext, ToolInfo, ToolResponse};

const MAX_ENTRIES: usize = 1_000;

/// Directories that are never worth listing.
const NOISE_DIRS: &[&str] = &["node_modules", "__pycache__", "target", "dist", "vendor"];

const DESCRIPTION: &str = "Directory listing tool that shows files and subdirectories in a tree \
structure, helping you explore the project organization.

HOW TO USE:
- Provide a path to list (defaults to the working directory)
- Optionally give glob patterns to ignore

FEATURES:
- Hidden entries and common noise directories are skipped automatically

LIMITATIONS:
- Results are capped at 1000 entries; large directories are truncated
- Use the glob tool to find files by name and grep to search contents";

pub struct LsTool;

#[derive(Deserialize)]
struct Params {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    ignore: Vec<String>,
}

#[async_trait]
impl Tool for LsTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "ls".into(),
            description: DESCRIPTION.into(),
            parameters: json!({
                "path": {
                    "type": "string",
                    "description": "The path to the directory to list (defaults to the working directory)"
                },
                "ignore": {
                    "type": "array",
                    "description": "List of glob patterns to ignore",
                    "items": { "type": "string" }
                }
            }),
            required: vec!["path".into()],
        }
    }

    async fn run(&self, ctx: &ToolContext, call: ToolCall) -> ToolResponse {
        let params = match parse_params::<Params>(&call.input) {
            Ok(p) => p,
            Err(e) => return e,
        };

        let root = match params.path.as_deref() {
            Some(p) if !p.is_empty() => ctx.resolve_path(p),
            _ => ctx.working_dir.clone(),
        };
        if !root.exists() {
            return ToolResponse::error(format!("path does not exist: {}", root.display()));
        }
        if !root.is_dir() {
            return ToolResponse::error(format!("path is not a directory: {}", root.display()));
        }

        let ignore: Vec<glob::Pattern> = params
            .ignore
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();

        let (entries, truncated) = collect_entries(&root, &ignore, MAX_ENTRIES);
        let mut output = render_tree(&root, &entries);

        if truncated {
            output = format!(
                "There are more than {MAX_ENTRIES} entries in the directory. \
                 Use a more specific path or the glob tool to find specific files. \
                 The first {MAX_ENTRIES} entries are included below:\n\n{output}"
            );
        }

        ToolResponse::text(output).with_metadata(json!({
            "entries": entries.len(),
            "truncated": truncated,
        }))
    }
}

struct Entry {
    rel: PathBuf,
    is_dir: bool,
}

fn collect_entries(root: &Path, ignore: &[glob::Pattern], limit: usize) -> (Vec<Entry>, bool) {
    let mut entries = Vec::new();
    let mut truncated = false;

    let walker = walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !should_skip(e, ignore));

    for entry in walker.flatten() {
        if entry.path() == root {
            continue;
        }
        if entries.len() >= limit {
            truncated = true;
            break;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        entries.push(Entry {
            rel,
            is_dir: entry.file_type().is_dir(),
        });
    }

    (entries, truncated)
}

fn should_skip(entry: &walkdir::DirEntry, ignore: &[glob::Pattern]) -> bool {
    let name = entry.file_name().to_string_lossy();
    if entry.depth() > 0 && name.starts_with('.') {
        return true;
    }
    if entry.file_type().is_dir() && NOISE_DIRS.contains(&name.as_ref()) {
        return true;
    }
    ignore.iter().any(|p| p.matches(&name))
}

fn render_tree(root: &Path, entries: &[Entry]) -> String {
    let mut out = format!("- {}/\n", root.display());
    for entry in entries {
        let depth = entry.rel.components().count();
        let indent = "  ".repeat(depth);
        let name = entry
            .rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if entry.is_dir {
            out.push_str(&format!("{indent}- {name}/\n"));
        } else {
            out.push_str(&format!("{indent}- {name}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{call, context};

    fn setup(dir: &Path) {
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.join("README.md"), "#").unwrap();
        std::fs::create_dir_all(dir.join(".git")).unwrap();
        std::fs::write(dir.join(".git/HEAD"), "ref").unwrap();
        std::fs::create_dir_all(dir.join("node_modules/pkg")).unwrap();
        std::fs::write(dir.join("node_modules/pkg/index.js"), "x").unwrap();
    }

    #[tokio::test]
    async fn renders_tree_skipping_noise() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let (ctx, _session) = context(dir.path());

        let resp = LsTool.run(&ctx, call("ls", json!({}))).await;
        assert!(!resp.is_error);
        assert!(resp.content.contains("- src/"));
        assert!(resp.content.contains("- main.rs"));
        assert!(resp.content.contains("- README.md"));
        assert!(!resp.content.contains(".git"));
        assert!(!resp.content.contains("node_modules"));
    }

    #[tokio::test]
    async fn ignore_patterns_apply() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let (ctx, _session) = context(dir.path());

        let resp = LsTool
            .run(&ctx, call("ls", json!({"ignore": ["*.md"]})))
            .await;
        assert!(!resp.content.contains("README.md"));
        assert!(resp.content.contains("main.rs"));
    }

    #[tokio::test]
    async fn caps_at_limit_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..(MAX_ENTRIES + 50) {
            std::fs::write(dir.path().join(format!("f{i:04}.txt")), "x").unwrap();
        }
        let (ctx, _session) = context(dir.path());

        let resp = LsTool.run(&ctx, call("ls", json!({}))).await;
        assert!(resp.content.contains("more than 1000 entries"));
        assert_eq!(resp.metadata.unwrap()["truncated"], true);
    }

    #[tokio::test]
    async fn missing_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _session) = context(dir.path());
        let resp = LsTool
            .run(&ctx, call("ls", json!({"path": "nope"})))
            .await;
        assert!(resp.is_error);
        assert!(resp.content.contains("does not exist"));
    }
}
