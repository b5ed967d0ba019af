//! Built-in tools.

use std::sync::Arc;

use anyhow::Result;

use super::{Tool, ToolContext};

mod bash;
mod edit;
mod fetch;
mod glob;
mod grep;
mod ls;
mod sourcegraph;
mod view;
mod write;

pub use bash::BashTool;
pub use edit::EditTool;
pub use fetch::FetchTool;
pub use glob::GlobTool;
pub use grep::GrepTool;
pub use ls::LsTool;
pub use sourcegraph::SourcegraphTool;
pub use view::ViewTool;
pub use write::WriteTool;

/// The standard toolset offered to the model.
pub fn default_tools(fetch_host_interval_ms: u64) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ViewTool),
        Arc::new(LsTool),
        Arc::new(GlobTool),
        Arc::new(GrepTool),
        Arc::new(WriteTool),
        Arc::new(EditTool),
        Arc::new(BashTool),
        Arc::new(FetchTool::new(fetch_host_interval_ms)),
        Arc::new(SourcegraphTool::new()),
    ]
}

/// Record the snapshots for one approved mutation. The first snapshot for a
/// `(session, path)` is the pre-image (or, for a brand-new file, the written
/// content); every later mutation appends the post-image.
pub(crate) fn snapshot_mutation(
    ctx: &ToolContext,
    session_id: &str,
    path: &str,
    old_content: Option<&str>,
    new_content: &str,
) -> Result<()> {
    let files = &ctx.services.files;
    let had_initial = files.get_initial(session_id, path)?.is_some();
    match (had_initial, old_content) {
        // New file: the written content is the baseline.
        (false, None) => {
            files.create_version(session_id, path, new_content)?;
        }
        // First mutation of an existing file: baseline, then post-image.
        (false, Some(old)) => {
            files.create_version(session_id, path, old)?;
            files.create_version(session_id, path, new_content)?;
        }
        (true, _) => {
            files.create_version(session_id, path, new_content)?;
        }
    }
    Ok(())
}

/// Wait briefly for fresh diagnostics after a write and return the block to
/// append to the tool response (empty when clean or no clients).
pub(crate) async fn diagnostics_block(ctx: &ToolContext, path: &std::path::Path) -> String {
    let lsp = &ctx.services.lsp;
    lsp.notify_change(path).await;
    lsp.wait_for_diagnostics(path, crate::lsp::DIAGNOSTICS_WAIT)
        .await;
    lsp.format_diagnostics(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support;

    #[test]
    fn default_toolset_names() {
        let tools = default_tools(2_000);
        let names: Vec<String> = tools.iter().map(|t| t.info().name).collect();
        assert_eq!(
            names,
            vec!["view", "ls", "glob", "grep", "write", "edit", "bash", "fetch", "sourcegraph"]
        );
    }

    #[test]
    fn snapshot_mutation_orders_versions() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, session) = test_support::context(dir.path());

        // First mutation of an existing file: initial is the pre-image.
        snapshot_mutation(&ctx, &session.id, "/wd/a.txt", Some("old"), "new").unwrap();
        let initial = ctx
            .services
            .files
            .get_initial(&session.id, "/wd/a.txt")
            .unwrap()
            .unwrap();
        assert_eq!(initial.content, "old");

        snapshot_mutation(&ctx, &session.id, "/wd/a.txt", Some("new"), "newer").unwrap();
        let latest = ctx
            .services
            .files
            .list_latest_by_session(&session.id)
            .unwrap();
        assert_eq!(latest[0].content, "newer");
        assert_eq!(latest[0].version, "2");

        // Brand-new file: written content is the initial snapshot.
        snapshot_mutation(&ctx, &session.id, "/wd/b.txt", None, "hi").unwrap();
        let b = ctx
            .services
            .files
            .get_initial(&session.id, "/wd/b.txt")
            .unwrap()
            .unwrap();
        assert_eq!(b.content, "hi");
    }
}
