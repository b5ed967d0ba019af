//! LSP diagnostics coordination.
//!
//! Actual language-server transports live outside the core; they feed
//! results into [`LspCoordinator::publish_diagnostics`]. After a write the
//! agent notifies the coordinator and waits briefly for the per-path
//! diagnostics version to advance, then appends a formatted block to the
//! tool response.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};

/// How long a tool waits for fresh diagnostics after a write.
pub const DIAGNOSTICS_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Information,
    Hint,
}

impl Severity {
    fn label(&self) -> &'static str {
        match self {
            Severity::Error => "Error",
            Severity::Warning => "Warn",
            Severity::Information => "Info",
            Severity::Hint => "Hint",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// 1-indexed.
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub source: Option<String>,
}

#[derive(Default)]
struct PathState {
    version: u64,
    diagnostics: Vec<Diagnostic>,
}

pub struct LspCoordinator {
    /// Configured language ids; with none, waits return immediately.
    languages: Vec<String>,
    states: RwLock<HashMap<PathBuf, PathState>>,
    changed: Notify,
}

impl LspCoordinator {
    pub fn new(languages: Vec<String>) -> Self {
        Self {
            languages,
            states: RwLock::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    pub fn has_clients(&self) -> bool {
        !self.languages.is_empty()
    }

    /// Transport-facing: replace the diagnostics for a file and advance its
    /// version so waiters wake up.
    pub async fn publish_diagnostics(&self, path: &Path, diagnostics: Vec<Diagnostic>) {
        {
            let mut states = self.states.write().await;
            let state = states.entry(path.to_path_buf()).or_default();
            state.version += 1;
            state.diagnostics = diagnostics;
        }
        self.changed.notify_waiters();
    }

    /// Hint that a file changed and new diagnostics are expected.
    pub async fn notify_change(&self, path: &Path) {
        let mut states = self.states.write().await;
        states.entry(path.to_path_buf()).or_default();
    }

    /// Wait until the file's diagnostics version advances or the deadline
    /// fires. Returns whether fresh diagnostics arrived.
    pub async fn wait_for_diagnostics(&self, path: &Path, deadline: Duration) -> bool {
        if !self.has_clients() {
            return false;
        }

        let start_version = self.version_of(path).await;
        let timeout = tokio::time::sleep(deadline);
        tokio::pin!(timeout);
        let mut poll = tokio::time::interval(Duration::from_millis(25));

        loop {
            if self.version_of(path).await > start_version {
                return true;
            }
            tokio::select! {
                _ = poll.tick() => {}
                _ = self.changed.notified() => {}
                _ = &mut timeout => return self.version_of(path).await > start_version,
            }
        }
    }

    async fn version_of(&self, path: &Path) -> u64 {
        self.states
            .read()
            .await
            .get(path)
            .map(|s| s.version)
            .unwrap_or(0)
    }

    pub async fn diagnostics(&self, path: &Path) -> Vec<Diagnostic> {
        self.states
            .read()
            .await
            .get(path)
            .map(|s| s.diagnostics.clone())
            .unwrap_or_default()
    }

    /// Block appended to tool responses; empty when the file is clean.
    pub async fn format_diagnostics(&self, path: &Path) -> String {
        let diagnostics = self.diagnostics(path).await;
        if diagnostics.is_empty() {
            return String::new();
        }

        let mut out = String::from("\n<file_diagnostics>\n");
        for d in &diagnostics {
            let source = d.source.as_deref().unwrap_or("lsp");
            out.push_str(&format!(
                "{}: {}:{}:{} [{}] {}\n",
                d.severity.label(),
                path.display(),
                d.line,
                d.column,
                source,
                d.message
            ));
        }
        out.push_str("</file_diagnostics>\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn diag(msg: &str) -> Diagnostic {
        Diagnostic {
            severity: Severity::Error,
            line: 3,
            column: 7,
            message: msg.into(),
            source: Some("rust-analyzer".into()),
        }
    }

    #[tokio::test]
    async fn wait_returns_when_version_advances() {
        let coordinator = Arc::new(LspCoordinator::new(vec!["rust".into()]));
        let path = PathBuf::from("/wd/main.rs");

        let waiter = coordinator.clone();
        let waiter_path = path.clone();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_diagnostics(&waiter_path, Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator
            .publish_diagnostics(&path, vec![diag("mismatched types")])
            .await;
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn wait_times_out_without_update() {
        let coordinator = LspCoordinator::new(vec!["rust".into()]);
        let got = coordinator
            .wait_for_diagnostics(Path::new("/wd/main.rs"), Duration::from_millis(30))
            .await;
        assert!(!got);
    }

    #[tokio::test]
    async fn wait_is_instant_with_no_clients() {
        let coordinator = LspCoordinator::disabled();
        let start = std::time::Instant::now();
        coordinator
            .wait_for_diagnostics(Path::new("/wd/main.rs"), Duration::from_secs(5))
            .await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn formatting_includes_position_and_source() {
        let coordinator = LspCoordinator::new(vec!["rust".into()]);
        let path = PathBuf::from("/wd/main.rs");
        coordinator
            .publish_diagnostics(&path, vec![diag("unused variable")])
            .await;

        let block = coordinator.format_diagnostics(&path).await;
        assert!(block.contains("<file_diagnostics>"));
        assert!(block.contains("/wd/main.rs:3:7"));
        assert!(block.contains("unused variable"));

        let clean = coordinator.format_diagnostics(Path::new("/wd/other.rs")).await;
        assert!(clean.is_empty());
    }
}
