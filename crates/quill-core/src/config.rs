//! Configuration loading.
//!
//! Settings come from a JSON file (`$XDG_CONFIG_HOME/quill/config.json`, or
//! an explicit path). Unknown keys are ignored so older binaries keep
//! working against newer config files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default minimum spacing between `fetch` requests to the same host.
pub const DEFAULT_FETCH_HOST_INTERVAL_MS: u64 = 2_000;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Absolute path the tools operate in.
    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    #[serde(default)]
    pub models: ModelsConfig,

    /// Per-provider credentials and switches, keyed by provider name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub debug: bool,

    /// Language server commands, keyed by language id.
    #[serde(default)]
    pub lsp: HashMap<String, LspConfig>,

    /// External tool server definitions, keyed by server name. Parsed and
    /// exposed to embedders; the core itself does not spawn them.
    #[serde(default)]
    pub mcp: HashMap<String, McpConfig>,

    #[serde(default)]
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Model used for the main conversation.
    #[serde(default = "default_big_model")]
    pub big: String,
    /// Cheap model used for side jobs such as title generation.
    #[serde(default = "default_little_model")]
    pub little: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            big: default_big_model(),
            little: default_little_model(),
        }
    }
}

fn default_big_model() -> String {
    "claude-3.7-sonnet".to_string()
}

fn default_little_model() -> String {
    "claude-3.5-haiku".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub disable_cache: bool,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LspConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Minimum milliseconds between requests to the same host.
    #[serde(default = "default_fetch_interval")]
    pub per_host_interval_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            per_host_interval_ms: default_fetch_interval(),
        }
    }
}

fn default_fetch_interval() -> u64 {
    DEFAULT_FETCH_HOST_INTERVAL_MS
}

impl Config {
    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    /// Working directory, defaulting to the process cwd.
    pub fn working_directory(&self) -> PathBuf {
        self.working_directory
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    pub fn provider(&self, name: &str) -> ProviderConfig {
        self.providers.get(name).cloned().unwrap_or_default()
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("quill").join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_ignored() {
        let raw = r#"{
            "working_directory": "/tmp/project",
            "debug": true,
            "future_option": {"nested": 1},
            "providers": {"anthropic": {"api_key": "k", "extra": true}}
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert!(config.debug);
        assert_eq!(
            config.working_directory.as_deref(),
            Some(Path::new("/tmp/project"))
        );
        assert_eq!(config.provider("anthropic").api_key, "k");
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.models.big, "claude-3.7-sonnet");
        assert_eq!(config.models.little, "claude-3.5-haiku");
        assert_eq!(
            config.fetch.per_host_interval_ms,
            DEFAULT_FETCH_HOST_INTERVAL_MS
        );
        assert!(!config.provider("anthropic").disable_cache);
    }

    #[test]
    fn lsp_and_mcp_entries_parse() {
        let raw = r#"{
            "lsp": {"go": {"command": "gopls"}},
            "mcp": {"search": {"command": "mcp-search", "args": ["--fast"], "env": {"TOKEN": "t"}}}
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.lsp["go"].command, "gopls");
        assert_eq!(config.mcp["search"].args, vec!["--fast"]);
    }
}
