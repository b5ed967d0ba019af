//! Bash tool: permission-gated shell execution.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;

use crate::permission::CreatePermissionRequest;
use crate::tools::{parse_params, Tool, ToolCall, ToolContext, ToolInfo, ToolResponse};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_OUTPUT_BYTES: usize = 30_000;

/// Commands refused outright: interactive fetchers and package managers the
/// model must not reach for. Matched against the first token of each
/// pipe/and-separated segment.
const BANNED_COMMANDS: &[&str] = &[
    "curl", "wget", "axel", "aria2c", "nc", "telnet", "lynx", "w3m", "links", "httpie", "xh",
    "http-prompt", "chrome", "firefox", "safari", "npm", "yarn", "pnpm", "pip", "pip3", "gem",
    "apt", "apt-get", "yum", "dnf", "brew",
];

const DESCRIPTION: &str = "Executes a shell command in the working directory and returns its \
combined output.

HOW TO USE:
- Provide the command to run
- Optionally give a timeout in seconds (default 120, maximum 600)

LIMITATIONS:
- Output is truncated to 30000 bytes
- Network fetchers and package managers are refused; use the fetch tool for HTTP
- Every invocation requires user approval";

pub struct BashTool;

#[derive(Deserialize)]
struct Params {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
}

#[async_trait]
impl Tool for BashTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "bash".into(),
            description: DESCRIPTION.into(),
            parameters: json!({
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 120, max 600)"
                }
            }),
            required: vec!["command".into()],
        }
    }

    async fn run(&self, ctx: &ToolContext, call: ToolCall) -> ToolResponse {
        let params = match parse_params::<Params>(&call.input) {
            Ok(p) => p,
            Err(e) => return e,
        };
        if params.command.trim().is_empty() {
            return ToolResponse::error("command is required");
        }
        let (session_id, _message_id) = match ctx.require_ids() {
            Ok(ids) => ids,
            Err(e) => return e,
        };

        if let Some(banned) = first_banned_command(&params.command) {
            return ToolResponse::error(format!("command '{banned}' is not allowed"));
        }

        let timeout = params
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
            .min(MAX_TIMEOUT);

        let granted = ctx
            .services
            .permissions
            .request(CreatePermissionRequest {
                session_id: session_id.to_string(),
                tool_name: "bash".into(),
                action: "execute".into(),
                path: ctx.working_dir.display().to_string(),
                description: format!("Execute command: {}", params.command),
                params: json!({ "command": params.command }),
            })
            .await;
        if !granted {
            return ToolResponse::error("permission denied");
        }

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&params.command)
            .current_dir(&ctx.working_dir)
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(c) => c,
            Err(e) => return ToolResponse::error(format!("failed to start command: {e}")),
        };

        // Dropping the wait future kills the child, so cancellation and
        // timeout both tear the process down promptly.
        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => return ToolResponse::error("canceled"),
            result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
                Err(_) => {
                    return ToolResponse::error(format!(
                        "command timed out after {} seconds",
                        timeout.as_secs()
                    ))
                }
                Ok(Err(e)) => return ToolResponse::error(format!("command failed: {e}")),
                Ok(Ok(output)) => output,
            },
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        let truncated = combined.len() > MAX_OUTPUT_BYTES;
        if truncated {
            let mut cut = MAX_OUTPUT_BYTES;
            while !combined.is_char_boundary(cut) {
                cut -= 1;
            }
            combined.truncate(cut);
            combined.push_str("\n[output truncated]");
        }

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code != 0 {
            combined.push_str(&format!("\nexit status {exit_code}"));
        }
        if combined.is_empty() {
            combined.push_str("(no output)");
        }

        ToolResponse::text(combined).with_metadata(json!({
            "exit_code": exit_code,
            "truncated": truncated,
        }))
    }
}

/// First token of each `|`/`&&`/`||`/`;`-separated segment, checked against
/// the denylist.
fn first_banned_command(command: &str) -> Option<&'static str> {
    for segment in command
        .split(['|', ';'])
        .flat_map(|s| s.split("&&"))
        .flat_map(|s| s.split("||"))
    {
        if let Some(first) = segment.split_whitespace().next() {
            if let Some(banned) = BANNED_COMMANDS.iter().find(|&&b| b == first) {
                return Some(banned);
            }
        }
    }
    None
}
