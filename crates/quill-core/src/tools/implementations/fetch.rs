//! Fetch tool: single HTTP GET with per-host pacing.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::permission::CreatePermissionRequest;
use crate::tools::{parse_params, Tool, ToolCall, ToolContext, ToolInfo, ToolResponse};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_BODY_BYTES: usize = 50 * 1024;

const DESCRIPTION: &str = "Fetches the contents of a URL with a single HTTP GET request.

HOW TO USE:
- Provide an http or https URL
- Optionally give a timeout in seconds (default 30, maximum 120)

LIMITATIONS:
- The body is truncated to 50 KB
- Requests to the same host are rate limited
- Every invocation requires user approval";

pub struct FetchTool {
    client: reqwest::Client,
    host_interval: Duration,
    last_by_host: Mutex<HashMap<String, Instant>>,
}

#[derive(Deserialize)]
struct Params {
    url: String,
    #[serde(default)]
    timeout: Option<u64>,
}

impl FetchTool {
    pub fn new(host_interval_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            host_interval: Duration::from_millis(host_interval_ms),
            last_by_host: Mutex::new(HashMap::new()),
        }
    }

    /// Sleep until this host's slot opens, then claim it.
    async fn pace_host(&self, host: &str) {
        let wait = {
            let mut last = self.last_by_host.lock().await;
            let now = Instant::now();
            let wait = last
                .get(host)
                .map(|&t| (t + self.host_interval).saturating_duration_since(now))
                .unwrap_or(Duration::ZERO);
            last.insert(host.to_string(), now + wait);
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl Tool for FetchTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "fetch".into(),
            description: DESCRIPTION.into(),
            parameters: json!({
                "url": {
                    "type": "string",
                    "description": "The URL to fetch"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 30, max 120)"
                }
            }),
            required: vec!["url".into()],
        }
    }

    async fn run(&self, ctx: &ToolContext, call: ToolCall) -> ToolResponse {
        let params = match parse_params::<Params>(&call.input) {
            Ok(p) => p,
            Err(e) => return e,
        };
        let (session_id, _message_id) = match ctx.require_ids() {
            Ok(ids) => ids,
            Err(e) => return e,
        };

        let url = match url::Url::parse(&params.url) {
            Ok(u) => u,
            Err(e) => return ToolResponse::error(format!("invalid URL: {e}")),
        };
        if !matches!(url.scheme(), "http" | "https") {
            return ToolResponse::error(format!(
                "unsupported URL scheme '{}': only http and https are allowed",
                url.scheme()
            ));
        }
        let Some(host) = url.host_str().map(str::to_string) else {
            return ToolResponse::error("URL has no host");
        };

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
                tool_name: "fetch".into(),
                action: "fetch".into(),
                path: params.url.clone(),
                description: format!("Fetch URL {}", params.url),
                params: json!({ "url": params.url }),
            })
            .await;
        if !granted {
            return ToolResponse::error("permission denied");
        }

        self.pace_host(&host).await;

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return ToolResponse::error("canceled"),
            result = self.client.get(url.clone()).timeout(timeout).send() => match result {
                Ok(r) => r,
                Err(e) => return ToolResponse::error(format!("request failed: {e}")),
            },
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return ToolResponse::error(format!("failed to read response body: {e}")),
        };

        let truncated = body.len() > MAX_BODY_BYTES;
        let mut content = body;
        if truncated {
            let mut cut = MAX_BODY_BYTES;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            content.truncate(cut);
            content.push_str("\n[response truncated to 50KB]");
        }

        let response = ToolResponse::text(content).with_metadata(json!({
            "status": status.as_u16(),
            "url": params.url,
            "truncated": truncated,
        }));
        if status.is_success() {
            response
        } else {
            ToolResponse::error(format!("request failed with status {status}"))
        }
    }
}
