//! Sourcegraph tool: public code search.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::{parse_params, Tool, ToolCall, ToolContext, ToolInfo, ToolResponse};

const ENDPOINT: &str = "https://sourcegraph.com/.api/graphql";
const DEFAULT_COUNT: usize = 10;
const MAX_COUNT: usize = 20;
const MAX_DISPLAYED: usize = 10;
const CONTEXT_LINES: usize = 10;

const GRAPHQL_QUERY: &str = "query Search($query: String!) { search(query: $query, version: V2, \
patternType: standard ) { results { matchCount, limitHit, resultCount, approximateResultCount, \
missing { name }, timedout { name }, indexUnavailable, results { __typename, ... on FileMatch { \
repository { name }, file { path, url, content }, lineMatches { preview, lineNumber, \
offsetAndLengths } } } } } }";

const DESCRIPTION: &str = "Search code across public repositories using Sourcegraph's GraphQL API.

HOW TO USE:
- Provide a search query in Sourcegraph syntax
- Optionally give the number of results (default 10, max 20)

QUERY SYNTAX:
- \"file:.go fmt.Println\" limits to Go files
- \"repo:^github\\.com/golang/go$ fmt.Println\" limits to one repository
- \"lang:rust tokio::spawn\" limits by language
- \"type:symbol\" finds definitions; boolean operators AND/OR/NOT work

LIMITATIONS:
- Only public repositories are searched
- Complex queries may take longer to run";

pub struct SourcegraphTool {
    client: reqwest::Client,
}

impl SourcegraphTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for SourcegraphTool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct Params {
    query: String,
    #[serde(default)]
    count: Option<usize>,
}

#[async_trait]
impl Tool for SourcegraphTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "sourcegraph".into(),
            description: DESCRIPTION.into(),
            parameters: json!({
                "query": {
                    "type": "string",
                    "description": "The Sourcegraph search query"
                },
                "count": {
                    "type": "integer",
                    "description": "Number of results to return (default 10, max 20)"
                }
            }),
            required: vec!["query".into()],
        }
    }

    async fn run(&self, ctx: &ToolContext, call: ToolCall) -> ToolResponse {
        let params = match parse_params::<Params>(&call.input) {
            Ok(p) => p,
            Err(e) => return e,
        };
        if params.query.is_empty() {
            return ToolResponse::error("query is required");
        }
        let count = params.count.unwrap_or(DEFAULT_COUNT).clamp(1, MAX_COUNT);

        let body = json!({
            "query": GRAPHQL_QUERY,
            "variables": { "query": format!("{} count:{count}", params.query) },
        });

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return ToolResponse::error("canceled"),
            result = self
                .client
                .post(ENDPOINT)
                .header("Content-Type", "application/json")
                .header("User-Agent", "quill/1.0")
                .json(&body)
                .send() => match result {
                Ok(r) => r,
                Err(e) => return ToolResponse::error(format!("request failed: {e}")),
            },
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return ToolResponse::error(format!(
                "request failed with status {status}: {body}"
            ));
        }

        let result: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => return ToolResponse::error(format!("failed to parse response: {e}")),
        };

        match format_results(&result) {
            Ok(formatted) => ToolResponse::text(formatted),
            Err(e) => ToolResponse::error(format!("failed to format results: {e}")),
        }
    }
}

fn format_results(result: &Value) -> Result<String, String> {
    let mut out = String::new();

    if let Some(errors) = result.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            out.push_str("## Sourcegraph API Error\n\n");
            for err in errors {
                if let Some(message) = err.get("message").and_then(Value::as_str) {
                    out.push_str(&format!("- {message}\n"));
                }
            }
            return Ok(out);
        }
    }

    let search_results = result
        .pointer("/data/search/results")
        .ok_or("invalid response format: missing search results")?;

    let match_count = search_results
        .get("matchCount")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let result_count = search_results
        .get("resultCount")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    out.push_str("# Sourcegraph Search Results\n\n");
    out.push_str(&format!(
        "Found {match_count} matches across {result_count} results\n"
    ));
    if search_results
        .get("limitHit")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        out.push_str("(Result limit reached, try a more specific query)\n");
    }
    out.push('\n');

    let Some(results) = search_results.get("results").and_then(Value::as_array) else {
        out.push_str("No results found. Try a different query.\n");
        return Ok(out);
    };
    if results.is_empty() {
        out.push_str("No results found. Try a different query.\n");
        return Ok(out);
    }

    for (i, file_match) in results.iter().take(MAX_DISPLAYED).enumerate() {
        if file_match.get("__typename").and_then(Value::as_str) != Some("FileMatch") {
            continue;
        }

        let repo = file_match
            .pointer("/repository/name")
            .and_then(Value::as_str)
            .unwrap_or("");
        let path = file_match
            .pointer("/file/path")
            .and_then(Value::as_str)
            .unwrap_or("");
        let url = file_match.pointer("/file/url").and_then(Value::as_str);
        let content = file_match
            .pointer("/file/content")
            .and_then(Value::as_str)
            .unwrap_or("");

        out.push_str(&format!("## Result {}: {repo}/{path}\n\n", i + 1));
        if let Some(url) = url {
            out.push_str(&format!("URL: https://sourcegraph.com{url}\n\n"));
        }

        let Some(line_matches) = file_match.get("lineMatches").and_then(Value::as_array) else {
            continue;
        };
        for line_match in line_matches {
            let line_number = line_match
                .get("lineNumber")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            let preview = line_match
                .get("preview")
                .and_then(Value::as_str)
                .unwrap_or("");

            out.push_str("```\n");
            if !content.is_empty() {
                let lines: Vec<&str> = content.split('\n').collect();
                let start = line_number.saturating_sub(CONTEXT_LINES);
                for (j, line) in lines
                    .iter()
                    .enumerate()
                    .skip(start)
                    .take(line_number.saturating_sub(start))
                {
                    out.push_str(&format!("{}| {line}\n", j + 1));
                }
                out.push_str(&format!("{}|  {preview}\n", line_number + 1));
                for (j, line) in lines
                    .iter()
                    .enumerate()
                    .skip(line_number + 1)
                    .take(CONTEXT_LINES)
                {
                    out.push_str(&format!("{}| {line}\n", j + 1));
                }
            } else {
                out.push_str(&format!("{}| {preview}\n", line_number + 1));
            }
            out.push_str("```\n\n");
        }
    }

    Ok(out)
}
