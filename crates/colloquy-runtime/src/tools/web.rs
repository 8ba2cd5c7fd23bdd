//! Web tools

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use colloquy_core::{
    error::Result,
    tool::{Tool, ToolArguments, ToolResult, ToolSchema, truncate_chars},
};
use serde_json::{Value, json};

use super::{str_arg, u64_arg};
use crate::search::{SearchHit, SearxngClient};

const MAX_FETCH_CHARS: usize = 20_000;
/// Bytes read from a response before the body is cut off
const MAX_FETCH_BYTES: usize = MAX_FETCH_CHARS * 4;
const DEFAULT_MAX_RESULTS: u64 = 5;

/// Web search through SearxNG
pub struct WebSearchTool {
    search: SearxngClient,
}

impl WebSearchTool {
    pub const fn new(search: SearxngClient) -> Self {
        Self { search }
    }
}

fn result_rows(hits: Vec<SearchHit>, max: usize) -> Value {
    hits.into_iter()
        .take(max)
        .map(|hit| {
            json!({
                "title": hit.title,
                "url": hit.url,
                "snippet": hit.content.unwrap_or_default(),
            })
        })
        .collect()
}

#[async_trait]
impl Tool for WebSearchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::builder("web_search", "Search the web. Returns titles, URLs and snippets.")
            .param("query", "string", "Search terms", true)
            .param("max_results", "integer", "Number of results (default: 5)", false)
            .build()
    }

    async fn execute(&self, arguments: &ToolArguments) -> Result<ToolResult> {
        let query = str_arg(arguments, "query")?;
        let max = usize::try_from(u64_arg(arguments, "max_results").unwrap_or(DEFAULT_MAX_RESULTS))
            .unwrap_or(usize::MAX);

        Ok(match self.search.search(query, None).await {
            Ok(hits) => ToolResult::success(result_rows(hits, max)),
            Err(e) => ToolResult::failure(format!("Search failed: {e}")),
        })
    }
}

/// Read at most `cap` bytes of a body; true when the body was longer.
/// The rest of the stream is never polled.
async fn collect_capped<S, B, E>(body: S, cap: usize) -> std::result::Result<(Vec<u8>, bool), E>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
{
    let mut body = std::pin::pin!(body);
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(chunk?.as_ref());
        if bytes.len() >= cap {
            let truncated = bytes.len() > cap;
            bytes.truncate(cap);
            return Ok((bytes, truncated));
        }
    }
    Ok((bytes, false))
}

/// Plain HTTP GET
pub struct FetchUrlTool {
    client: reqwest::Client,
}

impl FetchUrlTool {
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::builder("fetch_url", "Fetch a URL and return the response body as text.")
            .param("url", "string", "Absolute http(s) URL", true)
            .build()
    }

    async fn execute(&self, arguments: &ToolArguments) -> Result<ToolResult> {
        let url = str_arg(arguments, "url")?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Ok(ToolResult::failure(format!("Unsupported URL: {url}")));
        }

        tracing::debug!(url, "Fetching URL");
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => return Ok(ToolResult::failure(format!("Request failed: {e}"))),
        };
        let status = response.status();
        if !status.is_success() {
            return Ok(ToolResult::failure(format!("HTTP {status}")));
        }
        Ok(match collect_capped(response.bytes_stream(), MAX_FETCH_BYTES).await {
            Ok((bytes, truncated)) => {
                if truncated {
                    tracing::debug!(url, limit = MAX_FETCH_BYTES, "Response body cut off");
                }
                let body = String::from_utf8_lossy(&bytes);
                ToolResult::success(truncate_chars(&body, MAX_FETCH_CHARS))
            }
            Err(e) => ToolResult::failure(format!("Failed to read body: {e}")),
        })
    }
}
