//! `web_search`: look things up through a pluggable search backend.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;

use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

pub const WEB_SEARCH: &str = "web_search";

/// One search result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// A web search provider.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ToolError>;
}

/// SearXNG-style JSON search endpoint (`GET {endpoint}?q=...&format=json`).
pub struct HttpSearchBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSearchBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ToolError> {
        let failed = |reason: String| ToolError::ExecutionFailed {
            name: WEB_SEARCH.to_string(),
            reason,
        };

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("format", "json")])
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(failed(format!("search returned HTTP {}", response.status())));
        }

        let body: SearchResponse = response.json().await.map_err(|e| failed(e.to_string()))?;
        Ok(body
            .results
            .into_iter()
            .take(limit)
            .map(|r| SearchHit {
                title: r.title,
                url: r.url,
                snippet: r.content,
            })
            .collect())
    }
}

/// Runs a web search and formats the hits for the model.
pub struct WebSearchTool {
    backend: Arc<dyn SearchBackend>,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(backend: Arc<dyn SearchBackend>, max_results: usize) -> Self {
        Self {
            backend,
            max_results: max_results.max(1),
        }
    }
}

fn format_hits(query: &str, hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return format!("No results found for \"{query}\".");
    }
    let mut out = format!("Search results for \"{query}\":\n");
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!("\n{}. {}\n   {}\n", i + 1, hit.title, hit.url));
        if !hit.snippet.is_empty() {
            out.push_str(&format!("   {}\n", hit.snippet));
        }
    }
    out
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        WEB_SEARCH
    }

    fn description(&self) -> &str {
        "Search the web for current information. Returns titles, URLs and snippets."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let query = require_str(&params, WEB_SEARCH, "query")?;
        let hits = self.backend.search(query, self.max_results).await?;
        tracing::debug!(session_id = %ctx.session_id, hits = hits.len(), "Web search finished");
        Ok(ToolOutput::text(format_hits(query, &hits), start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::test_context;

    struct FixedBackend;

    #[async_trait]
    impl SearchBackend for FixedBackend {
        async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ToolError> {
            Ok((0..5)
                .map(|i| SearchHit {
                    title: format!("{query} {i}"),
                    url: format!("https://example.com/{i}"),
                    snippet: String::new(),
                })
                .take(limit)
                .collect())
        }
    }

    #[tokio::test]
    async fn formats_limited_hits() {
        let tool = WebSearchTool::new(Arc::new(FixedBackend), 2);
        let output = tool
            .execute(serde_json::json!({"query": "rust"}), &test_context())
            .await
            .unwrap();
        assert!(output.output.contains("1. rust 0"));
        assert!(output.output.contains("2. rust 1"));
        assert!(!output.output.contains("3. rust 2"));
    }

    #[test]
    fn empty_results_are_explicit() {
        assert_eq!(format_hits("zzz", &[]), "No results found for \"zzz\".");
    }
}
