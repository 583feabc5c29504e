use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use super::{Capability, Tool};

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";

/// Web search via the Brave Search API.
pub struct WebSearchTool {
    api_key: String,
    max_results: u32,
    client: reqwest::Client,
    tag_re: Regex,
}

impl WebSearchTool {
    pub fn new(api_key: String, max_results: u32) -> Result<Self> {
        Ok(Self {
            api_key,
            max_results: max_results.clamp(1, 20),
            client: reqwest::Client::new(),
            tag_re: Regex::new(r"<[^>]+>")?,
        })
    }

    fn clean(&self, snippet: &str) -> String {
        let text = self.tag_re.replace_all(snippet, "");
        html_escape::decode_html_entities(&text).trim().to_string()
    }

    /// Render a Brave response body as a plain-text summary.
    fn format_results(&self, query: &str, body: &serde_json::Value) -> String {
        let results = body
            .get("web")
            .and_then(|w| w.get("results"))
            .and_then(|r| r.as_array());

        let results = match results {
            Some(r) if !r.is_empty() => r,
            _ => return format!("No results for: {query}"),
        };

        let mut output = format!("Results for: {query}\n");
        for (i, result) in results
            .iter()
            .take(self.max_results as usize)
            .enumerate()
        {
            let title = result.get("title").and_then(|t| t.as_str()).unwrap_or("");
            let url = result.get("url").and_then(|u| u.as_str()).unwrap_or("");
            let desc = result
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("");
            output.push_str(&format!(
                "\n{}. {}\n   {url}\n   {}",
                i + 1,
                self.clean(title),
                self.clean(desc)
            ));
        }
        output
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information such as events, prices, weather or news. \
         Returns titles, URLs and snippets."
    }

    fn capability(&self) -> Capability {
        Capability::Search
    }

    async fn invoke(&self, query: &str) -> Result<String> {
        let query = query.trim();
        if query.is_empty() {
            return Ok("Error: query is required".into());
        }

        if self.api_key.is_empty() {
            return Ok("Error: BRAVE_API_KEY not configured. Set tools.web.search.apiKey in config.json or BRAVE_API_KEY env var.".into());
        }

        let count = self.max_results.to_string();
        let resp = self
            .client
            .get(BRAVE_ENDPOINT)
            .query(&[("q", query), ("count", count.as_str())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        resp.error_for_status_ref()
            .map_err(|e| anyhow::anyhow!("Brave Search API error: {e}"))?;

        let body: serde_json::Value = resp.json().await?;
        Ok(self.format_results(query, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_results_and_strips_markup() {
        let tool = WebSearchTool::new("key".into(), 2).unwrap();
        let body = serde_json::json!({
            "web": { "results": [
                {"title": "Rome <strong>in 2 days</strong>", "url": "https://a.example", "description": "See the Colosseum &amp; Forum"},
                {"title": "Vatican tips", "url": "https://b.example", "description": "Book ahead"},
                {"title": "Dropped", "url": "https://c.example", "description": "over the limit"}
            ]}
        });
        let out = tool.format_results("rome", &body);
        assert!(out.starts_with("Results for: rome"));
        assert!(out.contains("1. Rome in 2 days"));
        assert!(out.contains("See the Colosseum & Forum"));
        assert!(out.contains("2. Vatican tips"));
        assert!(!out.contains("Dropped"));
    }

    #[test]
    fn empty_results() {
        let tool = WebSearchTool::new("key".into(), 5).unwrap();
        let out = tool.format_results("atlantis", &serde_json::json!({"web": {"results": []}}));
        assert_eq!(out, "No results for: atlantis");
    }

    #[tokio::test]
    async fn missing_key_is_reported_not_raised() {
        let tool = WebSearchTool::new(String::new(), 5).unwrap();
        let out = tool.invoke("Rome museums").await.unwrap();
        assert!(out.contains("BRAVE_API_KEY"));
    }

    #[tokio::test]
    async fn blank_query() {
        let tool = WebSearchTool::new("key".into(), 5).unwrap();
        assert_eq!(tool.invoke("  ").await.unwrap(), "Error: query is required");
    }
}
