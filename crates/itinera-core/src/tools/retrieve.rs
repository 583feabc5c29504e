use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::{Capability, Tool};
use crate::index::DocumentIndex;

/// Tool that searches the indexed travel documents.
pub struct RetrieverTool {
    name: String,
    description: String,
    index: Arc<DocumentIndex>,
    top_k: usize,
}

impl RetrieverTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        index: Arc<DocumentIndex>,
        top_k: usize,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            index,
            top_k: top_k.max(1),
        }
    }
}

#[async_trait]
impl Tool for RetrieverTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn capability(&self) -> Capability {
        Capability::Retrieve
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look up in the travel documents"
                }
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, query: &str) -> Result<String> {
        if query.trim().is_empty() {
            return Ok("Error: query is required".into());
        }

        let hits = self.index.search(query, self.top_k).await?;
        if hits.is_empty() {
            return Ok("No results found.".into());
        }

        let mut output = String::new();
        for (i, hit) in hits.iter().enumerate() {
            if i > 0 {
                output.push_str("\n---\n");
            }
            output.push_str(&format!(
                "## Result {} (score: {:.2})\n**Source:** {} (lines {}-{})\n\n{}\n",
                i + 1,
                hit.score,
                hit.chunk.source,
                hit.chunk.start_line,
                hit.chunk.end_line,
                hit.chunk.text,
            ));
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ChunkingConfig, Document, HashingEmbedder};

    async fn tool(top_k: usize) -> RetrieverTool {
        let text = "Florence\nThe Uffizi needs a reservation.\nPonte Vecchio is best at sunset.";
        let index = DocumentIndex::build(
            vec![Document::new("florence.md", text)],
            &ChunkingConfig::new(40, 0).unwrap(),
            Arc::new(HashingEmbedder::new(256)),
        )
        .await
        .unwrap();
        RetrieverTool::new("travel_docs", "Search travel documents", Arc::new(index), top_k)
    }

    #[tokio::test]
    async fn formats_hits_with_source_and_lines() {
        let out = tool(1).await.invoke("Uffizi needs a reservation").await.unwrap();
        assert!(out.starts_with("## Result 1 (score: "));
        assert!(out.contains("**Source:** florence.md (lines "));
        assert!(out.contains("The Uffizi needs a reservation."));
        assert!(!out.contains("## Result 2"));
    }

    #[tokio::test]
    async fn respects_top_k() {
        let out = tool(2).await.invoke("Florence").await.unwrap();
        assert!(out.contains("## Result 2"));
        assert!(!out.contains("## Result 3"));
    }

    #[tokio::test]
    async fn blank_query() {
        assert_eq!(tool(3).await.invoke(" ").await.unwrap(), "Error: query is required");
    }

    #[tokio::test]
    async fn descriptor_uses_configured_name() {
        let t = tool(3).await;
        assert_eq!(t.name(), "travel_docs");
        assert_eq!(t.capability(), Capability::Retrieve);
    }
}
