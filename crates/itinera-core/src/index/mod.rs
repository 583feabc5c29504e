pub mod cache;
pub mod chunk;
pub mod embed;
pub mod loader;

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::IndexError;

pub use cache::{CacheKey, IndexCache};
pub use chunk::{ChunkingConfig, TextSpan};
pub use embed::{Embedder, HashingEmbedder, RigEmbedder};
pub use loader::Document;

/// A piece of one source document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    pub source: String,
    pub text: String,
    pub start_byte: usize,
    pub end_byte: usize,
    pub start_line: usize,
    pub end_line: usize,
    /// Index of this chunk within its document.
    pub position: usize,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk: DocumentChunk,
    pub score: f32,
}

/// Immutable vector index over the chunks of one or more documents.
pub struct DocumentIndex {
    chunks: Vec<DocumentChunk>,
    vectors: Vec<Vec<f32>>,
    /// Case-folded, whitespace-collapsed chunk text for phrase matching.
    normalized: Vec<String>,
    embedder: Arc<dyn Embedder>,
}

impl DocumentIndex {
    pub async fn build(
        documents: Vec<Document>,
        chunking: &ChunkingConfig,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, IndexError> {
        Self::build_with_cache(documents, chunking, embedder, None).await
    }

    /// Chunk and embed every document, reusing cached vectors for documents
    /// whose text, embedder and chunking are unchanged.
    pub async fn build_with_cache(
        documents: Vec<Document>,
        chunking: &ChunkingConfig,
        embedder: Arc<dyn Embedder>,
        cache: Option<&IndexCache>,
    ) -> Result<Self, IndexError> {
        let embedder_id = embedder.id();
        let mut chunks = Vec::new();
        let mut vectors = Vec::new();
        let mut reused = 0usize;

        for doc in &documents {
            if doc.text.trim().is_empty() {
                return Err(IndexError::load(&doc.source, "no extractable text"));
            }

            let key = CacheKey::new(&doc.source, &doc.text, &embedder_id, chunking);
            let cached = match cache {
                Some(cache) => cache.lookup(&key)?,
                None => None,
            };

            let embedded = match cached {
                Some(entries) => {
                    reused += 1;
                    entries
                }
                None => {
                    let spans = chunking.split(&doc.text);
                    let texts: Vec<String> = spans.iter().map(|s| s.text.clone()).collect();
                    let embedded = embedder.embed(&texts).await?;
                    if embedded.len() != spans.len() {
                        return Err(IndexError::Embedding(format!(
                            "expected {} vectors for {}, got {}",
                            spans.len(),
                            doc.source,
                            embedded.len()
                        )));
                    }
                    let entries: Vec<(TextSpan, Vec<f32>)> =
                        spans.into_iter().zip(embedded).collect();
                    if let Some(cache) = cache {
                        cache.store(&key, &entries)?;
                    }
                    entries
                }
            };

            debug!("Indexed {}: {} chunks", doc.source, embedded.len());
            for (position, (span, vector)) in embedded.into_iter().enumerate() {
                chunks.push(DocumentChunk {
                    source: doc.source.clone(),
                    text: span.text,
                    start_byte: span.start_byte,
                    end_byte: span.end_byte,
                    start_line: span.start_line,
                    end_line: span.end_line,
                    position,
                });
                vectors.push(vector);
            }
        }

        info!(
            "Document index: {} chunks from {} documents ({} from cache)",
            chunks.len(),
            documents.len(),
            reused
        );

        let normalized = chunks.iter().map(|c| normalize_phrase(&c.text)).collect();
        Ok(Self {
            chunks,
            vectors,
            normalized,
            embedder,
        })
    }

    /// The `k` most relevant chunks, best first.
    ///
    /// Chunks containing the query verbatim (case and spacing aside) rank
    /// ahead of all others; within each group hits are ordered by cosine
    /// similarity, and equal scores keep document order.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, IndexError> {
        let phrase = normalize_phrase(query);
        if phrase.is_empty() || k == 0 || self.chunks.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::Embedding("no vector returned for query".into()))?;

        let mut scored = Vec::with_capacity(self.chunks.len());
        for (i, vector) in self.vectors.iter().enumerate() {
            if vector.len() != query_vector.len() {
                return Err(IndexError::Embedding(format!(
                    "dimension mismatch: query {} vs chunk {}",
                    query_vector.len(),
                    vector.len()
                )));
            }
            let verbatim = self.normalized[i].contains(&phrase);
            scored.push((i, verbatim, embed::cosine(&query_vector, vector)));
        }

        // Stable sort keeps document order among ties
        scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.2.total_cmp(&a.2)));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(i, _, score)| SearchHit {
                chunk: self.chunks[i].clone(),
                score,
            })
            .collect())
    }

    pub fn chunks(&self) -> &[DocumentChunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Distinct sources, in indexing order.
    pub fn sources(&self) -> Vec<&str> {
        let mut sources: Vec<&str> = Vec::new();
        for chunk in &self.chunks {
            if sources.last() != Some(&chunk.source.as_str()) {
                sources.push(&chunk.source);
            }
        }
        sources
    }
}

/// Index a single document.
pub async fn index(
    document: Document,
    chunking: &ChunkingConfig,
    embedder: Arc<dyn Embedder>,
) -> Result<DocumentIndex, IndexError> {
    DocumentIndex::build(vec![document], chunking, embedder).await
}

fn normalize_phrase(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
