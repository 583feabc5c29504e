use async_trait::async_trait;
use rig::embeddings::EmbeddingModel;
use tracing::debug;

use crate::error::IndexError;

/// Turns text into vectors for similarity search.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable identity; part of the index cache key.
    fn id(&self) -> String;

    /// One vector per input text, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError>;
}

/// Offline embedder using signed feature hashing over word unigrams and
/// bigrams. Deterministic across runs and platforms.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let tokens = tokenize(text);

        for token in &tokens {
            self.add_feature(&mut vector, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut vector, bigram.as_bytes(), 0.5);
        }

        normalize(&mut vector);
        vector
    }

    fn add_feature(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = fnv1a(feature);
        let slot = (hash % self.dimensions as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn id(&self) -> String {
        format!("hashing-v1-{}", self.dimensions)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Embedder backed by a rig embedding model (e.g. OpenAI
/// `text-embedding-3-small`).
pub struct RigEmbedder<M> {
    model: M,
    model_name: String,
    batch_size: usize,
}

impl<M> RigEmbedder<M> {
    pub fn new(model: M, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
            batch_size: 64,
        }
    }
}

#[async_trait]
impl<M> Embedder for RigEmbedder<M>
where
    M: EmbeddingModel + Send + Sync,
{
    fn id(&self) -> String {
        format!("rig-{}", self.model_name)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            debug!(
                "Embedding batch of {} texts with {}",
                batch.len(),
                self.model_name
            );
            let embeddings = self
                .model
                .embed_texts(batch.to_vec())
                .await
                .map_err(|e| IndexError::Embedding(e.to_string()))?;
            if embeddings.len() != batch.len() {
                return Err(IndexError::Embedding(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    embeddings.len()
                )));
            }
            for embedding in embeddings {
                let mut v: Vec<f32> = embedding.vec.iter().map(|x| *x as f32).collect();
                normalize(&mut v);
                vectors.push(v);
            }
        }
        Ok(vectors)
    }
}

/// Lowercased alphanumeric words.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Scale to unit length. Zero vectors stay zero.
pub(crate) fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic_and_unit_length() {
        let e = HashingEmbedder::new(256);
        let a = e.embed_one("The Colosseum opens at 9am");
        let b = e.embed_one("The Colosseum opens at 9am");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_texts_score_higher() {
        let e = HashingEmbedder::new(512);
        let query = e.embed_one("opening hours of the Vatican Museums");
        let near = e.embed_one("The Vatican Museums opening hours are 9:00 to 18:00.");
        let far = e.embed_one("Trattorias in Trastevere serve cacio e pepe.");
        assert!(cosine(&query, &near) > cosine(&query, &far));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(16);
        assert!(e.embed_one("  ...  ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn tokenize_lowercases_and_splits() {
        assert_eq!(tokenize("Rome, 2-day TRIP!"), vec!["rome", "2", "day", "trip"]);
    }

    #[test]
    fn fnv_known_value() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[tokio::test]
    async fn embed_batch_preserves_order() {
        let e = HashingEmbedder::new(64);
        let texts = vec!["Rome".to_string(), "Milan".to_string()];
        let vectors = e.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], e.embed_one("Rome"));
        assert_eq!(vectors[1], e.embed_one("Milan"));
        assert_eq!(e.id(), "hashing-v1-64");
    }
}
