use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Result, VectorError};
use crate::math::l2_normalize;

/// Embeddings are cached by content hash so re-ingesting identical text and
/// repeated signal computations over the same message cost one API call.
const MAX_CACHE_ENTRIES: usize = 2048;
/// Max internal retries on retryable failures.
const MAX_RETRIES: u32 = 2;

/// Produces fixed-width, L2-normalized vectors from text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// The fixed output dimension.
    fn dim(&self) -> usize;

    /// Embed a batch. Output order matches input order; every vector has
    /// exactly `dim()` components and unit length.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Convenience single-text embed.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vecs = self.embed(std::slice::from_ref(&text.to_string())).await?;
        vecs.pop()
            .ok_or_else(|| VectorError::Parse("empty embedding batch response".into()))
    }
}

/// OpenAI-compatible `/v1/embeddings` client with a content-hash cache and
/// jittered retry on transient failures.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dim: usize,
    cache: Mutex<HashMap<String, (Vec<f32>, Instant)>>,
}

impl HttpEmbedder {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        dim: usize,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dim,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(&self, text: &str) -> String {
        let mut h = Sha256::new();
        h.update(self.model.as_bytes());
        h.update([0u8]);
        h.update(text.as_bytes());
        hex::encode(h.finalize())
    }

    fn cache_get(&self, key: &str) -> Option<Vec<f32>> {
        let cache = self.cache.lock().unwrap();
        cache.get(key).map(|(v, _)| v.clone())
    }

    fn cache_put(&self, key: String, vector: Vec<f32>) {
        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= MAX_CACHE_ENTRIES {
            let oldest = cache
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                cache.remove(&k);
            }
        }
        cache.insert(key, (vector, Instant::now()));
    }

    async fn request_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = serde_json::json!({ "model": self.model, "input": texts });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::BackendUnavailable(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(VectorError::BackendUnavailable(format!(
                "embeddings endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(VectorError::Parse(format!(
                "embeddings endpoint returned {status}: {text}"
            )));
        }

        let parsed: EmbeddingsResponse = resp
            .json()
            .await
            .map_err(|e| VectorError::Parse(e.to_string()))?;

        let mut rows: Vec<EmbeddingRow> = parsed.data;
        // The API documents index-annotated rows; order by index so batch
        // output always matches input order.
        rows.sort_by_key(|r| r.index);

        if rows.len() != texts.len() {
            return Err(VectorError::Parse(format!(
                "asked for {} embeddings, got {}",
                texts.len(),
                rows.len()
            )));
        }

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if row.embedding.len() != self.dim {
                return Err(VectorError::DimensionMismatch {
                    expected: self.dim,
                    got: row.embedding.len(),
                });
            }
            let mut v = row.embedding;
            l2_normalize(&mut v);
            out.push(v);
        }
        Ok(out)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // Partition into cached hits and texts that need the API.
        let keys: Vec<String> = texts.iter().map(|t| self.cache_key(t)).collect();
        let mut out: Vec<Option<Vec<f32>>> = keys.iter().map(|k| self.cache_get(k)).collect();

        let missing: Vec<usize> = (0..texts.len()).filter(|&i| out[i].is_none()).collect();
        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();

            let mut attempt = 0;
            let vectors = loop {
                match self.request_batch(&batch).await {
                    Ok(v) => break v,
                    Err(e) if e.retryable() && attempt < MAX_RETRIES => {
                        let backoff = backoff_with_jitter(attempt);
                        warn!(attempt, ?backoff, error = %e, "embedding batch failed, retrying");
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            };

            for (&i, v) in missing.iter().zip(vectors.into_iter()) {
                self.cache_put(keys[i].clone(), v.clone());
                out[i] = Some(v);
            }
            debug!(total = texts.len(), fetched = missing.len(), "embedded batch");
        }

        Ok(out.into_iter().flatten().collect())
    }
}

/// Exponential backoff with deterministic sub-millisecond jitter derived
/// from the clock; keeps concurrent retries from synchronizing.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = 250u64 << attempt;
    let jitter_ms = (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0) as u64)
        % 100;
    Duration::from_millis(base_ms + jitter_ms)
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

/// Deterministic offline embedder: hashes word shingles into buckets.
///
/// Not semantically meaningful, but stable, layer-free, and dimension-correct
/// — enough for development without an embeddings key and for the test
/// suites of every crate that consumes an [`Embedder`]. Identical texts map
/// to identical vectors, and texts sharing words land measurably closer than
/// unrelated ones.
pub struct LocalHashEmbedder {
    dim: usize,
}

impl LocalHashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        let lowered = text.to_lowercase();
        for word in lowered.split(|c: char| !c.is_alphanumeric()) {
            if word.is_empty() {
                continue;
            }
            let mut h = Sha256::new();
            h.update(word.as_bytes());
            let digest = h.finalize();
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % self.dim;
            v[bucket] += 1.0;
        }
        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl Embedder for LocalHashEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::cosine_similarity;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let e = LocalHashEmbedder::new(64);
        let a = e.embed_one("what is your refund policy").await.unwrap();
        let b = e.embed_one("what is your refund policy").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn shared_words_are_closer_than_disjoint() {
        let e = LocalHashEmbedder::new(256);
        let refund1 = e.embed_one("what is your refund policy").await.unwrap();
        let refund2 = e.embed_one("tell me the refund policy").await.unwrap();
        let other = e.embed_one("favorite hiking trails in norway").await.unwrap();
        assert!(
            cosine_similarity(&refund1, &refund2) > cosine_similarity(&refund1, &other),
            "related texts should score higher"
        );
    }

    #[tokio::test]
    async fn batch_order_matches_input() {
        let e = LocalHashEmbedder::new(32);
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let vecs = e.embed(&texts).await.unwrap();
        assert_eq!(vecs[0], e.embed_one("alpha").await.unwrap());
        assert_eq!(vecs[1], e.embed_one("beta").await.unwrap());
    }

    #[test]
    fn backoff_grows_with_attempt() {
        assert!(backoff_with_jitter(1) >= Duration::from_millis(500));
        assert!(backoff_with_jitter(0) < backoff_with_jitter(2));
    }
}
