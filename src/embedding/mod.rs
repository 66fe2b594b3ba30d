//! Embedding provider interface
//!
//! The engine never talks to inference servers itself. It sees a pure,
//! batched `encode` honoring a declared dimensionality; callers plug in
//! whatever transport they need behind [`EmbeddingProvider`].

mod hashed;

pub use hashed::HashedProvider;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, Result};

/// Whether a text is embedded as a stored document or as a search query.
///
/// Asymmetric models (E5, BGE, Instructor) prepend different prompts for
/// each side; the engine passes the kind through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedKind {
    Document,
    Query,
}

/// Contract between the engine and an embedding model
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable model identifier recorded in the index manifest
    fn model_id(&self) -> &str;

    /// Output dimensionality
    fn dimension(&self) -> usize;

    /// True when vectors are unit-norm (cosine distance reduces to `1 - dot`)
    fn normalized(&self) -> bool;

    /// Embed a batch of texts. Must be deterministic up to floating-point
    /// rounding. Failures are either [`EngineError::ProviderTransient`]
    /// (worth retrying) or [`EngineError::ProviderPermanent`].
    async fn encode(&self, texts: &[&str], kind: EmbedKind) -> Result<Vec<Vec<f32>>>;
}

/// Retry policy for transient provider failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retries per batch after the initial attempt
    pub retry_max: u32,
    /// Initial backoff delay, doubled on every retry
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_max: 2,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Encode one batch, retrying transient failures with exponential backoff.
///
/// Permanent failures surface immediately; transient failures exhaust the
/// retry budget and then surface as `ProviderTransient` for the caller to
/// demote or abort on.
pub async fn encode_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[&str],
    kind: EmbedKind,
    policy: &RetryPolicy,
) -> Result<Vec<Vec<f32>>> {
    let mut delay = policy.base_delay;
    let mut attempt = 0u32;

    loop {
        match provider.encode(texts, kind).await {
            Ok(vectors) => {
                let dim = provider.dimension();
                for v in &vectors {
                    if v.len() != dim {
                        return Err(EngineError::ProviderPermanent(format!(
                            "provider returned {}-dim vector, declared dimension is {dim}",
                            v.len()
                        )));
                    }
                }
                if vectors.len() != texts.len() {
                    return Err(EngineError::ProviderPermanent(format!(
                        "provider returned {} vectors for {} texts",
                        vectors.len(),
                        texts.len()
                    )));
                }
                return Ok(vectors);
            }
            Err(EngineError::ProviderTransient(msg)) if attempt < policy.retry_max => {
                attempt += 1;
                tracing::debug!(
                    "transient embedding failure (attempt {attempt}/{}): {msg}",
                    policy.retry_max
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}
