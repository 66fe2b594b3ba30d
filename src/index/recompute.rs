//! Candidate expanders - embeddings on demand during graph traversal
//!
//! The blob expander serves random reads from the memory-mapped embedding
//! file. The recompute expander resolves node indices to passage texts and
//! re-embeds them through the provider, deduplicating against a bounded
//! LRU cache and batching misses. Both check the query deadline and the
//! cancellation token at batch boundaries, making the expander the only
//! suspension point inside a search.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use lru::LruCache;
use tracing::warn;

use crate::backend::{CandidateExpander, ExpanderStatus};
use crate::embedding::{EmbedKind, EmbeddingProvider, RetryPolicy};
use crate::error::{EngineError, Result};

use super::embeddings::EmbeddingsStore;
use super::filter::FilterPlan;
use super::passages::PassageStore;

/// Reason attached to responses degraded by dropped embedding batches
pub const REASON_TRANSIENT_EXHAUSTED: &str = "provider_transient_exhausted";

/// Cooperative cancellation handle checked at expander batch boundaries
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-query limits shared by every expander implementation
#[derive(Debug, Clone, Default)]
pub struct QueryLimits {
    pub deadline: Option<Instant>,
    pub cancel: Option<CancelToken>,
}

impl QueryLimits {
    /// Check cancellation first, then the deadline
    pub fn check(&self) -> Result<()> {
        if let Some(token) = &self.cancel {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(EngineError::DeadlineExceeded);
            }
        }
        Ok(())
    }
}

/// Expander backed by the on-disk embedding blob (`recompute = false`)
pub struct BlobExpander<'a> {
    blob: &'a EmbeddingsStore,
    plan: Option<&'a FilterPlan>,
    limits: QueryLimits,
    status: ExpanderStatus,
}

impl<'a> BlobExpander<'a> {
    pub fn new(blob: &'a EmbeddingsStore, plan: Option<&'a FilterPlan>, limits: QueryLimits) -> Self {
        Self {
            blob,
            plan,
            limits,
            status: ExpanderStatus::default(),
        }
    }
}

#[async_trait]
impl CandidateExpander for BlobExpander<'_> {
    fn allows(&self, node: u32) -> bool {
        self.plan.is_none_or(|p| p.allows(node))
    }

    async fn expand(&mut self, nodes: &[u32]) -> Result<Vec<(u32, Vec<f32>)>> {
        self.limits.check()?;
        let mut out = Vec::with_capacity(nodes.len());
        for &node in nodes {
            if !self.allows(node) {
                continue;
            }
            out.push((node, self.blob.get(node)?.to_vec()));
        }
        self.status.batches_ok += 1;
        Ok(out)
    }

    async fn expand_unfiltered(&mut self, node: u32) -> Result<Option<Vec<f32>>> {
        self.limits.check()?;
        Ok(Some(self.blob.get(node)?.to_vec()))
    }

    fn status(&self) -> &ExpanderStatus {
        &self.status
    }
}

/// Expander that re-embeds passage text on demand (`recompute = true`)
pub struct RecomputeExpander<'a> {
    store: &'a PassageStore,
    provider: &'a dyn EmbeddingProvider,
    document_prompt: Option<&'a str>,
    plan: Option<&'a FilterPlan>,
    cache: LruCache<u32, Vec<f32>>,
    batch_size: usize,
    retry: RetryPolicy,
    limits: QueryLimits,
    status: ExpanderStatus,
}

impl<'a> RecomputeExpander<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &'a PassageStore,
        provider: &'a dyn EmbeddingProvider,
        document_prompt: Option<&'a str>,
        plan: Option<&'a FilterPlan>,
        cache_capacity: usize,
        batch_size: usize,
        retry: RetryPolicy,
        limits: QueryLimits,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            provider,
            document_prompt,
            plan,
            cache: LruCache::new(capacity),
            batch_size: batch_size.max(1),
            retry,
            limits,
            status: ExpanderStatus::default(),
        }
    }

    fn passage_text(&self, node: u32) -> Result<String> {
        let text = self.store.get_by_node(node)?.text;
        Ok(match self.document_prompt {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}{text}"),
            _ => text,
        })
    }

    /// Embed one batch, retrying transient failures with backoff.
    ///
    /// Returns `Ok(None)` when the batch is dropped after the retry budget;
    /// an immediate permanent failure (no transient attempt before it)
    /// still surfaces as an error.
    async fn embed_batch(&mut self, texts: &[&str]) -> Result<Option<Vec<Vec<f32>>>> {
        let mut delay = self.retry.base_delay;
        let mut attempt = 0u32;
        let mut saw_transient = false;

        loop {
            self.limits.check()?;
            match self.provider.encode(texts, EmbedKind::Document).await {
                Ok(vectors) => {
                    self.status.batches_ok += 1;
                    return Ok(Some(vectors));
                }
                Err(EngineError::ProviderTransient(msg)) => {
                    saw_transient = true;
                    if attempt >= self.retry.retry_max {
                        warn!("embedding batch dropped after {attempt} retries: {msg}");
                        self.drop_batch();
                        return Ok(None);
                    }
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(EngineError::ProviderPermanent(msg)) if saw_transient => {
                    warn!("embedding batch dropped (permanent after transient): {msg}");
                    self.drop_batch();
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn drop_batch(&mut self) {
        self.status.batches_failed += 1;
        self.status.partial = true;
        self.status.reason = Some(REASON_TRANSIENT_EXHAUSTED);
    }

    async fn resolve(&mut self, nodes: &[u32]) -> Result<Vec<(u32, Vec<f32>)>> {
        let mut out: Vec<(u32, Option<Vec<f32>>)> = Vec::with_capacity(nodes.len());
        let mut misses: Vec<u32> = Vec::new();

        for &node in nodes {
            if let Some(vec) = self.cache.get(&node) {
                out.push((node, Some(vec.clone())));
            } else {
                out.push((node, None));
                misses.push(node);
            }
        }
        misses.dedup();

        for group in misses.chunks(self.batch_size).map(|c| c.to_vec()) {
            let texts: Vec<String> = group
                .iter()
                .map(|&node| self.passage_text(node))
                .collect::<Result<_>>()?;
            let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();

            let Some(vectors) = self.embed_batch(&refs).await? else {
                continue;
            };
            for (&node, vec) in group.iter().zip(vectors) {
                self.cache.put(node, vec.clone());
                for slot in out.iter_mut().filter(|(n, v)| *n == node && v.is_none()) {
                    slot.1 = Some(vec.clone());
                }
            }
        }

        Ok(out
            .into_iter()
            .filter_map(|(node, vec)| vec.map(|v| (node, v)))
            .collect())
    }
}

#[async_trait]
impl CandidateExpander for RecomputeExpander<'_> {
    fn allows(&self, node: u32) -> bool {
        self.plan.is_none_or(|p| p.allows(node))
    }

    async fn expand(&mut self, nodes: &[u32]) -> Result<Vec<(u32, Vec<f32>)>> {
        self.limits.check()?;
        let allowed: Vec<u32> = nodes.iter().copied().filter(|&n| self.allows(n)).collect();
        if allowed.is_empty() {
            return Ok(Vec::new());
        }
        self.resolve(&allowed).await
    }

    async fn expand_unfiltered(&mut self, node: u32) -> Result<Option<Vec<f32>>> {
        self.limits.check()?;
        let resolved = self.resolve(&[node]).await?;
        Ok(resolved.into_iter().next().map(|(_, v)| v))
    }

    fn status(&self) -> &ExpanderStatus {
        &self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::passages::PassageStoreWriter;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn store_with(texts: &[&str]) -> (tempfile::TempDir, PassageStore) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("index");
        let mut w = PassageStoreWriter::create(&base).unwrap();
        for (i, t) in texts.iter().enumerate() {
            w.append(&format!("p{i}"), t, json!({})).unwrap();
        }
        w.finish().unwrap();
        (dir, PassageStore::open(&base).unwrap())
    }

    struct CountingProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model_id(&self) -> &str {
            "counting"
        }
        fn dimension(&self) -> usize {
            2
        }
        fn normalized(&self) -> bool {
            false
        }
        async fn encode(&self, texts: &[&str], _kind: EmbedKind) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_cache_deduplicates_recomputes() {
        let (_dir, store) = store_with(&["aa", "bbb", "cccc"]);
        let provider = CountingProvider {
            calls: AtomicU32::new(0),
        };
        let mut exp = RecomputeExpander::new(
            &store,
            &provider,
            None,
            None,
            16,
            8,
            RetryPolicy::default(),
            QueryLimits::default(),
        );

        let first = exp.expand(&[0, 1]).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        // 0 and 1 now come from the cache; only node 2 hits the provider
        let second = exp.expand(&[0, 1, 2]).await.unwrap();
        assert_eq!(second.len(), 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_token_aborts() {
        let (_dir, store) = store_with(&["aa"]);
        let provider = CountingProvider {
            calls: AtomicU32::new(0),
        };
        let token = CancelToken::new();
        token.cancel();
        let mut exp = RecomputeExpander::new(
            &store,
            &provider,
            None,
            None,
            16,
            8,
            RetryPolicy::default(),
            QueryLimits {
                deadline: None,
                cancel: Some(token),
            },
        );
        assert!(matches!(
            exp.expand(&[0]).await.unwrap_err(),
            EngineError::Cancelled
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    struct AlwaysTransient;

    #[async_trait]
    impl EmbeddingProvider for AlwaysTransient {
        fn model_id(&self) -> &str {
            "transient"
        }
        fn dimension(&self) -> usize {
            2
        }
        fn normalized(&self) -> bool {
            false
        }
        async fn encode(&self, _texts: &[&str], _kind: EmbedKind) -> Result<Vec<Vec<f32>>> {
            Err(EngineError::ProviderTransient("overloaded".into()))
        }
    }

    #[tokio::test]
    async fn test_exhausted_batch_degrades_to_partial() {
        let (_dir, store) = store_with(&["aa", "bb"]);
        let mut exp = RecomputeExpander::new(
            &store,
            &AlwaysTransient,
            None,
            None,
            16,
            8,
            RetryPolicy {
                retry_max: 1,
                base_delay: std::time::Duration::from_millis(1),
            },
            QueryLimits::default(),
        );

        let out = exp.expand(&[0, 1]).await.unwrap();
        assert!(out.is_empty());
        assert!(exp.status().partial);
        assert_eq!(exp.status().reason, Some(REASON_TRANSIENT_EXHAUSTED));
        assert_eq!(exp.status().batches_failed, 1);
    }

    #[tokio::test]
    async fn test_document_prompt_applied() {
        struct CaptureProvider {
            saw: std::sync::Mutex<Vec<String>>,
        }

        #[async_trait]
        impl EmbeddingProvider for CaptureProvider {
            fn model_id(&self) -> &str {
                "capture"
            }
            fn dimension(&self) -> usize {
                1
            }
            fn normalized(&self) -> bool {
                false
            }
            async fn encode(&self, texts: &[&str], _kind: EmbedKind) -> Result<Vec<Vec<f32>>> {
                self.saw
                    .lock()
                    .unwrap()
                    .extend(texts.iter().map(|t| t.to_string()));
                Ok(texts.iter().map(|_| vec![0.0]).collect())
            }
        }

        let (_dir, store) = store_with(&["body"]);
        let provider = CaptureProvider {
            saw: std::sync::Mutex::new(Vec::new()),
        };
        let mut exp = RecomputeExpander::new(
            &store,
            &provider,
            Some("passage: "),
            None,
            4,
            4,
            RetryPolicy::default(),
            QueryLimits::default(),
        );
        exp.expand(&[0]).await.unwrap();
        assert_eq!(provider.saw.lock().unwrap()[0], "passage: body");
    }
}
