//! Deterministic feature-hashing provider
//!
//! Maps tokens into a fixed number of buckets via a seeded hash and
//! L2-normalizes the result. No model weights, no network: useful for
//! tests, demos, and smoke-testing an index pipeline end to end.

use async_trait::async_trait;

use crate::error::Result;

use super::{EmbedKind, EmbeddingProvider};

/// Hashing-based embedding provider with a fixed dimension
pub struct HashedProvider {
    model_id: String,
    dimension: usize,
}

impl HashedProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            model_id: format!("hashed-v1-{dimension}d"),
            dimension,
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dimension as u64) as usize;
            // Second hash decides the sign, spreading mass across buckets
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashedProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn normalized(&self) -> bool {
        true
    }

    async fn encode(&self, texts: &[&str], _kind: EmbedKind) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
