//! BM25 lexical sidecar for hybrid search
//!
//! Built lazily from the passage store on the first hybrid query and
//! persisted next to the index as `<name>.bm25` (term postings, document
//! lengths, parameters). The tokenizer identifier is recorded in both the
//! sidecar and the manifest; a mismatch, or a document count disagreeing
//! with `N`, triggers a rebuild.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, Result};

use super::meta::TOKENIZER_ID;
use super::passages::PassageStore;

/// Okapi BM25 defaults
pub const DEFAULT_K1: f32 = 1.2;
pub const DEFAULT_B: f32 = 0.75;

/// Persisted lexical index
#[derive(Debug, Serialize, Deserialize)]
pub struct Bm25Sidecar {
    pub tokenizer: String,
    pub k1: f32,
    pub b: f32,
    pub doc_count: u64,
    pub avg_doc_len: f32,
    /// Token count per node index
    pub doc_lengths: Vec<u32>,
    /// term -> [(node, term frequency)]
    pub postings: HashMap<String, Vec<(u32, u32)>>,
}

impl Bm25Sidecar {
    /// Build the sidecar from every passage in the store
    pub fn build(store: &PassageStore) -> Result<Self> {
        let n = store.len();
        let mut doc_lengths = Vec::with_capacity(n);
        let mut postings: HashMap<String, Vec<(u32, u32)>> = HashMap::new();
        let mut total_len = 0u64;

        for (node, passage) in store.iter()?.enumerate() {
            let passage = passage?;
            let mut tf: HashMap<String, u32> = HashMap::new();
            let mut len = 0u32;
            for token in tokenize(&passage.text) {
                *tf.entry(token).or_insert(0) += 1;
                len += 1;
            }
            doc_lengths.push(len);
            total_len += len as u64;
            for (term, count) in tf {
                postings.entry(term).or_default().push((node as u32, count));
            }
        }

        // Deterministic posting order regardless of map iteration
        for list in postings.values_mut() {
            list.sort_unstable_by_key(|(node, _)| *node);
        }

        let avg_doc_len = if n > 0 {
            total_len as f32 / n as f32
        } else {
            1.0
        };

        info!("built BM25 sidecar: {n} documents, {} terms", postings.len());

        Ok(Self {
            tokenizer: TOKENIZER_ID.to_string(),
            k1: DEFAULT_K1,
            b: DEFAULT_B,
            doc_count: n as u64,
            avg_doc_len,
            doc_lengths,
            postings,
        })
    }

    /// Load the sidecar, or rebuild and persist it when absent or stale.
    pub fn load_or_build(
        path: &Path,
        store: &PassageStore,
        expected_tokenizer: &str,
    ) -> Result<Self> {
        if expected_tokenizer != TOKENIZER_ID {
            return Err(EngineError::InvalidInput(format!(
                "index records tokenizer '{expected_tokenizer}' but this build implements '{TOKENIZER_ID}'; \
                 hybrid search would be inconsistent"
            )));
        }

        if path.exists() {
            match Self::load(path) {
                Ok(sidecar)
                    if sidecar.doc_count == store.len() as u64
                        && sidecar.tokenizer == expected_tokenizer =>
                {
                    return Ok(sidecar);
                }
                Ok(sidecar) => {
                    debug!(
                        "BM25 sidecar stale (doc_count {} vs {}), rebuilding",
                        sidecar.doc_count,
                        store.len()
                    );
                }
                Err(e) => {
                    debug!("BM25 sidecar unreadable ({e}), rebuilding");
                }
            }
        }

        let sidecar = Self::build(store)?;
        sidecar.save(path)?;
        Ok(sidecar)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| EngineError::Corrupt(format!("{}: {e}", path.display())))
    }

    /// Persist atomically (temp + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("bm25.tmp");
        std::fs::write(&tmp, serde_json::to_string(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// BM25 scores of `query` for a set of candidate nodes, in candidate
    /// order. Nodes outside the candidate set are not scored.
    pub fn score_candidates(&self, query: &str, candidates: &[u32]) -> Vec<f32> {
        let positions: HashMap<u32, usize> = candidates
            .iter()
            .enumerate()
            .map(|(i, &node)| (node, i))
            .collect();
        let mut scores = vec![0.0f32; candidates.len()];

        for term in tokenize(query) {
            let Some(posting) = self.postings.get(&term) else {
                continue;
            };
            let df = posting.len() as f32;
            let idf = ((self.doc_count as f32 - df + 0.5) / (df + 0.5) + 1.0).ln();

            for &(node, tf) in posting {
                let Some(&slot) = positions.get(&node) else {
                    continue;
                };
                let tf = tf as f32;
                let doc_len = self.doc_lengths[node as usize] as f32;
                let norm = 1.0 - self.b + self.b * (doc_len / self.avg_doc_len);
                scores[slot] += idf * (tf * (self.k1 + 1.0)) / (tf + self.k1 * norm);
            }
        }
        scores
    }

    /// Top-k nodes by BM25 score across the whole corpus, restricted to an
    /// optional allowed set. Serves lexical-only queries (`alpha = 1`).
    pub fn search(
        &self,
        query: &str,
        k: usize,
        allowed: Option<&dyn Fn(u32) -> bool>,
    ) -> Vec<(u32, f32)> {
        let mut scores: HashMap<u32, f32> = HashMap::new();
        for term in tokenize(query) {
            let Some(posting) = self.postings.get(&term) else {
                continue;
            };
            let df = posting.len() as f32;
            let idf = ((self.doc_count as f32 - df + 0.5) / (df + 0.5) + 1.0).ln();
            for &(node, tf) in posting {
                if let Some(pred) = allowed {
                    if !pred(node) {
                        continue;
                    }
                }
                let tf = tf as f32;
                let doc_len = self.doc_lengths[node as usize] as f32;
                let norm = 1.0 - self.b + self.b * (doc_len / self.avg_doc_len);
                *scores.entry(node).or_insert(0.0) +=
                    idf * (tf * (self.k1 + 1.0)) / (tf + self.k1 * norm);
            }
        }

        let mut ranked: Vec<(u32, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(k);
        ranked
    }
}

/// Unicode-aware tokenizer: lowercase, split on non-alphanumeric.
/// Identified as `unicode-alnum-lower-v1` in the manifest.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::passages::PassageStoreWriter;
    use serde_json::json;

    fn store_with(texts: &[&str]) -> (tempfile::TempDir, PassageStore) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("index");
        let mut w = PassageStoreWriter::create(&base).unwrap();
        for (i, t) in texts.iter().enumerate() {
            w.append(&format!("p{i}"), t, json!({})).unwrap();
        }
        w.finish().unwrap();
        let store = PassageStore::open(&base).unwrap();
        (dir, store)
    }

    #[test]
    fn test_tokenize_unicode_lowercase() {
        let tokens = tokenize("Hello, Wörld! x2");
        assert_eq!(tokens, vec!["hello", "wörld", "x2"]);
    }

    #[test]
    fn test_scoring_prefers_matching_docs() {
        let (_dir, store) = store_with(&[
            "the quick brown fox jumps over the lazy dog",
            "a quick brown dog outpaces a swift fox",
            "completely unrelated text about databases",
        ]);
        let sidecar = Bm25Sidecar::build(&store).unwrap();

        let ranked = sidecar.search("quick fox", 3, None);
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().all(|(node, _)| *node < 2));
    }

    #[test]
    fn test_shorter_doc_scores_higher_on_equal_tf() {
        let (_dir, store) = store_with(&["the cat sits on the mat", "the mat is blue"]);
        let sidecar = Bm25Sidecar::build(&store).unwrap();
        let scores = sidecar.score_candidates("mat", &[0, 1]);
        assert!(scores[1] > scores[0], "length normalization should favor the shorter doc");
    }

    #[test]
    fn test_persist_and_reload() {
        let (_dir, store) = store_with(&["alpha beta", "beta gamma"]);
        let sidecar = Bm25Sidecar::build(&store).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bm25");
        sidecar.save(&path).unwrap();

        let loaded = Bm25Sidecar::load_or_build(&path, &store, TOKENIZER_ID).unwrap();
        assert_eq!(loaded.doc_count, 2);
        assert_eq!(loaded.postings.len(), sidecar.postings.len());
    }

    #[test]
    fn test_stale_sidecar_rebuilt() {
        let (_dir, store) = store_with(&["one", "two", "three"]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bm25");

        // Persist a sidecar claiming a different corpus size
        let (_d2, small) = store_with(&["one"]);
        Bm25Sidecar::build(&small).unwrap().save(&path).unwrap();

        let rebuilt = Bm25Sidecar::load_or_build(&path, &store, TOKENIZER_ID).unwrap();
        assert_eq!(rebuilt.doc_count, 3);
    }

    #[test]
    fn test_foreign_tokenizer_refused() {
        let (_dir, store) = store_with(&["text"]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bm25");
        let err = Bm25Sidecar::load_or_build(&path, &store, "ascii-v0").unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
