//! Index manifest handling
//!
//! The manifest is the small human-readable descriptor binding the index
//! artifacts together. Unknown keys are preserved across rewrites so newer
//! tools can annotate older indexes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::distance::Metric;
use crate::error::{EngineError, Result};

/// Manifest schema version
pub const META_VERSION: u32 = 1;

/// BM25 tokenizer identifier written by this implementation
pub const TOKENIZER_ID: &str = "unicode-alnum-lower-v1";

/// Graph backend recorded in the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Hnsw,
    Vamana,
}

impl std::str::FromStr for BackendKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hnsw" => Ok(BackendKind::Hnsw),
            "vamana" => Ok(BackendKind::Vamana),
            other => Err(EngineError::InvalidInput(format!(
                "unknown backend '{other}' (expected 'hnsw' or 'vamana')"
            ))),
        }
    }
}

/// HNSW parameters persisted with the index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswMeta {
    pub m: u32,
    pub ef_construction: u32,
    pub ef_search_default: u32,
    pub entry_point: u32,
    pub num_layers: u32,
}

/// Vamana parameters persisted with the index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VamanaMeta {
    pub r: u32,
    pub l_build: u32,
    pub alpha: f32,
    pub entry_point: u32,
}

/// File names of the index artifacts, relative to the index directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaFiles {
    pub passages: String,
    pub offsets: String,
    pub graph: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bm25: Option<String>,
}

/// Index manifest (`<name>.meta.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub version: u32,
    pub backend: BackendKind,
    pub num_passages: u64,
    pub dimension: u32,
    pub metric: Metric,
    pub model_id: String,
    pub normalized: bool,
    pub recompute: bool,
    pub compact: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hnsw: Option<HnswMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vamana: Option<VamanaMeta>,

    pub files: MetaFiles,

    /// Tokenizer identifier the BM25 sidecar must agree with
    pub tokenizer: String,

    /// sha256 over model id, dimension, count, parameters, and sorted ids
    pub build_fingerprint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_prompt_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_prompt_template: Option<String>,

    /// Keys this version does not recognize, preserved on rewrite
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl IndexMeta {
    /// Load a manifest from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let meta: IndexMeta = serde_json::from_str(&content)
            .map_err(|e| EngineError::Corrupt(format!("{}: {e}", path.display())))?;
        if meta.version != META_VERSION {
            return Err(EngineError::Corrupt(format!(
                "{}: unsupported manifest version {}",
                path.display(),
                meta.version
            )));
        }
        Ok(meta)
    }

    /// Save the manifest atomically (temp + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Refuse to pair this index with a provider for a different model
    pub fn check_model(&self, provider_model_id: &str) -> Result<()> {
        if self.model_id != provider_model_id {
            return Err(EngineError::ModelMismatch {
                index: self.model_id.clone(),
                provider: provider_model_id.to_string(),
            });
        }
        Ok(())
    }

    /// Default beam width for searches against this index
    pub fn ef_search_default(&self) -> usize {
        self.hnsw
            .as_ref()
            .map(|h| h.ef_search_default as usize)
            .or_else(|| self.vamana.as_ref().map(|v| v.l_build as usize))
            .unwrap_or(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> IndexMeta {
        IndexMeta {
            version: META_VERSION,
            backend: BackendKind::Hnsw,
            num_passages: 3,
            dimension: 8,
            metric: Metric::Cosine,
            model_id: "hashed-v1-8d".into(),
            normalized: true,
            recompute: false,
            compact: false,
            hnsw: Some(HnswMeta {
                m: 16,
                ef_construction: 200,
                ef_search_default: 64,
                entry_point: 0,
                num_layers: 1,
            }),
            vamana: None,
            files: MetaFiles {
                passages: "index.passages.jsonl".into(),
                offsets: "index.passages.idx".into(),
                graph: "index.graph".into(),
                embeddings: Some("index.embeddings".into()),
                bm25: None,
            },
            tokenizer: TOKENIZER_ID.into(),
            build_fingerprint: "deadbeef".into(),
            query_prompt_template: None,
            document_prompt_template: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.meta.json");
        sample().save(&path).unwrap();

        let meta = IndexMeta::load(&path).unwrap();
        assert_eq!(meta.num_passages, 3);
        assert_eq!(meta.backend, BackendKind::Hnsw);
        assert_eq!(meta.metric, Metric::Cosine);
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.meta.json");

        let mut json = serde_json::to_value(sample()).unwrap();
        json["future_knob"] = serde_json::json!({"a": 1});
        std::fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();

        let meta = IndexMeta::load(&path).unwrap();
        assert!(meta.extra.contains_key("future_knob"));

        meta.save(&path).unwrap();
        let rewritten = IndexMeta::load(&path).unwrap();
        assert_eq!(rewritten.extra["future_knob"]["a"], 1);
    }

    #[test]
    fn test_model_mismatch() {
        let meta = sample();
        assert!(meta.check_model("hashed-v1-8d").is_ok());
        assert!(matches!(
            meta.check_model("other-model").unwrap_err(),
            EngineError::ModelMismatch { .. }
        ));
    }
}
