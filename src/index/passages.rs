//! Passage storage - JSONL records with a binary offset table
//!
//! Two files per index: `<name>.passages.jsonl` holds one JSON object per
//! line in node-index order, and `<name>.passages.idx` holds a fixed-width
//! table of byte offsets so record `i` spans `[off[i], off[i+1])`. The
//! trailing sentinel offset equals the jsonl file size and doubles as a
//! truncation check on open.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Offset table magic: "LPX1"
const IDX_MAGIC: [u8; 4] = *b"LPX1";
const IDX_VERSION: u32 = 1;

/// A single passage with text and metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Read-only passage store with O(1) lookup by node index or id
#[derive(Debug)]
pub struct PassageStore {
    jsonl_path: PathBuf,
    /// Byte offsets into the jsonl file, one per node plus the sentinel
    offsets: Vec<u64>,
    /// Passage id per node index, in node order
    ids: Vec<String>,
    /// Reverse map id -> node index
    by_id: HashMap<String, u32>,
}

impl PassageStore {
    pub fn jsonl_path_for(base: &Path) -> PathBuf {
        base.with_extension("passages.jsonl")
    }

    pub fn idx_path_for(base: &Path) -> PathBuf {
        base.with_extension("passages.idx")
    }

    /// Open an existing store, validating the offset table against the
    /// jsonl file and loading the id map.
    pub fn open(base: &Path) -> Result<Self> {
        let jsonl_path = Self::jsonl_path_for(base);
        let idx_path = Self::idx_path_for(base);

        let offsets = read_offset_table(&idx_path)?;

        let jsonl_len = std::fs::metadata(&jsonl_path)?.len();
        let sentinel = *offsets.last().ok_or_else(|| {
            EngineError::Corrupt(format!("{}: empty offset table", idx_path.display()))
        })?;
        if sentinel != jsonl_len {
            return Err(EngineError::Corrupt(format!(
                "{}: sentinel offset {sentinel} disagrees with jsonl size {jsonl_len}",
                idx_path.display()
            )));
        }
        for w in offsets.windows(2) {
            if w[0] > w[1] {
                return Err(EngineError::Corrupt(format!(
                    "{}: offsets are not monotone",
                    idx_path.display()
                )));
            }
        }

        // One sequential scan recovers the node -> id table; ids double as
        // the node_to_passage_id map recorded alongside the graph.
        let n = offsets.len() - 1;
        let mut ids = Vec::with_capacity(n);
        let mut by_id = HashMap::with_capacity(n);
        let reader = BufReader::new(File::open(&jsonl_path)?);
        for (node, line) in reader.lines().enumerate() {
            let line = line?;
            let record: Passage = serde_json::from_str(&line).map_err(|e| {
                EngineError::Corrupt(format!("passage record {node} does not parse: {e}"))
            })?;
            if by_id.insert(record.id.clone(), node as u32).is_some() {
                return Err(EngineError::Corrupt(format!(
                    "duplicate passage id '{}' in store",
                    record.id
                )));
            }
            ids.push(record.id);
        }
        if ids.len() != n {
            return Err(EngineError::Corrupt(format!(
                "jsonl has {} records but offset table declares {n}",
                ids.len()
            )));
        }

        Ok(Self {
            jsonl_path,
            offsets,
            ids,
            by_id,
        })
    }

    /// Passage count `N`
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Passage id for a node index
    pub fn id_of(&self, node: u32) -> Result<&str> {
        self.ids
            .get(node as usize)
            .map(|s| s.as_str())
            .ok_or(EngineError::OutOfRange {
                node,
                len: self.ids.len() as u64,
            })
    }

    /// Node index for a passage id
    pub fn node_of(&self, id: &str) -> Option<u32> {
        self.by_id.get(id).copied()
    }

    /// Fetch a passage by node index via the offset table
    pub fn get_by_node(&self, node: u32) -> Result<Passage> {
        let i = node as usize;
        if i >= self.ids.len() {
            return Err(EngineError::OutOfRange {
                node,
                len: self.ids.len() as u64,
            });
        }
        let start = self.offsets[i];
        let end = self.offsets[i + 1];

        let mut file = File::open(&self.jsonl_path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)?;

        serde_json::from_slice(&buf)
            .map_err(|e| EngineError::Corrupt(format!("passage record {node} does not parse: {e}")))
    }

    /// Fetch a passage by id
    pub fn get_by_id(&self, id: &str) -> Result<Passage> {
        let node = self
            .node_of(id)
            .ok_or_else(|| EngineError::InvalidInput(format!("passage not found: {id}")))?;
        self.get_by_node(node)
    }

    /// Sequential scan over all passages in node order
    pub fn iter(&self) -> Result<PassageIter> {
        Ok(PassageIter {
            reader: BufReader::new(File::open(&self.jsonl_path)?),
            node: 0,
            total: self.ids.len() as u32,
        })
    }
}

/// Iterator over passages in node-index order
pub struct PassageIter {
    reader: BufReader<File>,
    node: u32,
    total: u32,
}

impl Iterator for PassageIter {
    type Item = Result<Passage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.node >= self.total {
            return None;
        }
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(_) => {
                let node = self.node;
                self.node += 1;
                Some(serde_json::from_str(&line).map_err(|e| {
                    EngineError::Corrupt(format!("passage record {node} does not parse: {e}"))
                }))
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}

/// Writer used by the builder; offsets are kept in memory and flushed as
/// the binary table on `finish`.
pub struct PassageStoreWriter {
    writer: BufWriter<File>,
    jsonl_path: PathBuf,
    idx_path: PathBuf,
    offsets: Vec<u64>,
    seen: HashMap<String, u32>,
    current_offset: u64,
}

impl PassageStoreWriter {
    /// Create a fresh store, truncating any previous files
    pub fn create(base: &Path) -> Result<Self> {
        let jsonl_path = PassageStore::jsonl_path_for(base);
        let idx_path = PassageStore::idx_path_for(base);
        let file = File::create(&jsonl_path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            jsonl_path,
            idx_path,
            offsets: Vec::new(),
            seen: HashMap::new(),
            current_offset: 0,
        })
    }

    /// Append one passage, returning its node index.
    ///
    /// Ids must be unique within the store.
    pub fn append(&mut self, id: &str, text: &str, metadata: serde_json::Value) -> Result<u32> {
        if self.seen.contains_key(id) {
            return Err(EngineError::DuplicateId(id.to_string()));
        }
        let node = self.offsets.len() as u32;

        let record = Passage {
            id: id.to_string(),
            text: text.to_string(),
            metadata,
        };
        let json = serde_json::to_string(&record)?;

        self.offsets.push(self.current_offset);
        self.writer.write_all(json.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.current_offset += json.len() as u64 + 1;

        self.seen.insert(id.to_string(), node);
        Ok(node)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Flush the jsonl file, then write the offset table atomically
    /// (temp + rename). The jsonl lands first so a crash between the two
    /// writes is caught by the sentinel check on open.
    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;

        let tmp_path = self.idx_path.with_extension("idx.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp_path)?);
            out.write_all(&IDX_MAGIC)?;
            out.write_all(&IDX_VERSION.to_le_bytes())?;
            out.write_all(&(self.offsets.len() as u64).to_le_bytes())?;
            for off in &self.offsets {
                out.write_all(&off.to_le_bytes())?;
            }
            // Sentinel: total jsonl size
            out.write_all(&self.current_offset.to_le_bytes())?;
            out.flush()?;
        }
        std::fs::rename(&tmp_path, &self.idx_path)?;
        Ok(())
    }

    pub fn jsonl_path(&self) -> &Path {
        &self.jsonl_path
    }
}

fn read_offset_table(idx_path: &Path) -> Result<Vec<u64>> {
    let mut file = BufReader::new(File::open(idx_path)?);

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if magic != IDX_MAGIC {
        return Err(EngineError::Corrupt(format!(
            "{}: bad magic {:?}",
            idx_path.display(),
            magic
        )));
    }

    let mut word = [0u8; 4];
    file.read_exact(&mut word)?;
    let version = u32::from_le_bytes(word);
    if version != IDX_VERSION {
        return Err(EngineError::Corrupt(format!(
            "{}: unsupported offset table version {version}",
            idx_path.display()
        )));
    }

    let mut qword = [0u8; 8];
    file.read_exact(&mut qword)?;
    let n = u64::from_le_bytes(qword) as usize;

    // n entries plus the sentinel
    let mut offsets = Vec::with_capacity(n + 1);
    for _ in 0..=n {
        file.read_exact(&mut qword).map_err(|_| {
            EngineError::Corrupt(format!("{}: offset table truncated", idx_path.display()))
        })?;
        offsets.push(u64::from_le_bytes(qword));
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("index")
    }

    fn write_three(base: &Path) {
        let mut w = PassageStoreWriter::create(base).unwrap();
        w.append("a", "first passage", json!({"tag": "x"})).unwrap();
        w.append("b", "second passage", json!({})).unwrap();
        w.append("c", "third passage", json!({"n": 3})).unwrap();
        w.finish().unwrap();
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        write_three(&base(&dir));

        let store = PassageStore::open(&base(&dir)).unwrap();
        assert_eq!(store.len(), 3);

        let p = store.get_by_node(1).unwrap();
        assert_eq!(p.id, "b");
        assert_eq!(p.text, "second passage");

        let p = store.get_by_id("c").unwrap();
        assert_eq!(p.metadata["n"], 3);

        // node <-> id mapping is consistent (round-trip law)
        for node in 0..store.len() as u32 {
            let p = store.get_by_node(node).unwrap();
            assert_eq!(p.id, store.id_of(node).unwrap());
            assert_eq!(store.node_of(&p.id), Some(node));
        }
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PassageStoreWriter::create(&base(&dir)).unwrap();
        w.append("a", "one", json!({})).unwrap();
        let err = w.append("a", "two", json!({})).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateId(_)));
    }

    #[test]
    fn test_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        write_three(&base(&dir));
        let store = PassageStore::open(&base(&dir)).unwrap();
        assert!(matches!(
            store.get_by_node(3).unwrap_err(),
            EngineError::OutOfRange { node: 3, .. }
        ));
    }

    #[test]
    fn test_truncated_jsonl_detected() {
        let dir = tempfile::tempdir().unwrap();
        write_three(&base(&dir));

        // Chop the tail off the jsonl; the sentinel no longer matches.
        let jsonl = PassageStore::jsonl_path_for(&base(&dir));
        let content = std::fs::read(&jsonl).unwrap();
        std::fs::write(&jsonl, &content[..content.len() - 10]).unwrap();

        let err = PassageStore::open(&base(&dir)).unwrap_err();
        assert!(matches!(err, EngineError::Corrupt(_)));
    }

    #[test]
    fn test_bad_magic_detected() {
        let dir = tempfile::tempdir().unwrap();
        write_three(&base(&dir));

        let idx = PassageStore::idx_path_for(&base(&dir));
        let mut content = std::fs::read(&idx).unwrap();
        content[0] = b'X';
        std::fs::write(&idx, &content).unwrap();

        assert!(matches!(
            PassageStore::open(&base(&dir)).unwrap_err(),
            EngineError::Corrupt(_)
        ));
    }

    #[test]
    fn test_iter_order() {
        let dir = tempfile::tempdir().unwrap();
        write_three(&base(&dir));
        let store = PassageStore::open(&base(&dir)).unwrap();
        let ids: Vec<String> = store.iter().unwrap().map(|p| p.unwrap().id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
