//! Embedding blob - memory-mapped float32 vectors
//!
//! Present only when the index was built with `recompute = false`. The file
//! is `N` contiguous records of `D` little-endian float32s with no header;
//! dimensions and count come from the manifest and are validated on open.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{EngineError, Result};

/// Read-only, memory-mapped embedding blob
#[derive(Debug)]
pub struct EmbeddingsStore {
    mmap: Mmap,
    dimension: usize,
    count: usize,
}

impl EmbeddingsStore {
    /// Open and validate the blob against the manifest's `N` and `D`
    pub fn open(path: &Path, dimension: usize, expected_count: u64) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let record = dimension * std::mem::size_of::<f32>();
        let expected_len = expected_count as usize * record;
        if mmap.len() != expected_len {
            return Err(EngineError::Corrupt(format!(
                "{}: blob is {} bytes, expected {expected_len} ({expected_count} x {dimension} x 4)",
                path.display(),
                mmap.len()
            )));
        }

        Ok(Self {
            mmap,
            dimension,
            count: expected_count as usize,
        })
    }

    /// Vector for a node index
    pub fn get(&self, node: u32) -> Result<&[f32]> {
        let i = node as usize;
        if i >= self.count {
            return Err(EngineError::OutOfRange {
                node,
                len: self.count as u64,
            });
        }
        let record = self.dimension * std::mem::size_of::<f32>();
        let start = i * record;
        let slice = &self.mmap[start..start + record];
        // Safety: the mmap is page-aligned and every record offset is a
        // multiple of 4, so the f32 view is aligned; values were written
        // as little-endian f32 on the same convention.
        let ptr = slice.as_ptr() as *const f32;
        Ok(unsafe { std::slice::from_raw_parts(ptr, self.dimension) })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn path_for(base: &Path) -> PathBuf {
        base.with_extension("embeddings")
    }
}

/// Streaming writer for the embedding blob
pub struct EmbeddingsWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    tmp_path: PathBuf,
    dimension: usize,
    count: usize,
}

impl EmbeddingsWriter {
    pub fn create(path: &Path, dimension: usize) -> Result<Self> {
        let tmp_path = path.with_extension("embeddings.tmp");
        let file = File::create(&tmp_path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            tmp_path,
            dimension,
            count: 0,
        })
    }

    pub fn append(&mut self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(EngineError::InvalidInput(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            )));
        }
        for x in embedding {
            self.writer.write_all(&x.to_le_bytes())?;
        }
        self.count += 1;
        Ok(())
    }

    /// Flush and move the blob into place
    pub fn finish(mut self) -> Result<usize> {
        self.writer.flush()?;
        std::fs::rename(&self.tmp_path, &self.path)?;
        Ok(self.count)
    }

    pub fn len(&self) -> usize {
        self.count
    }
}

/// Delete the embedding blob, switching the index to recompute mode.
/// The caller is responsible for updating the manifest.
pub fn drop_embeddings(base: &Path) -> Result<bool> {
    let path = EmbeddingsStore::path_for(base);
    if path.exists() {
        std::fs::remove_file(&path)?;
        Ok(true)
    } else {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.embeddings");

        let mut w = EmbeddingsWriter::create(&path, 3).unwrap();
        w.append(&[1.0, 2.0, 3.0]).unwrap();
        w.append(&[-1.0, 0.5, 0.25]).unwrap();
        assert_eq!(w.finish().unwrap(), 2);

        let store = EmbeddingsStore::open(&path, 3, 2).unwrap();
        assert_eq!(store.get(0).unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(store.get(1).unwrap(), &[-1.0, 0.5, 0.25]);
        assert!(matches!(
            store.get(2).unwrap_err(),
            EngineError::OutOfRange { .. }
        ));
    }

    #[test]
    fn test_size_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.embeddings");

        let mut w = EmbeddingsWriter::create(&path, 3).unwrap();
        w.append(&[1.0, 2.0, 3.0]).unwrap();
        w.finish().unwrap();

        // Claim two records where only one exists
        assert!(matches!(
            EmbeddingsStore::open(&path, 3, 2).unwrap_err(),
            EngineError::Corrupt(_)
        ));
    }

    #[test]
    fn test_dimension_checked_on_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.embeddings");
        let mut w = EmbeddingsWriter::create(&path, 4).unwrap();
        assert!(w.append(&[1.0, 2.0]).is_err());
    }
}
