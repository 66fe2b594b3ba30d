//! Index registry lookup
//!
//! Named indexes live under `.leann/indexes/<name>` in the current
//! project, with `~/.leann/indexes/<name>` as the user-wide fallback. The
//! registry is a CLI convenience; the engine itself only ever sees a
//! directory path.

use std::path::PathBuf;

use crate::error::{EngineError, Result};

/// Resolve an index name (or path) to its directory
pub fn find_index(name: &str) -> Result<PathBuf> {
    let local = PathBuf::from(".leann").join("indexes").join(name);
    if local.exists() {
        return Ok(local);
    }

    let as_path = PathBuf::from(name);
    if as_path.is_absolute() && as_path.exists() {
        return Ok(as_path);
    }

    if let Some(home) = dirs::home_dir() {
        let global = home.join(".leann").join("indexes").join(name);
        if global.exists() {
            return Ok(global);
        }
    }

    Err(EngineError::InvalidInput(format!(
        "index '{name}' not found; run 'leann list' to see available indexes"
    )))
}

/// All registered index directories as `(name, path)` pairs
pub fn list_indexes() -> Result<Vec<(String, PathBuf)>> {
    let mut roots = vec![PathBuf::from(".leann").join("indexes")];
    if let Some(home) = dirs::home_dir() {
        roots.push(home.join(".leann").join("indexes"));
    }

    let mut out = Vec::new();
    for root in roots {
        if !root.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
            }
        }
    }
    out.sort();
    out.dedup_by(|a, b| a.0 == b.0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_index_not_found() {
        let err = find_index("nonexistent-index-12345").unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert!(err.to_string().contains("not found"));
    }
}
