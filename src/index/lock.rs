//! Build lock - one writer per index directory
//!
//! A lock file created with `create_new` guards concurrent builds; the
//! file records the holder's pid for diagnostics. Stale temp files from a
//! build that died are garbage-collected by age when the directory is next
//! opened.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{EngineError, Result};

const LOCK_FILE: &str = ".leann.lock";

/// Temp files older than this are considered leftovers of a dead build
const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

/// Held for the duration of a build; released on drop
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
}

impl BuildLock {
    /// Acquire the directory lock, failing when another build holds it
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(EngineError::InvalidInput(format!(
                    "index directory {} is locked by another build (remove {LOCK_FILE} if stale)",
                    dir.display()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("failed to release build lock {}: {e}", self.path.display());
        }
    }
}

/// Remove `*.tmp` leftovers older than the stale age. Called when opening
/// a directory for reading or rebuilding.
pub fn collect_stale_temps(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("tmp") {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok());
        if age.is_some_and(|a| a > STALE_TEMP_AGE) {
            debug!("removing stale temp file {}", path.display());
            let _ = std::fs::remove_file(&path);
        }
    }
    Ok(())
}
