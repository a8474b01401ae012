//! Durable analysis cache.
//!
//! One JSON file per fingerprint inside a cache directory. Writes go
//! through a temp file and a rename, so a killed process leaves either
//! the complete entry or nothing. Separate processes sharing the
//! directory may race on `put`; last writer wins, which is harmless
//! because entries are deterministic per fingerprint.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::analysis::AnalysisResult;
use crate::fingerprint::Fingerprint;

/// Errors from cache reads and writes. Always non-fatal to analysis:
/// the orchestrator logs them and proceeds as on a miss.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to read cache entry {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write cache entry {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed cache entry {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Key/value store mapping fingerprints to analysis results
pub trait AnalysisCache: Send + Sync {
    /// Whether an entry exists for this fingerprint
    fn has(&self, fingerprint: &Fingerprint) -> bool;

    /// Read an entry. `Ok(None)` when absent.
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<AnalysisResult>, CacheError>;

    /// Write an entry, replacing any previous content
    fn put(&self, fingerprint: &Fingerprint, result: &AnalysisResult) -> Result<(), CacheError>;
}

/// File-backed cache, one `<fingerprint>.json` per entry.
///
/// Entries are never expired or pruned by this store; maintenance of
/// the directory is an external concern.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory entries live in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint.as_hex()))
    }
}

impl AnalysisCache for FileCache {
    fn has(&self, fingerprint: &Fingerprint) -> bool {
        self.entry_path(fingerprint).is_file()
    }

    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<AnalysisResult>, CacheError> {
        let path = self.entry_path(fingerprint);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Read { path, source }),
        };

        let result = serde_json::from_str(&contents)
            .map_err(|source| CacheError::Malformed { path, source })?;
        Ok(Some(result))
    }

    fn put(&self, fingerprint: &Fingerprint, result: &AnalysisResult) -> Result<(), CacheError> {
        let path = self.entry_path(fingerprint);

        fs::create_dir_all(&self.dir).map_err(|source| CacheError::Write {
            path: self.dir.clone(),
            source,
        })?;

        let contents = serde_json::to_string_pretty(result).map_err(|source| {
            CacheError::Write {
                path: path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidData, source),
            }
        })?;

        // Atomic: complete content or nothing visible
        let tmp = self.dir.join(format!("{}.json.tmp", fingerprint.as_hex()));
        fs::write(&tmp, contents).map_err(|source| CacheError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                warn!(tmp = %tmp.display(), error = %cleanup, "failed to remove stale temp entry");
            }
            CacheError::Write { path, source }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisResult;
    use chrono::Utc;

    fn sample_result() -> AnalysisResult {
        AnalysisResult {
            explanation: "the denominator is zero".to_string(),
            suggested_fix: "guard the division".to_string(),
            model: "gpt-4o-mini".to_string(),
            timestamp: Utc::now(),
            cache_hit: false,
            elapsed: None,
        }
    }

    fn sample_fingerprint() -> Fingerprint {
        use crate::fingerprint::Fingerprinter;
        use crate::stack_trace::StackSnapshot;
        Fingerprinter::with_project_root("/x")
            .fingerprint(&StackSnapshot::new("panic", "attempt to divide by zero"))
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let fp = sample_fingerprint();
        let original = sample_result();

        assert!(!cache.has(&fp));
        assert!(cache.get(&fp).unwrap().is_none());

        cache.put(&fp, &original).unwrap();
        assert!(cache.has(&fp));

        let loaded = cache.get(&fp).unwrap().unwrap();
        assert_eq!(loaded.explanation, original.explanation);
        assert_eq!(loaded.suggested_fix, original.suggested_fix);
        assert_eq!(loaded.model, original.model);
    }

    #[test]
    fn test_entry_file_named_by_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let fp = sample_fingerprint();

        cache.put(&fp, &sample_result()).unwrap();

        let expected = dir.path().join(format!("{}.json", fp.as_hex()));
        assert!(expected.is_file());
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let fp = sample_fingerprint();

        cache.put(&fp, &sample_result()).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_malformed_entry_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let fp = sample_fingerprint();

        fs::write(
            dir.path().join(format!("{}.json", fp.as_hex())),
            "not json at all",
        )
        .unwrap();

        assert!(matches!(
            cache.get(&fp),
            Err(CacheError::Malformed { .. })
        ));
    }

    #[test]
    fn test_put_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("deep").join("cache");
        let cache = FileCache::new(&nested);
        let fp = sample_fingerprint();

        cache.put(&fp, &sample_result()).unwrap();
        assert!(cache.has(&fp));
    }

    #[test]
    fn test_put_overwrites_existing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path());
        let fp = sample_fingerprint();

        cache.put(&fp, &sample_result()).unwrap();
        let mut updated = sample_result();
        updated.explanation = "second opinion".to_string();
        cache.put(&fp, &updated).unwrap();

        let loaded = cache.get(&fp).unwrap().unwrap();
        assert_eq!(loaded.explanation, "second opinion");
    }
}
