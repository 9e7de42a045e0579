//! On-disk cache of raw layout results keyed by content hash

use super::DocumentAnalyzer;
use crate::Result;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Wraps an analyzer and stores each result as `{dir}/{sha256}.json`
pub struct CachedAnalyzer {
    inner: Box<dyn DocumentAnalyzer>,
    dir: PathBuf,
}

impl CachedAnalyzer {
    pub fn new(inner: Box<dyn DocumentAnalyzer>, dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            dir: dir.into(),
        }
    }

    fn path_for(&self, bytes: &[u8]) -> PathBuf {
        self.dir.join(format!("{}.json", content_hash(bytes)))
    }
}

/// Hex-encoded SHA256 of raw bytes
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

async fn read_cached(path: &Path) -> Option<serde_json::Value> {
    let raw = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), "Ignoring unreadable cache entry: {}", e);
            None
        }
    }
}

#[async_trait::async_trait]
impl DocumentAnalyzer for CachedAnalyzer {
    async fn analyze(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        let path = self.path_for(bytes);

        if let Some(cached) = read_cached(&path).await {
            info!(path = %path.display(), "Layout loaded from cache");
            return Ok(cached);
        }

        debug!(path = %path.display(), "Layout cache miss");
        let result = self.inner.analyze(bytes).await?;

        // a failed write only costs a re-analysis later
        let write = async {
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::write(&path, serde_json::to_vec(&result)?).await?;
            Ok::<(), crate::error::PipelineError>(())
        };
        if let Err(e) = write.await {
            warn!(path = %path.display(), "Could not write layout cache: {}", e);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{temp_dir, StaticAnalyzer};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_second_call_served_from_disk() {
        let dir = temp_dir("layout-cache");
        let inner = Arc::new(StaticAnalyzer::new(serde_json::json!({"tables": []})));
        let cached = CachedAnalyzer::new(Box::new(inner.clone()), &dir);

        let first = cached.analyze(b"report-bytes").await.unwrap();
        let second = cached.analyze(b"report-bytes").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(inner.calls(), 1);
        assert!(dir.join(format!("{}.json", content_hash(b"report-bytes"))).exists());

        cached.analyze(b"other-bytes").await.unwrap();
        assert_eq!(inner.calls(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"").len(), 64);
    }
}
