//! In-memory blob store for tests and offline runs

use super::{matches_suffix, BlobStore, SignedUrl};
use crate::error::PipelineError;
use crate::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

pub struct InMemoryBlobStore {
    blobs: Arc<RwLock<BTreeMap<String, StoredBlob>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self {
            blobs: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub async fn get(&self, name: &str) -> Option<StoredBlob> {
        self.blobs.read().await.get(name).cloned()
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, name: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.blobs.write().await.insert(
            name.to_string(),
            StoredBlob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<Vec<u8>> {
        self.get(name)
            .await
            .map(|b| b.bytes)
            .ok_or_else(|| PipelineError::NotFound(format!("blob '{}'", name)))
    }

    async fn list(&self, suffix: Option<&str>) -> Result<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .await
            .keys()
            .filter(|name| matches_suffix(name, suffix))
            .cloned()
            .collect())
    }

    async fn signed_url(&self, name: &str, ttl: Duration) -> Result<SignedUrl> {
        if !self.blobs.read().await.contains_key(name) {
            return Err(PipelineError::NotFound(format!("blob '{}'", name)));
        }
        let expires_at = chrono::Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| PipelineError::Storage(format!("invalid expiry: {}", e)))?;

        Ok(SignedUrl {
            url: format!("memory://{}?se={}", name, expires_at.timestamp()),
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_and_listing() {
        let store = InMemoryBlobStore::new();
        store.upload("b.pdf", b"%PDF-b".to_vec(), "application/pdf").await.unwrap();
        store.upload("a.PDF", b"%PDF-a".to_vec(), "application/pdf").await.unwrap();
        store.upload("exports/x.xlsx", vec![1, 2], "application/zip").await.unwrap();

        assert_eq!(store.download("b.pdf").await.unwrap(), b"%PDF-b");
        assert_eq!(store.list(Some(".pdf")).await.unwrap(), vec!["a.PDF", "b.pdf"]);
        assert_eq!(store.list(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_blob_not_found() {
        let store = InMemoryBlobStore::new();
        assert!(matches!(
            store.download("nope.pdf").await,
            Err(PipelineError::NotFound(_))
        ));
        assert!(matches!(
            store.signed_url("nope.pdf", Duration::from_secs(60)).await,
            Err(PipelineError::NotFound(_))
        ));
    }
}
