//! Blob storage for uploaded reports and exported workbooks

pub mod azure;
pub mod memory;

pub use azure::AzureBlobStore;
pub use memory::InMemoryBlobStore;

use crate::Result;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub const PDF_CONTENT_TYPE: &str = "application/pdf";
pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Read-only, time-limited download link
#[derive(Debug, Clone, serde::Serialize)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Capability interface for blob storage
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, name: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// Fails with `NotFound` when the blob does not exist
    async fn download(&self, name: &str) -> Result<Vec<u8>>;

    /// Blob names, optionally restricted to a case-insensitive suffix
    async fn list(&self, suffix: Option<&str>) -> Result<Vec<String>>;

    async fn signed_url(&self, name: &str, ttl: Duration) -> Result<SignedUrl>;
}

pub(crate) fn matches_suffix(name: &str, suffix: Option<&str>) -> bool {
    match suffix {
        Some(s) if !s.is_empty() => name.to_lowercase().ends_with(&s.to_lowercase()),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_matching() {
        assert!(matches_suffix("Report.PDF", Some(".pdf")));
        assert!(matches_suffix("report.pdf", None));
        assert!(matches_suffix("report.pdf", Some("")));
        assert!(!matches_suffix("exports/a.xlsx", Some(".pdf")));
    }
}
