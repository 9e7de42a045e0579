//! Extraction adapter
//!
//! Sends report bytes to a document-intelligence service and converts the
//! returned layout into tables and paragraphs. Failures surface to the
//! caller; nothing here retries.

pub mod azure;
pub mod cache;
pub mod layout;

pub use azure::AzureDocumentAnalyzer;
pub use cache::CachedAnalyzer;

use crate::models::ExtractedDocument;
use crate::Result;
use tracing::info;

/// Capability interface for layout analysis
#[async_trait::async_trait]
pub trait DocumentAnalyzer: Send + Sync {
    /// Returns the raw `analyzeResult` payload
    async fn analyze(&self, bytes: &[u8]) -> Result<serde_json::Value>;
}

#[async_trait::async_trait]
impl<T: DocumentAnalyzer + ?Sized> DocumentAnalyzer for std::sync::Arc<T> {
    async fn analyze(&self, bytes: &[u8]) -> Result<serde_json::Value> {
        (**self).analyze(bytes).await
    }
}

/// Analyze a document and convert the layout into extracted records
pub async fn extract(
    analyzer: &dyn DocumentAnalyzer,
    document_id: &str,
    bytes: &[u8],
) -> Result<ExtractedDocument> {
    let raw = analyzer.analyze(bytes).await?;
    let extracted = layout::convert(document_id, &raw)?;

    info!(
        document = %document_id,
        tables = extracted.tables.len(),
        paragraphs = extracted.paragraphs.len(),
        "Layout extracted"
    );

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExtractionFailure, PipelineError};
    use crate::test_support::StaticAnalyzer;

    #[tokio::test]
    async fn test_extract_surfaces_service_errors() {
        let analyzer = StaticAnalyzer::failing(ExtractionFailure::QuotaExceeded);
        let err = extract(&analyzer, "a.pdf", b"%PDF").await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Extraction {
                kind: ExtractionFailure::QuotaExceeded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_extract_converts_layout() {
        let analyzer = StaticAnalyzer::new(serde_json::json!({
            "paragraphs": [{"content": "Hello", "spans": [{"offset": 0, "length": 5}]}]
        }));
        let doc = extract(&analyzer, "a.pdf", b"%PDF").await.unwrap();

        assert!(doc.tables.is_empty());
        assert_eq!(doc.paragraphs[0].document_id, "a.pdf");
        assert_eq!(analyzer.calls(), 1);
    }
}
