//! Indexer and retriever over a pluggable search index
//!
//! Re-indexing a document first removes every entry it owned, so a
//! document id always maps to exactly one set of entries.

pub mod azure;
pub mod memory;
pub mod scoring;

pub use azure::AzureSearchIndex;
pub use memory::InMemoryIndex;

use crate::error::PipelineError;
use crate::models::{
    DocumentMetadata, ExtractedDocument, IndexContent, IndexEntry, ScoredEntry, StatementCategory,
};
use crate::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub top_k: usize,
    pub document_id: Option<String>,
    pub category: Option<StatementCategory>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            top_k,
            document_id: None,
            category: None,
        }
    }

    pub fn in_document(mut self, document_id: &str) -> Self {
        self.document_id = Some(document_id.to_string());
        self
    }

    pub fn in_category(mut self, category: StatementCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn matches(&self, entry: &IndexEntry) -> bool {
        self.document_id
            .as_deref()
            .map_or(true, |id| entry.document_id == id)
            && self.category.map_or(true, |c| entry.category == c)
    }
}

/// Capability interface for the external search index
#[async_trait::async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<()>;

    /// Remove every entry of a document; returns how many were removed
    async fn delete_document(&self, document_id: &str) -> Result<usize>;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredEntry>>;
}

/// Deterministic entry key from (document id, ordinal)
pub fn stable_key(document_id: &str, ordinal: usize) -> String {
    use sha2::{Digest, Sha256};

    let hash = Sha256::digest(format!("{}#{}", document_id, ordinal).as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);

    // Set UUID version (4) and variant (RFC4122) bits.
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    uuid::Uuid::from_bytes(bytes).to_string()
}

/// Turn classified extraction output into index entries
pub fn build_entries(
    document_id: &str,
    extracted: &ExtractedDocument,
    metadata: &DocumentMetadata,
    indexed_at: DateTime<Utc>,
) -> Vec<IndexEntry> {
    let tables = extracted.tables.iter().map(|t| IndexEntry {
        key: stable_key(document_id, t.ordinal),
        document_id: document_id.to_string(),
        ordinal: t.ordinal,
        category: t.category.unwrap_or(StatementCategory::Other),
        content: IndexContent::Table {
            markdown: t.combined_text(),
        },
        page_number: t.first_page(),
        company_name: metadata.company_name.clone(),
        fiscal_year: metadata.fiscal_year_end.clone(),
        indexed_at,
    });

    let paragraphs = extracted.paragraphs.iter().map(|p| IndexEntry {
        key: stable_key(document_id, p.ordinal),
        document_id: document_id.to_string(),
        ordinal: p.ordinal,
        category: StatementCategory::Other,
        content: IndexContent::Paragraph {
            text: p.text.clone(),
        },
        page_number: p.regions.iter().map(|r| r.page_number).min(),
        company_name: metadata.company_name.clone(),
        fiscal_year: metadata.fiscal_year_end.clone(),
        indexed_at,
    });

    tables.chain(paragraphs).collect()
}

/// Writes a document's entries with delete-then-insert semantics
pub struct Indexer {
    index: Arc<dyn SearchIndex>,
}

impl Indexer {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }

    pub async fn index(&self, document_id: &str, entries: &[IndexEntry]) -> Result<usize> {
        if let Some(foreign) = entries.iter().find(|e| e.document_id != document_id) {
            return Err(PipelineError::BadRequest(format!(
                "entry {} belongs to '{}', not '{}'",
                foreign.key, foreign.document_id, document_id
            )));
        }

        let removed = self.index.delete_document(document_id).await?;
        if !entries.is_empty() {
            self.index.upsert(entries).await?;
        }

        info!(
            document = %document_id,
            removed,
            indexed = entries.len(),
            "Document indexed"
        );

        Ok(entries.len())
    }
}

/// Top-k retrieval ordered by relevance, then recency
pub struct Retriever {
    index: Arc<dyn SearchIndex>,
}

impl Retriever {
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self { index }
    }

    pub async fn retrieve(&self, query: &SearchQuery) -> Result<Vec<ScoredEntry>> {
        let mut hits = self.index.search(query).await?;

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.entry.indexed_at.cmp(&a.entry.indexed_at))
        });
        hits.truncate(query.top_k);

        debug!(
            query = %query.text,
            category = ?query.category,
            hits = hits.len(),
            "Retrieved entries"
        );

        Ok(hits)
    }
}
