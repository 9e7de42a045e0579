//! In-memory search index for tests and offline runs

use super::scoring::rank_texts;
use super::{SearchIndex, SearchQuery};
use crate::models::{IndexEntry, ScoredEntry};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Entries keyed by their stable key
pub struct InMemoryIndex {
    entries: Arc<RwLock<HashMap<String, IndexEntry>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn entries_for(&self, document_id: &str) -> Vec<IndexEntry> {
        let entries = self.entries.read().await;
        let mut found: Vec<IndexEntry> = entries
            .values()
            .filter(|e| e.document_id == document_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.ordinal);
        found
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SearchIndex for InMemoryIndex {
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        let mut stored = self.entries.write().await;
        for entry in entries {
            stored.insert(entry.key.clone(), entry.clone());
        }
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let mut stored = self.entries.write().await;
        let before = stored.len();
        stored.retain(|_, e| e.document_id != document_id);
        Ok(before - stored.len())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredEntry>> {
        let stored = self.entries.read().await;

        let candidates: Vec<&IndexEntry> = stored.values().filter(|e| query.matches(e)).collect();
        let texts: Vec<&str> = candidates.iter().map(|e| e.text()).collect();
        let scores = rank_texts(&query.text, &texts);

        // a category filter is itself a relevance signal
        let keep_unscored = query.category.is_some() || query.text.trim().is_empty();

        Ok(candidates
            .into_iter()
            .zip(scores)
            .filter(|(_, score)| keep_unscored || *score > 0.0)
            .map(|(entry, score)| ScoredEntry {
                entry: entry.clone(),
                score,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IndexContent, StatementCategory};
    use chrono::Utc;

    fn entry(document_id: &str, ordinal: usize, category: StatementCategory, text: &str) -> IndexEntry {
        IndexEntry {
            key: super::super::stable_key(document_id, ordinal),
            document_id: document_id.to_string(),
            ordinal,
            category,
            content: IndexContent::Paragraph {
                text: text.to_string(),
            },
            page_number: None,
            company_name: None,
            fiscal_year: None,
            indexed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_filters_apply() {
        let index = InMemoryIndex::new();
        index
            .upsert(&[
                entry("a.pdf", 0, StatementCategory::IncomeStatement, "revenue table"),
                entry("a.pdf", 1, StatementCategory::Other, "revenue commentary"),
                entry("b.pdf", 0, StatementCategory::IncomeStatement, "unrelated words"),
            ])
            .await
            .unwrap();

        let income = index
            .search(&SearchQuery::new("revenue", 10).in_category(StatementCategory::IncomeStatement))
            .await
            .unwrap();
        // category filter keeps zero-score tables
        assert_eq!(income.len(), 2);

        let scoped = index
            .search(&SearchQuery::new("revenue", 10).in_document("a.pdf"))
            .await
            .unwrap();
        assert_eq!(scoped.len(), 2);

        let plain = index.search(&SearchQuery::new("revenue", 10)).await.unwrap();
        assert_eq!(plain.len(), 2);
        assert!(plain.iter().all(|h| h.entry.document_id == "a.pdf"));
    }

    #[tokio::test]
    async fn test_delete_counts_removed() {
        let index = InMemoryIndex::new();
        index
            .upsert(&[
                entry("a.pdf", 0, StatementCategory::Other, "x"),
                entry("a.pdf", 1, StatementCategory::Other, "y"),
            ])
            .await
            .unwrap();

        assert_eq!(index.delete_document("a.pdf").await.unwrap(), 2);
        assert_eq!(index.delete_document("a.pdf").await.unwrap(), 0);
        assert_eq!(index.len().await, 0);
    }
}
