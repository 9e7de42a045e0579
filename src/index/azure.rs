//! Azure AI Search backend over the REST API
//!
//! Every failure of the service (transport, status, body shape) surfaces
//! as `IndexUnavailable`.

use super::{SearchIndex, SearchQuery};
use crate::config::SearchConfig;
use crate::error::PipelineError;
use crate::models::{IndexContent, IndexEntry, ScoredEntry, StatementCategory};
use crate::Result;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

const API_VERSION: &str = "2024-07-01";

/// Service limit on actions per `docs/index` request
const MAX_BATCH_ACTIONS: usize = 1000;

/// Keys fetched per lookup page when clearing one document
const KEY_PAGE_SIZE: usize = 1000;

pub struct AzureSearchIndex {
    client: Client,
    base_url: String,
    api_key: String,
}

/// Document shape stored in the search index
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct SearchDocument {
    id: String,
    blob_name: String,
    ordinal: usize,
    category: StatementCategory,
    is_table: bool,
    text: String,
    page_number: Option<u32>,
    company_name: Option<String>,
    year_ended: Option<String>,
    indexed_at: DateTime<Utc>,
}

impl From<&IndexEntry> for SearchDocument {
    fn from(entry: &IndexEntry) -> Self {
        Self {
            id: entry.key.clone(),
            blob_name: entry.document_id.clone(),
            ordinal: entry.ordinal,
            category: entry.category,
            is_table: entry.is_table(),
            text: entry.text().to_string(),
            page_number: entry.page_number,
            company_name: entry.company_name.clone(),
            year_ended: entry.fiscal_year.clone(),
            indexed_at: entry.indexed_at,
        }
    }
}

impl From<SearchDocument> for IndexEntry {
    fn from(doc: SearchDocument) -> Self {
        let content = if doc.is_table {
            IndexContent::Table { markdown: doc.text }
        } else {
            IndexContent::Paragraph { text: doc.text }
        };
        Self {
            key: doc.id,
            document_id: doc.blob_name,
            ordinal: doc.ordinal,
            category: doc.category,
            content,
            page_number: doc.page_number,
            company_name: doc.company_name,
            fiscal_year: doc.year_ended,
            indexed_at: doc.indexed_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct IndexAction<T: Serialize> {
    #[serde(rename = "@search.action")]
    action: &'static str,
    #[serde(flatten)]
    document: T,
}

#[derive(Debug, Serialize)]
struct KeyOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "@search.score", default)]
    score: f64,
    #[serde(flatten)]
    document: SearchDocument,
}

#[derive(Debug, Deserialize)]
struct SearchResponse<T> {
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct KeyHit {
    id: String,
}

/// Per-document outcome of a `docs/index` request; a 207 reply mixes both
#[derive(Debug, Deserialize)]
struct IndexingResult {
    key: String,
    status: bool,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
    #[serde(rename = "statusCode", default)]
    status_code: u16,
}

/// Request bodies of at most `MAX_BATCH_ACTIONS` actions each
fn batch_bodies<T: Serialize>(actions: &[IndexAction<T>]) -> Vec<serde_json::Value> {
    actions
        .chunks(MAX_BATCH_ACTIONS)
        .map(|batch| serde_json::json!({ "value": batch }))
        .collect()
}

/// Fails when any document in the batch was not applied
fn check_batch(context: &str, results: &[IndexingResult]) -> Result<()> {
    let failed: Vec<&IndexingResult> = results.iter().filter(|r| !r.status).collect();
    let Some(first) = failed.first() else {
        return Ok(());
    };
    Err(unavailable(
        context,
        format!(
            "{} of {} documents failed, first '{}' ({}): {}",
            failed.len(),
            results.len(),
            first.key,
            first.status_code,
            first.error_message.as_deref().unwrap_or("no message")
        ),
    ))
}

/// OData filter for a query, if it has any constraints
fn odata_filter(document_id: Option<&str>, category: Option<StatementCategory>) -> Option<String> {
    let mut clauses = Vec::new();
    if let Some(id) = document_id {
        clauses.push(format!("blob_name eq '{}'", id.replace('\'', "''")));
    }
    if let Some(category) = category {
        clauses.push(format!("category eq '{}'", category.as_str()));
    }
    (!clauses.is_empty()).then(|| clauses.join(" and "))
}

fn unavailable(context: &str, detail: impl std::fmt::Display) -> PipelineError {
    error!("Search index {} failed: {}", context, detail);
    PipelineError::IndexUnavailable(format!("{}: {}", context, detail))
}

impl AzureSearchIndex {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            client,
            base_url: format!(
                "{}/indexes/{}/docs",
                config.endpoint.trim_end_matches('/'),
                config.index
            ),
            api_key: config.api_key.clone(),
        })
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B, context: &str) -> Result<reqwest::Response> {
        let url = format!("{}/{}?api-version={}", self.base_url, path, API_VERSION);
        let response = self
            .client
            .post(&url)
            .header("api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| unavailable(context, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(unavailable(context, format!("{}: {}", status, text)));
        }
        Ok(response)
    }

    /// Every key stored for a document, paged until a short page
    async fn keys_for(&self, document_id: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        loop {
            let body = serde_json::json!({
                "search": "*",
                "filter": odata_filter(Some(document_id), None),
                "select": "id",
                "top": KEY_PAGE_SIZE,
                "skip": keys.len(),
            });
            let response = self.post("search", &body, "key lookup").await?;
            let page: SearchResponse<KeyHit> = response
                .json()
                .await
                .map_err(|e| unavailable("key lookup", e))?;

            let fetched = page.value.len();
            keys.extend(page.value.into_iter().map(|h| h.id));
            if fetched < KEY_PAGE_SIZE {
                return Ok(keys);
            }
        }
    }

    /// Send actions in service-sized batches, checking each document result
    async fn apply<T: Serialize>(&self, actions: &[IndexAction<T>], context: &str) -> Result<()> {
        for body in batch_bodies(actions) {
            let response = self.post("index", &body, context).await?;
            let results: SearchResponse<IndexingResult> = response
                .json()
                .await
                .map_err(|e| unavailable(context, e))?;
            check_batch(context, &results.value)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SearchIndex for AzureSearchIndex {
    async fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        let actions: Vec<IndexAction<SearchDocument>> = entries
            .iter()
            .map(|e| IndexAction {
                action: "mergeOrUpload",
                document: SearchDocument::from(e),
            })
            .collect();

        self.apply(&actions, "upsert").await?;
        debug!(count = entries.len(), "Entries upserted");
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        // the index has no delete-by-filter, so look up keys first
        let keys = self.keys_for(document_id).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let actions: Vec<IndexAction<KeyOnly>> = keys
            .into_iter()
            .map(|id| IndexAction {
                action: "delete",
                document: KeyOnly { id },
            })
            .collect();
        let count = actions.len();

        self.apply(&actions, "delete").await?;
        debug!(document = %document_id, count, "Entries deleted");
        Ok(count)
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredEntry>> {
        let text = if query.text.trim().is_empty() {
            "*"
        } else {
            query.text.as_str()
        };
        let body = serde_json::json!({
            "search": text,
            "top": query.top_k,
            "filter": odata_filter(query.document_id.as_deref(), query.category),
        });

        let response = self.post("search", &body, "search").await?;
        let hits: SearchResponse<SearchHit> = response
            .json()
            .await
            .map_err(|e| unavailable("search", e))?;

        Ok(hits
            .value
            .into_iter()
            .map(|hit| ScoredEntry {
                entry: hit.document.into(),
                score: hit.score,
            })
            .collect())
    }
}
