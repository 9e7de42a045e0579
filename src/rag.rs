//! Retrieval-augmented answers over the indexed reports

use crate::error::{PipelineError, Stage};
use crate::index::{Retriever, SearchIndex, SearchQuery};
use crate::llm::{CompletionRequest, CompletionService};
use crate::models::{ScoredEntry, StatementCategory};
use crate::pipeline::bounded;
use crate::Result;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const RAG_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that provides detailed and factual answers based on the provided context.";

const NO_CONTEXT: &str = "No relevant information found.";

#[derive(Debug, Clone, Serialize)]
pub struct RagSource {
    pub document_id: String,
    pub page_number: Option<u32>,
    pub category: StatementCategory,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub answer: String,
    pub sources: Vec<RagSource>,
}

/// Texts in rank order with repeats dropped
fn unique_texts(hits: &[ScoredEntry]) -> Vec<&str> {
    let mut seen = HashSet::new();
    hits.iter()
        .map(|h| h.entry.text())
        .filter(|text| seen.insert(*text))
        .collect()
}

fn build_prompt(query: &str, texts: &[&str]) -> String {
    let context = if texts.is_empty() {
        NO_CONTEXT.to_string()
    } else {
        texts.join("\n\n")
    };
    format!(
        "Below is the user query:\n\n{}\n\nBelow is the relevant context retrieved from the documents:\n\n{}\n\nBased on the above context, please answer the user's query as accurately and comprehensively as possible.",
        query, context
    )
}

pub struct RagResponder {
    llm: Arc<dyn CompletionService>,
    retriever: Retriever,
    call_timeout: Duration,
}

impl RagResponder {
    pub fn new(
        llm: Arc<dyn CompletionService>,
        index: Arc<dyn SearchIndex>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            retriever: Retriever::new(index),
            call_timeout,
        }
    }

    pub async fn answer(&self, query: &str, top: usize) -> Result<RagAnswer> {
        let query = query.trim();
        if query.is_empty() {
            return Err(PipelineError::BadRequest("query must not be empty".to_string()));
        }

        let hits = bounded(
            Stage::Query,
            self.call_timeout,
            self.retriever.retrieve(&SearchQuery::new(query, top.max(1))),
        )
        .await?;

        let texts = unique_texts(&hits);
        let request = CompletionRequest::text(RAG_SYSTEM_PROMPT, build_prompt(query, &texts));
        let answer = bounded(Stage::Query, self.call_timeout, self.llm.complete(&request)).await?;

        info!(hits = hits.len(), unique = texts.len(), "RAG query answered");

        Ok(RagAnswer {
            answer,
            sources: hits
                .iter()
                .map(|h| RagSource {
                    document_id: h.entry.document_id.clone(),
                    page_number: h.entry.page_number,
                    category: h.entry.category,
                    score: h.score,
                })
                .collect(),
        })
    }
}
