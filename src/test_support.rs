//! Deterministic stand-ins shared by unit tests

use crate::amount::parse_amount;
use crate::error::{ExtractionFailure, PipelineError};
use crate::extraction::DocumentAnalyzer;
use crate::llm::{CompletionRequest, CompletionService};
use crate::models::{ExtractedTable, TableCell};
use crate::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type Responder = Box<dyn Fn(&CompletionRequest, usize) -> Result<String> + Send + Sync>;

/// Completion service that answers from a script and records every prompt
pub struct ScriptedCompletion {
    responder: Responder,
    prompts: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    /// Replies in order; the last reply repeats once the script runs out
    pub fn new(replies: Vec<&str>) -> Self {
        let replies: Vec<String> = replies.into_iter().map(str::to_string).collect();
        Self::with_responder(move |_, call| {
            replies
                .get(call)
                .or_else(|| replies.last())
                .cloned()
                .ok_or_else(|| PipelineError::Llm("script is empty".to_string()))
        })
    }

    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self::with_responder(move |_, _| Err(PipelineError::Llm(message.clone())))
    }

    /// Reply computed from the request and the zero-based call index
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest, usize) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// User prompts in call order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.iter().map(|r| r.user.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let call = {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(request.clone());
            prompts.len() - 1
        };
        (self.responder)(request, call)
    }
}

/// Analyzer returning a fixed layout payload
pub struct StaticAnalyzer {
    result: std::result::Result<serde_json::Value, ExtractionFailure>,
    calls: AtomicUsize,
}

impl StaticAnalyzer {
    pub fn new(result: serde_json::Value) -> Self {
        Self {
            result: Ok(result),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(kind: ExtractionFailure) -> Self {
        Self {
            result: Err(kind),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DocumentAnalyzer for StaticAnalyzer {
    async fn analyze(&self, _bytes: &[u8]) -> Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.result {
            Ok(value) => Ok(value.clone()),
            Err(kind) => Err(PipelineError::Extraction {
                kind: *kind,
                detail: "scripted failure".to_string(),
            }),
        }
    }
}

/// Table with the given header and body rows
pub fn table_from_rows(headers: &[&str], rows: &[&[&str]]) -> ExtractedTable {
    ExtractedTable {
        document_id: "report.pdf".to_string(),
        ordinal: 0,
        offset: Some(0),
        headers: headers.iter().map(|h| h.to_string()).collect(),
        rows: rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|text| TableCell {
                        text: text.to_string(),
                        value: parse_amount(text),
                    })
                    .collect()
            })
            .collect(),
        context: vec![],
        footnote: None,
        regions: vec![],
        category: None,
    }
}

/// Layout payload holding one income statement table and a heading
pub fn income_statement_layout(rows: &[(&str, &str)]) -> serde_json::Value {
    let mut cells = vec![
        serde_json::json!({"kind": "columnHeader", "rowIndex": 0, "columnIndex": 0, "content": "Line item"}),
        serde_json::json!({"kind": "columnHeader", "rowIndex": 0, "columnIndex": 1, "content": "2024"}),
    ];
    for (i, (label, value)) in rows.iter().enumerate() {
        cells.push(serde_json::json!({"rowIndex": i + 1, "columnIndex": 0, "content": label}));
        cells.push(serde_json::json!({"rowIndex": i + 1, "columnIndex": 1, "content": value}));
    }

    serde_json::json!({
        "paragraphs": [
            {"content": "Acme Corp Annual Report", "role": "title",
             "spans": [{"offset": 0, "length": 23}]},
            {"content": "Consolidated Statements of Operations", "role": "sectionHeading",
             "spans": [{"offset": 30, "length": 37}]},
            {"content": "Fiscal year ended December 31, 2024", "spans": [{"offset": 400, "length": 35}]}
        ],
        "tables": [{
            "rowCount": rows.len() + 1,
            "columnCount": 2,
            "spans": [{"offset": 100, "length": 200}],
            "cells": cells
        }]
    })
}

/// Fresh scratch directory under the system temp dir
pub fn temp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}
