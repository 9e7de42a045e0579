//! Document pipeline - runs each uploaded report end to end
//!
//! DOWNLOAD → EXTRACT → METADATA → CLASSIFY → INDEX → RECONCILE → EXPORT
//!
//! Documents run one after another; the export happens once, after every
//! document has reconciled or exhausted its budget. Any stage error aborts
//! the request with the document and stage attached, and nothing is
//! exported.

use crate::classifier::TableClassifier;
use crate::config::{AppConfig, PipelineSettings};
use crate::error::{PipelineError, Stage};
use crate::export::Exporter;
use crate::extraction::{
    self, cache::content_hash, AzureDocumentAnalyzer, CachedAnalyzer, DocumentAnalyzer,
};
use crate::index::{build_entries, AzureSearchIndex, Indexer, SearchIndex};
use crate::llm::{AzureOpenAiClient, CompletionService, TimedCompletion};
use crate::metadata::MetadataExtractor;
use crate::models::{
    Document, DocumentReport, ExtractionStatus, ProcessingReport, StatementCategory,
};
use crate::reconcile::ReconciliationLoop;
use crate::storage::{AzureBlobStore, BlobStore};
use crate::Result;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Run `fut` with a deadline; expiry becomes `Timeout` for `stage`
pub async fn bounded<T, F>(stage: Stage, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Timeout {
            stage,
            seconds: limit.as_secs(),
        }),
    }
}

/// External collaborators the pipeline talks to
#[derive(Clone)]
pub struct PipelineServices {
    pub store: Arc<dyn BlobStore>,
    pub analyzer: Arc<dyn DocumentAnalyzer>,
    pub index: Arc<dyn SearchIndex>,
    pub llm: Arc<dyn CompletionService>,
}

impl PipelineServices {
    /// Azure-backed services; layouts are cached on disk when configured
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let analyzer: Arc<dyn DocumentAnalyzer> = {
            let azure = AzureDocumentAnalyzer::new(&config.document_intelligence)?;
            match &config.extraction_cache_dir {
                Some(dir) => {
                    info!(dir = %dir.display(), "Extraction cache enabled");
                    Arc::new(CachedAnalyzer::new(Box::new(azure), dir.clone()))
                }
                None => Arc::new(azure),
            }
        };

        Ok(Self {
            store: Arc::new(AzureBlobStore::new(&config.storage)?),
            analyzer,
            index: Arc::new(AzureSearchIndex::new(&config.search)?),
            llm: Arc::new(AzureOpenAiClient::new(&config.openai)?),
        })
    }
}

pub struct DocumentPipeline {
    store: Arc<dyn BlobStore>,
    analyzer: Arc<dyn DocumentAnalyzer>,
    classifier: TableClassifier,
    metadata: MetadataExtractor,
    indexer: Indexer,
    reconciler: ReconciliationLoop,
    exporter: Exporter,
    settings: PipelineSettings,
}

impl DocumentPipeline {
    pub fn new(services: PipelineServices, settings: PipelineSettings) -> Self {
        let timed = |stage: Stage| -> Arc<dyn CompletionService> {
            Arc::new(TimedCompletion::new(
                services.llm.clone(),
                settings.call_timeout,
                stage,
            ))
        };

        Self {
            classifier: TableClassifier::new(timed(Stage::Classification)),
            metadata: MetadataExtractor::new(timed(Stage::Metadata)),
            indexer: Indexer::new(services.index.clone()),
            reconciler: ReconciliationLoop::new(
                services.llm.clone(),
                services.index.clone(),
                settings.clone(),
            ),
            exporter: Exporter::new(services.store.clone(), settings.sas_expiry),
            store: services.store,
            analyzer: services.analyzer,
            settings,
        }
    }

    /// Process every named blob, then export all statements in one workbook
    pub async fn process(&self, blob_names: &[String]) -> Result<ProcessingReport> {
        let start_time = Instant::now();
        let request_id = Uuid::new_v4();

        let mut names: Vec<&str> = Vec::with_capacity(blob_names.len());
        for name in blob_names.iter().map(|n| n.trim()) {
            if name.is_empty() {
                return Err(PipelineError::BadRequest("blob name must not be empty".to_string()));
            }
            if !names.contains(&name) {
                names.push(name);
            }
        }
        if names.is_empty() {
            return Err(PipelineError::BadRequest("no documents to process".to_string()));
        }

        info!(
            request_id = %request_id,
            documents = names.len(),
            "Pipeline: starting"
        );

        let mut documents = Vec::with_capacity(names.len());
        for name in names {
            documents.push(self.process_document(name).await?);
        }

        // === EXPORT ===
        let export = self.exporter.export(request_id, &documents).await?;

        let execution_time_ms = start_time.elapsed().as_millis() as u64;
        info!(
            request_id = %request_id,
            documents = documents.len(),
            blob = %export.blob_name,
            execution_time_ms,
            "Pipeline: complete"
        );

        Ok(ProcessingReport {
            request_id,
            documents,
            export,
            execution_time_ms,
        })
    }

    /// Run one document through every stage up to reconciliation
    pub async fn process_document(&self, blob_name: &str) -> Result<DocumentReport> {
        let limit = self.settings.call_timeout;
        let fail = |stage: Stage| move |e: PipelineError| e.in_document(blob_name, stage);

        // === DOWNLOAD ===
        let bytes = bounded(Stage::Download, limit, self.store.download(blob_name))
            .await
            .map_err(fail(Stage::Download))?;

        let mut document = Document {
            id: blob_name.to_string(),
            status: ExtractionStatus::Pending,
            content_hash: content_hash(&bytes),
            size_bytes: bytes.len(),
            received_at: Utc::now(),
        };
        debug!(document = %blob_name, bytes = document.size_bytes, "Downloaded");

        // === EXTRACT ===
        let mut extracted = bounded(
            Stage::Extraction,
            limit,
            extraction::extract(self.analyzer.as_ref(), blob_name, &bytes),
        )
        .await
        .map_err(fail(Stage::Extraction))?;
        document.status = ExtractionStatus::Done;
        drop(bytes);

        // === METADATA ===
        let mut metadata = self
            .metadata
            .describe(&extracted)
            .await
            .map_err(fail(Stage::Metadata))?;

        // === CLASSIFY ===
        self.classifier
            .classify_all(&mut extracted.tables, self.settings.classify_concurrency)
            .await
            .map_err(fail(Stage::Classification))?;
        let income_statement_tables = extracted
            .tables_in(StatementCategory::IncomeStatement)
            .count();

        // === INDEX ===
        let entries = build_entries(blob_name, &extracted, &metadata, Utc::now());
        bounded(Stage::Indexing, limit, self.indexer.index(blob_name, &entries))
            .await
            .map_err(fail(Stage::Indexing))?;

        metadata.unit_scale = self
            .metadata
            .unit_scale(&extracted)
            .await
            .map_err(fail(Stage::Metadata))?;

        // === RECONCILE ===
        let outcome = self
            .reconciler
            .run(blob_name, &metadata)
            .await
            .map_err(fail(Stage::Reconciliation))?;

        info!(
            document = %blob_name,
            tables = extracted.tables.len(),
            income_statement_tables,
            status = ?outcome.status,
            attempts = outcome.attempts,
            "Document processed"
        );

        Ok(DocumentReport {
            document,
            metadata,
            tables: extracted.tables.len(),
            income_statement_tables,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractionFailure;
    use crate::index::InMemoryIndex;
    use crate::llm::CompletionRequest;
    use crate::models::{ReconciliationStatus, UnitScale};
    use crate::storage::{InMemoryBlobStore, PDF_CONTENT_TYPE};
    use crate::test_support::{income_statement_layout, ScriptedCompletion, StaticAnalyzer};

    const STATEMENT_ROWS: &[(&str, &str)] = &[
        ("Revenue", "1,000"),
        ("Cost of Goods Sold", "(600)"),
        ("Gross Profit", "400"),
    ];

    fn draft_reply(gross_profit: f64) -> String {
        serde_json::json!({
            "line_items": [
                {"name": "Total Revenue", "value": 1000, "kind": "detail"},
                {"name": "Cost of Goods Sold", "value": 600, "kind": "detail"},
                {"name": "Gross Profit", "value": gross_profit, "kind": "subtotal"}
            ],
            "formulas": [
                {"total": "Gross Profit", "components": ["Total Revenue", {"item": "Cost of Goods Sold", "sign": -1}]}
            ]
        })
        .to_string()
    }

    /// Answers each prompt kind the pipeline sends
    fn scripted_llm(gross_profit: f64) -> Arc<ScriptedCompletion> {
        let draft = draft_reply(gross_profit);
        Arc::new(ScriptedCompletion::with_responder(move |req: &CompletionRequest, _| {
            let reply = if req.json_mode {
                draft.clone()
            } else if req.system.contains("company name") {
                "Acme Corp".to_string()
            } else if req.system.contains("fiscal year end") {
                "December 31, 2024".to_string()
            } else if req.system.contains("unit scale") {
                "millions".to_string()
            } else {
                "[None]".to_string()
            };
            Ok(reply)
        }))
    }

    struct Harness {
        store: Arc<InMemoryBlobStore>,
        index: Arc<InMemoryIndex>,
        analyzer: Arc<StaticAnalyzer>,
        pipeline: DocumentPipeline,
    }

    async fn harness(analyzer: StaticAnalyzer, llm: Arc<ScriptedCompletion>) -> Harness {
        let store = Arc::new(InMemoryBlobStore::new());
        store
            .upload("a.pdf", b"%PDF-1.7".to_vec(), PDF_CONTENT_TYPE)
            .await
            .unwrap();
        let index = Arc::new(InMemoryIndex::new());
        let analyzer = Arc::new(analyzer);

        let pipeline = DocumentPipeline::new(
            PipelineServices {
                store: store.clone(),
                analyzer: analyzer.clone(),
                index: index.clone(),
                llm,
            },
            PipelineSettings::default(),
        );

        Harness {
            store,
            index,
            analyzer,
            pipeline,
        }
    }

    async fn exports(store: &InMemoryBlobStore) -> Vec<String> {
        store.list(Some(".xlsx")).await.unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_reconciled() {
        let h = harness(
            StaticAnalyzer::new(income_statement_layout(STATEMENT_ROWS)),
            scripted_llm(400.0),
        )
        .await;

        let report = h.pipeline.process(&["a.pdf".to_string()]).await.unwrap();

        assert_eq!(report.documents.len(), 1);
        let doc = &report.documents[0];
        assert_eq!(doc.document.status, ExtractionStatus::Done);
        assert_eq!(doc.income_statement_tables, 1);
        assert_eq!(doc.metadata.company_name.as_deref(), Some("Acme Corp"));
        assert_eq!(doc.metadata.unit_scale, Some(UnitScale::Millions));
        assert_eq!(doc.outcome.status, ReconciliationStatus::Reconciled);
        assert_eq!(doc.outcome.attempts, 1);
        assert_eq!(doc.outcome.draft.period.as_deref(), Some("December 31, 2024"));

        assert_eq!(exports(&h.store).await, vec![report.export.blob_name.clone()]);
        assert!(!h.index.entries_for("a.pdf").await.is_empty());
    }

    #[tokio::test]
    async fn test_reprocessing_replaces_index_entries() {
        let h = harness(
            StaticAnalyzer::new(income_statement_layout(STATEMENT_ROWS)),
            scripted_llm(400.0),
        )
        .await;
        let names = vec!["a.pdf".to_string()];

        h.pipeline.process(&names).await.unwrap();
        let first = h.index.entries_for("a.pdf").await;
        h.pipeline.process(&names).await.unwrap();
        let second = h.index.entries_for("a.pdf").await;

        assert_eq!(first.len(), second.len());
        assert_eq!(h.index.len().await, second.len());
        assert_eq!(
            first.iter().map(|e| &e.key).collect::<Vec<_>>(),
            second.iter().map(|e| &e.key).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_exhausted_statement_is_still_exported() {
        let h = harness(
            StaticAnalyzer::new(income_statement_layout(STATEMENT_ROWS)),
            scripted_llm(450.0),
        )
        .await;

        let report = h.pipeline.process(&["a.pdf".to_string()]).await.unwrap();

        let outcome = &report.documents[0].outcome;
        assert_eq!(outcome.status, ReconciliationStatus::Exhausted);
        assert_eq!(outcome.attempts, PipelineSettings::default().max_attempts);
        assert!(!outcome.check.mismatches.is_empty());
        assert!(h.store.get(&report.export.blob_name).await.is_some());
    }

    #[tokio::test]
    async fn test_missing_blob_reports_document_and_stage() {
        let h = harness(
            StaticAnalyzer::new(income_statement_layout(STATEMENT_ROWS)),
            scripted_llm(400.0),
        )
        .await;

        let err = h
            .pipeline
            .process(&["a.pdf".to_string(), "missing.pdf".to_string()])
            .await
            .unwrap_err();

        match &err {
            PipelineError::InDocument { document, stage, .. } => {
                assert_eq!(document, "missing.pdf");
                assert_eq!(*stage, Stage::Download);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
        assert!(exports(&h.store).await.is_empty());
    }

    #[tokio::test]
    async fn test_extraction_failure_surfaces() {
        let llm = scripted_llm(400.0);
        let h = harness(StaticAnalyzer::failing(ExtractionFailure::ServiceUnavailable), llm.clone()).await;

        let err = h.pipeline.process(&["a.pdf".to_string()]).await.unwrap_err();

        assert!(matches!(
            err.root(),
            PipelineError::Extraction {
                kind: ExtractionFailure::ServiceUnavailable,
                ..
            }
        ));
        assert_eq!(h.analyzer.calls(), 1);
        assert_eq!(llm.calls(), 0);
        assert_eq!(h.index.len().await, 0);
    }

    #[tokio::test]
    async fn test_blob_names_validated() {
        let h = harness(
            StaticAnalyzer::new(income_statement_layout(STATEMENT_ROWS)),
            scripted_llm(400.0),
        )
        .await;

        assert!(matches!(
            h.pipeline.process(&[]).await,
            Err(PipelineError::BadRequest(_))
        ));
        assert!(matches!(
            h.pipeline.process(&[" ".to_string()]).await,
            Err(PipelineError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_names_processed_once() {
        let h = harness(
            StaticAnalyzer::new(income_statement_layout(STATEMENT_ROWS)),
            scripted_llm(400.0),
        )
        .await;

        let report = h
            .pipeline
            .process(&["a.pdf".to_string(), "a.pdf".to_string()])
            .await
            .unwrap();
        assert_eq!(report.documents.len(), 1);
        assert_eq!(h.analyzer.calls(), 1);
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let err = bounded(Stage::Extraction, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Timeout {
                stage: Stage::Extraction,
                ..
            }
        ));
    }
}
