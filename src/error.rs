//! Error types for the statement reconciliation pipeline

use axum::http::StatusCode;
use std::fmt;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Why the document-intelligence service could not produce a layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionFailure {
    ServiceUnavailable,
    UnsupportedFormat,
    QuotaExceeded,
    MalformedResponse,
}

impl fmt::Display for ExtractionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtractionFailure::ServiceUnavailable => "service unavailable",
            ExtractionFailure::UnsupportedFormat => "unsupported format",
            ExtractionFailure::QuotaExceeded => "quota exceeded",
            ExtractionFailure::MalformedResponse => "malformed response",
        };
        write!(f, "{}", s)
    }
}

/// Pipeline stage an error surfaced from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Extraction,
    Metadata,
    Classification,
    Indexing,
    Reconciliation,
    Export,
    Query,
    Request,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Download => "download",
            Stage::Extraction => "extraction",
            Stage::Metadata => "metadata",
            Stage::Classification => "classification",
            Stage::Indexing => "indexing",
            Stage::Reconciliation => "reconciliation",
            Stage::Export => "export",
            Stage::Query => "query",
            Stage::Request => "request",
        };
        write!(f, "{}", s)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Extraction error ({kind}): {detail}")]
    Extraction {
        kind: ExtractionFailure,
        detail: String,
    },

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Draft parse failure: {0}")]
    DraftParseFailure(String),

    #[error("Reconciliation exhausted after {attempts} attempt(s): {reason}")]
    ReconciliationExhausted { attempts: u32, reason: String },

    #[error("Export error: {0}")]
    Export(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("{stage} timed out after {seconds}s")]
    Timeout { stage: Stage, seconds: u64 },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{stage} failed for document '{document}': {source}")]
    InDocument {
        document: String,
        stage: Stage,
        #[source]
        source: Box<PipelineError>,
    },

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PipelineError {
    /// Attach document id and stage so the caller can retry by hand
    pub fn in_document(self, document: &str, stage: Stage) -> Self {
        // keep the innermost context
        if matches!(self, PipelineError::InDocument { .. }) {
            return self;
        }
        PipelineError::InDocument {
            document: document.to_string(),
            stage,
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping document context
    pub fn root(&self) -> &PipelineError {
        match self {
            PipelineError::InDocument { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.root() {
            PipelineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Extraction {
                kind: ExtractionFailure::UnsupportedFormat,
                ..
            } => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::Extraction {
                kind: ExtractionFailure::QuotaExceeded,
                ..
            } => StatusCode::TOO_MANY_REQUESTS,
            PipelineError::Extraction { .. }
            | PipelineError::IndexUnavailable(_)
            | PipelineError::Llm(_)
            | PipelineError::Storage(_)
            | PipelineError::HttpError(_) => StatusCode::BAD_GATEWAY,
            PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
