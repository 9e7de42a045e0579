//! Statement Reconciler
//!
//! Turns uploaded financial report PDFs into a reconciled income statement:
//! - Extracts tables and paragraphs through a layout analysis service
//! - Classifies tables by financial statement category
//! - Indexes every table and paragraph for retrieval
//! - Drafts the income statement with an LLM and checks every formula
//! - Exports the final drafts to an xlsx workbook behind a signed link
//!
//! PIPELINE:
//! DOWNLOAD → EXTRACT → METADATA → CLASSIFY → INDEX → RECONCILE → EXPORT

pub mod amount;
pub mod api;
pub mod classifier;
pub mod config;
pub mod error;
pub mod export;
pub mod extraction;
pub mod index;
pub mod llm;
pub mod metadata;
pub mod models;
pub mod pipeline;
pub mod rag;
pub mod reconcile;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use error::{PipelineError, Result};

// Re-export common types
pub use models::*;
pub use pipeline::{DocumentPipeline, PipelineServices};
pub use reconcile::ReconciliationLoop;
