//! Reconciliation loop - drafts an income statement until it adds up
//!
//! DRAFTING → CHECKING → {DONE, DRAFTING (retry), FAILED}
//!
//! Every drafting attempt counts against the budget, whether the reply
//! failed to parse or the draft failed its checks. The loop ends after at
//! most `max_attempts` drafting calls.

pub mod check;
pub mod draft;

pub use check::{CheckEngine, CheckRule};
pub use draft::{build_request, parse_draft, Feedback};

use crate::amount::shows_rounding;
use crate::config::PipelineSettings;
use crate::error::{PipelineError, Stage};
use crate::index::{Retriever, SearchIndex, SearchQuery};
use crate::llm::CompletionService;
use crate::models::{
    DocumentMetadata, ReconciliationCheck, ReconciliationOutcome, ReconciliationStatus,
    ScoredEntry, StatementCategory, StatementDraft,
};
use crate::pipeline::bounded;
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Query used to pull statement tables and their surrounding prose
const STATEMENT_QUERY: &str =
    "income statement total revenue cost of goods sold gross profit operating income net income";

/// Tolerance when the source shows no sign of rounding
const EXACT_TOLERANCE: f64 = 0.0;

/// Explicit loop state; the attempt counter travels with it
#[derive(Debug)]
enum LoopState {
    Drafting {
        attempt: u32,
        feedback: Option<Feedback>,
    },
    Checking {
        attempt: u32,
        draft: StatementDraft,
    },
    Done {
        attempt: u32,
        draft: StatementDraft,
        check: ReconciliationCheck,
    },
    Failed {
        attempt: u32,
        reason: String,
    },
}

/// Retrieved text a run drafts from
struct DraftContext {
    statement: Vec<String>,
    supporting: Vec<String>,
    tolerance: f64,
}

pub struct ReconciliationLoop {
    llm: Arc<dyn CompletionService>,
    retriever: Retriever,
    checks: CheckEngine,
    settings: PipelineSettings,
}

impl ReconciliationLoop {
    pub fn new(
        llm: Arc<dyn CompletionService>,
        index: Arc<dyn SearchIndex>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            llm,
            retriever: Retriever::new(index),
            checks: CheckEngine::default(),
            settings,
        }
    }

    /// Draft and check the income statement of one indexed document.
    ///
    /// Returns `Reconciled` with the passing draft, or `Exhausted` with the
    /// last checked draft and its mismatches. Fails with
    /// `ReconciliationExhausted` only when no attempt produced a usable draft.
    pub async fn run(
        &self,
        document_id: &str,
        metadata: &DocumentMetadata,
    ) -> Result<ReconciliationOutcome> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut trace = Vec::new();
        let mut last_checked: Option<(StatementDraft, ReconciliationCheck)> = None;

        info!(
            document = %document_id,
            max_attempts,
            "Reconciliation: starting"
        );

        let context = self.gather_context(document_id).await?;
        trace.push(format!(
            "RETRIEVE: {} statement entries, {} supporting entries, tolerance {}",
            context.statement.len(),
            context.supporting.len(),
            context.tolerance
        ));

        let mut state = LoopState::Drafting {
            attempt: 1,
            feedback: None,
        };

        loop {
            state = match state {
                // === DRAFTING ===
                LoopState::Drafting { attempt, feedback } => {
                    trace.push(format!("DRAFTING: attempt {}/{}", attempt, max_attempts));

                    let request = build_request(
                        &context.statement,
                        &context.supporting,
                        metadata,
                        feedback.as_ref(),
                    );
                    let reply = bounded(
                        Stage::Reconciliation,
                        self.settings.call_timeout,
                        self.llm.complete(&request),
                    )
                    .await?;

                    match parse_draft(&reply, document_id, attempt) {
                        Ok(mut draft) => {
                            if draft.period.is_none() {
                                draft.period = metadata.fiscal_year_end.clone();
                            }
                            if draft.unit_scale.is_none() {
                                draft.unit_scale = metadata.unit_scale.map(|s| s.to_string());
                            }
                            LoopState::Checking { attempt, draft }
                        }
                        Err(PipelineError::DraftParseFailure(reason)) => {
                            warn!(
                                document = %document_id,
                                attempt,
                                reason = %reason,
                                "Draft rejected"
                            );
                            trace.push(format!("DRAFTING: attempt {} unusable: {}", attempt, reason));
                            next_attempt(
                                attempt,
                                max_attempts,
                                Feedback::Malformed {
                                    reason: reason.clone(),
                                    reply,
                                },
                                reason,
                            )
                        }
                        Err(e) => return Err(e),
                    }
                }

                // === CHECKING ===
                LoopState::Checking { attempt, draft } => {
                    let check = self.checks.check(&draft, context.tolerance);
                    trace.push(format!(
                        "CHECKING: attempt {} - {} mismatch(es)",
                        attempt,
                        check.mismatches.len()
                    ));

                    if check.passed {
                        LoopState::Done {
                            attempt,
                            draft,
                            check,
                        }
                    } else {
                        debug!(
                            document = %document_id,
                            attempt,
                            mismatches = check.mismatches.len(),
                            "Draft failed reconciliation"
                        );
                        let feedback = Feedback::Mismatches {
                            previous: draft.clone(),
                            mismatches: check.mismatches.clone(),
                        };
                        let reason = format!("{} mismatch(es) remain", check.mismatches.len());
                        last_checked = Some((draft, check));
                        next_attempt(attempt, max_attempts, feedback, reason)
                    }
                }

                // === DONE ===
                LoopState::Done {
                    attempt,
                    draft,
                    check,
                } => {
                    trace.push("DONE: all totals reconcile".to_string());
                    info!(document = %document_id, attempts = attempt, "Reconciliation passed");

                    return Ok(ReconciliationOutcome {
                        status: ReconciliationStatus::Reconciled,
                        draft,
                        check,
                        attempts: attempt,
                        trace,
                    });
                }

                // === FAILED ===
                LoopState::Failed { attempt, reason } => {
                    trace.push(format!("FAILED: budget exhausted: {}", reason));
                    warn!(
                        document = %document_id,
                        attempts = attempt,
                        reason = %reason,
                        "Reconciliation exhausted"
                    );

                    return match last_checked {
                        Some((draft, check)) => Ok(ReconciliationOutcome {
                            status: ReconciliationStatus::Exhausted,
                            draft,
                            check,
                            attempts: attempt,
                            trace,
                        }),
                        None => Err(PipelineError::ReconciliationExhausted {
                            attempts: attempt,
                            reason,
                        }),
                    };
                }
            };
        }
    }

    /// Statement tables, supporting prose, and the tolerance they imply
    async fn gather_context(&self, document_id: &str) -> Result<DraftContext> {
        let statement = self
            .retrieve(
                SearchQuery::new(STATEMENT_QUERY, self.settings.retrieval_top_k)
                    .in_document(document_id)
                    .in_category(StatementCategory::IncomeStatement),
            )
            .await?;
        let supporting = self
            .retrieve(
                SearchQuery::new(STATEMENT_QUERY, self.settings.context_top_k)
                    .in_document(document_id)
                    .in_category(StatementCategory::Other),
            )
            .await?;

        let rounded = statement
            .iter()
            .chain(&supporting)
            .any(|text| shows_rounding(text));
        let tolerance = if rounded {
            self.settings.rounding_epsilon
        } else {
            EXACT_TOLERANCE
        };

        Ok(DraftContext {
            statement,
            supporting,
            tolerance,
        })
    }

    async fn retrieve(&self, query: SearchQuery) -> Result<Vec<String>> {
        let hits: Vec<ScoredEntry> = bounded(
            Stage::Reconciliation,
            self.settings.call_timeout,
            self.retriever.retrieve(&query),
        )
        .await?;
        Ok(hits.into_iter().map(|h| h.entry.text().to_string()).collect())
    }
}

/// Retry with feedback while budget remains, otherwise fail
fn next_attempt(attempt: u32, max_attempts: u32, feedback: Feedback, reason: String) -> LoopState {
    if attempt < max_attempts {
        LoopState::Drafting {
            attempt: attempt + 1,
            feedback: Some(feedback),
        }
    } else {
        LoopState::Failed { attempt, reason }
    }
}
