//! Table Classifier
//!
//! Assigns each extracted table a statement category:
//! - Keyword fast path over headers, row labels and context
//! - LLM fallback when the keywords do not single out one category
//!
//! Ambiguity resolves to `other`; a table is never put into a financial
//! category without a clear signal.

use crate::llm::{CompletionRequest, CompletionService};
use crate::models::{ExtractedTable, StatementCategory};
use crate::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, info};

/// Keyword lists per category
const INCOME_STATEMENT_KEYWORDS: &[&str] = &[
    // Top line
    "revenue", "net sales", "cost of goods sold", "cost of revenue", "cost of sales",
    // Margins
    "gross profit", "gross margin", "operating income", "income from operations",
    "operating expenses",
    // Bottom line
    "income before", "income tax", "net income", "net loss", "earnings per share",
    // Titles
    "statements of operations", "statement of operations", "statements of income",
    "statement of income", "profit or loss",
];

const BALANCE_SHEET_KEYWORDS: &[&str] = &[
    "total assets", "current assets", "total liabilities", "current liabilities",
    "accounts receivable", "accounts payable", "inventories", "goodwill",
    "property and equipment", "balance sheet", "financial position",
];

const CASH_FLOW_KEYWORDS: &[&str] = &[
    "cash flows", "operating activities", "investing activities", "financing activities",
    "depreciation and amortization", "net cash", "capital expenditures",
    "cash equivalents at",
];

const EQUITY_KEYWORDS: &[&str] = &[
    "stockholders' equity", "shareholders' equity", "stockholders’ equity",
    "additional paid-in capital", "treasury stock", "accumulated other comprehensive",
    "dividends declared", "common stock", "retained earnings", "changes in equity",
];

/// Minimum distinct hits for the keyword path to decide on its own
const MIN_KEYWORD_HITS: usize = 2;

const CLASSIFY_SYSTEM_PROMPT: &str = r#"You classify tables extracted from company financial reports.

Answer with exactly one label in square brackets and nothing else:
[Income Statement]
[Balance Sheet]
[Cash Flow Statement]
[Stockholder's Equity Statement]
[None]

Use [None] unless the table is clearly the primary statement itself."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationMethod {
    Keyword,
    Llm,
    /// No confident signal; resolved to `other`
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Classification {
    pub category: StatementCategory,
    pub method: ClassificationMethod,
}

impl Classification {
    fn default_other() -> Self {
        Self {
            category: StatementCategory::Other,
            method: ClassificationMethod::Default,
        }
    }
}

/// Outcome of the deterministic pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordVerdict {
    Clear(StatementCategory),
    Ambiguous,
    NoSignal,
}

fn keywords_for(category: StatementCategory) -> &'static [&'static str] {
    match category {
        StatementCategory::IncomeStatement => INCOME_STATEMENT_KEYWORDS,
        StatementCategory::BalanceSheet => BALANCE_SHEET_KEYWORDS,
        StatementCategory::CashFlow => CASH_FLOW_KEYWORDS,
        StatementCategory::Equity => EQUITY_KEYWORDS,
        StatementCategory::Other => &[],
    }
}

/// Text the keyword pass looks at
fn signal_text(table: &ExtractedTable) -> String {
    let mut text = String::new();
    for part in table
        .headers
        .iter()
        .map(String::as_str)
        .chain(table.row_labels())
        .chain(table.context.iter().map(String::as_str))
    {
        text.push_str(&part.to_lowercase());
        text.push('\n');
    }
    text
}

/// Distinct keyword hits per financial category
pub fn keyword_scores(table: &ExtractedTable) -> Vec<(StatementCategory, usize)> {
    let text = signal_text(table);

    StatementCategory::ALL
        .into_iter()
        .filter(|c| *c != StatementCategory::Other)
        .map(|c| {
            let hits = keywords_for(c)
                .iter()
                .filter(|kw| text.contains(**kw))
                .count();
            (c, hits)
        })
        .collect()
}

/// Keyword heuristic: a winner needs enough hits and a strict lead
pub fn keyword_verdict(table: &ExtractedTable) -> KeywordVerdict {
    let mut scores = keyword_scores(table);
    scores.sort_by(|a, b| b.1.cmp(&a.1));

    match scores.as_slice() {
        [(_, 0), ..] | [] => KeywordVerdict::NoSignal,
        [(best, top), (_, runner_up), ..] if *top >= MIN_KEYWORD_HITS && top > runner_up => {
            KeywordVerdict::Clear(*best)
        }
        [(best, top)] if *top >= MIN_KEYWORD_HITS => KeywordVerdict::Clear(*best),
        _ => KeywordVerdict::Ambiguous,
    }
}

/// Map a bracketed label reply to a category
pub fn parse_label(reply: &str) -> Option<StatementCategory> {
    let start = reply.find('[')?;
    let end = start + reply[start..].find(']')?;
    let label = reply[start + 1..end]
        .trim()
        .to_lowercase()
        .replace('’', "'");

    match label.as_str() {
        "income statement" => Some(StatementCategory::IncomeStatement),
        "balance sheet" => Some(StatementCategory::BalanceSheet),
        "cash flow statement" => Some(StatementCategory::CashFlow),
        "stockholder's equity statement"
        | "stockholders' equity statement"
        | "shareholders' equity statement"
        | "equity statement" => Some(StatementCategory::Equity),
        "none" => Some(StatementCategory::Other),
        _ => None,
    }
}

/// Table classifier with LLM fallback
pub struct TableClassifier {
    llm: Arc<dyn CompletionService>,
}

impl TableClassifier {
    pub fn new(llm: Arc<dyn CompletionService>) -> Self {
        Self { llm }
    }

    /// Classify a single table
    pub async fn classify(&self, table: &ExtractedTable) -> Result<Classification> {
        match keyword_verdict(table) {
            KeywordVerdict::Clear(category) => {
                debug!(ordinal = table.ordinal, %category, "Classified by keywords");
                Ok(Classification {
                    category,
                    method: ClassificationMethod::Keyword,
                })
            }
            KeywordVerdict::NoSignal => Ok(Classification::default_other()),
            KeywordVerdict::Ambiguous => {
                let request = CompletionRequest::text(
                    CLASSIFY_SYSTEM_PROMPT,
                    format!("Classify this table:\n\n{}", table.combined_text()),
                );
                let reply = self.llm.complete(&request).await?;

                match parse_label(&reply) {
                    Some(category) => {
                        debug!(ordinal = table.ordinal, %category, "Classified by LLM");
                        Ok(Classification {
                            category,
                            method: ClassificationMethod::Llm,
                        })
                    }
                    None => {
                        debug!(ordinal = table.ordinal, reply = %reply, "Unrecognised label");
                        Ok(Classification::default_other())
                    }
                }
            }
        }
    }

    /// Classify every table with bounded concurrency and record the
    /// category on each. Results keep input order.
    pub async fn classify_all(
        &self,
        tables: &mut [ExtractedTable],
        concurrency: usize,
    ) -> Result<Vec<Classification>> {
        let pending: Vec<_> = tables.iter().map(|table| self.classify(table)).collect();
        let results: Vec<Classification> = stream::iter(pending)
            .buffered(concurrency.max(1))
            .try_collect()
            .await?;

        for (table, result) in tables.iter_mut().zip(&results) {
            table.category = Some(result.category);
        }

        info!(
            tables = results.len(),
            income_statement = results
                .iter()
                .filter(|c| c.category == StatementCategory::IncomeStatement)
                .count(),
            llm_calls = results
                .iter()
                .filter(|c| c.method == ClassificationMethod::Llm)
                .count(),
            "Tables classified"
        );

        Ok(results)
    }
}
