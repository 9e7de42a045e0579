//! Document metadata: company name, fiscal year end, unit scale
//!
//! Best-effort. A reply that names nothing yields `None`; transport
//! failures of the completion service still propagate.

use crate::index::scoring::top_k;
use crate::llm::{CompletionRequest, CompletionService};
use crate::models::{DocumentMetadata, ExtractedDocument, StatementCategory, UnitScale};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Context sizes tried in turn when looking for the company name
const COMPANY_CONTEXT_LENGTHS: &[usize] = &[1000, 2000, 5000];

const FISCAL_YEAR_QUERY: &str = "fiscal year end date";
const FISCAL_YEAR_PASSAGES: usize = 5;

const NOT_FOUND: &str = "not found";

const COMPANY_SYSTEM_PROMPT: &str = "You are an expert document analyzer. Extract the official company name from the given context.
1. Look for the full legal name of the company
2. Prefer names found in headers, title pages or official statements
3. Reply with ONLY the exact company name
4. If no clear company name is found, reply with 'Not Found'
5. Use ONLY the information in the context";

const FISCAL_YEAR_SYSTEM_PROMPT: &str = "You are an expert document analyzer. Extract the fiscal year end date from the given context.
1. Look for phrases like 'Fiscal Year Ended', 'Year End', 'As of'
2. Reply with ONLY the date in the format 'Month Day, Year'
3. If no clear fiscal year end date is found, reply with 'Not Found'
4. Use ONLY the information in the context";

const UNIT_SCALE_SYSTEM_PROMPT: &str = "You read financial statement tables. Identify the unit scale the amounts are presented in.
Reply with exactly one word: thousands, millions or billions.";

/// Scale phrases in the order they are searched
const SCALE_MARKERS: &[(&str, UnitScale)] = &[
    ("in thousands", UnitScale::Thousands),
    ("in millions", UnitScale::Millions),
    ("in billions", UnitScale::Billions),
    ("(thousands", UnitScale::Thousands),
    ("(millions", UnitScale::Millions),
    ("(billions", UnitScale::Billions),
    ("thousands of", UnitScale::Thousands),
    ("millions of", UnitScale::Millions),
    ("billions of", UnitScale::Billions),
    ("$000s", UnitScale::Thousands),
    ("$000's", UnitScale::Thousands),
];

/// Earliest scale phrase in the text
pub fn detect_unit_scale(text: &str) -> Option<UnitScale> {
    let lower = text.to_lowercase();
    SCALE_MARKERS
        .iter()
        .filter_map(|(marker, scale)| lower.find(marker).map(|pos| (pos, *scale)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, scale)| scale)
}

/// `None` for empty or "Not Found" replies
fn found(reply: &str) -> Option<String> {
    let cleaned = reply
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();
    if cleaned.is_empty() || cleaned.to_lowercase().trim_end_matches('.') == NOT_FOUND {
        None
    } else {
        Some(cleaned.to_string())
    }
}

pub struct MetadataExtractor {
    llm: Arc<dyn CompletionService>,
}

impl MetadataExtractor {
    pub fn new(llm: Arc<dyn CompletionService>) -> Self {
        Self { llm }
    }

    /// Company name and fiscal year end from the document's prose
    pub async fn describe(&self, extracted: &ExtractedDocument) -> Result<DocumentMetadata> {
        let paragraphs: Vec<&str> = extracted.paragraphs.iter().map(|p| p.text.as_str()).collect();

        let company_name = self.company_name(&paragraphs).await?;
        let fiscal_year_end = self.fiscal_year_end(&paragraphs).await?;

        info!(
            company = ?company_name,
            fiscal_year_end = ?fiscal_year_end,
            "Document metadata extracted"
        );

        Ok(DocumentMetadata {
            company_name,
            fiscal_year_end,
            unit_scale: None,
        })
    }

    /// Company name with progressively larger opening context
    pub async fn company_name(&self, paragraphs: &[&str]) -> Result<Option<String>> {
        let mut last_context_len = 0;

        for max_len in COMPANY_CONTEXT_LENGTHS {
            let mut context = String::new();
            for paragraph in paragraphs {
                if context.len() + paragraph.len() > *max_len {
                    break;
                }
                context.push_str(paragraph);
                context.push_str("\n\n");
            }

            // a larger window that adds nothing would repeat the same prompt
            if context.trim().is_empty() || context.len() == last_context_len {
                continue;
            }
            last_context_len = context.len();

            let request = CompletionRequest::text(
                COMPANY_SYSTEM_PROMPT,
                format!(
                    "Extract the official company name from the following context:\n\n{}",
                    context
                ),
            );
            if let Some(name) = found(&self.llm.complete(&request).await?) {
                return Ok(Some(name));
            }
            debug!(max_len, "Company name not found in context window");
        }

        Ok(None)
    }

    /// Fiscal year end from the passages most relevant to it
    pub async fn fiscal_year_end(&self, paragraphs: &[&str]) -> Result<Option<String>> {
        let best = top_k(FISCAL_YEAR_QUERY, paragraphs, FISCAL_YEAR_PASSAGES);
        if best.is_empty() {
            return Ok(None);
        }

        let context = best
            .iter()
            .map(|i| paragraphs[*i])
            .collect::<Vec<_>>()
            .join("\n\n");
        let request = CompletionRequest::text(
            FISCAL_YEAR_SYSTEM_PROMPT,
            format!(
                "Extract the fiscal year end date from the following context:\n\n{}",
                context
            ),
        );

        Ok(found(&self.llm.complete(&request).await?))
    }

    /// Unit scale of the income statement: scanned first, asked second
    pub async fn unit_scale(&self, extracted: &ExtractedDocument) -> Result<Option<UnitScale>> {
        let income_text: Vec<String> = extracted
            .tables_in(StatementCategory::IncomeStatement)
            .map(|t| t.combined_text())
            .collect();
        if income_text.is_empty() {
            return Ok(None);
        }

        let combined = income_text.join("\n\n");
        if let Some(scale) = detect_unit_scale(&combined) {
            debug!(%scale, "Unit scale found in table text");
            return Ok(Some(scale));
        }

        let request = CompletionRequest::text(UNIT_SCALE_SYSTEM_PROMPT, combined);
        let reply = self.llm.complete(&request).await?;
        let scale = UnitScale::parse(&reply);
        debug!(reply = %reply, scale = ?scale, "Unit scale from LLM");

        Ok(scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExtractedParagraph;
    use crate::test_support::{table_from_rows, ScriptedCompletion};

    fn document(paragraphs: &[&str]) -> ExtractedDocument {
        ExtractedDocument {
            tables: vec![],
            paragraphs: paragraphs
                .iter()
                .enumerate()
                .map(|(i, text)| ExtractedParagraph {
                    document_id: "a.pdf".into(),
                    ordinal: i,
                    offset: Some(i * 100),
                    text: text.to_string(),
                    role: None,
                    regions: vec![],
                })
                .collect(),
        }
    }

    #[test]
    fn test_detect_unit_scale() {
        assert_eq!(
            detect_unit_scale("(In millions, except per share amounts)"),
            Some(UnitScale::Millions)
        );
        assert_eq!(
            detect_unit_scale("Amounts in thousands of U.S. dollars; totals in millions"),
            Some(UnitScale::Thousands)
        );
        assert_eq!(detect_unit_scale("| Revenue | 100 |"), None);
    }

    #[test]
    fn test_not_found_replies() {
        assert_eq!(found("Not Found"), None);
        assert_eq!(found(" 'not found.' "), None);
        assert_eq!(found(""), None);
        assert_eq!(found("\"Acme Corp\""), Some("Acme Corp".to_string()));
    }

    #[tokio::test]
    async fn test_describe() {
        let llm = Arc::new(ScriptedCompletion::with_responder(|req, _| {
            Ok(if req.user.contains("company name") {
                "Acme Corporation".to_string()
            } else {
                "December 31, 2024".to_string()
            })
        }));
        let extractor = MetadataExtractor::new(llm.clone());
        let doc = document(&[
            "Acme Corporation Annual Report",
            "For the fiscal year ended December 31, 2024",
        ]);

        let metadata = extractor.describe(&doc).await.unwrap();
        assert_eq!(metadata.company_name.as_deref(), Some("Acme Corporation"));
        assert_eq!(metadata.fiscal_year_end.as_deref(), Some("December 31, 2024"));
        assert!(llm.prompts()[1].contains("fiscal year ended"));
    }

    #[tokio::test]
    async fn test_company_name_widens_context_once_per_size() {
        let llm = Arc::new(ScriptedCompletion::new(vec!["Not Found"]));
        let extractor = MetadataExtractor::new(llm.clone());

        // short document: every window holds the same text, so one call
        let name = extractor.company_name(&["tiny cover page"]).await.unwrap();
        assert_eq!(name, None);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_fiscal_year_skipped_without_relevant_text() {
        let llm = Arc::new(ScriptedCompletion::new(vec!["December 31, 2024"]));
        let extractor = MetadataExtractor::new(llm.clone());

        let result = extractor.fiscal_year_end(&["board of directors"]).await.unwrap();
        assert_eq!(result, None);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_unit_scale_prefers_table_text() {
        let llm = Arc::new(ScriptedCompletion::new(vec!["billions"]));
        let extractor = MetadataExtractor::new(llm.clone());

        let mut table = table_from_rows(&["", "2024"], &[&["Revenue", "10"]]);
        table.category = Some(StatementCategory::IncomeStatement);
        table.context = vec!["(in thousands)".to_string()];
        let mut doc = document(&[]);
        doc.tables.push(table.clone());

        assert_eq!(
            extractor.unit_scale(&doc).await.unwrap(),
            Some(UnitScale::Thousands)
        );
        assert_eq!(llm.calls(), 0);

        doc.tables[0].context.clear();
        assert_eq!(
            extractor.unit_scale(&doc).await.unwrap(),
            Some(UnitScale::Billions)
        );
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_unit_scale_rejects_unknown_reply() {
        let llm = Arc::new(ScriptedCompletion::new(vec!["hundreds"]));
        let extractor = MetadataExtractor::new(llm);

        let mut table = table_from_rows(&["", "2024"], &[&["Revenue", "10"]]);
        table.category = Some(StatementCategory::IncomeStatement);
        let mut doc = document(&[]);
        doc.tables.push(table);

        assert_eq!(extractor.unit_scale(&doc).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_llm_failure_propagates() {
        let extractor = MetadataExtractor::new(Arc::new(ScriptedCompletion::failing("down")));
        let doc = document(&["Acme Corporation Annual Report"]);
        assert!(extractor.describe(&doc).await.is_err());
    }
}
