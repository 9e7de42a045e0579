//! Drafting prompt and draft parsing
//!
//! The model answers with one JSON object. Anything that cannot be turned
//! into a self-consistent set of references is a `DraftParseFailure`.

use crate::amount::parse_amount;
use crate::error::PipelineError;
use crate::llm::{strip_code_fences, CompletionRequest};
use crate::models::{
    DocumentMetadata, Formula, FormulaTerm, LineItem, LineItemKind, Mismatch, StatementDraft,
};
use crate::Result;
use serde::Deserialize;
use std::collections::HashSet;

/// Line items every draft is expected to carry, in statement order
pub const EXPECTED_LINE_ITEMS: &[&str] = &[
    "Total Revenue",
    "Cost of Goods Sold",
    "Gross Profit",
    "Operating Expenses",
    "Operating Income",
    "Pre-Tax Income",
    "Income Tax Expense",
    "Net Income",
];

/// Expected items that are always derived from other lines
pub const AGGREGATE_LINE_ITEMS: &[&str] = &[
    "Gross Profit",
    "Operating Income",
    "Pre-Tax Income",
    "Net Income",
];

const DRAFT_SYSTEM_PROMPT: &str = "You are an accountant building an income statement from tables extracted from a financial report.
Follow standard income statement ordering:
1. Segment revenues, then Total Revenue
2. Cost of Goods Sold
3. Gross Profit
4. Operating Expenses (e.g. Selling, General & Administrative)
5. Operating Income
6. Interest and other non-operating items
7. Pre-Tax Income
8. Income Tax Expense
9. Net Income

Rules:
- Use only figures that appear in the provided tables
- Keep the unit scale of the source; do not convert
- Expenses may be positive values subtracted with a formula sign of -1, or negative values added with sign 1
- Every subtotal and total must have a formula listing its components
- Gross Profit, Operating Income, Pre-Tax Income and Net Income are always a subtotal or total
- A component sign is either 1 or -1
- A formula never lists its own total as a component
- Every formula must add up exactly to its total

Respond with JSON only:
{
  \"period\": \"December 31, 2024\",
  \"unit_scale\": \"millions\",
  \"line_items\": [
    {\"name\": \"Total Revenue\", \"value\": 10000, \"kind\": \"detail\"},
    {\"name\": \"Cost of Goods Sold\", \"value\": 6000, \"kind\": \"detail\"},
    {\"name\": \"Gross Profit\", \"value\": 4000, \"kind\": \"subtotal\"}
  ],
  \"formulas\": [
    {\"total\": \"Gross Profit\", \"components\": [\"Total Revenue\", {\"item\": \"Cost of Goods Sold\", \"sign\": -1}]}
  ]
}
kind is one of detail, subtotal, total.";

/// What the next drafting attempt is told about the previous one
#[derive(Debug, Clone)]
pub enum Feedback {
    /// The draft parsed but failed its checks
    Mismatches {
        previous: StatementDraft,
        mismatches: Vec<Mismatch>,
    },
    /// The reply could not be used at all
    Malformed { reason: String, reply: String },
}

impl Feedback {
    pub fn render(&self) -> String {
        match self {
            Feedback::Mismatches {
                previous,
                mismatches,
            } => {
                let mut out = String::from(
                    "Your previous draft failed reconciliation. These totals do not equal the sum of their components:\n",
                );
                for m in mismatches {
                    out.push_str(&format!(
                        "- {}: expected {} from components, declared {} (delta {})\n",
                        m.line_item, m.expected, m.actual, m.delta
                    ));
                }
                out.push_str("\nPrevious draft:\n");
                out.push_str(
                    &serde_json::to_string_pretty(&DraftView::from(previous)).unwrap_or_default(),
                );
                out.push_str("\n\nRe-read the tables and correct the values or formulas.");
                out
            }
            Feedback::Malformed { reason, reply } => format!(
                "Your previous reply could not be used: {}\n\nPrevious reply:\n{}\n\nAnswer again with valid JSON in the required shape.",
                reason, reply
            ),
        }
    }
}

/// Prompt for one drafting attempt
pub fn build_request(
    statement_context: &[String],
    supporting_context: &[String],
    metadata: &DocumentMetadata,
    feedback: Option<&Feedback>,
) -> CompletionRequest {
    let mut user = String::new();

    if let Some(period) = &metadata.fiscal_year_end {
        user.push_str(&format!("Fiscal year ended: {}\n", period));
    }
    if let Some(scale) = &metadata.unit_scale {
        user.push_str(&format!("Unit scale: {}\n", scale));
    }
    user.push_str(&format!(
        "Expected line items: {}\n\n",
        EXPECTED_LINE_ITEMS.join(", ")
    ));

    user.push_str("Income statement tables:\n");
    if statement_context.is_empty() {
        user.push_str("(none found)\n");
    }
    for text in statement_context {
        user.push_str(text);
        user.push_str("\n\n");
    }

    if !supporting_context.is_empty() {
        user.push_str("Supporting context:\n");
        for text in supporting_context {
            user.push_str(text);
            user.push_str("\n\n");
        }
    }

    if let Some(feedback) = feedback {
        user.push_str(&feedback.render());
    }

    CompletionRequest::json(DRAFT_SYSTEM_PROMPT, user)
}

//
// ================= Wire Shape =================
//

#[derive(Debug, Deserialize)]
struct RawDraft {
    #[serde(default)]
    period: Option<String>,
    #[serde(default)]
    unit_scale: Option<String>,
    #[serde(default)]
    line_items: Vec<RawLineItem>,
    #[serde(default)]
    formulas: Vec<RawFormula>,
}

#[derive(Debug, Deserialize)]
struct RawLineItem {
    name: String,
    value: RawAmount,
    #[serde(default = "default_kind")]
    kind: LineItemKind,
}

/// Numbers sometimes come back as accounting strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Number(f64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawFormula {
    total: String,
    components: Vec<RawTerm>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTerm {
    Name(String),
    Signed {
        item: String,
        #[serde(default = "default_sign")]
        sign: f64,
    },
}

fn default_kind() -> LineItemKind {
    LineItemKind::Detail
}

fn default_sign() -> f64 {
    1.0
}

/// Serialized form of a draft echoed back in feedback
#[derive(serde::Serialize)]
struct DraftView<'a> {
    line_items: &'a [LineItem],
    formulas: &'a [Formula],
}

impl<'a> From<&'a StatementDraft> for DraftView<'a> {
    fn from(draft: &'a StatementDraft) -> Self {
        Self {
            line_items: &draft.line_items,
            formulas: &draft.formulas,
        }
    }
}

fn reject(reason: impl Into<String>) -> PipelineError {
    PipelineError::DraftParseFailure(reason.into())
}

/// Parse a model reply into a structurally valid draft
pub fn parse_draft(reply: &str, document_id: &str, version: u32) -> Result<StatementDraft> {
    let raw: RawDraft = serde_json::from_str(strip_code_fences(reply))
        .map_err(|e| reject(format!("reply is not a draft object: {}", e)))?;

    if raw.line_items.is_empty() {
        return Err(reject("draft has no line items"));
    }

    let mut line_items = Vec::with_capacity(raw.line_items.len());
    let mut names = HashSet::new();
    for item in raw.line_items {
        let name = item.name.trim().to_string();
        if name.is_empty() {
            return Err(reject("line item without a name"));
        }
        if !names.insert(name.to_lowercase()) {
            return Err(reject(format!("duplicate line item '{}'", name)));
        }
        let value = match item.value {
            RawAmount::Number(v) => v,
            RawAmount::Text(text) => parse_amount(&text)
                .ok_or_else(|| reject(format!("'{}' has non-numeric value '{}'", name, text)))?,
        };
        if !value.is_finite() {
            return Err(reject(format!("'{}' has a non-finite value", name)));
        }
        if !item.kind.is_aggregate()
            && AGGREGATE_LINE_ITEMS
                .iter()
                .any(|aggregate| aggregate.eq_ignore_ascii_case(&name))
        {
            return Err(reject(format!(
                "'{}' must be a subtotal or total with a formula",
                name
            )));
        }
        line_items.push(LineItem {
            name,
            value,
            kind: item.kind,
        });
    }

    let known = |name: &str| names.contains(&name.to_lowercase());

    let mut formulas = Vec::with_capacity(raw.formulas.len());
    let mut with_formula = HashSet::new();
    for formula in raw.formulas {
        let total = formula.total.trim().to_string();
        if !known(&total) {
            return Err(reject(format!("formula for unknown line item '{}'", total)));
        }
        if formula.components.is_empty() {
            return Err(reject(format!("formula for '{}' has no components", total)));
        }
        if !with_formula.insert(total.to_lowercase()) {
            return Err(reject(format!("'{}' has more than one formula", total)));
        }

        let mut components = Vec::with_capacity(formula.components.len());
        for term in formula.components {
            let (item, sign) = match term {
                RawTerm::Name(item) => (item, 1.0),
                RawTerm::Signed { item, sign } => (item, sign),
            };
            let item = item.trim().to_string();
            if sign != 1.0 && sign != -1.0 {
                return Err(reject(format!(
                    "formula for '{}' gives '{}' sign {}; use 1 or -1",
                    total, item, sign
                )));
            }
            if item.eq_ignore_ascii_case(&total) {
                return Err(reject(format!("formula for '{}' includes itself", total)));
            }
            if !known(&item) {
                return Err(reject(format!(
                    "formula for '{}' references unknown line item '{}'",
                    total, item
                )));
            }
            components.push(FormulaTerm { item, sign });
        }

        formulas.push(Formula { total, components });
    }

    if let Some(orphan) = line_items
        .iter()
        .find(|li| li.kind.is_aggregate() && !with_formula.contains(&li.name.to_lowercase()))
    {
        return Err(reject(format!("'{}' is a {:?} without a formula", orphan.name, orphan.kind)));
    }

    Ok(StatementDraft {
        document_id: document_id.to_string(),
        version,
        period: raw.period.filter(|p| !p.trim().is_empty()),
        unit_scale: raw.unit_scale.filter(|s| !s.trim().is_empty()),
        line_items,
        formulas,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"```json
    {
      "period": "December 31, 2024",
      "unit_scale": "millions",
      "line_items": [
        {"name": "Total Revenue", "value": 1000, "kind": "detail"},
        {"name": "Cost of Goods Sold", "value": "600"},
        {"name": "Gross Profit", "value": 400, "kind": "subtotal"},
        {"name": "Other Expense", "value": "(20)"}
      ],
      "formulas": [
        {"total": "Gross Profit", "components": ["Total Revenue", {"item": "Cost of Goods Sold", "sign": -1}]}
      ]
    }
    ```"#;

    fn expect_rejection(reply: &str, fragment: &str) {
        match parse_draft(reply, "a.pdf", 1) {
            Err(PipelineError::DraftParseFailure(reason)) => {
                assert!(reason.contains(fragment), "reason was: {}", reason)
            }
            other => panic!("expected parse failure, got {:?}", other),
        }
    }

    #[test]
    fn test_parses_fenced_reply() {
        let draft = parse_draft(GOOD, "a.pdf", 2).unwrap();
        assert_eq!(draft.version, 2);
        assert_eq!(draft.period.as_deref(), Some("December 31, 2024"));
        assert_eq!(draft.line_items.len(), 4);
        assert_eq!(draft.value_of("cost of goods sold"), Some(600.0));
        assert_eq!(draft.value_of("Other Expense"), Some(-20.0));
        assert_eq!(draft.line_items[1].kind, LineItemKind::Detail);
        assert_eq!(draft.formulas[0].components[0].sign, 1.0);
        assert_eq!(draft.formulas[0].components[1].sign, -1.0);
    }

    #[test]
    fn test_rejects_malformed_drafts() {
        expect_rejection("I could not find an income statement.", "not a draft object");
        expect_rejection(r#"{"line_items": []}"#, "no line items");
        expect_rejection(
            r#"{"line_items": [{"name": "Net Income", "value": 5, "kind": "total"}]}"#,
            "without a formula",
        );
        expect_rejection(
            r#"{"line_items": [{"name": "Net Income", "value": 5, "kind": "total"}],
                "formulas": [{"total": "Net Income", "components": ["Revenue"]}]}"#,
            "unknown line item 'Revenue'",
        );
        expect_rejection(
            r#"{"line_items": [{"name": "Net Income", "value": 5, "kind": "total"},
                               {"name": "Tax", "value": 1}],
                "formulas": [{"total": "Net Income", "components": ["Net Income", "Tax"]}]}"#,
            "includes itself",
        );
        expect_rejection(
            r#"{"line_items": [{"name": "Revenue", "value": "n/a"}]}"#,
            "non-numeric",
        );
        expect_rejection(
            r#"{"line_items": [{"name": "Revenue", "value": 1}, {"name": "revenue", "value": 2}]}"#,
            "duplicate",
        );
    }

    #[test]
    fn test_aggregates_cannot_be_details() {
        expect_rejection(
            r#"{"line_items": [{"name": "Total Revenue", "value": 1000},
                               {"name": "Cost of Goods Sold", "value": 600},
                               {"name": "Gross Profit", "value": 450, "kind": "detail"},
                               {"name": "Net Income", "value": 99999}]}"#,
            "'Gross Profit' must be a subtotal or total",
        );
        expect_rejection(
            r#"{"line_items": [{"name": "Revenue", "value": 1000},
                               {"name": "net income", "value": 12}]}"#,
            "'net income' must be a subtotal or total",
        );
        expect_rejection(
            r#"{"line_items": [{"name": "Revenue", "value": 1000},
                               {"name": "Operating Income", "value": 10, "kind": "subtotal"}]}"#,
            "without a formula",
        );
    }

    #[test]
    fn test_rejects_signs_other_than_one() {
        let with_sign = |sign: &str| {
            format!(
                r#"{{"line_items": [{{"name": "Total Revenue", "value": 1000}},
                                    {{"name": "Cost of Goods Sold", "value": 600}},
                                    {{"name": "Gross Profit", "value": 7, "kind": "subtotal"}}],
                    "formulas": [{{"total": "Gross Profit",
                                   "components": [{{"item": "Total Revenue", "sign": {}}},
                                                  {{"item": "Cost of Goods Sold", "sign": {}}}]}}]}}"#,
                sign, sign
            )
        };

        expect_rejection(&with_sign("0"), "sign 0");
        expect_rejection(&with_sign("0.5"), "sign 0.5");
        assert!(parse_draft(&with_sign("-1"), "a.pdf", 1).is_ok());
    }

    #[test]
    fn test_prompt_carries_context_and_feedback() {
        let previous = parse_draft(GOOD, "a.pdf", 1).unwrap();
        let feedback = Feedback::Mismatches {
            previous,
            mismatches: vec![Mismatch {
                line_item: "Gross Profit".into(),
                expected: 400.0,
                actual: 450.0,
                delta: 50.0,
            }],
        };
        let metadata = DocumentMetadata {
            fiscal_year_end: Some("December 31, 2024".into()),
            ..Default::default()
        };

        let request = build_request(
            &["| Revenue | 1000 |".to_string()],
            &["Amounts in millions".to_string()],
            &metadata,
            Some(&feedback),
        );

        assert!(request.json_mode);
        assert!(request.user.contains("Fiscal year ended: December 31, 2024"));
        assert!(request.user.contains("| Revenue | 1000 |"));
        assert!(request.user.contains("Amounts in millions"));
        assert!(request.user.contains("Gross Profit: expected 400 from components, declared 450"));
        assert!(request.user.contains("\"line_items\""));
    }

    #[test]
    fn test_malformed_feedback_echoes_reply() {
        let feedback = Feedback::Malformed {
            reason: "draft has no line items".into(),
            reply: "{}".into(),
        };
        let rendered = feedback.render();
        assert!(rendered.contains("draft has no line items"));
        assert!(rendered.contains("Previous reply:\n{}"));
    }
}
