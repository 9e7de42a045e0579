//! Core data models for statement extraction and reconciliation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Pending,
    Done,
    Failed,
}

/// Financial statement category assigned to a table.
/// Only `IncomeStatement` is consumed downstream; the others are labels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StatementCategory {
    IncomeStatement,
    BalanceSheet,
    CashFlow,
    Equity,
    Other,
}

impl StatementCategory {
    pub const ALL: [StatementCategory; 5] = [
        StatementCategory::IncomeStatement,
        StatementCategory::BalanceSheet,
        StatementCategory::CashFlow,
        StatementCategory::Equity,
        StatementCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementCategory::IncomeStatement => "income_statement",
            StatementCategory::BalanceSheet => "balance_sheet",
            StatementCategory::CashFlow => "cash_flow",
            StatementCategory::Equity => "equity",
            StatementCategory::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for StatementCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UnitScale {
    Thousands,
    Millions,
    Billions,
}

impl UnitScale {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().trim_matches(|c| c == '\'' || c == '"' || c == '.').to_lowercase().as_str() {
            "thousands" => Some(UnitScale::Thousands),
            "millions" => Some(UnitScale::Millions),
            "billions" => Some(UnitScale::Billions),
            _ => None,
        }
    }
}

impl fmt::Display for UnitScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitScale::Thousands => "thousands",
            UnitScale::Millions => "millions",
            UnitScale::Billions => "billions",
        };
        write!(f, "{}", s)
    }
}

//
// ================= Document =================
//

/// An uploaded report, identified by its blob name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub status: ExtractionStatus,
    pub content_hash: String,
    pub size_bytes: usize,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub company_name: Option<String>,
    pub fiscal_year_end: Option<String>,
    pub unit_scale: Option<UnitScale>,
}

//
// ================= Extraction =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageRegion {
    pub page_number: u32,
    pub bounding_box: Option<BoundingBox>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableCell {
    pub text: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedTable {
    pub document_id: String,
    pub ordinal: usize,
    pub offset: Option<usize>,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<TableCell>>,
    pub context: Vec<String>,
    pub footnote: Option<String>,
    pub regions: Vec<PageRegion>,
    pub category: Option<StatementCategory>,
}

impl ExtractedTable {
    /// Row labels: first non-empty cell text of each row
    pub fn row_labels(&self) -> impl Iterator<Item = &str> {
        self.rows
            .iter()
            .filter_map(|row| row.iter().find(|c| !c.text.is_empty()).map(|c| c.text.as_str()))
    }

    /// Markdown rendering used for prompts and index text
    pub fn to_markdown(&self) -> String {
        let width = self
            .rows
            .iter()
            .map(|r| r.len())
            .max()
            .unwrap_or(0)
            .max(self.headers.len());

        if width == 0 {
            return String::new();
        }

        let mut out = String::new();
        let header_cells: Vec<&str> = (0..width)
            .map(|i| self.headers.get(i).map(String::as_str).unwrap_or(""))
            .collect();
        out.push_str(&format!("| {} |\n", header_cells.join(" | ")));
        out.push_str(&format!("|{}\n", "---|".repeat(width)));

        for row in &self.rows {
            let cells: Vec<&str> = (0..width)
                .map(|i| row.get(i).map(|c| c.text.as_str()).unwrap_or(""))
                .collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }

        out
    }

    /// Context, table and footnote combined into one searchable block
    pub fn combined_text(&self) -> String {
        let mut out = format!(
            "Context:\n{}\n\nTable:\n{}",
            self.context.join("\n"),
            self.to_markdown()
        );
        if let Some(footnote) = &self.footnote {
            out.push_str(&format!("\nFootnotes:\n{}", footnote));
        }
        out
    }

    pub fn first_page(&self) -> Option<u32> {
        self.regions.iter().map(|r| r.page_number).min()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedParagraph {
    pub document_id: String,
    pub ordinal: usize,
    pub offset: Option<usize>,
    pub text: String,
    pub role: Option<String>,
    pub regions: Vec<PageRegion>,
}

/// Extraction output for one document, in document order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub tables: Vec<ExtractedTable>,
    pub paragraphs: Vec<ExtractedParagraph>,
}

impl ExtractedDocument {
    pub fn tables_in(&self, category: StatementCategory) -> impl Iterator<Item = &ExtractedTable> {
        self.tables
            .iter()
            .filter(move |t| t.category == Some(category))
    }
}

//
// ================= Index =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndexContent {
    Table { markdown: String },
    Paragraph { text: String },
}

/// A unit of searchable content. Immutable once indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    pub document_id: String,
    pub ordinal: usize,
    pub category: StatementCategory,
    pub content: IndexContent,
    pub page_number: Option<u32>,
    pub company_name: Option<String>,
    pub fiscal_year: Option<String>,
    pub indexed_at: DateTime<Utc>,
}

impl IndexEntry {
    pub fn text(&self) -> &str {
        match &self.content {
            IndexContent::Table { markdown } => markdown,
            IndexContent::Paragraph { text } => text,
        }
    }

    pub fn is_table(&self) -> bool {
        matches!(self.content, IndexContent::Table { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: IndexEntry,
    pub score: f64,
}

//
// ================= Statement =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineItemKind {
    Detail,
    Subtotal,
    Total,
}

impl LineItemKind {
    pub fn is_aggregate(&self) -> bool {
        !matches!(self, LineItemKind::Detail)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub name: String,
    pub value: f64,
    pub kind: LineItemKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormulaTerm {
    pub item: String,
    pub sign: f64,
}

/// `total = Σ sign·component`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Formula {
    pub total: String,
    pub components: Vec<FormulaTerm>,
}

/// A candidate income statement produced by one drafting attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementDraft {
    pub document_id: String,
    pub version: u32,
    pub period: Option<String>,
    pub unit_scale: Option<String>,
    pub line_items: Vec<LineItem>,
    pub formulas: Vec<Formula>,
}

impl StatementDraft {
    pub fn value_of(&self, name: &str) -> Option<f64> {
        self.line_items
            .iter()
            .find(|li| li.name.eq_ignore_ascii_case(name))
            .map(|li| li.value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mismatch {
    pub line_item: String,
    pub expected: f64,
    pub actual: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationCheck {
    pub passed: bool,
    pub tolerance: f64,
    pub mismatches: Vec<Mismatch>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReconciliationStatus {
    Reconciled,
    Exhausted,
}

/// The single final draft of a reconciliation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub status: ReconciliationStatus,
    pub draft: StatementDraft,
    pub check: ReconciliationCheck,
    pub attempts: u32,
    pub trace: Vec<String>,
}

//
// ================= Final Result =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentReport {
    pub document: Document,
    pub metadata: DocumentMetadata,
    pub tables: usize,
    pub income_statement_tables: usize,
    pub outcome: ReconciliationOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub blob_name: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingReport {
    pub request_id: uuid::Uuid,
    pub documents: Vec<DocumentReport>,
    pub export: ExportArtifact,
    pub execution_time_ms: u64,
}
