//! Spreadsheet export of reconciled income statements
//!
//! One workbook per processing request. Drafts that exhausted their
//! attempt budget are exported too, with their mismatches listed.

use crate::error::PipelineError;
use crate::models::{DocumentReport, ExportArtifact, LineItemKind, ReconciliationStatus};
use crate::storage::{BlobStore, XLSX_CONTENT_TYPE};
use crate::Result;
use chrono::Utc;
use rust_xlsxwriter::{Color, Format, FormatAlign, FormatBorder, Workbook, Worksheet, XlsxError};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const STATEMENT_SHEET: &str = "Income Statement";
const RECONCILIATION_SHEET: &str = "Reconciliation";
const DOCUMENTS_SHEET: &str = "Documents";

const ACCOUNTING_FORMAT: &str = "#,##0.00;(#,##0.00)";
const HEADER_FILL: u32 = 0x1F4E78;

fn xlsx_error(e: XlsxError) -> PipelineError {
    PipelineError::Export(format!("workbook: {}", e))
}

//
// ================= Layout =================
//

#[derive(Debug, Clone, PartialEq)]
pub struct GridRow {
    pub label: String,
    pub kind: LineItemKind,
    /// One value per document column
    pub values: Vec<Option<f64>>,
}

/// Income statement laid out as line items × documents
#[derive(Debug, Clone, PartialEq)]
pub struct StatementGrid {
    pub columns: Vec<String>,
    pub rows: Vec<GridRow>,
    pub status: Vec<String>,
}

fn column_header(report: &DocumentReport) -> String {
    report
        .outcome
        .draft
        .period
        .clone()
        .or_else(|| report.metadata.fiscal_year_end.clone())
        .unwrap_or_else(|| report.document.id.clone())
}

fn status_label(report: &DocumentReport) -> String {
    match report.outcome.status {
        ReconciliationStatus::Reconciled => "Reconciled".to_string(),
        ReconciliationStatus::Exhausted => format!(
            "Unreconciled: {} mismatch(es)",
            report.outcome.check.mismatches.len()
        ),
    }
}

fn heavier(a: LineItemKind, b: LineItemKind) -> LineItemKind {
    match (a, b) {
        (LineItemKind::Total, _) | (_, LineItemKind::Total) => LineItemKind::Total,
        (LineItemKind::Subtotal, _) | (_, LineItemKind::Subtotal) => LineItemKind::Subtotal,
        _ => LineItemKind::Detail,
    }
}

/// Merge every document's draft into one grid; rows keep first-seen order
/// and line items match case-insensitively.
pub fn build_grid(reports: &[DocumentReport]) -> StatementGrid {
    let columns: Vec<String> = reports.iter().map(column_header).collect();
    let mut rows: Vec<GridRow> = Vec::new();

    for (col, report) in reports.iter().enumerate() {
        for item in &report.outcome.draft.line_items {
            let position = rows
                .iter()
                .position(|r| r.label.eq_ignore_ascii_case(&item.name));
            let row = match position {
                Some(i) => &mut rows[i],
                None => {
                    rows.push(GridRow {
                        label: item.name.clone(),
                        kind: item.kind,
                        values: vec![None; reports.len()],
                    });
                    let last = rows.len() - 1;
                    &mut rows[last]
                }
            };
            row.kind = heavier(row.kind, item.kind);
            row.values[col] = Some(item.value);
        }
    }

    StatementGrid {
        columns,
        rows,
        status: reports.iter().map(status_label).collect(),
    }
}

//
// ================= Rendering =================
//

struct Formats {
    header: Format,
    label: Format,
    aggregate_label: Format,
    amount: Format,
    aggregate_amount: Format,
    status: Format,
}

impl Formats {
    fn new() -> Self {
        let amount = Format::new()
            .set_num_format(ACCOUNTING_FORMAT)
            .set_align(FormatAlign::Right);
        Self {
            header: Format::new()
                .set_bold()
                .set_background_color(Color::RGB(HEADER_FILL))
                .set_font_color(Color::RGB(0xFFFFFF)),
            label: Format::new(),
            aggregate_label: Format::new().set_bold().set_border_top(FormatBorder::Thin),
            aggregate_amount: amount
                .clone()
                .set_bold()
                .set_border_top(FormatBorder::Thin),
            amount,
            status: Format::new().set_italic(),
        }
    }
}

fn write_amount(
    sheet: &mut Worksheet,
    row: u32,
    col: u16,
    value: f64,
    format: &Format,
) -> std::result::Result<(), XlsxError> {
    if value.is_finite() {
        sheet.write_number_with_format(row, col, value, format)?;
    } else {
        sheet.write_string_with_format(row, col, "n/a", format)?;
    }
    Ok(())
}

fn write_headers(
    sheet: &mut Worksheet,
    headers: &[&str],
    format: &Format,
) -> std::result::Result<(), XlsxError> {
    for (col, header) in headers.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *header, format)?;
    }
    sheet.set_freeze_panes(1, 0)?;
    Ok(())
}

fn write_statement_sheet(
    sheet: &mut Worksheet,
    grid: &StatementGrid,
    formats: &Formats,
) -> std::result::Result<(), XlsxError> {
    sheet.set_name(STATEMENT_SHEET)?;

    let mut headers = vec!["Line Item"];
    headers.extend(grid.columns.iter().map(String::as_str));
    write_headers(sheet, &headers, &formats.header)?;
    sheet.set_column_width(0, 40.0)?;

    let mut row: u32 = 1;
    for line in &grid.rows {
        let (label_format, amount_format) = if line.kind.is_aggregate() {
            (&formats.aggregate_label, &formats.aggregate_amount)
        } else {
            (&formats.label, &formats.amount)
        };
        sheet.write_string_with_format(row, 0, &line.label, label_format)?;
        for (i, value) in line.values.iter().enumerate() {
            let col = i as u16 + 1;
            match value {
                Some(v) => write_amount(sheet, row, col, *v, amount_format)?,
                None => {
                    sheet.write_blank(row, col, amount_format)?;
                }
            }
        }
        row += 1;
    }

    row += 1;
    sheet.write_string_with_format(row, 0, "Status", &formats.status)?;
    for (i, status) in grid.status.iter().enumerate() {
        sheet.write_string_with_format(row, i as u16 + 1, status, &formats.status)?;
    }

    for col in 1..=grid.columns.len() as u16 {
        sheet.set_column_width(col, 22.0)?;
    }
    Ok(())
}

fn write_reconciliation_sheet(
    sheet: &mut Worksheet,
    reports: &[DocumentReport],
    formats: &Formats,
) -> std::result::Result<(), XlsxError> {
    sheet.set_name(RECONCILIATION_SHEET)?;
    write_headers(
        sheet,
        &["Document", "Line Item", "Expected", "Actual", "Delta"],
        &formats.header,
    )?;
    sheet.set_column_width(0, 36.0)?;
    sheet.set_column_width(1, 36.0)?;

    let mut row: u32 = 1;
    for report in reports {
        for mismatch in &report.outcome.check.mismatches {
            sheet.write_string(row, 0, &report.document.id)?;
            sheet.write_string(row, 1, &mismatch.line_item)?;
            write_amount(sheet, row, 2, mismatch.expected, &formats.amount)?;
            write_amount(sheet, row, 3, mismatch.actual, &formats.amount)?;
            write_amount(sheet, row, 4, mismatch.delta, &formats.amount)?;
            row += 1;
        }
    }

    if row == 1 {
        sheet.write_string(1, 0, "All checks passed")?;
    }
    Ok(())
}

fn write_documents_sheet(
    sheet: &mut Worksheet,
    reports: &[DocumentReport],
    formats: &Formats,
) -> std::result::Result<(), XlsxError> {
    sheet.set_name(DOCUMENTS_SHEET)?;
    write_headers(
        sheet,
        &["Document", "Company", "Fiscal Year End", "Unit Scale", "Status", "Attempts"],
        &formats.header,
    )?;
    sheet.set_column_width(0, 36.0)?;
    sheet.set_column_width(1, 36.0)?;

    for (i, report) in reports.iter().enumerate() {
        let row = i as u32 + 1;
        let unit_scale = report
            .outcome
            .draft
            .unit_scale
            .clone()
            .or_else(|| report.metadata.unit_scale.map(|s| s.to_string()))
            .unwrap_or_default();

        sheet.write_string(row, 0, &report.document.id)?;
        sheet.write_string(row, 1, report.metadata.company_name.as_deref().unwrap_or(""))?;
        sheet.write_string(row, 2, report.metadata.fiscal_year_end.as_deref().unwrap_or(""))?;
        sheet.write_string(row, 3, &unit_scale)?;
        sheet.write_string(row, 4, &status_label(report))?;
        sheet.write_number(row, 5, f64::from(report.outcome.attempts))?;
    }
    Ok(())
}

/// Render the workbook into memory
pub fn render_workbook(reports: &[DocumentReport]) -> Result<Vec<u8>> {
    let grid = build_grid(reports);
    let formats = Formats::new();
    let mut workbook = Workbook::new();

    write_statement_sheet(workbook.add_worksheet(), &grid, &formats).map_err(xlsx_error)?;
    write_reconciliation_sheet(workbook.add_worksheet(), reports, &formats).map_err(xlsx_error)?;
    write_documents_sheet(workbook.add_worksheet(), reports, &formats).map_err(xlsx_error)?;

    workbook.save_to_buffer().map_err(xlsx_error)
}

/// `exports/income_statement_{timestamp}_{id}.xlsx`
pub fn export_blob_name(request_id: Uuid) -> String {
    let id = request_id.simple().to_string();
    format!(
        "exports/income_statement_{}_{}.xlsx",
        Utc::now().format("%Y%m%d_%H%M%S"),
        &id[..8]
    )
}

/// Uploads rendered workbooks and hands back a signed link
pub struct Exporter {
    store: Arc<dyn BlobStore>,
    link_ttl: Duration,
}

impl Exporter {
    pub fn new(store: Arc<dyn BlobStore>, link_ttl: Duration) -> Self {
        Self { store, link_ttl }
    }

    pub async fn export(&self, request_id: Uuid, reports: &[DocumentReport]) -> Result<ExportArtifact> {
        if reports.is_empty() {
            return Err(PipelineError::Export("no statements to export".to_string()));
        }

        let bytes = render_workbook(reports)?;
        let blob_name = export_blob_name(request_id);
        let size = bytes.len();

        self.store
            .upload(&blob_name, bytes, XLSX_CONTENT_TYPE)
            .await
            .map_err(|e| PipelineError::Export(format!("upload of '{}' failed: {}", blob_name, e)))?;

        let link = self
            .store
            .signed_url(&blob_name, self.link_ttl)
            .await
            .map_err(|e| PipelineError::Export(format!("signing '{}' failed: {}", blob_name, e)))?;

        info!(
            blob = %blob_name,
            bytes = size,
            documents = reports.len(),
            "Workbook exported"
        );

        Ok(ExportArtifact {
            blob_name,
            url: link.url,
            expires_at: link.expires_at,
        })
    }
}
