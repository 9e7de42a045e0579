//! Conversion of a raw layout analysis into tables and paragraphs

use crate::amount::parse_amount;
use crate::error::{ExtractionFailure, PipelineError};
use crate::models::{
    BoundingBox, ExtractedDocument, ExtractedParagraph, ExtractedTable, PageRegion, TableCell,
};
use crate::Result;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Context paragraphs considered before a table
const MAX_CONTEXT_PARAGRAPHS: usize = 3;

const HEADING_ROLES: &[&str] = &["sectionHeading", "title"];

//
// ================= Wire Shapes =================
//

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResult {
    #[serde(default)]
    pub paragraphs: Vec<LayoutParagraph>,
    #[serde(default)]
    pub tables: Vec<LayoutTable>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutParagraph {
    #[serde(default)]
    pub content: String,
    pub role: Option<String>,
    #[serde(default)]
    pub bounding_regions: Vec<BoundingRegion>,
    #[serde(default)]
    pub spans: Vec<Span>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutTable {
    #[serde(default)]
    pub row_count: usize,
    #[serde(default)]
    pub column_count: usize,
    #[serde(default)]
    pub cells: Vec<LayoutCell>,
    #[serde(default)]
    pub bounding_regions: Vec<BoundingRegion>,
    #[serde(default)]
    pub spans: Vec<Span>,
    #[serde(default)]
    pub footnotes: Vec<LayoutCaption>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutCell {
    pub kind: Option<String>,
    pub row_index: usize,
    pub column_index: usize,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub bounding_regions: Vec<BoundingRegion>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutCaption {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub bounding_regions: Vec<BoundingRegion>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingRegion {
    pub page_number: u32,
    #[serde(default)]
    pub polygon: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Span {
    pub offset: usize,
    #[serde(default)]
    pub length: usize,
}

impl Span {
    fn end(&self) -> usize {
        self.offset + self.length
    }

    fn overlaps(&self, other: &Span) -> bool {
        self.offset <= other.end() && other.offset <= self.end()
    }
}

//
// ================= Conversion =================
//

/// Convert a raw `analyzeResult` payload into document-ordered records
pub fn convert(document_id: &str, raw: &serde_json::Value) -> Result<ExtractedDocument> {
    let result = AnalyzeResult::deserialize(raw).map_err(|e| PipelineError::Extraction {
        kind: ExtractionFailure::MalformedResponse,
        detail: format!("unexpected layout shape: {}", e),
    })?;
    Ok(convert_result(document_id, &result))
}

pub fn convert_result(document_id: &str, result: &AnalyzeResult) -> ExtractedDocument {
    let mut tables: Vec<ExtractedTable> = result
        .tables
        .iter()
        .filter_map(|t| convert_table(document_id, t, &result.paragraphs))
        .collect();

    let table_spans: Vec<Span> = result
        .tables
        .iter()
        .filter_map(|t| t.spans.first().copied())
        .collect();

    let mut paragraphs: Vec<ExtractedParagraph> = result
        .paragraphs
        .iter()
        .filter(|p| !p.content.trim().is_empty())
        .filter(|p| match p.spans.first() {
            Some(span) => !table_spans.iter().any(|t| t.overlaps(span)),
            None => true,
        })
        .map(|p| ExtractedParagraph {
            document_id: document_id.to_string(),
            ordinal: 0,
            offset: p.spans.first().map(|s| s.offset),
            text: p.content.trim().to_string(),
            role: p.role.clone(),
            regions: page_regions(p.bounding_regions.iter()),
        })
        .collect();

    // Stable sort keeps source order among items without an offset
    tables.sort_by_key(|t| t.offset.unwrap_or(usize::MAX));
    paragraphs.sort_by_key(|p| p.offset.unwrap_or(usize::MAX));

    for (i, table) in tables.iter_mut().enumerate() {
        table.ordinal = i;
    }
    for (i, paragraph) in paragraphs.iter_mut().enumerate() {
        paragraph.ordinal = tables.len() + i;
    }

    ExtractedDocument { tables, paragraphs }
}

fn convert_table(
    document_id: &str,
    table: &LayoutTable,
    paragraphs: &[LayoutParagraph],
) -> Option<ExtractedTable> {
    if table.row_count == 0 || table.column_count == 0 {
        return None;
    }

    let mut headers = vec![String::new(); table.column_count];
    let mut grid = vec![vec![String::new(); table.column_count]; table.row_count];

    for cell in &table.cells {
        if cell.row_index >= table.row_count || cell.column_index >= table.column_count {
            continue;
        }
        let content = cell.content.trim();
        if cell.kind.as_deref() == Some("columnHeader") {
            let header = &mut headers[cell.column_index];
            if !content.is_empty() && header.as_str() != content {
                if !header.is_empty() {
                    header.push(' ');
                }
                header.push_str(content);
            }
        } else if !content.is_empty() {
            grid[cell.row_index][cell.column_index] = content.to_string();
        }
    }

    let rows: Vec<Vec<TableCell>> = grid
        .into_iter()
        .filter(|row| row.iter().any(|c| !c.is_empty()))
        .map(|row| {
            row.into_iter()
                .map(|text| TableCell {
                    value: parse_amount(&text),
                    text,
                })
                .collect()
        })
        .collect();

    if rows.is_empty() {
        return None;
    }

    let offset = table.spans.first().map(|s| s.offset);
    let context = context_paragraphs(paragraphs, offset);
    let footnote = table
        .footnotes
        .first()
        .map(|f| f.content.trim().to_string())
        .filter(|f| !f.is_empty());

    let regions = page_regions(
        context
            .iter()
            .flat_map(|p| p.bounding_regions.iter())
            .chain(table.bounding_regions.iter())
            .chain(table.cells.iter().flat_map(|c| c.bounding_regions.iter()))
            .chain(table.footnotes.iter().take(1).flat_map(|f| f.bounding_regions.iter())),
    );

    Some(ExtractedTable {
        document_id: document_id.to_string(),
        ordinal: 0,
        offset,
        headers: if headers.iter().any(|h| !h.is_empty()) {
            headers
        } else {
            Vec::new()
        },
        rows,
        context: context.iter().map(|p| p.content.trim().to_string()).collect(),
        footnote,
        regions,
        category: None,
    })
}

/// Up to three paragraphs ending before the table, trimmed to start at the
/// first heading among them. Without a heading only the last one is kept.
fn context_paragraphs(
    paragraphs: &[LayoutParagraph],
    table_start: Option<usize>,
) -> Vec<&LayoutParagraph> {
    let Some(table_start) = table_start else {
        return Vec::new();
    };

    let preceding: Vec<&LayoutParagraph> = paragraphs
        .iter()
        .filter(|p| p.spans.first().map_or(false, |s| s.end() <= table_start))
        .collect();
    let window = &preceding[preceding.len().saturating_sub(MAX_CONTEXT_PARAGRAPHS)..];

    let heading = window.iter().position(|p| {
        p.role
            .as_deref()
            .map_or(false, |role| HEADING_ROLES.contains(&role))
    });

    match heading {
        Some(idx) => window[idx..].to_vec(),
        None => window.last().copied().into_iter().collect(),
    }
}

/// Per-page bounding box over every polygon point
fn page_regions<'a>(regions: impl Iterator<Item = &'a BoundingRegion>) -> Vec<PageRegion> {
    let mut boxes: BTreeMap<u32, Option<BoundingBox>> = BTreeMap::new();

    for region in regions {
        let entry = boxes.entry(region.page_number).or_insert(None);
        for point in region.polygon.chunks_exact(2) {
            let (x, y) = (point[0], point[1]);
            *entry = Some(match *entry {
                Some(b) => BoundingBox {
                    min_x: b.min_x.min(x),
                    min_y: b.min_y.min(y),
                    max_x: b.max_x.max(x),
                    max_y: b.max_y.max(y),
                },
                None => BoundingBox {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                },
            });
        }
    }

    boxes
        .into_iter()
        .map(|(page_number, bounding_box)| PageRegion {
            page_number,
            bounding_box,
        })
        .collect()
}
