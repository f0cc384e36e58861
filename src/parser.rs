//! The document parser contract (§6) plus a reference implementation.
//!
//! `DocumentParser` is expressed as an async trait the same way this
//! codebase already expresses pluggable OCR backends (see the sibling
//! `OcrProvider` trait this module was grounded on): a small surface any
//! backend can implement, resolved by the caller rather than hardwired.
//!
//! `LopdfTextParser` is a real, usable implementation for text-layer PDFs —
//! it is not a full layout/OCR engine (no image-based PDFs, no reliable
//! glyph-level coordinates), which is exactly the limitation SPEC_FULL.md
//! calls out for this contract's shipped implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExtractorError;

/// An element's bounding box in the parser's native coordinate space.
/// The core never re-normalises this — a positional pattern learned in one
/// parser's space is only ever compared within that same space (§9).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl BBox {
    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> f64 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    /// Expand this box by `fraction` on each side (used by the field
    /// extractor's 10%-tolerance positional match, §4.6).
    pub fn expanded(&self, fraction: f64) -> BBox {
        let dw = self.width() * fraction;
        let dh = self.height() * fraction;
        BBox {
            x0: self.x0 - dw,
            y0: self.y0 - dh,
            x1: self.x1 + dw,
            y1: self.y1 + dh,
        }
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Paragraph,
    Line,
    TableCell,
}

/// A single positioned piece of text extracted from the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    pub text: String,
    pub page: u32,
    pub bbox: BBox,
    pub kind: ElementKind,
    /// Index of this element within its line group, used to decide
    /// left/right adjacency for contextual pattern matching.
    pub line_index: usize,
}

/// The parsed form of a document: a flat sequence of elements plus the full
/// text (used by the regex pattern fallback and the template matcher).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub elements: Vec<Element>,
    pub full_text: String,
    pub page_count: u32,
}

impl ParsedDocument {
    /// Group elements into lines by near-equal `y` (within `tolerance`,
    /// in the parser's own coordinate units), per §3.
    pub fn lines(&self, tolerance: f64) -> Vec<Vec<&Element>> {
        let mut sorted: Vec<&Element> = self.elements.iter().collect();
        sorted.sort_by(|a, b| {
            a.page
                .cmp(&b.page)
                .then(a.bbox.y0.partial_cmp(&b.bbox.y0).unwrap_or(std::cmp::Ordering::Equal))
        });

        let mut lines: Vec<Vec<&Element>> = Vec::new();
        for el in sorted {
            if let Some(last) = lines.last_mut() {
                let same_line = last.last().map_or(false, |prev: &&Element| {
                    prev.page == el.page && (prev.bbox.y0 - el.bbox.y0).abs() <= tolerance
                });
                if same_line {
                    last.push(el);
                    continue;
                }
            }
            lines.push(vec![el]);
        }

        for line in &mut lines {
            line.sort_by(|a, b| a.bbox.x0.partial_cmp(&b.bbox.x0).unwrap_or(std::cmp::Ordering::Equal));
        }

        lines
    }
}

/// Resource constraints communicated to a parser call (§5: parser timeout).
#[derive(Debug, Clone, Copy)]
pub struct ParseConstraints {
    pub timeout: Duration,
}

/// The parser contract: `parse(pdf_bytes) -> ParsedDocument | ParseError`.
#[async_trait]
pub trait DocumentParser: Send + Sync {
    fn name(&self) -> &str;
    async fn parse(
        &self,
        pdf_bytes: &[u8],
        constraints: ParseConstraints,
    ) -> Result<ParsedDocument, ExtractorError>;
}

/// Reference implementation backed by `lopdf`'s plain-text extraction.
///
/// `lopdf` does not expose glyph-level coordinates from its text extractor,
/// so each physical line of extracted text becomes one synthetic-coordinate
/// `Element`: `y` is the line's position within the page (0 at the top, 1 at
/// the bottom), `x0`/`x1` span the full page width, and tokens within a line
/// are distributed evenly along `x` so relative left/right ordering (used by
/// contextual patterns) still holds even though absolute glyph positions do
/// not exist. This is why the contract is explicit that the core must not
/// assume scale-invariance between parsers: a positional pattern learned
/// against this parser's space only makes sense against this parser.
pub struct LopdfTextParser;

impl LopdfTextParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LopdfTextParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentParser for LopdfTextParser {
    fn name(&self) -> &str {
        "lopdf_text"
    }

    async fn parse(
        &self,
        pdf_bytes: &[u8],
        constraints: ParseConstraints,
    ) -> Result<ParsedDocument, ExtractorError> {
        let bytes = pdf_bytes.to_vec();
        let result = tokio::time::timeout(
            constraints.timeout,
            tokio::task::spawn_blocking(move || parse_sync(&bytes)),
        )
        .await;

        match result {
            Ok(Ok(Ok(doc))) => Ok(doc),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join_err)) => Err(ExtractorError::Internal(format!(
                "parser task panicked: {}",
                join_err
            ))),
            Err(_) => Err(ExtractorError::Parse("parser timed out".to_string())),
        }
    }
}

fn parse_sync(pdf_bytes: &[u8]) -> Result<ParsedDocument, ExtractorError> {
    let doc = lopdf::Document::load_mem(pdf_bytes)
        .map_err(|e| ExtractorError::Parse(format!("failed to load PDF: {}", e)))?;

    let pages = doc.get_pages();
    if pages.is_empty() {
        return Err(ExtractorError::Parse("PDF has no pages".to_string()));
    }

    let mut elements = Vec::new();
    let mut full_text = String::new();
    let page_count = pages.len() as u32;

    for (page_num, _) in pages {
        let page_text = doc
            .extract_text(&[page_num])
            .unwrap_or_default();

        let lines: Vec<&str> = page_text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        if lines.is_empty() {
            continue;
        }

        let line_count = lines.len();
        for (line_idx, line) in lines.iter().enumerate() {
            let y0 = line_idx as f64 / line_count as f64;
            let y1 = (line_idx + 1) as f64 / line_count as f64;

            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }

            full_text.push_str(line);
            full_text.push('\n');

            elements.push(Element {
                text: line.to_string(),
                page: page_num,
                bbox: BBox {
                    x0: 0.0,
                    y0,
                    x1: 1.0,
                    y1,
                },
                kind: ElementKind::Line,
                line_index: line_idx,
            });

            // Also emit per-token elements so contextual/positional patterns
            // can anchor to a specific word rather than the whole line.
            let token_count = tokens.len();
            for (tok_idx, token) in tokens.iter().enumerate() {
                let x0 = tok_idx as f64 / token_count as f64;
                let x1 = (tok_idx + 1) as f64 / token_count as f64;
                elements.push(Element {
                    text: token.to_string(),
                    page: page_num,
                    bbox: BBox { x0, y0, x1, y1 },
                    kind: ElementKind::Paragraph,
                    line_index: line_idx,
                });
            }
        }
    }

    if elements.is_empty() {
        return Err(ExtractorError::Parse(
            "no extractable text found in PDF".to_string(),
        ));
    }

    Ok(ParsedDocument {
        elements,
        full_text,
        page_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_expanded_grows_symmetrically() {
        let b = BBox { x0: 0.4, y0: 0.4, x1: 0.6, y1: 0.6 };
        let e = b.expanded(0.1);
        assert!(e.x0 < b.x0 && e.x1 > b.x1);
        assert!(e.y0 < b.y0 && e.y1 > b.y1);
    }

    #[test]
    fn bbox_contains_point() {
        let b = BBox { x0: 0.0, y0: 0.0, x1: 1.0, y1: 1.0 };
        assert!(b.contains_point(0.5, 0.5));
        assert!(!b.contains_point(1.5, 0.5));
    }
}
