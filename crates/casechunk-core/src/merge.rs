//! Reassembly of per-chunk OCR results into one document-level result.
//!
//! Chunks are walked in index order regardless of the order they finished
//! in. For a completed chunk every box is moved from chunk-local to
//! document-global numbering:
//!
//! ```text
//! global_page = chunk.first_page + local_page - 1
//! ```
//!
//! and receives an identifier derived from `(document, global page,
//! position within page)`. Re-running a merge over the same results yields
//! byte-identical boxes, so stored results are disposable once a merge has
//! been persisted. Pages of failed chunks produce no boxes and are reported
//! as [`PageStatus::Missing`].

use std::collections::HashSet;

use serde::Serialize;
use uuid::Uuid;

use crate::error::MergeIntegrityError;
use crate::models::{
    BoundingBox, Chunk, ChunkResult, ChunkStatus, OcrBox, PageStatus, PageSummary,
};
use crate::split::check_coverage;

/// Namespace for bounding-box UUIDv5 identifiers.
const BBOX_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a7e_93d4_4b0a_8c55_d1e0_7b3a_9f42);

/// A chunk together with its decoded result (present only when completed).
#[derive(Debug, Clone)]
pub struct MergeInput {
    pub chunk: Chunk,
    pub result: Option<ChunkResult>,
}

/// Bbox ids a completed chunk produced, written back onto its row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkLinks {
    pub chunk_id: String,
    pub bbox_ids: Vec<String>,
    pub has_text: bool,
}

/// The merged, document-global OCR record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedDocument {
    pub document_id: String,
    pub total_pages: u32,
    pub full_text: String,
    pub bboxes: Vec<BoundingBox>,
    pub pages: Vec<PageSummary>,
    pub chunk_links: Vec<ChunkLinks>,
}

impl MergedDocument {
    pub fn missing_pages(&self) -> Vec<u32> {
        self.pages
            .iter()
            .filter(|p| p.status == PageStatus::Missing)
            .map(|p| p.page)
            .collect()
    }
}

/// Stable identifier for the `position`-th box on `page` of `document_id`.
pub fn bbox_id(document_id: &str, page: u32, position: usize) -> String {
    let name = format!("{}:{}:{}", document_id, page, position);
    Uuid::new_v5(&BBOX_NAMESPACE, name.as_bytes()).to_string()
}

/// Merge terminal chunk results for one document.
///
/// Fails only on structural problems: a non-terminal chunk, a completed
/// chunk without a result, a result that does not fit its chunk, or chunk
/// ranges that do not tile the document.
pub fn merge_chunks(
    document_id: &str,
    total_pages: u32,
    mut inputs: Vec<MergeInput>,
) -> Result<MergedDocument, MergeIntegrityError> {
    inputs.sort_by_key(|i| i.chunk.chunk_index);

    let ranges: Vec<(u32, u32)> = inputs
        .iter()
        .map(|i| (i.chunk.first_page, i.chunk.last_page))
        .collect();
    check_coverage(&ranges, total_pages).map_err(MergeIntegrityError::Coverage)?;

    let mut full_text = String::new();
    let mut bboxes = Vec::new();
    let mut pages = Vec::with_capacity(total_pages as usize);
    let mut chunk_links = Vec::new();

    for input in &inputs {
        let chunk = &input.chunk;
        match chunk.status {
            ChunkStatus::Failed => {
                pages.extend((chunk.first_page..=chunk.last_page).map(|page| PageSummary {
                    page,
                    status: PageStatus::Missing,
                    confidence: None,
                }));
            }
            ChunkStatus::Completed => {
                let result = input.result.as_ref().ok_or(MergeIntegrityError::MissingResult {
                    chunk_index: chunk.chunk_index,
                })?;
                validate_result(chunk, result)?;

                let chunk_boxes = remap_boxes(document_id, chunk, &result.boxes);
                chunk_links.push(ChunkLinks {
                    chunk_id: chunk.id.clone(),
                    bbox_ids: chunk_boxes.iter().map(|b| b.id.clone()).collect(),
                    has_text: result.has_text(),
                });
                bboxes.extend(chunk_boxes);

                let mut ocr_pages: Vec<_> = result.pages.iter().collect();
                ocr_pages.sort_by_key(|p| p.page);
                for p in &ocr_pages {
                    full_text.push_str(&p.text);
                }

                for local in 1..=chunk.page_count() {
                    let confidence = ocr_pages
                        .iter()
                        .find(|p| p.page == local)
                        .map(|p| p.confidence)
                        .or_else(|| mean_box_confidence(&result.boxes, local));
                    pages.push(PageSummary {
                        page: chunk.first_page + local - 1,
                        status: PageStatus::Ok,
                        confidence,
                    });
                }
            }
            other => {
                return Err(MergeIntegrityError::NonTerminalChunk {
                    chunk_index: chunk.chunk_index,
                    status: other.to_string(),
                })
            }
        }
    }

    Ok(MergedDocument {
        document_id: document_id.to_string(),
        total_pages,
        full_text,
        bboxes,
        pages,
        chunk_links,
    })
}

fn validate_result(chunk: &Chunk, result: &ChunkResult) -> Result<(), MergeIntegrityError> {
    let corrupt = |reason: String| MergeIntegrityError::CorruptResult {
        chunk_index: chunk.chunk_index,
        key: chunk.result_key.clone().unwrap_or_default(),
        reason,
    };
    let page_count = chunk.page_count();

    let mut seen = HashSet::new();
    for p in &result.pages {
        if p.page == 0 || p.page > page_count {
            return Err(corrupt(format!(
                "page entry {} outside 1..={}",
                p.page, page_count
            )));
        }
        if !seen.insert(p.page) {
            return Err(corrupt(format!("duplicate entry for local page {}", p.page)));
        }
    }
    for b in &result.boxes {
        if b.page == 0 || b.page > page_count {
            return Err(corrupt(format!(
                "box on local page {} outside 1..={}",
                b.page, page_count
            )));
        }
        let in_unit = |v: f32| v.is_finite() && (0.0..=1.0).contains(&v);
        if !(in_unit(b.x) && in_unit(b.y) && in_unit(b.width) && in_unit(b.height)) {
            return Err(corrupt(format!(
                "box on local page {} has non-normalized coordinates",
                b.page
            )));
        }
    }
    Ok(())
}

/// Mean box confidence on `local`, for results without a page entry.
fn mean_box_confidence(boxes: &[OcrBox], local: u32) -> Option<f32> {
    let on_page: Vec<f32> = boxes
        .iter()
        .filter(|b| b.page == local)
        .map(|b| b.confidence)
        .collect();
    if on_page.is_empty() {
        None
    } else {
        Some(on_page.iter().sum::<f32>() / on_page.len() as f32)
    }
}

fn remap_boxes(document_id: &str, chunk: &Chunk, boxes: &[OcrBox]) -> Vec<BoundingBox> {
    let mut ordered: Vec<&OcrBox> = boxes.iter().collect();
    // Stable: boxes sharing a reading-order index keep provider order.
    ordered.sort_by_key(|b| (b.page, b.reading_order));

    let mut out = Vec::with_capacity(ordered.len());
    let mut current_page = 0;
    let mut position = 0usize;
    for b in ordered {
        if b.page != current_page {
            current_page = b.page;
            position = 0;
        }
        let page = chunk.first_page + b.page - 1;
        out.push(BoundingBox {
            id: bbox_id(document_id, page, position),
            document_id: document_id.to_string(),
            page,
            x: b.x,
            y: b.y,
            width: b.width,
            height: b.height,
            text: b.text.clone(),
            confidence: b.confidence,
            reading_order: b.reading_order,
            chunk_index: chunk.chunk_index,
        });
        position += 1;
    }
    out
}
