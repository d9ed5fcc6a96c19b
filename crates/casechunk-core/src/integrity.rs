//! Reference-integrity rules applied to a merged document.
//!
//! Three invariants are checked:
//!
//! 1. every bbox referenced by an entity mention or citation source anchor
//!    exists and sits on the page the reference declares;
//! 2. every chunk's bbox-id list points at existing boxes inside the chunk's
//!    page range;
//! 3. while the document is not terminal, a completed chunk only has an
//!    empty bbox-id list when its range produced no text.
//!
//! Problems are reported, never repaired. Citation *target* anchors point
//! into other documents and are counted as unchecked.

use std::collections::HashMap;

use serde::Serialize;

use crate::models::{
    BoundingBox, Chunk, ChunkStatus, Citation, DocumentStatus, EntityMention, PageStatus,
    PageSummary,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    EntityMention,
    CitationSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum ReferenceProblem {
    MissingBbox { bbox_id: String },
    PageMismatch { bbox_id: String, declared: u32, actual: u32 },
}

/// A mention or citation anchor that does not resolve.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidReference {
    pub reference_id: String,
    pub kind: ReferenceKind,
    #[serde(flatten)]
    pub problem: ReferenceProblem,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum OrphanReason {
    DanglingBbox { bbox_id: String },
    BboxOutsideRange { bbox_id: String, page: u32 },
    EmptyBboxList,
}

/// A chunk whose bbox-id list is inconsistent with the bbox table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanChunk {
    pub chunk_id: String,
    pub chunk_index: u32,
    #[serde(flatten)]
    pub reason: OrphanReason,
}

/// Outcome of validating one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub document_id: String,
    pub valid_mentions: usize,
    pub invalid_mentions: Vec<InvalidReference>,
    pub orphan_chunks: Vec<OrphanChunk>,
    pub missing_pages: Vec<u32>,
    pub unchecked_targets: usize,
    pub is_healthy: bool,
}

/// Everything the rules look at for one document.
pub struct IntegrityInput<'a> {
    pub document_id: &'a str,
    pub document_status: DocumentStatus,
    pub bboxes: &'a [BoundingBox],
    pub mentions: &'a [EntityMention],
    pub citations: &'a [Citation],
    pub chunks: &'a [Chunk],
    pub pages: &'a [PageSummary],
}

pub fn check_integrity(input: &IntegrityInput<'_>) -> IntegrityReport {
    let pages_by_id: HashMap<&str, u32> = input
        .bboxes
        .iter()
        .map(|b| (b.id.as_str(), b.page))
        .collect();

    let mut valid_mentions = 0;
    let mut invalid_mentions = Vec::new();

    let anchors = input
        .mentions
        .iter()
        .map(|m| (m.id.as_str(), ReferenceKind::EntityMention, m.page, &m.bbox_ids))
        .chain(input.citations.iter().map(|c| {
            (
                c.id.as_str(),
                ReferenceKind::CitationSource,
                c.source_page,
                &c.source_bbox_ids,
            )
        }));

    for (reference_id, kind, declared, bbox_ids) in anchors {
        let problem = bbox_ids.iter().find_map(|id| match pages_by_id.get(id.as_str()) {
            None => Some(ReferenceProblem::MissingBbox {
                bbox_id: id.clone(),
            }),
            Some(&actual) if actual != declared => Some(ReferenceProblem::PageMismatch {
                bbox_id: id.clone(),
                declared,
                actual,
            }),
            Some(_) => None,
        });
        match problem {
            Some(problem) => invalid_mentions.push(InvalidReference {
                reference_id: reference_id.to_string(),
                kind,
                problem,
            }),
            None => valid_mentions += 1,
        }
    }

    let mut orphan_chunks = Vec::new();
    for chunk in input.chunks {
        let dangling = chunk.bbox_ids.iter().find_map(|id| match pages_by_id.get(id.as_str()) {
            None => Some(OrphanReason::DanglingBbox { bbox_id: id.clone() }),
            Some(&page) if !chunk.contains_page(page) => Some(OrphanReason::BboxOutsideRange {
                bbox_id: id.clone(),
                page,
            }),
            Some(_) => None,
        });
        let reason = dangling.or_else(|| {
            let empty_but_has_text = !input.document_status.is_terminal()
                && chunk.status == ChunkStatus::Completed
                && chunk.bbox_ids.is_empty()
                && chunk.has_text;
            empty_but_has_text.then_some(OrphanReason::EmptyBboxList)
        });
        if let Some(reason) = reason {
            orphan_chunks.push(OrphanChunk {
                chunk_id: chunk.id.clone(),
                chunk_index: chunk.chunk_index,
                reason,
            });
        }
    }

    let missing_pages = input
        .pages
        .iter()
        .filter(|p| p.status == PageStatus::Missing)
        .map(|p| p.page)
        .collect();

    let unchecked_targets = input
        .citations
        .iter()
        .filter(|c| !c.target_bbox_ids.is_empty())
        .count();

    let is_healthy = invalid_mentions.is_empty() && orphan_chunks.is_empty();

    IntegrityReport {
        document_id: input.document_id.to_string(),
        valid_mentions,
        invalid_mentions,
        orphan_chunks,
        missing_pages,
        unchecked_targets,
        is_healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(id: &str, page: u32) -> BoundingBox {
        BoundingBox {
            id: id.into(),
            document_id: "doc".into(),
            page,
            x: 0.1,
            y: 0.1,
            width: 0.2,
            height: 0.05,
            text: "text".into(),
            confidence: 0.9,
            reading_order: 0,
            chunk_index: 0,
        }
    }

    fn mention(id: &str, page: u32, bbox_ids: &[&str]) -> EntityMention {
        EntityMention {
            id: id.into(),
            document_id: "doc".into(),
            entity: "Acme Corp".into(),
            page,
            bbox_ids: bbox_ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn completed_chunk(bbox_ids: &[&str], has_text: bool) -> Chunk {
        Chunk {
            id: "chunk-0".into(),
            document_id: "doc".into(),
            chunk_index: 0,
            first_page: 1,
            last_page: 5,
            status: ChunkStatus::Completed,
            source_key: String::new(),
            result_key: None,
            result_hash: None,
            attempt: 1,
            retry_count: 0,
            recovery_attempts: 0,
            last_error: None,
            error_kind: None,
            bbox_ids: bbox_ids.iter().map(|s| s.to_string()).collect(),
            has_text,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn run(
        status: DocumentStatus,
        bboxes: &[BoundingBox],
        mentions: &[EntityMention],
        citations: &[Citation],
        chunks: &[Chunk],
    ) -> IntegrityReport {
        check_integrity(&IntegrityInput {
            document_id: "doc",
            document_status: status,
            bboxes,
            mentions,
            citations,
            chunks,
            pages: &[],
        })
    }

    #[test]
    fn test_mention_to_unknown_bbox_is_invalid() {
        let boxes = [bbox("b1", 1)];
        let mentions = [mention("m1", 1, &["b1"]), mention("m2", 1, &["nope"])];
        let report = run(DocumentStatus::OcrComplete, &boxes, &mentions, &[], &[]);
        assert_eq!(report.valid_mentions, 1);
        assert_eq!(report.invalid_mentions.len(), 1);
        assert_eq!(report.invalid_mentions[0].reference_id, "m2");
        assert!(!report.is_healthy);
    }

    #[test]
    fn test_page_mismatch_is_invalid() {
        let boxes = [bbox("b1", 3)];
        let mentions = [mention("m1", 2, &["b1"])];
        let report = run(DocumentStatus::OcrComplete, &boxes, &mentions, &[], &[]);
        assert_eq!(
            report.invalid_mentions[0].problem,
            ReferenceProblem::PageMismatch {
                bbox_id: "b1".into(),
                declared: 2,
                actual: 3
            }
        );
    }

    #[test]
    fn test_citation_source_checked_target_counted() {
        let boxes = [bbox("b1", 1)];
        let citations = [Citation {
            id: "c1".into(),
            document_id: "doc".into(),
            citation_text: "Smith v. Jones, 123 F.3d 456".into(),
            source_page: 1,
            source_bbox_ids: vec!["b1".into()],
            target_document_id: Some("ref-doc".into()),
            target_page: Some(7),
            target_bbox_ids: vec!["elsewhere".into()],
        }];
        let report = run(DocumentStatus::OcrComplete, &boxes, &[], &citations, &[]);
        assert!(report.is_healthy);
        assert_eq!(report.valid_mentions, 1);
        assert_eq!(report.unchecked_targets, 1);
    }

    #[test]
    fn test_chunk_with_dangling_bbox_is_orphan() {
        let boxes = [bbox("b1", 1)];
        let chunks = [completed_chunk(&["b1", "gone"], true)];
        let report = run(DocumentStatus::Merging, &boxes, &[], &[], &chunks);
        assert_eq!(
            report.orphan_chunks[0].reason,
            OrphanReason::DanglingBbox {
                bbox_id: "gone".into()
            }
        );
        assert!(!report.is_healthy);
    }

    #[test]
    fn test_empty_bbox_list_only_orphan_when_text_exists() {
        let blank = [completed_chunk(&[], false)];
        assert!(run(DocumentStatus::Merging, &[], &[], &[], &blank).is_healthy);

        let texty = [completed_chunk(&[], true)];
        let report = run(DocumentStatus::Merging, &[], &[], &[], &texty);
        assert_eq!(report.orphan_chunks[0].reason, OrphanReason::EmptyBboxList);

        // Terminal documents are exempt from the empty-list rule.
        assert!(run(DocumentStatus::OcrComplete, &[], &[], &[], &texty).is_healthy);
    }

    #[test]
    fn test_missing_pages_reported_without_affecting_health() {
        let pages = [
            PageSummary {
                page: 1,
                status: PageStatus::Ok,
                confidence: Some(0.9),
            },
            PageSummary {
                page: 2,
                status: PageStatus::Missing,
                confidence: None,
            },
        ];
        let report = check_integrity(&IntegrityInput {
            document_id: "doc",
            document_status: DocumentStatus::OcrFailed,
            bboxes: &[],
            mentions: &[],
            citations: &[],
            chunks: &[],
            pages: &pages,
        });
        assert_eq!(report.missing_pages, vec![2]);
        assert!(report.is_healthy);
    }
}
