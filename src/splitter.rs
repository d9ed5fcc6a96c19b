//! PDF page splitter.
//!
//! Turns a document's source PDF into one standalone PDF per planned page
//! range. For each range the parsed document is cloned, every page outside
//! the range is deleted, unreferenced objects are pruned and the result is
//! serialized. Blobs are stored under the document's chunk prefix and one
//! `pending` chunk row is written per range before [`PageSplitter::split`]
//! returns.

use std::sync::Arc;

use anyhow::{Context, Result};
use lopdf::Document as PdfDocument;
use serde::Serialize;
use tracing::{debug, info};

use casechunk_core::error::SplitError;
use casechunk_core::layout;
use casechunk_core::models::{Chunk, ChunkStatus, Document};
use casechunk_core::objects::ObjectStore;
use casechunk_core::split::{plan_chunks, ChunkPlan};
use casechunk_core::store::PipelineStore;

/// A persisted chunk as produced by the splitter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkDescriptor {
    pub chunk_id: String,
    pub index: u32,
    pub first_page: u32,
    pub last_page: u32,
    pub source_key: String,
    pub byte_len: usize,
}

fn load(pdf: &[u8]) -> Result<PdfDocument, SplitError> {
    let doc = PdfDocument::load_mem(pdf).map_err(|e| SplitError::Malformed(e.to_string()))?;
    if doc.is_encrypted() {
        return Err(SplitError::Malformed("document is encrypted".to_string()));
    }
    Ok(doc)
}

/// Number of pages in `pdf`.
pub fn count_pages(pdf: &[u8]) -> Result<u32, SplitError> {
    let pages = load(pdf)?.get_pages().len() as u32;
    if pages == 0 {
        return Err(SplitError::EmptyDocument);
    }
    Ok(pages)
}

/// Split `pdf` into one serialized PDF per plan, in plan order.
///
/// `declared_pages` is the page count recorded at upload; a parsed count
/// that disagrees is an error rather than a silent re-plan.
pub fn split_pdf(
    pdf: &[u8],
    declared_pages: u32,
    plans: &[ChunkPlan],
) -> Result<Vec<Vec<u8>>, SplitError> {
    let source = load(pdf)?;
    let all_pages: Vec<u32> = source.get_pages().keys().copied().collect();
    let parsed = all_pages.len() as u32;
    if parsed == 0 {
        return Err(SplitError::EmptyDocument);
    }
    if parsed != declared_pages {
        return Err(SplitError::PageCountMismatch {
            declared: declared_pages,
            parsed,
        });
    }

    let mut blobs = Vec::with_capacity(plans.len());
    for plan in plans {
        let serialize_err = |message: String| SplitError::Serialize {
            first_page: plan.first_page,
            last_page: plan.last_page,
            message,
        };

        let mut part = source.clone();
        let outside: Vec<u32> = all_pages
            .iter()
            .copied()
            .filter(|p| *p < plan.first_page || *p > plan.last_page)
            .collect();
        part.delete_pages(&outside);
        part.prune_objects();
        part.renumber_objects();

        let kept = part.get_pages().len() as u32;
        if kept != plan.page_count() {
            return Err(serialize_err(format!(
                "expected {} pages after split, found {}",
                plan.page_count(),
                kept
            )));
        }

        let mut bytes = Vec::new();
        part.save_to(&mut bytes)
            .map_err(|e| serialize_err(e.to_string()))?;
        blobs.push(bytes);
    }

    Ok(blobs)
}

/// Splits documents and persists their chunks.
pub struct PageSplitter {
    store: Arc<dyn PipelineStore>,
    objects: Arc<dyn ObjectStore>,
    pages_per_chunk: u32,
}

impl PageSplitter {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        objects: Arc<dyn ObjectStore>,
        pages_per_chunk: u32,
    ) -> Self {
        Self {
            store,
            objects,
            pages_per_chunk,
        }
    }

    /// Split `doc` and write one `pending` chunk row per range.
    ///
    /// Any chunk rows left by an interrupted split are replaced. Structural
    /// problems surface as a [`SplitError`] inside the returned error.
    pub async fn split(&self, doc: &Document, now: i64) -> Result<Vec<ChunkDescriptor>> {
        let plans = plan_chunks(doc.total_pages, self.pages_per_chunk)?;

        let source = self
            .objects
            .get(&doc.source_key)
            .await
            .with_context(|| format!("Failed to read source {}", doc.source_key))?
            .ok_or_else(|| SplitError::Malformed(format!("source {} not found", doc.source_key)))?;

        let declared = doc.total_pages;
        let plans_for_split = plans.clone();
        let blobs =
            tokio::task::spawn_blocking(move || split_pdf(&source, declared, &plans_for_split))
                .await??;

        let mut descriptors = Vec::with_capacity(plans.len());
        let mut chunks = Vec::with_capacity(plans.len());
        for (plan, blob) in plans.iter().zip(blobs) {
            let source_key = layout::chunk_source_key(&doc.matter_id, &doc.id, plan.index);
            self.objects
                .put(&source_key, &blob)
                .await
                .with_context(|| format!("Failed to store chunk source {}", source_key))?;
            debug!(
                document_id = %doc.id,
                chunk_index = plan.index,
                first_page = plan.first_page,
                last_page = plan.last_page,
                bytes = blob.len(),
                "stored chunk source"
            );

            let chunk_id = uuid::Uuid::new_v4().to_string();
            chunks.push(Chunk {
                id: chunk_id.clone(),
                document_id: doc.id.clone(),
                chunk_index: plan.index,
                first_page: plan.first_page,
                last_page: plan.last_page,
                status: ChunkStatus::Pending,
                source_key: source_key.clone(),
                result_key: None,
                result_hash: None,
                attempt: 0,
                retry_count: 0,
                recovery_attempts: 0,
                last_error: None,
                error_kind: None,
                bbox_ids: Vec::new(),
                has_text: false,
                created_at: now,
                updated_at: now,
            });
            descriptors.push(ChunkDescriptor {
                chunk_id,
                index: plan.index,
                first_page: plan.first_page,
                last_page: plan.last_page,
                source_key,
                byte_len: blob.len(),
            });
        }

        self.store.replace_chunks(&doc.id, &chunks).await?;
        info!(
            document_id = %doc.id,
            pages = doc.total_pages,
            chunks = chunks.len(),
            "document split"
        );
        Ok(descriptors)
    }
}
