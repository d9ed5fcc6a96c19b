//! OCR result merger.
//!
//! Loads every terminal chunk's stored result, checks it against the hash
//! recorded at completion, and folds the results into one document-global
//! record via [`merge_chunks`]. The merged text, bounding boxes, page summary
//! and per-chunk bbox links are persisted in a single store transaction.
//!
//! Structural problems come back as a [`MergeIntegrityError`] wrapped in the
//! returned `anyhow::Error`; callers downcast to tell them apart from storage
//! failures.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use casechunk_core::error::MergeIntegrityError;
use casechunk_core::merge::{merge_chunks, MergeInput, MergedDocument};
use casechunk_core::models::{hash_bytes, Chunk, ChunkResult, ChunkStatus};
use casechunk_core::objects::ObjectStore;
use casechunk_core::store::PipelineStore;

pub struct OcrResultMerger {
    store: Arc<dyn PipelineStore>,
    objects: Arc<dyn ObjectStore>,
}

impl OcrResultMerger {
    pub fn new(store: Arc<dyn PipelineStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { store, objects }
    }

    /// Merge and persist `document_id`. Does not change document status.
    pub async fn merge(&self, document_id: &str, now: i64) -> Result<MergedDocument> {
        let doc = self
            .store
            .get_document(document_id)
            .await?
            .with_context(|| format!("document {} not found", document_id))?;
        let chunks = self.store.list_chunks(document_id).await?;

        let mut inputs = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let result = if chunk.status == ChunkStatus::Completed {
                Some(self.load_result(&chunk).await?)
            } else {
                None
            };
            inputs.push(MergeInput { chunk, result });
        }

        let merged = merge_chunks(document_id, doc.total_pages, inputs)?;
        self.store
            .persist_merge(&merged, now)
            .await
            .with_context(|| format!("Failed to persist merge for {}", document_id))?;

        info!(
            document_id,
            pages = merged.total_pages,
            bboxes = merged.bboxes.len(),
            missing_pages = merged.missing_pages().len(),
            "merged chunk results"
        );
        Ok(merged)
    }

    async fn load_result(&self, chunk: &Chunk) -> Result<ChunkResult> {
        let key = chunk
            .result_key
            .as_deref()
            .ok_or(MergeIntegrityError::MissingResult {
                chunk_index: chunk.chunk_index,
            })?;
        let bytes = self
            .objects
            .get(key)
            .await
            .with_context(|| format!("Failed to read chunk result {}", key))?
            .ok_or(MergeIntegrityError::MissingResult {
                chunk_index: chunk.chunk_index,
            })?;

        let corrupt = |reason: String| MergeIntegrityError::CorruptResult {
            chunk_index: chunk.chunk_index,
            key: key.to_string(),
            reason,
        };

        if let Some(expected) = &chunk.result_hash {
            let actual = hash_bytes(&bytes);
            if &actual != expected {
                return Err(corrupt(format!(
                    "hash mismatch: expected {}, found {}",
                    expected, actual
                ))
                .into());
            }
        }
        let result: ChunkResult =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        debug!(
            chunk_index = chunk.chunk_index,
            boxes = result.boxes.len(),
            "loaded chunk result"
        );
        Ok(result)
    }
}
