//! Storage abstraction for pipeline state.
//!
//! The [`PipelineStore`] trait holds every row the pipeline reads or writes:
//! documents, chunks, merged bounding boxes, page summaries and the entity
//! mentions and citations that anchor to those boxes.
//!
//! Status changes are conditional. A transition names the status it expects
//! to move *from*, and reports whether it happened. This is what lets
//! concurrent workers, the stuck-job monitor and late OCR responses race
//! without double-processing: only one of them wins each transition.
//!
//! All mutating operations take `now` (Unix seconds) so callers and tests
//! control the clock.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::merge::MergedDocument;
use crate::models::{
    BoundingBox, Chunk, Citation, Document, DocumentStatus, EntityMention, PageSummary,
};

/// Chunk counts for one document, taken in the same atomic step as a chunk's
/// terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkTally {
    pub total: u32,
    /// Chunks still `pending` or `processing`.
    pub unfinished: u32,
    pub failed: u32,
}

impl ChunkTally {
    pub fn all_terminal(&self) -> bool {
        self.unfinished == 0
    }
}

/// Abstract storage backend for the chunking pipeline.
///
/// | Method group | Used by |
/// |--------------|---------|
/// | documents | ingest, pipeline driver, monitor |
/// | chunk lifecycle | splitter, scheduler, monitor |
/// | merge output | merger, validator, status views |
/// | references | validator, extraction consumers |
/// | sweeps | cleanup service, monitor |
#[async_trait]
pub trait PipelineStore: Send + Sync {
    // ── documents ──

    async fn insert_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// All documents, optionally filtered by status, newest first.
    async fn list_documents(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>>;

    /// Move a document from `from` to `to`. Returns `false` when it was not
    /// in `from`.
    async fn transition_document(
        &self,
        id: &str,
        from: DocumentStatus,
        to: DocumentStatus,
        now: i64,
    ) -> Result<bool>;

    /// Move a document to `ocr_failed` from whatever non-terminal status it
    /// is in, recording `error`. Returns `false` if it was already terminal.
    async fn fail_document(&self, id: &str, error: &str, now: i64) -> Result<bool>;

    /// Conditional transition that also bumps `retry_count` and clears
    /// `last_error`. Used by the monitor and by operator retries.
    async fn recover_document(
        &self,
        id: &str,
        from: DocumentStatus,
        to: DocumentStatus,
        now: i64,
    ) -> Result<bool>;

    // ── chunk lifecycle ──

    /// Replace the chunk rows of a document.
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Chunks of a document in chunk-index order.
    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>>;

    /// `pending → processing`, incrementing `attempt`. Returns the new
    /// attempt number, or `None` if the chunk was not pending.
    async fn claim_chunk(&self, id: &str, now: i64) -> Result<Option<u32>>;

    /// `processing → completed` for `attempt` only. Returns the document's
    /// tally after the transition, or `None` if the chunk was no longer in
    /// that attempt.
    async fn complete_chunk(
        &self,
        id: &str,
        attempt: u32,
        result_key: &str,
        result_hash: &str,
        now: i64,
    ) -> Result<Option<ChunkTally>>;

    /// `processing → failed` for `attempt` only, recording the error.
    async fn fail_chunk(
        &self,
        id: &str,
        attempt: u32,
        error: &str,
        error_kind: &str,
        now: i64,
    ) -> Result<Option<ChunkTally>>;

    /// `processing → pending` after a retryable failure of `attempt`,
    /// incrementing `retry_count`.
    async fn release_chunk_for_retry(
        &self,
        id: &str,
        attempt: u32,
        error: &str,
        error_kind: &str,
        now: i64,
    ) -> Result<bool>;

    /// `processing → pending`, incrementing `recovery_attempts`. When
    /// `stale_before` is set the chunk must not have been touched since.
    async fn recover_chunk(&self, id: &str, stale_before: Option<i64>, now: i64) -> Result<bool>;

    /// `failed → pending` for every failed chunk of a document, clearing
    /// errors and the retry budget. Returns how many were requeued.
    async fn requeue_failed_chunks(&self, document_id: &str, now: i64) -> Result<usize>;

    async fn delete_chunks(&self, document_id: &str) -> Result<usize>;

    // ── merge output ──

    /// Persist a merge atomically: bounding boxes and page summaries are
    /// replaced, full text is stored and every completed chunk gets its
    /// bbox-id list.
    async fn persist_merge(&self, merged: &MergedDocument, now: i64) -> Result<()>;

    async fn list_bboxes(&self, document_id: &str) -> Result<Vec<BoundingBox>>;

    async fn list_page_summaries(&self, document_id: &str) -> Result<Vec<PageSummary>>;

    // ── references ──

    async fn insert_mention(&self, mention: &EntityMention) -> Result<()>;

    async fn list_mentions(&self, document_id: &str) -> Result<Vec<EntityMention>>;

    async fn insert_citation(&self, citation: &Citation) -> Result<()>;

    async fn list_citations(&self, document_id: &str) -> Result<Vec<Citation>>;

    // ── sweeps ──

    /// `processing` chunks not updated since `cutoff`.
    async fn find_stale_chunks(&self, cutoff: i64) -> Result<Vec<Chunk>>;

    /// Active documents with neither the document nor any of its chunks
    /// updated since `cutoff`. A `chunks_processing` document also needs a
    /// `processing` chunk, or every chunk terminal without the move to
    /// `merging`; chunks that are only `pending` are waiting for a worker.
    async fn find_stale_documents(&self, cutoff: i64) -> Result<Vec<Document>>;

    /// Terminal documents that still own chunk rows, none updated since
    /// `cutoff`.
    async fn find_expired_documents(&self, cutoff: i64) -> Result<Vec<Document>>;
}
