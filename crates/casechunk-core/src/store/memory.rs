//! In-memory [`PipelineStore`] implementation for tests and local runs.
//!
//! All tables live in one `State` behind a single `RwLock`, so every
//! conditional transition together with its tally is atomic with respect to
//! every other operation.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::merge::MergedDocument;
use crate::models::{
    BoundingBox, Chunk, ChunkStatus, Citation, Document, DocumentStatus, EntityMention,
    PageSummary,
};

use super::{ChunkTally, PipelineStore};

#[derive(Default)]
struct State {
    documents: HashMap<String, Document>,
    chunks: HashMap<String, Chunk>,
    bboxes: HashMap<String, Vec<BoundingBox>>,
    pages: HashMap<String, Vec<PageSummary>>,
    mentions: Vec<EntityMention>,
    citations: Vec<Citation>,
}

impl State {
    fn chunks_of(&self, document_id: &str) -> Vec<&Chunk> {
        let mut chunks: Vec<&Chunk> = self
            .chunks
            .values()
            .filter(|c| c.document_id == document_id)
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        chunks
    }

    fn tally(&self, document_id: &str) -> ChunkTally {
        let chunks = self.chunks_of(document_id);
        ChunkTally {
            total: chunks.len() as u32,
            unfinished: chunks.iter().filter(|c| !c.status.is_terminal()).count() as u32,
            failed: chunks
                .iter()
                .filter(|c| c.status == ChunkStatus::Failed)
                .count() as u32,
        }
    }

    fn processing_attempt(&mut self, id: &str, attempt: u32) -> Option<&mut Chunk> {
        self.chunks
            .get_mut(id)
            .filter(|c| c.status == ChunkStatus::Processing && c.attempt == attempt)
    }
}

/// In-memory store for tests and local experimentation.
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStore for InMemoryStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let mut state = self.write();
        if state.documents.contains_key(&doc.id) {
            bail!("document {} already exists", doc.id);
        }
        state.documents.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read().documents.get(id).cloned())
    }

    async fn list_documents(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>> {
        let state = self.read();
        let mut docs: Vec<Document> = state
            .documents
            .values()
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn transition_document(
        &self,
        id: &str,
        from: DocumentStatus,
        to: DocumentStatus,
        now: i64,
    ) -> Result<bool> {
        let mut state = self.write();
        match state.documents.get_mut(id) {
            Some(doc) if doc.status == from => {
                doc.status = to;
                doc.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_document(&self, id: &str, error: &str, now: i64) -> Result<bool> {
        let mut state = self.write();
        match state.documents.get_mut(id) {
            Some(doc) if !doc.status.is_terminal() => {
                doc.status = DocumentStatus::OcrFailed;
                doc.last_error = Some(error.to_string());
                doc.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recover_document(
        &self,
        id: &str,
        from: DocumentStatus,
        to: DocumentStatus,
        now: i64,
    ) -> Result<bool> {
        let mut state = self.write();
        match state.documents.get_mut(id) {
            Some(doc) if doc.status == from => {
                doc.status = to;
                doc.retry_count += 1;
                doc.last_error = None;
                doc.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut state = self.write();
        state.chunks.retain(|_, c| c.document_id != document_id);
        for chunk in chunks {
            state.chunks.insert(chunk.id.clone(), chunk.clone());
        }
        Ok(())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        Ok(self
            .read()
            .chunks_of(document_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        Ok(self.read().chunks.get(id).cloned())
    }

    async fn claim_chunk(&self, id: &str, now: i64) -> Result<Option<u32>> {
        let mut state = self.write();
        match state.chunks.get_mut(id) {
            Some(chunk) if chunk.status == ChunkStatus::Pending => {
                chunk.status = ChunkStatus::Processing;
                chunk.attempt += 1;
                chunk.updated_at = now;
                Ok(Some(chunk.attempt))
            }
            _ => Ok(None),
        }
    }

    async fn complete_chunk(
        &self,
        id: &str,
        attempt: u32,
        result_key: &str,
        result_hash: &str,
        now: i64,
    ) -> Result<Option<ChunkTally>> {
        let mut state = self.write();
        let Some(chunk) = state.processing_attempt(id, attempt) else {
            return Ok(None);
        };
        chunk.status = ChunkStatus::Completed;
        chunk.result_key = Some(result_key.to_string());
        chunk.result_hash = Some(result_hash.to_string());
        chunk.last_error = None;
        chunk.error_kind = None;
        chunk.updated_at = now;
        let document_id = chunk.document_id.clone();
        Ok(Some(state.tally(&document_id)))
    }

    async fn fail_chunk(
        &self,
        id: &str,
        attempt: u32,
        error: &str,
        error_kind: &str,
        now: i64,
    ) -> Result<Option<ChunkTally>> {
        let mut state = self.write();
        let Some(chunk) = state.processing_attempt(id, attempt) else {
            return Ok(None);
        };
        chunk.status = ChunkStatus::Failed;
        chunk.last_error = Some(error.to_string());
        chunk.error_kind = Some(error_kind.to_string());
        chunk.updated_at = now;
        let document_id = chunk.document_id.clone();
        Ok(Some(state.tally(&document_id)))
    }

    async fn release_chunk_for_retry(
        &self,
        id: &str,
        attempt: u32,
        error: &str,
        error_kind: &str,
        now: i64,
    ) -> Result<bool> {
        let mut state = self.write();
        let Some(chunk) = state.processing_attempt(id, attempt) else {
            return Ok(false);
        };
        chunk.status = ChunkStatus::Pending;
        chunk.retry_count += 1;
        chunk.last_error = Some(error.to_string());
        chunk.error_kind = Some(error_kind.to_string());
        chunk.updated_at = now;
        Ok(true)
    }

    async fn recover_chunk(&self, id: &str, stale_before: Option<i64>, now: i64) -> Result<bool> {
        let mut state = self.write();
        match state.chunks.get_mut(id) {
            Some(chunk)
                if chunk.status == ChunkStatus::Processing
                    && stale_before.map_or(true, |cutoff| chunk.updated_at < cutoff) =>
            {
                chunk.status = ChunkStatus::Pending;
                chunk.recovery_attempts += 1;
                chunk.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requeue_failed_chunks(&self, document_id: &str, now: i64) -> Result<usize> {
        let mut state = self.write();
        let mut count = 0;
        for chunk in state.chunks.values_mut() {
            if chunk.document_id == document_id && chunk.status == ChunkStatus::Failed {
                chunk.status = ChunkStatus::Pending;
                chunk.retry_count = 0;
                chunk.last_error = None;
                chunk.error_kind = None;
                chunk.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<usize> {
        let mut state = self.write();
        let before = state.chunks.len();
        state.chunks.retain(|_, c| c.document_id != document_id);
        Ok(before - state.chunks.len())
    }

    async fn persist_merge(&self, merged: &MergedDocument, now: i64) -> Result<()> {
        let mut state = self.write();
        let Some(doc) = state.documents.get_mut(&merged.document_id) else {
            bail!("document {} not found", merged.document_id);
        };
        doc.full_text = merged.full_text.clone();
        doc.updated_at = now;

        for link in &merged.chunk_links {
            if let Some(chunk) = state.chunks.get_mut(&link.chunk_id) {
                chunk.bbox_ids = link.bbox_ids.clone();
                chunk.has_text = link.has_text;
                chunk.updated_at = now;
            }
        }
        state
            .bboxes
            .insert(merged.document_id.clone(), merged.bboxes.clone());
        state
            .pages
            .insert(merged.document_id.clone(), merged.pages.clone());
        Ok(())
    }

    async fn list_bboxes(&self, document_id: &str) -> Result<Vec<BoundingBox>> {
        Ok(self
            .read()
            .bboxes
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_page_summaries(&self, document_id: &str) -> Result<Vec<PageSummary>> {
        Ok(self
            .read()
            .pages
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_mention(&self, mention: &EntityMention) -> Result<()> {
        let mut state = self.write();
        state.mentions.retain(|m| m.id != mention.id);
        state.mentions.push(mention.clone());
        Ok(())
    }

    async fn list_mentions(&self, document_id: &str) -> Result<Vec<EntityMention>> {
        Ok(self
            .read()
            .mentions
            .iter()
            .filter(|m| m.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn insert_citation(&self, citation: &Citation) -> Result<()> {
        let mut state = self.write();
        state.citations.retain(|c| c.id != citation.id);
        state.citations.push(citation.clone());
        Ok(())
    }

    async fn list_citations(&self, document_id: &str) -> Result<Vec<Citation>> {
        Ok(self
            .read()
            .citations
            .iter()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn find_stale_chunks(&self, cutoff: i64) -> Result<Vec<Chunk>> {
        let state = self.read();
        let mut stale: Vec<Chunk> = state
            .chunks
            .values()
            .filter(|c| c.status == ChunkStatus::Processing && c.updated_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by(|a, b| {
            a.document_id
                .cmp(&b.document_id)
                .then(a.chunk_index.cmp(&b.chunk_index))
        });
        Ok(stale)
    }

    async fn find_stale_documents(&self, cutoff: i64) -> Result<Vec<Document>> {
        let state = self.read();
        let mut stale: Vec<Document> = state
            .documents
            .values()
            .filter(|d| d.status.is_active() && d.updated_at < cutoff)
            .filter(|d| {
                let chunks = state.chunks_of(&d.id);
                if !chunks.iter().all(|c| c.updated_at < cutoff) {
                    return false;
                }
                // Pending chunks may just be queued for a worker.
                d.status != DocumentStatus::ChunksProcessing
                    || chunks.iter().any(|c| c.status == ChunkStatus::Processing)
                    || (!chunks.is_empty() && chunks.iter().all(|c| c.status.is_terminal()))
            })
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stale)
    }

    async fn find_expired_documents(&self, cutoff: i64) -> Result<Vec<Document>> {
        let state = self.read();
        let mut expired: Vec<Document> = state
            .documents
            .values()
            .filter(|d| d.status.is_terminal() && d.updated_at < cutoff)
            .filter(|d| {
                let chunks = state.chunks_of(&d.id);
                !chunks.is_empty() && chunks.iter().all(|c| c.updated_at < cutoff)
            })
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, status: DocumentStatus, updated_at: i64) -> Document {
        Document {
            id: id.into(),
            matter_id: "m".into(),
            total_pages: 10,
            status,
            retry_count: 0,
            source_key: format!("documents/m/{}.pdf", id),
            full_text: String::new(),
            last_error: None,
            created_at: 0,
            updated_at,
        }
    }

    fn chunk(id: &str, doc: &str, index: u32, status: ChunkStatus, updated_at: i64) -> Chunk {
        Chunk {
            id: id.into(),
            document_id: doc.into(),
            chunk_index: index,
            first_page: index * 5 + 1,
            last_page: index * 5 + 5,
            status,
            source_key: String::new(),
            result_key: None,
            result_hash: None,
            attempt: 0,
            retry_count: 0,
            recovery_attempts: 0,
            last_error: None,
            error_kind: None,
            bbox_ids: vec![],
            has_text: false,
            created_at: 0,
            updated_at,
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryStore::new();
        store
            .replace_chunks("d", &[chunk("c0", "d", 0, ChunkStatus::Pending, 0)])
            .await
            .unwrap();
        assert_eq!(store.claim_chunk("c0", 1).await.unwrap(), Some(1));
        assert_eq!(store.claim_chunk("c0", 2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_completion_ignores_stale_attempt() {
        let store = InMemoryStore::new();
        store
            .replace_chunks(
                "d",
                &[
                    chunk("c0", "d", 0, ChunkStatus::Pending, 0),
                    chunk("c1", "d", 1, ChunkStatus::Pending, 0),
                ],
            )
            .await
            .unwrap();
        let first = store.claim_chunk("c0", 1).await.unwrap().unwrap();
        assert!(store.recover_chunk("c0", None, 2).await.unwrap());
        let second = store.claim_chunk("c0", 3).await.unwrap().unwrap();
        assert_eq!(second, first + 1);

        let late = store.complete_chunk("c0", first, "k1", "h1", 4).await.unwrap();
        assert!(late.is_none());

        let tally = store
            .complete_chunk("c0", second, "k2", "h2", 5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tally.total, 2);
        assert_eq!(tally.unfinished, 1);
        let stored = store.get_chunk("c0").await.unwrap().unwrap();
        assert_eq!(stored.result_key.as_deref(), Some("k2"));
        assert_eq!(stored.recovery_attempts, 1);
    }

    #[tokio::test]
    async fn test_transition_is_conditional() {
        let store = InMemoryStore::new();
        store
            .insert_document(&doc("d", DocumentStatus::ChunksProcessing, 0))
            .await
            .unwrap();
        let from = DocumentStatus::ChunksProcessing;
        let to = DocumentStatus::Merging;
        assert!(store.transition_document("d", from, to, 1).await.unwrap());
        assert!(!store.transition_document("d", from, to, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_document_needs_quiet_chunks() {
        let store = InMemoryStore::new();
        store
            .insert_document(&doc("d", DocumentStatus::ChunksProcessing, 0))
            .await
            .unwrap();
        store
            .replace_chunks("d", &[chunk("c0", "d", 0, ChunkStatus::Processing, 500)])
            .await
            .unwrap();
        assert!(store.find_stale_documents(100).await.unwrap().is_empty());
        assert_eq!(store.find_stale_documents(1000).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_queued_chunks_are_not_stuck() {
        let store = InMemoryStore::new();
        for id in ["queued", "unmerged", "splitting"] {
            let status = if id == "splitting" {
                DocumentStatus::Splitting
            } else {
                DocumentStatus::ChunksProcessing
            };
            store.insert_document(&doc(id, status, 0)).await.unwrap();
        }
        store
            .replace_chunks(
                "queued",
                &[
                    chunk("q0", "queued", 0, ChunkStatus::Completed, 0),
                    chunk("q1", "queued", 1, ChunkStatus::Pending, 0),
                ],
            )
            .await
            .unwrap();
        store
            .replace_chunks(
                "unmerged",
                &[
                    chunk("u0", "unmerged", 0, ChunkStatus::Completed, 0),
                    chunk("u1", "unmerged", 1, ChunkStatus::Failed, 0),
                ],
            )
            .await
            .unwrap();

        let stale: Vec<String> = store
            .find_stale_documents(1000)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(stale, vec!["splitting", "unmerged"]);
    }

    #[tokio::test]
    async fn test_expired_documents_are_terminal_with_chunks() {
        let store = InMemoryStore::new();
        store
            .insert_document(&doc("done", DocumentStatus::OcrFailed, 10))
            .await
            .unwrap();
        store
            .insert_document(&doc("busy", DocumentStatus::ChunksProcessing, 10))
            .await
            .unwrap();
        store
            .replace_chunks("done", &[chunk("a", "done", 0, ChunkStatus::Failed, 10)])
            .await
            .unwrap();
        store
            .replace_chunks("busy", &[chunk("b", "busy", 0, ChunkStatus::Pending, 10)])
            .await
            .unwrap();
        let expired = store.find_expired_documents(100).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "done");
    }
}
