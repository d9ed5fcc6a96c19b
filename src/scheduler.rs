//! Chunk scheduler.
//!
//! Drives every `pending` chunk of a document through OCR to `completed` or
//! `failed`. One [`Semaphore`] shared by every dispatch caps simultaneous OCR
//! calls system-wide, however many documents are in flight.
//!
//! Each worker loops:
//!
//! 1. acquire a permit, claim the chunk (`pending → processing`, new attempt)
//! 2. call the provider once, bounded by the OCR timeout
//! 3. on success write the result object, then complete the row *for that
//!    attempt only*
//! 4. on a retryable failure release the chunk back to `pending`, drop the
//!    permit and back off; on a terminal failure (or an exhausted budget)
//!    fail the chunk
//!
//! The worker whose terminal transition leaves zero unfinished siblings
//! moves the document to `merging`. A result for an attempt that is no
//! longer current (the stuck-job monitor reset it) is discarded.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use casechunk_core::error::ChunkOcrError;
use casechunk_core::layout;
use casechunk_core::models::{hash_bytes, Chunk, ChunkStatus, Document, DocumentStatus};
use casechunk_core::objects::ObjectStore;
use casechunk_core::ocr::OcrProvider;
use casechunk_core::retry::{RetryDecision, RetryPolicy};
use casechunk_core::store::{ChunkTally, PipelineStore};

use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::unix_now;

/// Result of one `dispatch` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub document_id: String,
    /// Workers started by this call.
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    /// This call moved the document to `merging`.
    pub ready_for_merge: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkRun {
    Completed { ready: bool },
    Failed { ready: bool },
    /// Another worker, the monitor, or an operator owns the chunk now.
    Abandoned,
}

struct Inner {
    store: Arc<dyn PipelineStore>,
    objects: Arc<dyn ObjectStore>,
    ocr: Arc<dyn OcrProvider>,
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
    timeout: Duration,
    progress: Arc<dyn ProgressReporter>,
    in_flight: Mutex<HashSet<String>>,
}

/// Removes a chunk from the in-flight set when its worker exits.
struct InFlightGuard {
    inner: Arc<Inner>,
    chunk_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.chunk_id);
    }
}

/// Cheap to clone; clones share the worker pool.
#[derive(Clone)]
pub struct ChunkScheduler {
    inner: Arc<Inner>,
}

impl ChunkScheduler {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        objects: Arc<dyn ObjectStore>,
        ocr: Arc<dyn OcrProvider>,
        concurrency: usize,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                objects,
                ocr,
                permits: Arc::new(Semaphore::new(concurrency)),
                policy,
                timeout,
                progress: Arc::new(NoProgress),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Replace the progress reporter. Only effective before the scheduler
    /// has been cloned.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.progress = progress;
        }
        self
    }

    /// Run every pending chunk of `document_id` to a terminal state.
    ///
    /// A no-op unless the document is in `chunks_processing`. Chunks that
    /// already have a live worker in this process are skipped, so calling
    /// this again while a dispatch is running starts nothing new.
    pub async fn dispatch(&self, document_id: &str) -> Result<DispatchOutcome> {
        let mut outcome = DispatchOutcome {
            document_id: document_id.to_string(),
            ..Default::default()
        };

        let Some(doc) = self.inner.store.get_document(document_id).await? else {
            anyhow::bail!("document {} not found", document_id);
        };
        if doc.status != DocumentStatus::ChunksProcessing {
            debug!(document_id, status = %doc.status, "dispatch skipped");
            return Ok(outcome);
        }

        let chunks = self.inner.store.list_chunks(document_id).await?;
        let doc = Arc::new(doc);
        let mut workers = JoinSet::new();
        for chunk in chunks.into_iter().filter(|c| c.status == ChunkStatus::Pending) {
            let newly_tracked = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(chunk.id.clone());
            if !newly_tracked {
                continue;
            }
            let guard = InFlightGuard {
                inner: self.inner.clone(),
                chunk_id: chunk.id.clone(),
            };
            let inner = self.inner.clone();
            let doc = doc.clone();
            workers.spawn(async move {
                let _guard = guard;
                run_chunk(&inner, &doc, chunk).await
            });
            outcome.dispatched += 1;
        }

        if outcome.dispatched > 0 {
            info!(document_id, chunks = outcome.dispatched, "dispatching chunks");
        }

        let mut first_err = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(ChunkRun::Completed { ready })) => {
                    outcome.completed += 1;
                    outcome.ready_for_merge |= ready;
                }
                Ok(Ok(ChunkRun::Failed { ready })) => {
                    outcome.failed += 1;
                    outcome.ready_for_merge |= ready;
                }
                Ok(Ok(ChunkRun::Abandoned)) => {}
                Ok(Err(e)) => {
                    error!(document_id, error = %e, "chunk worker failed");
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    error!(document_id, error = %e, "chunk worker panicked");
                    first_err.get_or_insert(e.into());
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        // Recovers a document whose last terminal transition happened
        // without the follow-up move to `merging` (e.g. a crash in between).
        if !outcome.ready_for_merge {
            let chunks = self.inner.store.list_chunks(document_id).await?;
            if !chunks.is_empty()
                && chunks.iter().all(|c| c.status.is_terminal())
                && self
                    .inner
                    .store
                    .transition_document(
                        document_id,
                        DocumentStatus::ChunksProcessing,
                        DocumentStatus::Merging,
                        unix_now(),
                    )
                    .await?
            {
                outcome.ready_for_merge = true;
            }
        }

        Ok(outcome)
    }
}

async fn run_chunk(inner: &Inner, doc: &Document, chunk: Chunk) -> Result<ChunkRun> {
    loop {
        let permit = inner.permits.clone().acquire_owned().await?;

        let Some(attempt) = inner.store.claim_chunk(&chunk.id, unix_now()).await? else {
            return Ok(ChunkRun::Abandoned);
        };
        // Re-read after claiming: another worker may have consumed retries.
        let retries_used = inner
            .store
            .get_chunk(&chunk.id)
            .await?
            .map(|c| c.retry_count)
            .unwrap_or(0);
        debug!(
            document_id = %doc.id,
            chunk_index = chunk.chunk_index,
            attempt,
            "chunk claimed"
        );

        let result = attempt_ocr(inner, &chunk).await;

        let err = match result {
            Ok(payload) => {
                let key =
                    layout::chunk_result_key(&doc.matter_id, &doc.id, chunk.chunk_index, attempt);
                match inner.objects.put(&key, &payload).await {
                    Ok(()) => {
                        let tally = inner
                            .store
                            .complete_chunk(
                                &chunk.id,
                                attempt,
                                &key,
                                &hash_bytes(&payload),
                                unix_now(),
                            )
                            .await?;
                        drop(permit);
                        match tally {
                            Some(tally) => {
                                info!(
                                    document_id = %doc.id,
                                    chunk_index = chunk.chunk_index,
                                    attempt,
                                    "chunk completed"
                                );
                                let ready = finish(inner, doc, &chunk, tally, true).await?;
                                return Ok(ChunkRun::Completed { ready });
                            }
                            None => {
                                warn!(
                                    document_id = %doc.id,
                                    chunk_index = chunk.chunk_index,
                                    attempt,
                                    "discarding late OCR result for superseded attempt"
                                );
                                if let Err(e) = inner.objects.delete(&key).await {
                                    warn!(key = %key, error = %e, "failed to delete late result");
                                }
                                // The chunk may be pending again; pick it up if nobody has.
                                continue;
                            }
                        }
                    }
                    Err(e) => ChunkOcrError::Transport(format!("storing result: {}", e)),
                }
            }
            Err(e) => e,
        };
        drop(permit);

        match inner.policy.decide(&err, retries_used + 1) {
            RetryDecision::RetryAfter(delay) => {
                let released = inner
                    .store
                    .release_chunk_for_retry(
                        &chunk.id,
                        attempt,
                        &err.to_string(),
                        err.kind(),
                        unix_now(),
                    )
                    .await?;
                if !released {
                    // Reset underneath us; whoever claims it next owns it.
                    continue;
                }
                warn!(
                    document_id = %doc.id,
                    chunk_index = chunk.chunk_index,
                    attempt,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "chunk attempt failed, retrying"
                );
                inner.progress.report(ProgressEvent::ChunkRetrying {
                    document_id: doc.id.clone(),
                    chunk_index: chunk.chunk_index,
                    attempt,
                });
                tokio::time::sleep(delay).await;
            }
            RetryDecision::GiveUp => {
                let tally = inner
                    .store
                    .fail_chunk(&chunk.id, attempt, &err.to_string(), err.kind(), unix_now())
                    .await?;
                let Some(tally) = tally else {
                    continue;
                };
                warn!(
                    document_id = %doc.id,
                    chunk_index = chunk.chunk_index,
                    first_page = chunk.first_page,
                    last_page = chunk.last_page,
                    attempt,
                    error = %err,
                    "chunk failed"
                );
                let ready = finish(inner, doc, &chunk, tally, false).await?;
                return Ok(ChunkRun::Failed { ready });
            }
        }
    }
}

/// One provider call, returning the serialized result.
async fn attempt_ocr(inner: &Inner, chunk: &Chunk) -> Result<Vec<u8>, ChunkOcrError> {
    let source = match inner.objects.get(&chunk.source_key).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            return Err(ChunkOcrError::MalformedInput(format!(
                "chunk source {} is missing",
                chunk.source_key
            )))
        }
        Err(e) => return Err(ChunkOcrError::Transport(format!("reading source: {}", e))),
    };

    let result = tokio::time::timeout(inner.timeout, inner.ocr.process_pages(&source))
        .await
        .map_err(|_| ChunkOcrError::Timeout(inner.timeout))??;

    serde_json::to_vec(&result).map_err(|e| ChunkOcrError::InvalidResponse(e.to_string()))
}

/// Report progress and, if this was the last unfinished chunk, move the
/// document to `merging`. Returns whether this worker made that move.
async fn finish(
    inner: &Inner,
    doc: &Document,
    chunk: &Chunk,
    tally: ChunkTally,
    succeeded: bool,
) -> Result<bool> {
    inner.progress.report(ProgressEvent::ChunkFinished {
        document_id: doc.id.clone(),
        chunk_index: chunk.chunk_index,
        succeeded,
        done: tally.total - tally.unfinished,
        total: tally.total,
    });

    if !tally.all_terminal() {
        return Ok(false);
    }
    let moved = inner
        .store
        .transition_document(
            &doc.id,
            DocumentStatus::ChunksProcessing,
            DocumentStatus::Merging,
            unix_now(),
        )
        .await?;
    if moved {
        info!(
            document_id = %doc.id,
            failed_chunks = tally.failed,
            "all chunks terminal, document ready for merge"
        );
    }
    Ok(moved)
}
