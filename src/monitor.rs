//! Stuck-job monitor.
//!
//! A chunk is stuck when it has sat in `processing` longer than the
//! threshold; a document is stuck when it is in an active status and neither
//! it nor any of its chunks changed within the threshold. Resets are
//! conditional on staleness, so a chunk that completes concurrently is left
//! alone and running the same reset twice is harmless.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

use casechunk_core::models::{Chunk, Document, DocumentStatus};
use casechunk_core::store::PipelineStore;

use crate::unix_now;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StuckReport {
    /// Anything not updated since this timestamp counts as stuck.
    pub cutoff: i64,
    pub documents: Vec<Document>,
    pub chunks: Vec<Chunk>,
}

impl StuckReport {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty() && self.chunks.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetOutcome {
    /// Documents whose status was rolled back or re-armed.
    pub documents: Vec<String>,
    pub chunks_reset: usize,
}

pub struct StuckJobMonitor {
    store: Arc<dyn PipelineStore>,
    threshold_secs: i64,
}

impl StuckJobMonitor {
    pub fn new(store: Arc<dyn PipelineStore>, threshold_secs: i64) -> Self {
        Self {
            store,
            threshold_secs,
        }
    }

    fn cutoff(&self, now: i64) -> i64 {
        now - self.threshold_secs
    }

    pub async fn find_stuck(&self, now: i64) -> Result<StuckReport> {
        let cutoff = self.cutoff(now);
        Ok(StuckReport {
            cutoff,
            documents: self.store.find_stale_documents(cutoff).await?,
            chunks: self.store.find_stale_chunks(cutoff).await?,
        })
    }

    /// `processing → pending` for one chunk, only if it is past the threshold.
    pub async fn reset_chunk(&self, chunk_id: &str, now: i64) -> Result<bool> {
        let reset = self
            .store
            .recover_chunk(chunk_id, Some(self.cutoff(now)), now)
            .await?;
        if reset {
            info!(chunk_id, "stuck chunk reset to pending");
        }
        Ok(reset)
    }

    /// Reset a document's stuck chunks and, if the document itself is
    /// stuck, roll it back to the status that re-runs its stage.
    pub async fn reset_document(&self, document_id: &str, now: i64) -> Result<ResetOutcome> {
        let cutoff = self.cutoff(now);
        let doc = self
            .store
            .get_document(document_id)
            .await?
            .with_context(|| format!("document {} not found", document_id))?;

        let doc_stuck = self
            .store
            .find_stale_documents(cutoff)
            .await?
            .iter()
            .any(|d| d.id == doc.id);

        let mut outcome = ResetOutcome::default();
        for chunk in self.store.list_chunks(document_id).await? {
            if self.store.recover_chunk(&chunk.id, Some(cutoff), now).await? {
                outcome.chunks_reset += 1;
            }
        }

        if doc_stuck {
            let target = match doc.status {
                DocumentStatus::Splitting => Some(DocumentStatus::Uploaded),
                DocumentStatus::ChunksProcessing => Some(DocumentStatus::ChunksProcessing),
                DocumentStatus::Merging => Some(DocumentStatus::ChunksProcessing),
                _ => None,
            };
            if let Some(to) = target {
                if self
                    .store
                    .recover_document(document_id, doc.status, to, now)
                    .await?
                {
                    outcome.documents.push(document_id.to_string());
                }
            }
        }

        if outcome.chunks_reset > 0 || !outcome.documents.is_empty() {
            info!(
                document_id,
                from = %doc.status,
                chunks = outcome.chunks_reset,
                "stuck document reset"
            );
        }
        Ok(outcome)
    }

    /// Reset everything currently stuck.
    pub async fn reset_stuck(&self, now: i64) -> Result<ResetOutcome> {
        let report = self.find_stuck(now).await?;
        let mut outcome = ResetOutcome::default();

        let mut seen: Vec<&str> = Vec::new();
        for doc in &report.documents {
            let r = self.reset_document(&doc.id, now).await?;
            outcome.chunks_reset += r.chunks_reset;
            outcome.documents.extend(r.documents);
            seen.push(&doc.id);
        }
        for chunk in &report.chunks {
            if seen.contains(&chunk.document_id.as_str()) {
                continue;
            }
            if self.reset_chunk(&chunk.id, now).await? {
                outcome.chunks_reset += 1;
                if !outcome.documents.contains(&chunk.document_id) {
                    outcome.documents.push(chunk.document_id.clone());
                }
            }
        }
        Ok(outcome)
    }

    /// Log stuck jobs every `interval`. With `auto_reset`, reset them and
    /// send each affected document id on `redrive`.
    pub fn spawn_poller(
        self: Arc<Self>,
        interval: Duration,
        auto_reset: bool,
        redrive: Option<UnboundedSender<String>>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = unix_now();
                let report = match self.find_stuck(now).await {
                    Ok(r) => r,
                    Err(e) => {
                        error!(error = %e, "stuck-job scan failed");
                        continue;
                    }
                };
                if report.is_empty() {
                    continue;
                }
                for doc in &report.documents {
                    warn!(document_id = %doc.id, status = %doc.status, "stuck document");
                }
                for chunk in &report.chunks {
                    warn!(
                        document_id = %chunk.document_id,
                        chunk_index = chunk.chunk_index,
                        attempt = chunk.attempt,
                        "stuck chunk"
                    );
                }
                if !auto_reset {
                    continue;
                }
                match self.reset_stuck(now).await {
                    Ok(outcome) => {
                        if let Some(tx) = &redrive {
                            for id in outcome.documents {
                                if tx.send(id).is_err() {
                                    warn!("redrive channel closed, stopping stuck-job poller");
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "automatic stuck-job reset failed"),
                }
            }
        })
    }
}
