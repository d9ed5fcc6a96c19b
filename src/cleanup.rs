//! Chunk cleanup service.
//!
//! Chunk rows and their storage objects are scaffolding: once a document is
//! merged they are no longer needed. Three operations reclaim them:
//!
//! - [`ChunkCleanupService::after_success`] right after `ocr_complete`
//! - [`ChunkCleanupService::sweep_retention`] for terminal documents whose
//!   chunks outlived the retention window (the only path that reclaims
//!   `ocr_failed` chunks)
//! - [`ChunkCleanupService::detect_orphans`] for objects under the chunk
//!   root that no chunk row accounts for
//!
//! Every operation is best-effort. Failures are collected as
//! [`CleanupError`]s in the report and logged; document status is never
//! touched.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use casechunk_core::error::CleanupError;
use casechunk_core::layout::{self, CHUNK_ROOT};
use casechunk_core::models::{ChunkStatus, Document, DocumentStatus};
use casechunk_core::objects::ObjectStore;
use casechunk_core::store::PipelineStore;

use crate::unix_now;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub documents: usize,
    pub objects_deleted: usize,
    pub rows_deleted: usize,
    /// Orphan object keys found (deleted or not).
    pub orphans: Vec<String>,
    pub errors: Vec<CleanupError>,
}

impl CleanupReport {
    fn absorb(&mut self, other: CleanupReport) {
        self.documents += other.documents;
        self.objects_deleted += other.objects_deleted;
        self.rows_deleted += other.rows_deleted;
        self.orphans.extend(other.orphans);
        self.errors.extend(other.errors);
    }
}

pub struct ChunkCleanupService {
    store: Arc<dyn PipelineStore>,
    objects: Arc<dyn ObjectStore>,
    retention_secs: i64,
}

impl ChunkCleanupService {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        objects: Arc<dyn ObjectStore>,
        retention_secs: i64,
    ) -> Self {
        Self {
            store,
            objects,
            retention_secs,
        }
    }

    /// Remove chunk rows and objects of a document that just reached
    /// `ocr_complete`. Other statuses are left alone.
    pub async fn after_success(&self, doc: &Document) -> CleanupReport {
        if doc.status != DocumentStatus::OcrComplete {
            warn!(
                document_id = %doc.id,
                status = %doc.status,
                "post-success cleanup skipped"
            );
            return CleanupReport::default();
        }
        let report = self.discard(doc).await;
        info!(
            document_id = %doc.id,
            objects = report.objects_deleted,
            rows = report.rows_deleted,
            errors = report.errors.len(),
            "chunk artifacts removed"
        );
        report
    }

    /// Purge every terminal document whose chunks are older than the
    /// retention window.
    pub async fn sweep_retention(&self, now: i64) -> Result<CleanupReport> {
        let cutoff = now - self.retention_secs;
        let expired = self.store.find_expired_documents(cutoff).await?;

        let mut report = CleanupReport::default();
        for doc in &expired {
            info!(
                document_id = %doc.id,
                status = %doc.status,
                "retention elapsed, purging chunks"
            );
            report.absorb(self.discard(doc).await);
        }
        Ok(report)
    }

    /// Find objects under the chunk root with no matching chunk row.
    /// Orphans older than the retention window are deleted; newer ones are
    /// only reported.
    pub async fn detect_orphans(&self, now: i64) -> Result<CleanupReport> {
        let listed = self.objects.list(CHUNK_ROOT).await?;

        // ocr-chunks/{matter}/{document}/...
        let mut by_document: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for meta in listed {
            let document_id = meta
                .key
                .strip_prefix(CHUNK_ROOT)
                .and_then(|rest| rest.split('/').nth(1))
                .unwrap_or_default()
                .to_string();
            by_document.entry(document_id).or_default().push(meta);
        }

        let mut report = CleanupReport::default();
        for (document_id, objects) in by_document {
            let known = self.referenced_keys(&document_id).await?;
            for meta in objects {
                if known.contains(&meta.key) {
                    continue;
                }
                let age = now - meta.last_modified;
                if age > self.retention_secs {
                    warn!(key = %meta.key, age_secs = age, "deleting orphan chunk object");
                    match self.objects.delete(&meta.key).await {
                        Ok(()) => report.objects_deleted += 1,
                        Err(e) => report.errors.push(CleanupError::Object {
                            key: meta.key.clone(),
                            message: e.to_string(),
                        }),
                    }
                } else {
                    warn!(key = %meta.key, age_secs = age, "orphan chunk object within retention");
                }
                report.orphans.push(meta.key);
            }
        }

        for e in &report.errors {
            error!(error = %e, "orphan cleanup failed");
        }
        Ok(report)
    }

    /// Run the retention sweep and orphan detection every `interval`.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = unix_now();
                match self.sweep_retention(now).await {
                    Ok(r) => info!(
                        documents = r.documents,
                        objects = r.objects_deleted,
                        rows = r.rows_deleted,
                        "retention sweep finished"
                    ),
                    Err(e) => error!(error = %e, "retention sweep failed"),
                }
                match self.detect_orphans(now).await {
                    Ok(r) => info!(
                        orphans = r.orphans.len(),
                        deleted = r.objects_deleted,
                        "orphan scan finished"
                    ),
                    Err(e) => error!(error = %e, "orphan scan failed"),
                }
            }
        })
    }

    /// Keys the chunk rows of `document_id` account for, including the
    /// result object of an attempt still being written.
    async fn referenced_keys(&self, document_id: &str) -> Result<HashSet<String>> {
        if document_id.is_empty() {
            return Ok(HashSet::new());
        }
        let Some(doc) = self.store.get_document(document_id).await? else {
            return Ok(HashSet::new());
        };
        let mut keys = HashSet::new();
        for chunk in self.store.list_chunks(document_id).await? {
            if chunk.status == ChunkStatus::Processing {
                keys.insert(layout::chunk_result_key(
                    &doc.matter_id,
                    &doc.id,
                    chunk.chunk_index,
                    chunk.attempt,
                ));
            }
            keys.extend(chunk.result_key);
            keys.insert(chunk.source_key);
        }
        Ok(keys)
    }

    /// Delete every chunk object and row of `doc`, whatever its status.
    pub async fn discard(&self, doc: &Document) -> CleanupReport {
        let mut report = CleanupReport {
            documents: 1,
            ..Default::default()
        };
        let prefix = layout::chunk_prefix(&doc.matter_id, &doc.id);

        match self.objects.list(&prefix).await {
            Ok(listed) => {
                for meta in listed {
                    match self.objects.delete(&meta.key).await {
                        Ok(()) => report.objects_deleted += 1,
                        Err(e) => report.errors.push(CleanupError::Object {
                            key: meta.key,
                            message: e.to_string(),
                        }),
                    }
                }
            }
            Err(e) => report.errors.push(CleanupError::Object {
                key: prefix.clone(),
                message: e.to_string(),
            }),
        }

        match self.store.delete_chunks(&doc.id).await {
            Ok(n) => report.rows_deleted = n,
            Err(e) => report.errors.push(CleanupError::Rows {
                document_id: doc.id.clone(),
                message: e.to_string(),
            }),
        }

        for e in &report.errors {
            error!(document_id = %doc.id, error = %e, "chunk cleanup failed");
        }
        report
    }
}
