//! Pipeline driver.
//!
//! Owns one instance of every service and moves a document through its
//! lifecycle:
//!
//! ```text
//! uploaded → splitting → chunks_processing → merging → ocr_complete
//!                 │              │               │
//!                 └──────────────┴───────────────┴──→ ocr_failed
//! ```
//!
//! Each stage runs only in the caller that won the transition into it. A
//! caller that finds a document mid-stage (another process, or a crash)
//! returns without touching it; the stuck-job monitor is what rolls an
//! abandoned stage back so it can be re-driven.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use casechunk_core::error::{MergeIntegrityError, SplitError};
use casechunk_core::integrity::IntegrityReport;
use casechunk_core::layout;
use casechunk_core::models::{ChunkStatus, Document, DocumentStatus};
use casechunk_core::objects::ObjectStore;
use casechunk_core::ocr::OcrProvider;
use casechunk_core::store::PipelineStore;

use crate::cleanup::ChunkCleanupService;
use crate::config::Config;
use crate::merger::OcrResultMerger;
use crate::monitor::{ResetOutcome, StuckJobMonitor};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::scheduler::ChunkScheduler;
use crate::splitter::{count_pages, PageSplitter};
use crate::sqlite_store::SqliteStore;
use crate::validator::{report_error, IntegrityValidator};
use crate::{db, objects_fs, objects_s3, ocr_http, unix_now};

/// Stage a failed document is retried from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Re-split from the source PDF, discarding all chunks.
    Split,
    /// Requeue failed chunks only; completed chunks are kept.
    Ocr,
    /// Re-run the merge over the existing terminal chunks.
    Merge,
}

pub struct Pipeline {
    store: Arc<dyn PipelineStore>,
    objects: Arc<dyn ObjectStore>,
    splitter: PageSplitter,
    scheduler: ChunkScheduler,
    merger: OcrResultMerger,
    validator: Arc<IntegrityValidator>,
    cleanup: Arc<ChunkCleanupService>,
    monitor: Arc<StuckJobMonitor>,
    progress: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        objects: Arc<dyn ObjectStore>,
        ocr: Arc<dyn OcrProvider>,
        config: &Config,
    ) -> Self {
        Self::with_progress(store, objects, ocr, config, Arc::new(NoProgress))
    }

    pub fn with_progress(
        store: Arc<dyn PipelineStore>,
        objects: Arc<dyn ObjectStore>,
        ocr: Arc<dyn OcrProvider>,
        config: &Config,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        let scheduler = ChunkScheduler::new(
            store.clone(),
            objects.clone(),
            ocr,
            config.ocr.concurrency,
            config.ocr.retry_policy(),
            config.ocr.timeout(),
        )
        .with_progress(progress.clone());

        Self {
            splitter: PageSplitter::new(
                store.clone(),
                objects.clone(),
                config.chunking.pages_per_chunk,
            ),
            scheduler,
            merger: OcrResultMerger::new(store.clone(), objects.clone()),
            validator: Arc::new(IntegrityValidator::new(store.clone())),
            cleanup: Arc::new(ChunkCleanupService::new(
                store.clone(),
                objects.clone(),
                config.retention.window_secs(),
            )),
            monitor: Arc::new(StuckJobMonitor::new(
                store.clone(),
                config.monitor.threshold_secs(),
            )),
            store,
            objects,
            progress,
        }
    }

    /// Wire up the SQLite store, the configured object store and OCR provider.
    pub async fn open(config: &Config, progress: Arc<dyn ProgressReporter>) -> Result<Self> {
        let pool = db::connect(config).await?;
        let store: Arc<dyn PipelineStore> = Arc::new(SqliteStore::new(pool));
        let objects: Arc<dyn ObjectStore> = match config.storage.backend.as_str() {
            "fs" => Arc::new(objects_fs::FsObjectStore::from_config(&config.storage)),
            "s3" => Arc::new(objects_s3::S3ObjectStore::from_config(&config.storage)?),
            other => bail!("Unknown storage backend: {}", other),
        };
        let ocr = ocr_http::create_provider(&config.ocr)?;
        Ok(Self::with_progress(store, objects, ocr, config, progress))
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &ChunkScheduler {
        &self.scheduler
    }

    pub fn cleanup(&self) -> &Arc<ChunkCleanupService> {
        &self.cleanup
    }

    pub fn monitor(&self) -> &Arc<StuckJobMonitor> {
        &self.monitor
    }

    pub fn validator(&self) -> &Arc<IntegrityValidator> {
        &self.validator
    }

    async fn load(&self, document_id: &str) -> Result<Document> {
        self.store
            .get_document(document_id)
            .await?
            .with_context(|| format!("document {} not found", document_id))
    }

    /// Store an uploaded PDF and register it as `uploaded`.
    pub async fn ingest(&self, pdf: Vec<u8>, matter_id: &str) -> Result<Document> {
        if matter_id.is_empty() || matter_id.contains('/') {
            bail!("invalid matter id: '{}'", matter_id);
        }
        let (pdf, total_pages) = tokio::task::spawn_blocking(move || {
            let pages = count_pages(&pdf);
            (pdf, pages)
        })
        .await?;
        let total_pages = total_pages?;

        let id = uuid::Uuid::new_v4().to_string();
        let source_key = layout::document_source_key(matter_id, &id);
        self.objects
            .put(&source_key, &pdf)
            .await
            .with_context(|| format!("Failed to store source {}", source_key))?;

        let now = unix_now();
        let doc = Document {
            id,
            matter_id: matter_id.to_string(),
            total_pages,
            status: DocumentStatus::Uploaded,
            retry_count: 0,
            source_key,
            full_text: String::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_document(&doc).await?;
        info!(
            document_id = %doc.id,
            matter_id,
            pages = total_pages,
            bytes = pdf.len(),
            "document ingested"
        );
        Ok(doc)
    }

    /// Drive `document_id` as far as it can go and return its final state.
    pub async fn process(&self, document_id: &str) -> Result<Document> {
        let doc = self.load(document_id).await?;
        match doc.status {
            DocumentStatus::Uploaded => {
                if self
                    .store
                    .transition_document(
                        document_id,
                        DocumentStatus::Uploaded,
                        DocumentStatus::Splitting,
                        unix_now(),
                    )
                    .await?
                {
                    self.run_split(&doc).await?;
                }
            }
            DocumentStatus::ChunksProcessing => {}
            other => {
                info!(document_id, status = %other, "nothing to drive");
                return Ok(doc);
            }
        }

        let doc = self.load(document_id).await?;
        if doc.status != DocumentStatus::ChunksProcessing {
            return Ok(doc);
        }

        let outcome = self.scheduler.dispatch(document_id).await?;
        if outcome.ready_for_merge {
            self.run_merge(document_id).await?;
        }
        self.load(document_id).await
    }

    async fn run_split(&self, doc: &Document) -> Result<()> {
        let chunks = match self.splitter.split(doc, unix_now()).await {
            Ok(chunks) => chunks,
            Err(e) => {
                if let Some(split_err) = e.downcast_ref::<SplitError>() {
                    error!(document_id = %doc.id, error = %split_err, "split failed");
                    self.fail(&doc.id, &format!("split failed: {}", split_err))
                        .await?;
                    return Ok(());
                }
                return Err(e);
            }
        };

        self.progress.report(ProgressEvent::Split {
            document_id: doc.id.clone(),
            chunks: chunks.len() as u32,
        });
        if !self
            .store
            .transition_document(
                &doc.id,
                DocumentStatus::Splitting,
                DocumentStatus::ChunksProcessing,
                unix_now(),
            )
            .await?
        {
            warn!(document_id = %doc.id, "document left splitting while it was being split");
        }
        Ok(())
    }

    /// Merge, validate and finish a document this caller moved to `merging`.
    async fn run_merge(&self, document_id: &str) -> Result<()> {
        self.progress.report(ProgressEvent::Merging {
            document_id: document_id.to_string(),
        });

        let merged = match self.merger.merge(document_id, unix_now()).await {
            Ok(merged) => merged,
            Err(e) => {
                if let Some(merge_err) = e.downcast_ref::<MergeIntegrityError>() {
                    error!(document_id, error = %merge_err, "merge failed");
                    self.fail(document_id, &format!("merge failed: {}", merge_err))
                        .await?;
                    return Ok(());
                }
                return Err(e);
            }
        };

        let report = self.validator.validate(document_id).await?;
        if let Some(err) = report_error(&report) {
            self.fail(document_id, &err.to_string()).await?;
            return Ok(());
        }

        if !merged.missing_pages().is_empty() {
            let ranges = self.failed_ranges(document_id).await?;
            self.fail(document_id, &format!("pages without OCR output: {}", ranges))
                .await?;
            return Ok(());
        }

        if self
            .store
            .transition_document(
                document_id,
                DocumentStatus::Merging,
                DocumentStatus::OcrComplete,
                unix_now(),
            )
            .await?
        {
            let doc = self.load(document_id).await?;
            info!(document_id, pages = doc.total_pages, "OCR complete");
            self.progress.report(ProgressEvent::Finished {
                document_id: document_id.to_string(),
                status: doc.status.to_string(),
            });
            self.cleanup.after_success(&doc).await;
        }
        Ok(())
    }

    async fn failed_ranges(&self, document_id: &str) -> Result<String> {
        let described: Vec<String> = self
            .store
            .list_chunks(document_id)
            .await?
            .into_iter()
            .filter(|c| c.status == ChunkStatus::Failed)
            .map(|c| {
                format!(
                    "pages {}-{} ({})",
                    c.first_page,
                    c.last_page,
                    c.last_error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        Ok(described.join("; "))
    }

    async fn fail(&self, document_id: &str, reason: &str) -> Result<()> {
        if self
            .store
            .fail_document(document_id, reason, unix_now())
            .await?
        {
            warn!(document_id, reason, "document failed");
            self.progress.report(ProgressEvent::Finished {
                document_id: document_id.to_string(),
                status: DocumentStatus::OcrFailed.to_string(),
            });
        }
        Ok(())
    }

    /// Re-run a failed document from `stage`.
    pub async fn retry(&self, document_id: &str, stage: Stage) -> Result<Document> {
        let doc = self.load(document_id).await?;
        if doc.status != DocumentStatus::OcrFailed {
            bail!(
                "document {} is {}, only ocr_failed documents can be retried",
                document_id,
                doc.status
            );
        }
        let now = unix_now();

        match stage {
            Stage::Split => {
                self.cleanup.discard(&doc).await;
                self.recover(&doc, DocumentStatus::Uploaded, now).await?;
                self.process(document_id).await
            }
            Stage::Ocr => {
                if self.store.list_chunks(document_id).await?.is_empty() {
                    bail!(
                        "document {} has no chunks left; retry from the split stage",
                        document_id
                    );
                }
                let requeued = self.store.requeue_failed_chunks(document_id, now).await?;
                info!(document_id, chunks = requeued, "failed chunks requeued");
                self.recover(&doc, DocumentStatus::ChunksProcessing, now)
                    .await?;
                self.process(document_id).await
            }
            Stage::Merge => {
                self.recover(&doc, DocumentStatus::Merging, now).await?;
                self.run_merge(document_id).await?;
                self.load(document_id).await
            }
        }
    }

    async fn recover(&self, doc: &Document, to: DocumentStatus, now: i64) -> Result<()> {
        if !self
            .store
            .recover_document(&doc.id, DocumentStatus::OcrFailed, to, now)
            .await?
        {
            bail!("document {} changed status during retry", doc.id);
        }
        Ok(())
    }

    pub async fn validate(&self, document_id: &str) -> Result<IntegrityReport> {
        self.validator.validate(document_id).await
    }

    pub async fn reset_document(&self, document_id: &str) -> Result<ResetOutcome> {
        self.monitor.reset_document(document_id, unix_now()).await
    }

    pub async fn reset_chunk(&self, chunk_id: &str) -> Result<bool> {
        self.monitor.reset_chunk(chunk_id, unix_now()).await
    }

    /// Re-drive every document id received on `rx`.
    pub fn spawn_redrive(
        self: Arc<Self>,
        mut rx: UnboundedReceiver<String>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(document_id) = rx.recv().await {
                let pipeline = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = pipeline.process(&document_id).await {
                        error!(document_id = %document_id, error = %e, "re-drive failed");
                    }
                });
            }
        })
    }
}
