//! Integrity validator.
//!
//! Gathers a document's merged boxes, anchored references and chunk rows
//! from the store and runs [`check_integrity`] over them. Problems are
//! logged as warnings and returned in the report; nothing is repaired.
//!
//! Besides the post-merge check and on-demand runs, a timer task re-checks
//! every `ocr_complete` document, since mentions and citations are written
//! by later stages.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use casechunk_core::error::ReferenceIntegrityError;
use casechunk_core::integrity::{check_integrity, IntegrityInput, IntegrityReport};
use casechunk_core::models::DocumentStatus;
use casechunk_core::store::PipelineStore;

/// Outcome of one pass over the completed documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegritySweep {
    pub checked: usize,
    /// Ids of documents whose report is unhealthy.
    pub unhealthy: Vec<String>,
}

pub struct IntegrityValidator {
    store: Arc<dyn PipelineStore>,
}

impl IntegrityValidator {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    pub async fn validate(&self, document_id: &str) -> Result<IntegrityReport> {
        let doc = self
            .store
            .get_document(document_id)
            .await?
            .with_context(|| format!("document {} not found", document_id))?;

        let bboxes = self.store.list_bboxes(document_id).await?;
        let mentions = self.store.list_mentions(document_id).await?;
        let citations = self.store.list_citations(document_id).await?;
        let chunks = self.store.list_chunks(document_id).await?;
        let pages = self.store.list_page_summaries(document_id).await?;

        let report = check_integrity(&IntegrityInput {
            document_id,
            document_status: doc.status,
            bboxes: &bboxes,
            mentions: &mentions,
            citations: &citations,
            chunks: &chunks,
            pages: &pages,
        });

        for invalid in &report.invalid_mentions {
            warn!(
                document_id,
                reference_id = %invalid.reference_id,
                kind = ?invalid.kind,
                problem = ?invalid.problem,
                "invalid bbox reference"
            );
        }
        for orphan in &report.orphan_chunks {
            warn!(
                document_id,
                chunk_index = orphan.chunk_index,
                reason = ?orphan.reason,
                "orphan chunk"
            );
        }
        if !report.missing_pages.is_empty() {
            warn!(
                document_id,
                missing = report.missing_pages.len(),
                "document has pages without OCR output"
            );
        }
        info!(
            document_id,
            valid_mentions = report.valid_mentions,
            healthy = report.is_healthy,
            "integrity check finished"
        );

        Ok(report)
    }

    /// Validate every `ocr_complete` document.
    pub async fn validate_completed(&self) -> Result<IntegritySweep> {
        let docs = self
            .store
            .list_documents(Some(DocumentStatus::OcrComplete))
            .await?;
        let mut sweep = IntegritySweep::default();
        for doc in docs {
            let report = self.validate(&doc.id).await?;
            sweep.checked += 1;
            if !report.is_healthy {
                sweep.unhealthy.push(doc.id);
            }
        }
        Ok(sweep)
    }

    /// Run [`Self::validate_completed`] every `interval`.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.validate_completed().await {
                    Ok(sweep) if sweep.unhealthy.is_empty() => {
                        info!(checked = sweep.checked, "integrity sweep finished")
                    }
                    Ok(sweep) => warn!(
                        checked = sweep.checked,
                        unhealthy = ?sweep.unhealthy,
                        "integrity sweep found unhealthy documents"
                    ),
                    Err(e) => error!(error = %e, "integrity sweep failed"),
                }
            }
        })
    }
}

/// The error a post-merge check raises for an unhealthy report.
pub fn report_error(report: &IntegrityReport) -> Option<ReferenceIntegrityError> {
    if report.is_healthy {
        return None;
    }
    Some(ReferenceIntegrityError {
        document_id: report.document_id.clone(),
        invalid_references: report.invalid_mentions.len(),
        orphan_chunks: report.orphan_chunks.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use casechunk_core::models::{
        BoundingBox, Document, DocumentStatus, EntityMention, PageStatus, PageSummary,
    };
    use casechunk_core::merge::MergedDocument;
    use casechunk_core::store::memory::InMemoryStore;

    async fn seeded() -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_document(&Document {
                id: "doc-1".into(),
                matter_id: "m-1".into(),
                total_pages: 2,
                status: DocumentStatus::OcrComplete,
                retry_count: 0,
                source_key: "documents/m-1/doc-1.pdf".into(),
                full_text: String::new(),
                last_error: None,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();
        store
            .persist_merge(
                &MergedDocument {
                    document_id: "doc-1".into(),
                    total_pages: 2,
                    full_text: "Plaintiff alleges".into(),
                    bboxes: vec![BoundingBox {
                        id: "b-1".into(),
                        document_id: "doc-1".into(),
                        page: 1,
                        x: 0.1,
                        y: 0.1,
                        width: 0.3,
                        height: 0.05,
                        text: "Plaintiff".into(),
                        confidence: 0.97,
                        reading_order: 0,
                        chunk_index: 0,
                    }],
                    pages: vec![
                        PageSummary {
                            page: 1,
                            status: PageStatus::Ok,
                            confidence: Some(0.97),
                        },
                        PageSummary {
                            page: 2,
                            status: PageStatus::Missing,
                            confidence: None,
                        },
                    ],
                    chunk_links: Vec::new(),
                },
                5,
            )
            .await
            .unwrap();
        store
    }

    fn mention(id: &str, bbox: &str) -> EntityMention {
        EntityMention {
            id: id.into(),
            document_id: "doc-1".into(),
            entity: "Acme Corp".into(),
            page: 1,
            bbox_ids: vec![bbox.into()],
        }
    }

    #[tokio::test]
    async fn dangling_mention_makes_report_unhealthy() {
        let store = seeded().await;
        store.insert_mention(&mention("m-ok", "b-1")).await.unwrap();
        store.insert_mention(&mention("m-bad", "b-404")).await.unwrap();

        let report = IntegrityValidator::new(store).validate("doc-1").await.unwrap();
        assert_eq!(report.valid_mentions, 1);
        assert_eq!(report.invalid_mentions.len(), 1);
        assert_eq!(report.invalid_mentions[0].reference_id, "m-bad");
        assert_eq!(report.missing_pages, vec![2]);
        assert!(!report.is_healthy);

        let err = report_error(&report).unwrap();
        assert_eq!(err.invalid_references, 1);
    }

    #[tokio::test]
    async fn sweep_checks_only_completed_documents() {
        let store = seeded().await;
        store.insert_mention(&mention("m-bad", "b-404")).await.unwrap();
        store
            .insert_document(&Document {
                id: "doc-2".into(),
                matter_id: "m-1".into(),
                total_pages: 1,
                status: DocumentStatus::ChunksProcessing,
                retry_count: 0,
                source_key: "documents/m-1/doc-2.pdf".into(),
                full_text: String::new(),
                last_error: None,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();

        let validator = Arc::new(IntegrityValidator::new(store));
        let sweep = validator.validate_completed().await.unwrap();
        assert_eq!(sweep.checked, 1);
        assert_eq!(sweep.unhealthy, vec!["doc-1".to_string()]);
    }

    #[tokio::test]
    async fn missing_pages_alone_stay_healthy() {
        let store = seeded().await;
        store.insert_mention(&mention("m-ok", "b-1")).await.unwrap();
        let report = IntegrityValidator::new(store).validate("doc-1").await.unwrap();
        assert!(report.is_healthy);
        assert!(report_error(&report).is_none());
    }
}
