mod common;

use std::sync::Arc;
use std::time::Duration;

use casechunk::casechunk_core::models::{ChunkStatus, DocumentStatus};
use casechunk::casechunk_core::objects::InMemoryObjectStore;
use casechunk::casechunk_core::store::memory::InMemoryStore;
use casechunk::casechunk_core::store::PipelineStore;
use casechunk::pipeline::{Pipeline, Stage};
use casechunk::unix_now;

use common::{build_pdf, server_error, test_config, FakeOcr};

struct Harness {
    pipeline: Arc<Pipeline>,
    store: Arc<InMemoryStore>,
    objects: Arc<InMemoryObjectStore>,
    ocr: Arc<FakeOcr>,
}

fn harness(pages_per_chunk: u32, concurrency: usize, ocr: FakeOcr) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let objects = Arc::new(InMemoryObjectStore::new());
    let ocr = Arc::new(ocr);
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        objects.clone(),
        ocr.clone(),
        &test_config(pages_per_chunk, concurrency),
    ));
    Harness {
        pipeline,
        store,
        objects,
        ocr,
    }
}

#[tokio::test]
async fn happy_path_merges_remaps_and_cleans_up() {
    let h = harness(25, 5, FakeOcr::new());
    let doc = h.pipeline.ingest(build_pdf(30), "M-100").await.unwrap();
    assert_eq!(doc.total_pages, 30);
    assert_eq!(doc.status, DocumentStatus::Uploaded);

    let done = h.pipeline.process(&doc.id).await.unwrap();
    assert_eq!(done.status, DocumentStatus::OcrComplete);
    assert_eq!(h.ocr.calls(), 2);

    // Global pages follow chunk order; the second chunk starts at page 26.
    let bboxes = h.store.list_bboxes(&doc.id).await.unwrap();
    assert_eq!(bboxes.len(), 30);
    for b in &bboxes {
        assert!(b.text.starts_with(&format!("Page {} ", b.page)), "{}", b.text);
    }
    let p28 = bboxes.iter().find(|b| b.page == 28).unwrap();
    assert_eq!(p28.chunk_index, 1);

    assert!(done.full_text.starts_with("Page 1 call 1\nPage 2 call 1\n"));
    assert!(done.full_text.ends_with("Page 30 call 1\n"));

    // Chunk rows and chunk objects are gone; the uploaded source stays.
    assert!(h.store.list_chunks(&doc.id).await.unwrap().is_empty());
    assert_eq!(h.objects.keys(), vec![doc.source_key.clone()]);

    let pages = h.store.list_page_summaries(&doc.id).await.unwrap();
    assert_eq!(pages.len(), 30);

    let report = h.pipeline.validate(&doc.id).await.unwrap();
    assert!(report.is_healthy);
    assert!(report.missing_pages.is_empty());
}

#[tokio::test]
async fn transient_failures_recover_within_budget() {
    let ocr = FakeOcr::new();
    for first_page in [1, 3, 5, 7, 9] {
        ocr.fail(first_page, vec![server_error(), server_error()]);
    }
    let h = harness(2, 5, ocr);
    let doc = h.pipeline.ingest(build_pdf(10), "M-101").await.unwrap();

    let done = h.pipeline.process(&doc.id).await.unwrap();
    assert_eq!(done.status, DocumentStatus::OcrComplete);
    assert_eq!(h.ocr.calls(), 15);

    let bboxes = h.store.list_bboxes(&doc.id).await.unwrap();
    assert_eq!(bboxes.len(), 10);
    assert!(bboxes.iter().all(|b| b.text.ends_with("call 3")));
    let pages = h.store.list_page_summaries(&doc.id).await.unwrap();
    assert!(pages.iter().all(|p| p.confidence.is_some()));
}

#[tokio::test]
async fn exhausted_chunk_fails_document_and_keeps_chunks() {
    let ocr = FakeOcr::new();
    ocr.fail(3, vec![server_error(), server_error(), server_error()]);
    let h = harness(2, 5, ocr);
    let doc = h.pipeline.ingest(build_pdf(10), "M-102").await.unwrap();

    let failed = h.pipeline.process(&doc.id).await.unwrap();
    assert_eq!(failed.status, DocumentStatus::OcrFailed);
    let err = failed.last_error.unwrap();
    assert!(err.contains("pages 3-4"), "{}", err);

    let chunks = h.store.list_chunks(&doc.id).await.unwrap();
    assert_eq!(chunks.len(), 5);
    let bad = &chunks[1];
    assert_eq!(bad.status, ChunkStatus::Failed);
    assert_eq!(bad.error_kind.as_deref(), Some("server_error"));
    assert_eq!(bad.retry_count, 2);

    let report = h.pipeline.validate(&doc.id).await.unwrap();
    assert_eq!(report.missing_pages, vec![3, 4]);
    assert!(report.is_healthy);

    // Only the failed chunk is OCR'd again.
    let calls_before = h.ocr.calls();
    let retried = h.pipeline.retry(&doc.id, Stage::Ocr).await.unwrap();
    assert_eq!(retried.status, DocumentStatus::OcrComplete);
    assert_eq!(retried.retry_count, 1);
    assert_eq!(h.ocr.calls(), calls_before + 1);
    assert!(h.store.list_chunks(&doc.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_chunks_survive_until_retention_elapses() {
    let ocr = FakeOcr::new();
    ocr.fail(1, vec![common::malformed()]);
    let h = harness(5, 2, ocr);
    let doc = h.pipeline.ingest(build_pdf(10), "M-103").await.unwrap();
    let failed = h.pipeline.process(&doc.id).await.unwrap();
    assert_eq!(failed.status, DocumentStatus::OcrFailed);
    // Terminal errors are not retried.
    assert_eq!(h.ocr.calls(), 2);

    let cleanup = h.pipeline.cleanup();
    let early = cleanup.sweep_retention(unix_now() + 86_400).await.unwrap();
    assert_eq!(early.documents, 0);
    assert_eq!(h.store.list_chunks(&doc.id).await.unwrap().len(), 2);

    let late = cleanup
        .sweep_retention(unix_now() + 8 * 86_400)
        .await
        .unwrap();
    assert_eq!(late.documents, 1);
    assert_eq!(late.rows_deleted, 2);
    assert_eq!(h.objects.keys(), vec![doc.source_key.clone()]);
    assert_eq!(
        h.store.get_document(&doc.id).await.unwrap().unwrap().status,
        DocumentStatus::OcrFailed
    );
}

#[tokio::test]
async fn concurrency_ceiling_holds_across_documents() {
    let h = harness(2, 3, FakeOcr::with_delay(Duration::from_millis(40)));
    let a = h.pipeline.ingest(build_pdf(10), "M-200").await.unwrap();
    let b = h.pipeline.ingest(build_pdf(10), "M-201").await.unwrap();

    let (ra, rb) = tokio::join!(h.pipeline.process(&a.id), h.pipeline.process(&b.id));
    assert_eq!(ra.unwrap().status, DocumentStatus::OcrComplete);
    assert_eq!(rb.unwrap().status, DocumentStatus::OcrComplete);
    assert_eq!(h.ocr.calls(), 10);
    assert!(h.ocr.max_active() <= 3, "max active {}", h.ocr.max_active());
}

#[tokio::test]
async fn dispatch_on_completed_document_is_noop() {
    let h = harness(25, 5, FakeOcr::new());
    let doc = h.pipeline.ingest(build_pdf(3), "M-300").await.unwrap();
    h.pipeline.process(&doc.id).await.unwrap();
    let calls = h.ocr.calls();

    let outcome = h.pipeline.scheduler().dispatch(&doc.id).await.unwrap();
    assert_eq!(outcome.dispatched, 0);
    assert!(!outcome.ready_for_merge);

    let again = h.pipeline.process(&doc.id).await.unwrap();
    assert_eq!(again.status, DocumentStatus::OcrComplete);
    assert_eq!(h.ocr.calls(), calls);
}

#[tokio::test]
async fn late_result_after_reset_is_discarded() {
    let ocr = FakeOcr::new();
    let gate = ocr.gate(1);
    let h = harness(25, 5, ocr);
    let doc = h.pipeline.ingest(build_pdf(3), "M-400").await.unwrap();

    let pipeline = h.pipeline.clone();
    let doc_id = doc.id.clone();
    let run = tokio::spawn(async move { pipeline.process(&doc_id).await });

    gate.entered.notified().await;
    let chunk = h.store.list_chunks(&doc.id).await.unwrap().remove(0);
    assert_eq!(chunk.status, ChunkStatus::Processing);
    assert_eq!(chunk.attempt, 1);

    // Six minutes on, the chunk counts as stuck.
    let monitor = h.pipeline.monitor();
    let later = unix_now() + 6 * 60;
    assert_eq!(monitor.find_stuck(later).await.unwrap().chunks.len(), 1);
    assert!(monitor.reset_chunk(&chunk.id, later).await.unwrap());
    assert!(!monitor.reset_chunk(&chunk.id, later).await.unwrap());

    gate.release.notify_one();
    let done = run.await.unwrap().unwrap();
    assert_eq!(done.status, DocumentStatus::OcrComplete);
    assert_eq!(h.ocr.calls(), 2);

    let bboxes = h.store.list_bboxes(&doc.id).await.unwrap();
    assert_eq!(bboxes.len(), 3);
    assert!(bboxes.iter().all(|b| b.text.ends_with("call 2")));
    assert_eq!(h.objects.keys(), vec![doc.source_key.clone()]);
}

#[tokio::test]
async fn orphaned_objects_are_reclaimed_after_retention() {
    let h = harness(25, 5, FakeOcr::new());
    let doc = h.pipeline.ingest(build_pdf(3), "M-500").await.unwrap();
    h.pipeline.process(&doc.id).await.unwrap();

    let now = unix_now();
    let stale = format!("ocr-chunks/M-500/{}/0.a7.json", doc.id);
    let fresh = "ocr-chunks/M-500/unknown-doc/source/0.pdf".to_string();
    h.objects.put_at(&stale, b"{}", now - 30 * 86_400);
    h.objects.put_at(&fresh, b"%PDF", now);

    let report = h.pipeline.cleanup().detect_orphans(now).await.unwrap();
    assert_eq!(report.orphans.len(), 2);
    assert_eq!(report.objects_deleted, 1);
    assert!(!h.objects.contains(&stale));
    assert!(h.objects.contains(&fresh));
}

#[tokio::test]
async fn malformed_upload_is_rejected() {
    let h = harness(25, 5, FakeOcr::new());
    assert!(h.pipeline.ingest(b"not a pdf".to_vec(), "M-600").await.is_err());
    assert!(h.store.list_documents(None).await.unwrap().is_empty());
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn merge_waits_for_every_chunk_to_finish() {
    let ocr = FakeOcr::new();
    let gate = ocr.gate(3);
    let h = harness(2, 5, ocr);
    let doc = h.pipeline.ingest(build_pdf(6), "M-700").await.unwrap();

    let pipeline = h.pipeline.clone();
    let doc_id = doc.id.clone();
    let run = tokio::spawn(async move { pipeline.process(&doc_id).await });

    gate.entered.notified().await;
    let store = h.store.clone();
    let id = doc.id.clone();
    wait_until(|| {
        let store = store.clone();
        let id = id.clone();
        async move {
            let chunks = store.list_chunks(&id).await.unwrap();
            chunks[0].status == ChunkStatus::Completed && chunks[2].status == ChunkStatus::Completed
        }
    })
    .await;

    let held = h.store.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(held.status, DocumentStatus::ChunksProcessing);
    assert_eq!(
        h.store.list_chunks(&doc.id).await.unwrap()[1].status,
        ChunkStatus::Processing
    );
    assert!(h.store.list_bboxes(&doc.id).await.unwrap().is_empty());
    assert!(h.store.list_page_summaries(&doc.id).await.unwrap().is_empty());

    gate.release.notify_one();
    let done = run.await.unwrap().unwrap();
    assert_eq!(done.status, DocumentStatus::OcrComplete);
    assert_eq!(h.store.list_bboxes(&doc.id).await.unwrap().len(), 6);
}

#[tokio::test]
async fn queued_document_is_not_reported_stuck() {
    let ocr = FakeOcr::new();
    let gate = ocr.gate(1);
    let h = harness(25, 1, ocr);
    let busy = h.pipeline.ingest(build_pdf(3), "M-800").await.unwrap();
    let queued = h.pipeline.ingest(build_pdf(3), "M-801").await.unwrap();

    let pipeline = h.pipeline.clone();
    let busy_id = busy.id.clone();
    let run_busy = tokio::spawn(async move { pipeline.process(&busy_id).await });
    gate.entered.notified().await;

    let pipeline = h.pipeline.clone();
    let queued_id = queued.id.clone();
    let run_queued = tokio::spawn(async move { pipeline.process(&queued_id).await });
    let store = h.store.clone();
    let id = queued.id.clone();
    wait_until(|| {
        let store = store.clone();
        let id = id.clone();
        async move {
            let doc = store.get_document(&id).await.unwrap().unwrap();
            doc.status == DocumentStatus::ChunksProcessing
        }
    })
    .await;

    // The single permit is held past the threshold; the queued chunk is
    // still pending, so only the busy document counts as stuck.
    let later = unix_now() + 6 * 60;
    let stuck = h.pipeline.monitor().find_stuck(later).await.unwrap();
    let ids: Vec<&str> = stuck.documents.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec![busy.id.as_str()]);
    assert_eq!(stuck.chunks.len(), 1);
    assert_eq!(stuck.chunks[0].document_id, busy.id);

    gate.release.notify_one();
    assert_eq!(
        run_busy.await.unwrap().unwrap().status,
        DocumentStatus::OcrComplete
    );
    let finished = run_queued.await.unwrap().unwrap();
    assert_eq!(finished.status, DocumentStatus::OcrComplete);
    assert_eq!(finished.retry_count, 0);
}
