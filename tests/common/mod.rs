#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use tokio::sync::Notify;

use casechunk::config::Config;
use casechunk::casechunk_core::error::ChunkOcrError;
use casechunk::casechunk_core::models::{ChunkResult, OcrBox, OcrPage};
use casechunk::casechunk_core::ocr::OcrProvider;

/// A PDF whose page `n` draws the text "Page n".
pub fn build_pdf(pages: u32) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });
    let mut kids: Vec<Object> = Vec::new();
    for n in 1..=pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(format!("Page {}", n))]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

/// Global page numbers drawn on each page of a chunk PDF, in page order.
pub fn page_labels(pdf: &[u8]) -> Vec<u32> {
    let doc = Document::load_mem(pdf).unwrap();
    doc.get_pages()
        .values()
        .map(|&page_id| {
            let raw = doc.get_page_content(page_id).unwrap();
            let content = Content::decode(&raw).unwrap();
            content
                .operations
                .iter()
                .filter(|op| op.operator == "Tj")
                .find_map(|op| match op.operands.first() {
                    Some(Object::String(bytes, _)) => String::from_utf8_lossy(bytes)
                        .trim_start_matches("Page ")
                        .parse()
                        .ok(),
                    _ => None,
                })
                .unwrap()
        })
        .collect()
}

/// Blocks the first OCR call for one chunk until released.
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Scriptable OCR provider. Chunks are identified by the global number of
/// their first page; box text is "Page {n} call {k}" where `k` counts calls
/// for that chunk.
#[derive(Default)]
pub struct FakeOcr {
    pub delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    per_chunk: Mutex<HashMap<u32, usize>>,
    failures: Mutex<HashMap<u32, VecDeque<ChunkOcrError>>>,
    gates: Mutex<HashMap<u32, Arc<Gate>>>,
}

impl FakeOcr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Fail the next calls for the chunk starting at `first_page`.
    pub fn fail(&self, first_page: u32, errors: Vec<ChunkOcrError>) {
        self.failures
            .lock()
            .unwrap()
            .entry(first_page)
            .or_default()
            .extend(errors);
    }

    pub fn gate(&self, first_page: u32) -> Arc<Gate> {
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        });
        self.gates.lock().unwrap().insert(first_page, gate.clone());
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl OcrProvider for FakeOcr {
    fn name(&self) -> &str {
        "fake"
    }

    async fn process_pages(&self, pdf: &[u8]) -> Result<ChunkResult, ChunkOcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let labels = page_labels(pdf);
        let first = labels[0];
        let call = {
            let mut per_chunk = self.per_chunk.lock().unwrap();
            let n = per_chunk.entry(first).or_insert(0);
            *n += 1;
            *n
        };

        let gate = self.gates.lock().unwrap().remove(&first);
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&first)
            .and_then(|q| q.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }

        let mut result = ChunkResult::default();
        for (i, global) in labels.iter().enumerate() {
            let local = i as u32 + 1;
            let text = format!("Page {} call {}", global, call);
            result.pages.push(OcrPage {
                page: local,
                text: format!("{}\n", text),
                confidence: 0.95,
            });
            result.boxes.push(OcrBox {
                page: local,
                x: 0.1,
                y: 0.1,
                width: 0.5,
                height: 0.05,
                text,
                confidence: 0.95,
                reading_order: 0,
            });
        }
        Ok(result)
    }
}

/// Defaults with small chunks and near-instant backoff.
pub fn test_config(pages_per_chunk: u32, concurrency: usize) -> Config {
    let mut config = Config::with_db_path("unused.db");
    config.chunking.pages_per_chunk = pages_per_chunk;
    config.ocr.concurrency = concurrency;
    config.ocr.backoff_base_ms = 1;
    config.ocr.backoff_max_secs = 1;
    config.ocr.timeout_secs = 10;
    config
}

pub fn server_error() -> ChunkOcrError {
    ChunkOcrError::Server {
        status: 503,
        message: "service unavailable".into(),
    }
}

pub fn malformed() -> ChunkOcrError {
    ChunkOcrError::MalformedInput("HTTP 422: unreadable page".into())
}
