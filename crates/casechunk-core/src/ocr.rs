//! OCR provider trait.
//!
//! A provider takes the bytes of one split PDF covering a chunk's page range
//! and returns text, per-page confidence and bounding boxes numbered with
//! chunk-local pages (`1..=page_count`). Coordinates are normalized to the
//! page, in `0.0..=1.0`.

use async_trait::async_trait;

use crate::error::ChunkOcrError;
use crate::models::ChunkResult;

#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Provider name for logs and status output.
    fn name(&self) -> &str;

    /// OCR one chunk. Implementations should not retry internally; the
    /// scheduler owns the retry budget.
    async fn process_pages(&self, pdf: &[u8]) -> Result<ChunkResult, ChunkOcrError>;
}
