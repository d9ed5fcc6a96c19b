//! Core data models used throughout casechunk.
//!
//! These types represent the documents, chunks, bounding boxes and reference
//! links that flow through the split → OCR → merge → validate pipeline.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Lifecycle status of a [`Document`].
///
/// ```text
/// uploaded → splitting → chunks_processing → merging → ocr_complete
///                                                   ↘ ocr_failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Splitting,
    ChunksProcessing,
    Merging,
    OcrComplete,
    OcrFailed,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Splitting => "splitting",
            Self::ChunksProcessing => "chunks_processing",
            Self::Merging => "merging",
            Self::OcrComplete => "ocr_complete",
            Self::OcrFailed => "ocr_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(Self::Uploaded),
            "splitting" => Some(Self::Splitting),
            "chunks_processing" => Some(Self::ChunksProcessing),
            "merging" => Some(Self::Merging),
            "ocr_complete" => Some(Self::OcrComplete),
            "ocr_failed" => Some(Self::OcrFailed),
            _ => None,
        }
    }

    /// `ocr_complete` and `ocr_failed` need external intervention to move again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::OcrComplete | Self::OcrFailed)
    }

    /// Stages in which a document is expected to make progress on its own.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Splitting | Self::ChunksProcessing | Self::Merging)
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a [`Chunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical case file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub matter_id: String,
    pub total_pages: u32,
    pub status: DocumentStatus,
    pub retry_count: u32,
    /// Object key of the uploaded source PDF.
    pub source_key: String,
    /// Merged full text; empty until a merge has run.
    pub full_text: String,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One page-range slice of a [`Document`] undergoing independent OCR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: u32,
    /// First page, 1-based, document-global, inclusive.
    pub first_page: u32,
    /// Last page, 1-based, document-global, inclusive.
    pub last_page: u32,
    pub status: ChunkStatus,
    /// Object key of the split PDF bytes for this range.
    pub source_key: String,
    /// Object key of the serialized [`ChunkResult`], set on completion.
    pub result_key: Option<String>,
    /// SHA-256 of the stored result bytes, checked again at merge time.
    pub result_hash: Option<String>,
    /// Incremented on every `pending → processing` claim.
    pub attempt: u32,
    /// Retryable failures consumed so far.
    pub retry_count: u32,
    /// Times the stuck-job monitor reset this chunk.
    pub recovery_attempts: u32,
    pub last_error: Option<String>,
    pub error_kind: Option<String>,
    /// Global bbox ids produced by this chunk, written by merge.
    pub bbox_ids: Vec<String>,
    /// Whether OCR extracted any text for this range, written by merge.
    pub has_text: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Chunk {
    pub fn page_count(&self) -> u32 {
        self.last_page - self.first_page + 1
    }

    pub fn contains_page(&self, page: u32) -> bool {
        (self.first_page..=self.last_page).contains(&page)
    }
}

/// A single OCR-detected text region with document-global page numbering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub id: String,
    pub document_id: String,
    pub page: u32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub text: String,
    pub confidence: f32,
    pub reading_order: u32,
    pub chunk_index: u32,
}

/// Raw per-chunk OCR output, numbered with chunk-local pages (1..=chunk pages).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    #[serde(default)]
    pub pages: Vec<OcrPage>,
    #[serde(default)]
    pub boxes: Vec<OcrBox>,
}

impl ChunkResult {
    pub fn has_text(&self) -> bool {
        self.pages.iter().any(|p| !p.text.trim().is_empty())
            || self.boxes.iter().any(|b| !b.text.trim().is_empty())
    }
}

/// Text and confidence for one chunk-local page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrPage {
    pub page: u32,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub confidence: f32,
}

/// A bounding box as reported by the OCR provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrBox {
    pub page: u32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub reading_order: u32,
}

/// Whether a merged page has OCR output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Ok,
    Missing,
}

impl PageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Missing => "missing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "missing" => Some(Self::Missing),
            _ => None,
        }
    }
}

/// Per-page entry of the merged page-confidence summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSummary {
    pub page: u32,
    pub status: PageStatus,
    pub confidence: Option<f32>,
}

/// An entity mention anchored to bounding boxes on one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMention {
    pub id: String,
    pub document_id: String,
    pub entity: String,
    pub page: u32,
    pub bbox_ids: Vec<String>,
}

/// A citation whose source anchor lives in this document and whose target
/// anchor may live in a separately uploaded reference document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub id: String,
    pub document_id: String,
    pub citation_text: String,
    pub source_page: u32,
    pub source_bbox_ids: Vec<String>,
    pub target_document_id: Option<String>,
    pub target_page: Option<u32>,
    pub target_bbox_ids: Vec<String>,
}

/// Hex SHA-256 of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
