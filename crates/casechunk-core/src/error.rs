//! Error taxonomy for the chunking pipeline.
//!
//! | Error | Raised by | Effect |
//! |-------|-----------|--------|
//! | [`SplitError`] | page splitter | document → `ocr_failed` |
//! | [`ChunkOcrError`] | OCR provider | retried or chunk → `failed` |
//! | [`MergeIntegrityError`] | merger | document → `ocr_failed`, chunks kept |
//! | [`ReferenceIntegrityError`] | integrity validator | reported, never repaired |
//! | [`CleanupError`] | cleanup service | logged only |

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// The source document cannot be split into page ranges.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SplitError {
    #[error("document has no pages")]
    EmptyDocument,
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
    #[error("source could not be parsed as PDF: {0}")]
    Malformed(String),
    #[error("declared page count {declared} does not match parsed page count {parsed}")]
    PageCountMismatch { declared: u32, parsed: u32 },
    #[error("failed to write pages {first_page}-{last_page}: {message}")]
    Serialize {
        first_page: u32,
        last_page: u32,
        message: String,
    },
}

/// A single OCR attempt for one chunk failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChunkOcrError {
    #[error("OCR call timed out after {0:?}")]
    Timeout(Duration),
    #[error("OCR provider rate limited the request: {0}")]
    RateLimited(String),
    #[error("OCR provider returned HTTP {status}: {message}")]
    Server { status: u16, message: String },
    #[error("OCR transport error: {0}")]
    Transport(String),
    #[error("malformed chunk input: {0}")]
    MalformedInput(String),
    #[error("OCR response could not be decoded: {0}")]
    InvalidResponse(String),
    #[error("OCR provider is disabled")]
    Disabled,
}

impl ChunkOcrError {
    /// Timeouts, 5xx, rate limits and transport failures consume a retry slot;
    /// everything else fails the chunk immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited(_) | Self::Server { .. } | Self::Transport(_)
        )
    }

    /// Short machine-readable kind stored on the chunk row.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::RateLimited(_) => "rate_limited",
            Self::Server { .. } => "server_error",
            Self::Transport(_) => "transport",
            Self::MalformedInput(_) => "malformed_input",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Disabled => "disabled",
        }
    }
}

/// Structural failure while reassembling chunk results.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MergeIntegrityError {
    #[error("chunk {chunk_index} is still {status}; merge needs every chunk terminal")]
    NonTerminalChunk { chunk_index: u32, status: String },
    #[error("chunk {chunk_index} is completed but has no stored result")]
    MissingResult { chunk_index: u32 },
    #[error("chunk {chunk_index} result at {key} is corrupt: {reason}")]
    CorruptResult {
        chunk_index: u32,
        key: String,
        reason: String,
    },
    #[error("chunk ranges do not tile the document: {0}")]
    Coverage(String),
}

/// Dangling references found after merge.
#[derive(Debug, Error, Clone, PartialEq)]
#[error(
    "document {document_id} has {invalid_references} invalid references and {orphan_chunks} orphan chunks"
)]
pub struct ReferenceIntegrityError {
    pub document_id: String,
    pub invalid_references: usize,
    pub orphan_chunks: usize,
}

/// Best-effort cleanup failure. Never escalates to a document status change.
#[derive(Debug, Error, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CleanupError {
    #[error("failed to delete object {key}: {message}")]
    Object { key: String, message: String },
    #[error("failed to delete chunk rows for document {document_id}: {message}")]
    Rows {
        document_id: String,
        message: String,
    },
}
