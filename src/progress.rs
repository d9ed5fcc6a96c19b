//! Pipeline progress reporting.
//!
//! Reports observable progress while `casechunk process` drives a document
//! through split, OCR and merge, so operators can see which chunk is done
//! and how many are left. Progress is emitted on **stderr** so stdout stays
//! parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// The document was split into `chunks` page ranges.
    Split { document_id: String, chunks: u32 },
    /// A chunk reached a terminal state; `done` of `total` are terminal.
    ChunkFinished {
        document_id: String,
        chunk_index: u32,
        succeeded: bool,
        done: u32,
        total: u32,
    },
    /// A chunk attempt failed and will be retried.
    ChunkRetrying {
        document_id: String,
        chunk_index: u32,
        attempt: u32,
    },
    /// Chunk results are being merged.
    Merging { document_id: String },
    /// The document reached a terminal status.
    Finished { document_id: String, status: String },
}

/// Reports pipeline progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "doc 3f2a…  ocr  12 / 17 chunks".
pub struct StderrProgress;

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Split {
                document_id,
                chunks,
            } => format!("doc {}  split into {} chunks\n", short(document_id), chunks),
            ProgressEvent::ChunkFinished {
                document_id,
                chunk_index,
                succeeded,
                done,
                total,
            } => format!(
                "doc {}  ocr  {} / {} chunks  (chunk {} {})\n",
                short(document_id),
                done,
                total,
                chunk_index,
                if *succeeded { "ok" } else { "FAILED" }
            ),
            ProgressEvent::ChunkRetrying {
                document_id,
                chunk_index,
                attempt,
            } => format!(
                "doc {}  chunk {} attempt {} failed, retrying\n",
                short(document_id),
                chunk_index,
                attempt
            ),
            ProgressEvent::Merging { document_id } => {
                format!("doc {}  merging...\n", short(document_id))
            }
            ProgressEvent::Finished {
                document_id,
                status,
            } => format!("doc {}  {}\n", short(document_id), status),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Split {
                document_id,
                chunks,
            } => serde_json::json!({
                "event": "progress",
                "document_id": document_id,
                "phase": "split",
                "chunks": chunks
            }),
            ProgressEvent::ChunkFinished {
                document_id,
                chunk_index,
                succeeded,
                done,
                total,
            } => serde_json::json!({
                "event": "progress",
                "document_id": document_id,
                "phase": "ocr",
                "chunk_index": chunk_index,
                "succeeded": succeeded,
                "n": done,
                "total": total
            }),
            ProgressEvent::ChunkRetrying {
                document_id,
                chunk_index,
                attempt,
            } => serde_json::json!({
                "event": "retry",
                "document_id": document_id,
                "chunk_index": chunk_index,
                "attempt": attempt
            }),
            ProgressEvent::Merging { document_id } => serde_json::json!({
                "event": "progress",
                "document_id": document_id,
                "phase": "merging"
            }),
            ProgressEvent::Finished {
                document_id,
                status,
            } => serde_json::json!({
                "event": "finished",
                "document_id": document_id,
                "status": status
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}
