//! # casechunk
//!
//! Chunked OCR pipeline for oversized legal PDFs.
//!
//! Case files of several hundred pages are split into fixed-size page ranges,
//! each range is OCR'd independently under a system-wide concurrency cap,
//! and the per-chunk results are merged back into one document-global text
//! and bounding-box record. Temporary chunk artifacts are cleaned up after
//! success or when their retention window elapses.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────────┐   ┌──────────┐
//! │  ingest  │──▶│  splitter   │──▶│  scheduler   │──▶│  merger  │
//! │ (upload) │   │ lopdf pages │   │ OCR workers  │   │ + checks │
//! └──────────┘   └────────────┘   └──────┬───────┘   └────┬─────┘
//!                                        │                │
//!                      ┌─────────────────┴───┐      ┌─────┴──────┐
//!                      ▼                     ▼      ▼            ▼
//!                ┌──────────┐          ┌──────────────┐   ┌──────────┐
//!                │ objects  │          │ SQLite store │   │ cleanup  │
//!                │ fs / s3  │          │  (sqlx/WAL)  │   │ monitor  │
//!                └──────────┘          └──────────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! casechunk init
//! casechunk ingest ./complaint.pdf --matter M-2291 --process
//! casechunk status
//! casechunk serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | SQLite [`PipelineStore`](casechunk_core::store::PipelineStore) |
//! | [`objects_fs`] / [`objects_s3`] | Object storage backends |
//! | [`ocr_http`] | OCR provider implementations |
//! | [`splitter`] | PDF page splitter |
//! | [`scheduler`] | Chunk OCR scheduler |
//! | [`merger`] | Result merger |
//! | [`validator`] | Integrity validator |
//! | [`cleanup`] | Chunk cleanup service |
//! | [`monitor`] | Stuck-job monitor |
//! | [`pipeline`] | Stage driver tying the services together |
//! | [`status`] | Status views |
//! | [`progress`] | Progress reporting |
//! | [`server`] | Admin HTTP API |

pub mod cleanup;
pub mod config;
pub mod db;
pub mod merger;
pub mod migrate;
pub mod monitor;
pub mod objects_fs;
pub mod objects_s3;
pub mod ocr_http;
pub mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod server;
pub mod splitter;
pub mod sqlite_store;
pub mod status;
pub mod validator;

pub use casechunk_core;

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
