//! # casechunk-core
//!
//! Runtime-independent pieces of the casechunk OCR pipeline: data models,
//! page-range planning, the merge and integrity algorithms, retry policy and
//! the storage, object-store and OCR provider traits.
//!
//! This crate contains no tokio, sqlx, HTTP or filesystem code. The
//! `casechunk` crate supplies the native backends and the async services
//! that drive a document through
//!
//! ```text
//! uploaded → splitting → chunks_processing → merging → ocr_complete | ocr_failed
//! ```

pub mod error;
pub mod integrity;
pub mod layout;
pub mod merge;
pub mod models;
pub mod objects;
pub mod ocr;
pub mod retry;
pub mod split;
pub mod store;
