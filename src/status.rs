//! Status views for documents, chunks and stuck jobs.
//!
//! The same [`DocumentView`] backs `casechunk status <doc>` and
//! `GET /documents/{id}`, so a failed document always shows which page
//! ranges failed and why.

use anyhow::Result;
use serde::Serialize;

use casechunk_core::models::{Chunk, ChunkStatus, Document, PageStatus};
use casechunk_core::store::PipelineStore;

use crate::monitor::StuckReport;

/// Per-chunk progress line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkView {
    pub id: String,
    pub index: u32,
    pub first_page: u32,
    pub last_page: u32,
    pub status: ChunkStatus,
    pub attempt: u32,
    pub retry_count: u32,
    pub recovery_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub updated_at: i64,
}

impl From<&Chunk> for ChunkView {
    fn from(c: &Chunk) -> Self {
        Self {
            id: c.id.clone(),
            index: c.chunk_index,
            first_page: c.first_page,
            last_page: c.last_page,
            status: c.status,
            attempt: c.attempt,
            retry_count: c.retry_count,
            recovery_attempts: c.recovery_attempts,
            error: c.last_error.clone(),
            error_kind: c.error_kind.clone(),
            updated_at: c.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentView {
    pub id: String,
    pub matter_id: String,
    pub status: String,
    pub total_pages: u32,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub text_chars: usize,
    pub chunks_total: usize,
    pub chunks_completed: usize,
    pub chunks_failed: usize,
    pub pages_ok: usize,
    pub pages_missing: Vec<u32>,
    pub chunks: Vec<ChunkView>,
    pub created_at: i64,
    pub updated_at: i64,
}

pub async fn document_view(
    store: &dyn PipelineStore,
    document_id: &str,
) -> Result<Option<DocumentView>> {
    let Some(doc) = store.get_document(document_id).await? else {
        return Ok(None);
    };
    let chunks = store.list_chunks(document_id).await?;
    let pages = store.list_page_summaries(document_id).await?;

    let count = |s: ChunkStatus| chunks.iter().filter(|c| c.status == s).count();
    Ok(Some(DocumentView {
        id: doc.id.clone(),
        matter_id: doc.matter_id.clone(),
        status: doc.status.to_string(),
        total_pages: doc.total_pages,
        retry_count: doc.retry_count,
        last_error: doc.last_error.clone(),
        text_chars: doc.full_text.chars().count(),
        chunks_total: chunks.len(),
        chunks_completed: count(ChunkStatus::Completed),
        chunks_failed: count(ChunkStatus::Failed),
        pages_ok: pages.iter().filter(|p| p.status == PageStatus::Ok).count(),
        pages_missing: pages
            .iter()
            .filter(|p| p.status == PageStatus::Missing)
            .map(|p| p.page)
            .collect(),
        chunks: chunks.iter().map(ChunkView::from).collect(),
        created_at: doc.created_at,
        updated_at: doc.updated_at,
    }))
}

pub fn print_document(view: &DocumentView, now: i64) {
    println!("Document {}", view.id);
    println!("  Matter:      {}", view.matter_id);
    println!("  Status:      {}", view.status);
    println!("  Pages:       {}", view.total_pages);
    println!("  Retries:     {}", view.retry_count);
    println!("  Updated:     {}", format_ts_relative(view.updated_at, now));
    if let Some(err) = &view.last_error {
        println!("  Last error:  {}", err);
    }
    if view.text_chars > 0 {
        println!("  Text:        {} chars", view.text_chars);
    }
    if !view.pages_missing.is_empty() {
        println!("  Missing:     {}", compact_pages(&view.pages_missing));
    }

    if view.chunks.is_empty() {
        return;
    }
    println!();
    println!(
        "  Chunks: {} total, {} completed, {} failed",
        view.chunks_total, view.chunks_completed, view.chunks_failed
    );
    println!(
        "  {:>5} {:>11} {:<10} {:>7} {:>7}   {}",
        "INDEX", "PAGES", "STATUS", "ATTEMPT", "RETRIES", "UPDATED"
    );
    println!("  {}", "-".repeat(64));
    for c in &view.chunks {
        println!(
            "  {:>5} {:>11} {:<10} {:>7} {:>7}   {}",
            c.index,
            format!("{}-{}", c.first_page, c.last_page),
            c.status.as_str(),
            c.attempt,
            c.retry_count,
            format_ts_relative(c.updated_at, now)
        );
        if let Some(err) = &c.error {
            println!("        └ {}", err);
        }
    }
}

pub fn print_overview(docs: &[Document], now: i64) {
    if docs.is_empty() {
        println!("No documents.");
        return;
    }
    println!(
        "{:<36}  {:<12} {:<18} {:>6}   {}",
        "DOCUMENT", "MATTER", "STATUS", "PAGES", "UPDATED"
    );
    println!("{}", "-".repeat(92));
    for d in docs {
        println!(
            "{:<36}  {:<12} {:<18} {:>6}   {}",
            d.id,
            d.matter_id,
            d.status.as_str(),
            d.total_pages,
            format_ts_relative(d.updated_at, now)
        );
    }
}

pub fn print_stuck(report: &StuckReport, now: i64) {
    if report.is_empty() {
        println!("No stuck jobs.");
        return;
    }
    for d in &report.documents {
        println!(
            "document {}  {}  idle since {}",
            d.id,
            d.status,
            format_ts_relative(d.updated_at, now)
        );
    }
    for c in &report.chunks {
        println!(
            "chunk    {}  doc {} #{} (pages {}-{}) attempt {}  processing since {}",
            c.id,
            c.document_id,
            c.chunk_index,
            c.first_page,
            c.last_page,
            c.attempt,
            format_ts_relative(c.updated_at, now)
        );
    }
}

/// "1-3, 7, 9-10" from a sorted page list.
pub fn compact_pages(pages: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut iter = pages.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}-{}", start, end));
        }
    }
    parts.join(", ")
}

/// Format a Unix timestamp relative to `now` (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64, now: i64) -> String {
    let delta = now - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_timestamps() {
        assert_eq!(format_ts_relative(1000, 1030), "just now");
        assert_eq!(format_ts_relative(1000, 1000 + 60), "1 min ago");
        assert_eq!(format_ts_relative(0, 7 * 3600), "7 hours ago");
        assert_eq!(format_ts_relative(0, 2 * 86400), "2 days ago");
        assert_eq!(format_ts_relative(0, 40 * 86400), "1970-01-01 00:00");
    }

    #[test]
    fn page_ranges_are_compacted() {
        assert_eq!(compact_pages(&[26, 27, 28, 50]), "26-28, 50");
        assert_eq!(compact_pages(&[]), "");
    }
}
