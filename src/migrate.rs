use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            matter_id TEXT NOT NULL,
            total_pages INTEGER NOT NULL,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            source_key TEXT NOT NULL,
            full_text TEXT NOT NULL DEFAULT '',
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            first_page INTEGER NOT NULL,
            last_page INTEGER NOT NULL,
            status TEXT NOT NULL,
            source_key TEXT NOT NULL,
            result_key TEXT,
            result_hash TEXT,
            attempt INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            recovery_attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            error_kind TEXT,
            bbox_ids_json TEXT NOT NULL DEFAULT '[]',
            has_text INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bounding_boxes (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            page INTEGER NOT NULL,
            x REAL NOT NULL,
            y REAL NOT NULL,
            width REAL NOT NULL,
            height REAL NOT NULL,
            text TEXT NOT NULL,
            confidence REAL NOT NULL,
            reading_order INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS page_summaries (
            document_id TEXT NOT NULL,
            page INTEGER NOT NULL,
            status TEXT NOT NULL,
            confidence REAL,
            PRIMARY KEY (document_id, page),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entity_mentions (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            entity TEXT NOT NULL,
            page INTEGER NOT NULL,
            bbox_ids_json TEXT NOT NULL DEFAULT '[]',
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS citations (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            citation_text TEXT NOT NULL,
            source_page INTEGER NOT NULL,
            source_bbox_ids_json TEXT NOT NULL DEFAULT '[]',
            target_document_id TEXT,
            target_page INTEGER,
            target_bbox_ids_json TEXT NOT NULL DEFAULT '[]',
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_status_updated ON chunks(status, updated_at)",
        "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)",
        "CREATE INDEX IF NOT EXISTS idx_bboxes_document_id ON bounding_boxes(document_id, seq)",
        "CREATE INDEX IF NOT EXISTS idx_mentions_document_id ON entity_mentions(document_id)",
        "CREATE INDEX IF NOT EXISTS idx_citations_document_id ON citations(document_id)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}
