//! SQLite-backed [`PipelineStore`] implementation.
//!
//! Every status transition is a single `UPDATE … WHERE status = ?` whose
//! `rows_affected()` says whether the caller won. Chunk terminal
//! transitions run in a transaction together with the sibling tally so the
//! one worker that leaves zero unfinished chunks is the one that sees it.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use casechunk_core::merge::MergedDocument;
use casechunk_core::models::{
    BoundingBox, Chunk, ChunkStatus, Citation, Document, DocumentStatus, EntityMention,
    PageStatus, PageSummary,
};
use casechunk_core::store::{ChunkTally, PipelineStore};

/// SQLite implementation of the [`PipelineStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const DOCUMENT_COLUMNS: &str = "id, matter_id, total_pages, status, retry_count, source_key, \
     full_text, last_error, created_at, updated_at";

const CHUNK_COLUMNS: &str = "id, document_id, chunk_index, first_page, last_page, status, \
     source_key, result_key, result_hash, attempt, retry_count, recovery_attempts, last_error, \
     error_kind, bbox_ids_json, has_text, created_at, updated_at";

fn get_u32(row: &SqliteRow, col: &str) -> Result<u32> {
    let v: i64 = row.try_get(col)?;
    u32::try_from(v).with_context(|| format!("column {} out of range: {}", col, v))
}

fn ids_from_json(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).with_context(|| format!("invalid id list: {}", raw))
}

fn ids_to_json(ids: &[String]) -> Result<String> {
    Ok(serde_json::to_string(ids)?)
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let status: String = row.try_get("status")?;
    Ok(Document {
        id: row.try_get("id")?,
        matter_id: row.try_get("matter_id")?,
        total_pages: get_u32(row, "total_pages")?,
        status: DocumentStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown document status '{}'", status))?,
        retry_count: get_u32(row, "retry_count")?,
        source_key: row.try_get("source_key")?,
        full_text: row.try_get("full_text")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let status: String = row.try_get("status")?;
    let bbox_ids: String = row.try_get("bbox_ids_json")?;
    let has_text: i64 = row.try_get("has_text")?;
    Ok(Chunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        chunk_index: get_u32(row, "chunk_index")?,
        first_page: get_u32(row, "first_page")?,
        last_page: get_u32(row, "last_page")?,
        status: ChunkStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown chunk status '{}'", status))?,
        source_key: row.try_get("source_key")?,
        result_key: row.try_get("result_key")?,
        result_hash: row.try_get("result_hash")?,
        attempt: get_u32(row, "attempt")?,
        retry_count: get_u32(row, "retry_count")?,
        recovery_attempts: get_u32(row, "recovery_attempts")?,
        last_error: row.try_get("last_error")?,
        error_kind: row.try_get("error_kind")?,
        bbox_ids: ids_from_json(&bbox_ids)?,
        has_text: has_text != 0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn bbox_from_row(row: &SqliteRow) -> Result<BoundingBox> {
    let x: f64 = row.try_get("x")?;
    let y: f64 = row.try_get("y")?;
    let width: f64 = row.try_get("width")?;
    let height: f64 = row.try_get("height")?;
    let confidence: f64 = row.try_get("confidence")?;
    Ok(BoundingBox {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        page: get_u32(row, "page")?,
        x: x as f32,
        y: y as f32,
        width: width as f32,
        height: height as f32,
        text: row.try_get("text")?,
        confidence: confidence as f32,
        reading_order: get_u32(row, "reading_order")?,
        chunk_index: get_u32(row, "chunk_index")?,
    })
}

/// Tally the siblings of `chunk_id` on the caller's connection.
async fn tally_for_chunk(conn: &mut SqliteConnection, chunk_id: &str) -> Result<ChunkTally> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COALESCE(SUM(CASE WHEN status IN ('pending', 'processing') THEN 1 ELSE 0 END), 0)
                AS unfinished,
            COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed
        FROM chunks
        WHERE document_id = (SELECT document_id FROM chunks WHERE id = ?)
        "#,
    )
    .bind(chunk_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(ChunkTally {
        total: get_u32(&row, "total")?,
        unfinished: get_u32(&row, "unfinished")?,
        failed: get_u32(&row, "failed")?,
    })
}

#[async_trait]
impl PipelineStore for SqliteStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, matter_id, total_pages, status, retry_count, source_key,
                                   full_text, last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.matter_id)
        .bind(i64::from(doc.total_pages))
        .bind(doc.status.as_str())
        .bind(i64::from(doc.retry_count))
        .bind(&doc.source_key)
        .bind(&doc.full_text)
        .bind(&doc.last_error)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert document {}", doc.id))?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let sql = format!("SELECT {} FROM documents WHERE id = ?", DOCUMENT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_documents(&self, status: Option<DocumentStatus>) -> Result<Vec<Document>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE (? IS NULL OR status = ?) \
             ORDER BY created_at DESC, id ASC",
            DOCUMENT_COLUMNS
        );
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query(&sql)
            .bind(status)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn transition_document(
        &self,
        id: &str,
        from: DocumentStatus,
        to: DocumentStatus,
        now: i64,
    ) -> Result<bool> {
        let res = sqlx::query("UPDATE documents SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(to.as_str())
            .bind(now)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn fail_document(&self, id: &str, error: &str, now: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE documents SET status = 'ocr_failed', last_error = ?, updated_at = ?
            WHERE id = ? AND status NOT IN ('ocr_complete', 'ocr_failed')
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn recover_document(
        &self,
        id: &str,
        from: DocumentStatus,
        to: DocumentStatus,
        now: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE documents
            SET status = ?, retry_count = retry_count + 1, last_error = NULL, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(now)
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, first_page, last_page, status,
                                    source_key, result_key, result_hash, attempt, retry_count,
                                    recovery_attempts, last_error, error_kind, bbox_ids_json,
                                    has_text, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(i64::from(chunk.chunk_index))
            .bind(i64::from(chunk.first_page))
            .bind(i64::from(chunk.last_page))
            .bind(chunk.status.as_str())
            .bind(&chunk.source_key)
            .bind(&chunk.result_key)
            .bind(&chunk.result_hash)
            .bind(i64::from(chunk.attempt))
            .bind(i64::from(chunk.retry_count))
            .bind(i64::from(chunk.recovery_attempts))
            .bind(&chunk.last_error)
            .bind(&chunk.error_kind)
            .bind(ids_to_json(&chunk.bbox_ids)?)
            .bind(i64::from(chunk.has_text))
            .bind(chunk.created_at)
            .bind(chunk.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE document_id = ? ORDER BY chunk_index",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let sql = format!("SELECT {} FROM chunks WHERE id = ?", CHUNK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(chunk_from_row).transpose()
    }

    async fn claim_chunk(&self, id: &str, now: i64) -> Result<Option<u32>> {
        let row = sqlx::query(
            r#"
            UPDATE chunks SET status = 'processing', attempt = attempt + 1, updated_at = ?
            WHERE id = ? AND status = 'pending'
            RETURNING attempt
            "#,
        )
        .bind(now)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| get_u32(&r, "attempt")).transpose()
    }

    async fn complete_chunk(
        &self,
        id: &str,
        attempt: u32,
        result_key: &str,
        result_hash: &str,
        now: i64,
    ) -> Result<Option<ChunkTally>> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            r#"
            UPDATE chunks
            SET status = 'completed', result_key = ?, result_hash = ?,
                last_error = NULL, error_kind = NULL, updated_at = ?
            WHERE id = ? AND status = 'processing' AND attempt = ?
            "#,
        )
        .bind(result_key)
        .bind(result_hash)
        .bind(now)
        .bind(id)
        .bind(i64::from(attempt))
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        let tally = tally_for_chunk(&mut tx, id).await?;
        tx.commit().await?;
        Ok(Some(tally))
    }

    async fn fail_chunk(
        &self,
        id: &str,
        attempt: u32,
        error: &str,
        error_kind: &str,
        now: i64,
    ) -> Result<Option<ChunkTally>> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            r#"
            UPDATE chunks SET status = 'failed', last_error = ?, error_kind = ?, updated_at = ?
            WHERE id = ? AND status = 'processing' AND attempt = ?
            "#,
        )
        .bind(error)
        .bind(error_kind)
        .bind(now)
        .bind(id)
        .bind(i64::from(attempt))
        .execute(&mut *tx)
        .await?;

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        let tally = tally_for_chunk(&mut tx, id).await?;
        tx.commit().await?;
        Ok(Some(tally))
    }

    async fn release_chunk_for_retry(
        &self,
        id: &str,
        attempt: u32,
        error: &str,
        error_kind: &str,
        now: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE chunks
            SET status = 'pending', retry_count = retry_count + 1,
                last_error = ?, error_kind = ?, updated_at = ?
            WHERE id = ? AND status = 'processing' AND attempt = ?
            "#,
        )
        .bind(error)
        .bind(error_kind)
        .bind(now)
        .bind(id)
        .bind(i64::from(attempt))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn recover_chunk(&self, id: &str, stale_before: Option<i64>, now: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE chunks
            SET status = 'pending', recovery_attempts = recovery_attempts + 1, updated_at = ?
            WHERE id = ? AND status = 'processing' AND (? IS NULL OR updated_at < ?)
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(stale_before)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn requeue_failed_chunks(&self, document_id: &str, now: i64) -> Result<usize> {
        let res = sqlx::query(
            r#"
            UPDATE chunks
            SET status = 'pending', retry_count = 0, last_error = NULL, error_kind = NULL,
                updated_at = ?
            WHERE document_id = ? AND status = 'failed'
            "#,
        )
        .bind(now)
        .bind(document_id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() as usize)
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<usize> {
        let res = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() as usize)
    }

    async fn persist_merge(&self, merged: &MergedDocument, now: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query("UPDATE documents SET full_text = ?, updated_at = ? WHERE id = ?")
            .bind(&merged.full_text)
            .bind(now)
            .bind(&merged.document_id)
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() == 0 {
            bail!("document {} not found", merged.document_id);
        }

        sqlx::query("DELETE FROM bounding_boxes WHERE document_id = ?")
            .bind(&merged.document_id)
            .execute(&mut *tx)
            .await?;

        for (seq, b) in merged.bboxes.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO bounding_boxes (id, document_id, page, x, y, width, height, text,
                                            confidence, reading_order, chunk_index, seq)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&b.id)
            .bind(&b.document_id)
            .bind(i64::from(b.page))
            .bind(f64::from(b.x))
            .bind(f64::from(b.y))
            .bind(f64::from(b.width))
            .bind(f64::from(b.height))
            .bind(&b.text)
            .bind(f64::from(b.confidence))
            .bind(i64::from(b.reading_order))
            .bind(i64::from(b.chunk_index))
            .bind(seq as i64)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM page_summaries WHERE document_id = ?")
            .bind(&merged.document_id)
            .execute(&mut *tx)
            .await?;

        for p in &merged.pages {
            sqlx::query(
                "INSERT INTO page_summaries (document_id, page, status, confidence) VALUES (?, ?, ?, ?)",
            )
            .bind(&merged.document_id)
            .bind(i64::from(p.page))
            .bind(p.status.as_str())
            .bind(p.confidence.map(f64::from))
            .execute(&mut *tx)
            .await?;
        }

        for link in &merged.chunk_links {
            sqlx::query(
                "UPDATE chunks SET bbox_ids_json = ?, has_text = ?, updated_at = ? WHERE id = ?",
            )
            .bind(ids_to_json(&link.bbox_ids)?)
            .bind(i64::from(link.has_text))
            .bind(now)
            .bind(&link.chunk_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_bboxes(&self, document_id: &str) -> Result<Vec<BoundingBox>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, page, x, y, width, height, text, confidence,
                   reading_order, chunk_index
            FROM bounding_boxes WHERE document_id = ? ORDER BY seq
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bbox_from_row).collect()
    }

    async fn list_page_summaries(&self, document_id: &str) -> Result<Vec<PageSummary>> {
        let rows = sqlx::query(
            "SELECT page, status, confidence FROM page_summaries WHERE document_id = ? ORDER BY page",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let confidence: Option<f64> = row.try_get("confidence")?;
                Ok(PageSummary {
                    page: get_u32(row, "page")?,
                    status: PageStatus::parse(&status)
                        .ok_or_else(|| anyhow!("unknown page status '{}'", status))?,
                    confidence: confidence.map(|c| c as f32),
                })
            })
            .collect()
    }

    async fn insert_mention(&self, mention: &EntityMention) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO entity_mentions (id, document_id, entity, page, bbox_ids_json)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&mention.id)
        .bind(&mention.document_id)
        .bind(&mention.entity)
        .bind(i64::from(mention.page))
        .bind(ids_to_json(&mention.bbox_ids)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_mentions(&self, document_id: &str) -> Result<Vec<EntityMention>> {
        let rows = sqlx::query(
            "SELECT id, document_id, entity, page, bbox_ids_json FROM entity_mentions \
             WHERE document_id = ? ORDER BY id",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let ids: String = row.try_get("bbox_ids_json")?;
                Ok(EntityMention {
                    id: row.try_get("id")?,
                    document_id: row.try_get("document_id")?,
                    entity: row.try_get("entity")?,
                    page: get_u32(row, "page")?,
                    bbox_ids: ids_from_json(&ids)?,
                })
            })
            .collect()
    }

    async fn insert_citation(&self, citation: &Citation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO citations (id, document_id, citation_text, source_page,
                                              source_bbox_ids_json, target_document_id,
                                              target_page, target_bbox_ids_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&citation.id)
        .bind(&citation.document_id)
        .bind(&citation.citation_text)
        .bind(i64::from(citation.source_page))
        .bind(ids_to_json(&citation.source_bbox_ids)?)
        .bind(&citation.target_document_id)
        .bind(citation.target_page.map(i64::from))
        .bind(ids_to_json(&citation.target_bbox_ids)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_citations(&self, document_id: &str) -> Result<Vec<Citation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, citation_text, source_page, source_bbox_ids_json,
                   target_document_id, target_page, target_bbox_ids_json
            FROM citations WHERE document_id = ? ORDER BY id
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let source_ids: String = row.try_get("source_bbox_ids_json")?;
                let target_ids: String = row.try_get("target_bbox_ids_json")?;
                let target_page: Option<i64> = row.try_get("target_page")?;
                Ok(Citation {
                    id: row.try_get("id")?,
                    document_id: row.try_get("document_id")?,
                    citation_text: row.try_get("citation_text")?,
                    source_page: get_u32(row, "source_page")?,
                    source_bbox_ids: ids_from_json(&source_ids)?,
                    target_document_id: row.try_get("target_document_id")?,
                    target_page: target_page.map(|p| p as u32),
                    target_bbox_ids: ids_from_json(&target_ids)?,
                })
            })
            .collect()
    }

    async fn find_stale_chunks(&self, cutoff: i64) -> Result<Vec<Chunk>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE status = 'processing' AND updated_at < ? \
             ORDER BY document_id, chunk_index",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn find_stale_documents(&self, cutoff: i64) -> Result<Vec<Document>> {
        let sql = format!(
            r#"
            SELECT {} FROM documents d
            WHERE d.status IN ('splitting', 'chunks_processing', 'merging')
              AND d.updated_at < ?
              AND NOT EXISTS (
                  SELECT 1 FROM chunks c WHERE c.document_id = d.id AND c.updated_at >= ?
              )
              AND (
                  d.status <> 'chunks_processing'
                  OR EXISTS (
                      SELECT 1 FROM chunks c
                      WHERE c.document_id = d.id AND c.status = 'processing'
                  )
                  OR (
                      EXISTS (SELECT 1 FROM chunks c WHERE c.document_id = d.id)
                      AND NOT EXISTS (
                          SELECT 1 FROM chunks c
                          WHERE c.document_id = d.id
                            AND c.status NOT IN ('completed', 'failed')
                      )
                  )
              )
            ORDER BY d.id
            "#,
            DOCUMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn find_expired_documents(&self, cutoff: i64) -> Result<Vec<Document>> {
        let sql = format!(
            r#"
            SELECT {} FROM documents d
            WHERE d.status IN ('ocr_complete', 'ocr_failed')
              AND d.updated_at < ?
              AND EXISTS (SELECT 1 FROM chunks c WHERE c.document_id = d.id)
              AND NOT EXISTS (
                  SELECT 1 FROM chunks c WHERE c.document_id = d.id AND c.updated_at >= ?
              )
            ORDER BY d.id
            "#,
            DOCUMENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(document_from_row).collect()
    }
}
