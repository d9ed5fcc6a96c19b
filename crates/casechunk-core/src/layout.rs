//! Object-store key layout.
//!
//! ```text
//! documents/{matter}/{document}.pdf                      uploaded source
//! ocr-chunks/{matter}/{document}/source/{index}.pdf      split page range
//! ocr-chunks/{matter}/{document}/{index}.a{attempt}.json serialized ChunkResult
//! ```
//!
//! Result keys carry the attempt number so every attempt writes a fresh
//! object. Everything under a document's chunk prefix is disposable once the
//! document is merged or its retention window has elapsed.

/// Root prefix for all temporary chunk artifacts.
pub const CHUNK_ROOT: &str = "ocr-chunks/";

pub fn document_source_key(matter_id: &str, document_id: &str) -> String {
    format!("documents/{}/{}.pdf", matter_id, document_id)
}

pub fn chunk_prefix(matter_id: &str, document_id: &str) -> String {
    format!("{}{}/{}/", CHUNK_ROOT, matter_id, document_id)
}

pub fn chunk_source_key(matter_id: &str, document_id: &str, chunk_index: u32) -> String {
    format!(
        "{}source/{}.pdf",
        chunk_prefix(matter_id, document_id),
        chunk_index
    )
}

/// `{chunk_index}.a{attempt}.json`. Keys are write-once per attempt, so a
/// late upload from a superseded attempt cannot overwrite the result the
/// current attempt recorded.
pub fn chunk_result_key(
    matter_id: &str,
    document_id: &str,
    chunk_index: u32,
    attempt: u32,
) -> String {
    format!(
        "{}{}.a{}.json",
        chunk_prefix(matter_id, document_id),
        chunk_index,
        attempt
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_live_under_the_document_prefix() {
        let prefix = chunk_prefix("m-1", "d-1");
        assert_eq!(prefix, "ocr-chunks/m-1/d-1/");
        assert_eq!(
            chunk_result_key("m-1", "d-1", 3, 2),
            "ocr-chunks/m-1/d-1/3.a2.json"
        );
        assert!(chunk_source_key("m-1", "d-1", 3).starts_with(&prefix));
        assert!(!document_source_key("m-1", "d-1").starts_with(CHUNK_ROOT));
    }

    #[test]
    fn each_attempt_gets_its_own_result_key() {
        let first = chunk_result_key("m-1", "d-1", 0, 1);
        let retry = chunk_result_key("m-1", "d-1", 0, 2);
        assert_ne!(first, retry);
        assert_eq!(
            first.strip_suffix(".a1.json"),
            retry.strip_suffix(".a2.json")
        );
    }
}
