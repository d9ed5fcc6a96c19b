//! Object-store abstraction for source PDFs, split chunks and chunk results.
//!
//! Keys are flat strings laid out by [`crate::layout`]. Backends only need
//! put/get/delete and a prefix listing with modification times, which is
//! what retention and orphan sweeps work from.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Listing entry for one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    /// Unix seconds.
    pub last_modified: i64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs (`fs`, `s3`, `memory`).
    fn name(&self) -> &str;

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Every object whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
}

/// In-memory object store for tests.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, (Vec<u8>, i64)>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` with an explicit modification time.
    pub fn put_at(&self, key: &str, bytes: &[u8], last_modified: i64) {
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (bytes.to_vec(), last_modified));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.put_at(key, bytes, chrono::Utc::now().timestamp());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|(bytes, _)| bytes.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (bytes, ts))| ObjectMeta {
                key: k.clone(),
                size: bytes.len() as u64,
                last_modified: *ts,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_is_prefix_scoped_and_sorted() {
        let store = InMemoryObjectStore::new();
        store.put_at("ocr-chunks/m/d/1.a1.json", b"{}", 5);
        store.put_at("ocr-chunks/m/d/0.a1.json", b"{}", 5);
        store.put_at("ocr-chunks/m/e/0.a1.json", b"{}", 5);
        store.put_at("documents/m/d.pdf", b"%PDF", 5);

        let keys: Vec<String> = store
            .list("ocr-chunks/m/d/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["ocr-chunks/m/d/0.a1.json", "ocr-chunks/m/d/1.a1.json"]);

        store.delete("ocr-chunks/m/d/0.a1.json").await.unwrap();
        store.delete("never-existed").await.unwrap();
        assert!(store.get("ocr-chunks/m/d/0.a1.json").await.unwrap().is_none());
    }
}
