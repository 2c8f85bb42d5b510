//! Document stores: in-memory and one-JSON-file-per-document

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use log::debug;

use super::DocumentStore;
use crate::model::{PageRecord, TargetDocument};
use crate::{Error, Result};

/// Kind of write a store received, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    Full(String),
    Field { id: String, section: String },
    Created(String),
}

/// Keeps documents in memory and logs every write
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<BTreeMap<String, TargetDocument>>,
    writes: Mutex<Vec<StoreWrite>>,
    next_id: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document (not logged as a write)
    pub fn insert(&self, document: TargetDocument) {
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(document.id.clone(), document);
    }

    pub fn get(&self, id: &str) -> Option<TargetDocument> {
        self.documents.lock().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }

    pub fn writes(&self) -> Vec<StoreWrite> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn log(&self, write: StoreWrite) {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).push(write);
    }
}

impl DocumentStore for MemoryDocumentStore {
    async fn read(&self, id: &str) -> Result<TargetDocument> {
        self.get(id).ok_or_else(|| Error::TargetNotFound(id.to_string()))
    }

    async fn write_full(&self, document: &TargetDocument) -> Result<()> {
        self.insert(document.clone());
        self.log(StoreWrite::Full(document.id.clone()));
        Ok(())
    }

    async fn write_field(&self, id: &str, section: &str, pages: &[PageRecord], order: &[String]) -> Result<()> {
        {
            let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
            let document = documents
                .get_mut(id)
                .ok_or_else(|| Error::TargetNotFound(id.to_string()))?;
            apply_field(document, section, pages, order);
        }
        self.log(StoreWrite::Field { id: id.to_string(), section: section.to_string() });
        Ok(())
    }

    async fn create_new(&self, document: &TargetDocument) -> Result<String> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("doc-{}", n);
        let mut stored = document.clone();
        stored.id = id.clone();
        self.insert(stored);
        self.log(StoreWrite::Created(id.clone()));
        Ok(id)
    }
}

fn apply_field(document: &mut TargetDocument, section: &str, pages: &[PageRecord], order: &[String]) {
    document.pages_by_section.insert(section.to_string(), pages.to_vec());
    document.order_by_section.insert(section.to_string(), order.to_vec());
    document.updated_at = Some(Utc::now());
}

/// Stores each document as `{dir}/{id}.json`
#[derive(Debug)]
pub struct JsonFileDocumentStore {
    dir: PathBuf,
    counter: AtomicUsize,
}

impl JsonFileDocumentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonFileDocumentStore { dir: dir.into(), counter: AtomicUsize::new(0) }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(Error::ConfigError(format!("invalid document id '{}'", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn store(&self, document: &TargetDocument) -> Result<()> {
        let path = self.path_for(&document.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(document)?;
        tokio::fs::write(&path, json).await?;
        debug!("wrote document {} to {}", document.id, path.display());
        Ok(())
    }
}

impl DocumentStore for JsonFileDocumentStore {
    async fn read(&self, id: &str) -> Result<TargetDocument> {
        let path = self.path_for(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::TargetNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut document: TargetDocument = serde_json::from_slice(&bytes)?;
        if document.id.is_empty() {
            document.id = id.to_string();
        }
        Ok(document)
    }

    async fn write_full(&self, document: &TargetDocument) -> Result<()> {
        self.store(document).await
    }

    async fn write_field(&self, id: &str, section: &str, pages: &[PageRecord], order: &[String]) -> Result<()> {
        let mut document = self.read(id).await?;
        apply_field(&mut document, section, pages, order);
        self.store(&document).await
    }

    async fn create_new(&self, document: &TargetDocument) -> Result<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("doc-{}-{}", Utc::now().timestamp_millis(), n);
        let mut stored = document.clone();
        stored.id = id.clone();
        self.store(&stored).await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::page;

    #[tokio::test]
    async fn memory_read_missing_is_target_not_found() {
        let store = MemoryDocumentStore::new();
        assert!(matches!(store.read("nope").await, Err(Error::TargetNotFound(id)) if id == "nope"));
    }

    #[tokio::test]
    async fn memory_write_field_touches_one_section() {
        let store = MemoryDocumentStore::new();
        let mut doc = TargetDocument::new("d1", "Doc");
        doc.set_section("a", vec![page("a1", "1")]);
        doc.set_section("b", vec![page("b1", "1")]);
        store.insert(doc);

        store
            .write_field("d1", "a", &[page("a2", "2")], &["a2".to_string()])
            .await
            .unwrap();
        let stored = store.get("d1").unwrap();
        assert_eq!(stored.order_by_section["a"], vec!["a2"]);
        assert_eq!(stored.order_by_section["b"], vec!["b1"]);
        assert_eq!(
            store.writes(),
            vec![StoreWrite::Field { id: "d1".into(), section: "a".into() }]
        );
    }

    #[tokio::test]
    async fn json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileDocumentStore::new(dir.path());
        let mut doc = TargetDocument::new("", "Fresh");
        doc.set_section("s", vec![page("p", "0")]);

        let id = store.create_new(&doc).await.unwrap();
        let back = store.read(&id).await.unwrap();
        assert_eq!(back.id, id);
        assert_eq!(back.pages_by_section["s"][0].id, "p");

        store.write_field(&id, "t", &[page("q", "1")], &["q".into()]).await.unwrap();
        let back = store.read(&id).await.unwrap();
        assert_eq!(back.order_by_section.len(), 2);
        assert!(back.updated_at.is_some());
    }

    #[tokio::test]
    async fn json_store_missing_and_invalid_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileDocumentStore::new(dir.path());
        assert!(matches!(store.read("absent").await, Err(Error::TargetNotFound(_))));
        assert!(matches!(store.read("../x").await, Err(Error::ConfigError(_))));
    }
}
