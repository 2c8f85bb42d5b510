//! Content stores for rasterized visuals

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use log::debug;
use url::Url;

use super::ContentStore;
use crate::{Error, Result};

/// Keeps uploads in memory and hands out `memory://` references
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored paths, sorted
    pub fn paths(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentStore for MemoryContentStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String> {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert(path.to_string(), bytes);
        Ok(format!("memory://{}", path))
    }
}

/// Writes uploads below a root directory
///
/// References are `public_base` joined with the path when a base is set,
/// otherwise `file://` URLs of the written files.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
    public_base: Option<Url>,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsContentStore { root: root.into(), public_base: None }
    }

    pub fn with_public_base(mut self, base: Url) -> Self {
        self.public_base = Some(base);
        self
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::StorageUnavailable(format!("refusing path outside store: {}", path)));
        }
        Ok(self.root.join(relative))
    }
}

impl ContentStore for FsContentStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        }
        tokio::fs::write(&target, &bytes)
            .await
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        debug!("stored {} bytes at {}", bytes.len(), target.display());

        match &self.public_base {
            Some(base) => base
                .join(path)
                .map(|u| u.to_string())
                .map_err(|e| Error::ConfigError(e.to_string())),
            None => {
                let absolute = tokio::fs::canonicalize(&target).await?;
                Url::from_file_path(&absolute)
                    .map(|u| u.to_string())
                    .map_err(|_| Error::StorageUnavailable(format!("no file URL for {}", absolute.display())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_keeps_bytes() {
        let store = MemoryContentStore::new();
        let reference = store.upload("plan-1/diagram-1-canvas-0-5.png", vec![1, 2, 3]).await.unwrap();
        assert_eq!(reference, "memory://plan-1/diagram-1-canvas-0-5.png");
        assert_eq!(store.get("plan-1/diagram-1-canvas-0-5.png"), Some(vec![1, 2, 3]));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn fs_store_writes_below_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path())
            .with_public_base(Url::parse("https://cdn.example.com/assets/").unwrap());
        let reference = store.upload("ns/a.png", vec![9; 4]).await.unwrap();
        assert_eq!(reference, "https://cdn.example.com/assets/ns/a.png");
        assert_eq!(std::fs::read(dir.path().join("ns/a.png")).unwrap(), vec![9; 4]);
    }

    #[tokio::test]
    async fn fs_store_file_urls_without_base() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());
        let reference = store.upload("x/b.png", vec![1]).await.unwrap();
        assert!(reference.starts_with("file://"));
        assert!(reference.ends_with("x/b.png"));
    }

    #[tokio::test]
    async fn fs_store_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());
        let err = store.upload("../evil.png", vec![1]).await.unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)));
    }
}
