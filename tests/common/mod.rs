//! Test doubles shared by the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pagemigrate::dom::{selector, NodeKey, RenderedTree};
use pagemigrate::model::ConversionReport;
use pagemigrate::platform::{
    ContentStore, ContextProvider, IsolatedContext, RenderSurface, StaticSurface, VisualMetrics,
};
use pagemigrate::{Error, PageRecord, Result};
use url::Url;

/// Bytes that start like a PNG; content is never decoded
pub const FAKE_PNG: &[u8] = b"\x89PNG\r\n\x1a\nfake";

pub fn page(id: &str, boundary_key: &str) -> PageRecord {
    PageRecord {
        id: id.to_string(),
        boundary_key: boundary_key.to_string(),
        title: format!("Title {}", id),
        key_message: None,
        sub_message: None,
        content: format!("<p>{}</p>", id),
        ordinal_hint: 0,
        section_id: None,
        extracted_at: None,
        conversion: ConversionReport::default(),
    }
}

pub fn ids(pages: &[PageRecord]) -> Vec<&str> {
    pages.iter().map(|p| p.id.as_str()).collect()
}

/// Static markup that can also produce pixels, except for chosen elements
pub struct PixelSurface {
    inner: StaticSurface,
    failing: HashSet<NodeKey>,
}

impl PixelSurface {
    pub fn parse(markup: &str) -> Self {
        PixelSurface { inner: StaticSurface::parse(markup), failing: HashSet::new() }
    }

    /// Make the `nth` element matching `css` fail to rasterize
    pub fn failing(mut self, css: &str, nth: usize) -> Self {
        let sel = selector(css).unwrap();
        let key = {
            let tree = self.inner.tree();
            let el = tree.select(&sel)[nth];
            tree.key_of(&el)
        };
        self.failing.insert(key);
        self
    }

    fn pixels(&self, key: &NodeKey) -> Result<Vec<u8>> {
        if self.failing.contains(key) {
            Err(Error::RenderError(format!("pixels of {} unavailable", key)))
        } else {
            Ok(FAKE_PNG.to_vec())
        }
    }
}

impl RenderSurface for PixelSurface {
    fn tree(&self) -> &RenderedTree {
        self.inner.tree()
    }

    fn metrics(&self, key: &NodeKey) -> Option<VisualMetrics> {
        self.inner.metrics(key)
    }

    fn computed_style(&self, key: &NodeKey, property: &str) -> Option<String> {
        self.inner.computed_style(key, property)
    }

    async fn is_rendered(&self, key: &NodeKey) -> bool {
        self.inner.is_rendered(key).await
    }

    async fn read_pixels(&self, key: &NodeKey) -> Result<Vec<u8>> {
        self.pixels(key)
    }

    async fn capture(&self, key: &NodeKey) -> Result<Vec<u8>> {
        self.pixels(key)
    }
}

/// A content store whose backend is down
#[derive(Debug, Default)]
pub struct OfflineContentStore {
    pub attempts: AtomicUsize,
}

impl ContentStore for OfflineContentStore {
    async fn upload(&self, path: &str, _bytes: Vec<u8>) -> Result<String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::StorageUnavailable(format!("cannot store {}", path)))
    }
}

/// What a scripted section does when loaded
#[derive(Debug, Clone)]
pub enum SectionScript {
    Loads(String),
    Hangs,
    Fails,
}

/// Serves sections by URL path and counts context lifecycles
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    scripts: BTreeMap<String, SectionScript>,
    pub created: Arc<AtomicUsize>,
    pub destroyed: Arc<AtomicUsize>,
    pub opened: Arc<Mutex<Vec<String>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(mut self, path: &str, script: SectionScript) -> Self {
        self.scripts.insert(path.to_string(), script);
        self
    }
}

impl ContextProvider for ScriptedProvider {
    type Context = ScriptedContext;

    async fn create(&self, url: &Url) -> Result<ScriptedContext> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.opened.lock().unwrap().push(url.path().to_string());
        let script = self
            .scripts
            .get(url.path())
            .cloned()
            .unwrap_or(SectionScript::Fails);
        Ok(ScriptedContext { script, destroyed: self.destroyed.clone() })
    }
}

pub struct ScriptedContext {
    script: SectionScript,
    destroyed: Arc<AtomicUsize>,
}

impl IsolatedContext for ScriptedContext {
    type Surface = StaticSurface;

    async fn wait_loaded(&mut self) -> Result<()> {
        match &self.script {
            SectionScript::Loads(_) => Ok(()),
            SectionScript::Hangs => std::future::pending().await,
            SectionScript::Fails => Err(Error::LoadError("section refused to load".into())),
        }
    }

    async fn surface(&mut self) -> Result<StaticSurface> {
        match &self.script {
            SectionScript::Loads(markup) => Ok(StaticSurface::parse(markup)),
            _ => Err(Error::LoadError("no surface".into())),
        }
    }

    async fn destroy(self) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
