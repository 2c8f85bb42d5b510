//! Collaborator interfaces: rendering surfaces, isolated contexts, stores
//!
//! The engine never reaches for globals. Everything it reads from or writes
//! to comes through one of the traits below, and each trait ships with a
//! small implementation that is good enough for tests and simple hosts:
//! static markup surfaces, an HTTP context provider, polling stability, and
//! in-memory or filesystem stores.

use crate::dom::{NodeKey, RenderedTree};
use crate::model::{PageRecord, TargetDocument};
use crate::Result;

pub mod content_store;
pub mod document_store;
pub mod stability;
pub mod surface;

#[cfg(feature = "http")]
pub mod context;

pub use content_store::{FsContentStore, MemoryContentStore};
pub use document_store::{JsonFileDocumentStore, MemoryDocumentStore};
pub use stability::PollStability;
pub use surface::StaticSurface;

#[cfg(feature = "http")]
pub use context::{HttpContext, HttpContextProvider};

/// Layout values resolved for one element, as CSS strings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisualMetrics {
    pub width: Option<String>,
    pub height: Option<String>,
    pub display: Option<String>,
    pub margin: Option<String>,
    pub max_width: Option<String>,
    /// The parent's max-width when it constrains the element
    pub parent_max_width: Option<String>,
}

impl VisualMetrics {
    /// Resolved width in pixels, when it is a pixel value
    pub fn width_px(&self) -> Option<f64> {
        self.width.as_deref().and_then(parse_px)
    }

    pub fn height_px(&self) -> Option<f64> {
        self.height.as_deref().and_then(parse_px)
    }
}

/// Parse `"320"`, `"320px"` or `"320.5px"`; percentages and keywords yield `None`
pub fn parse_px(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.ends_with('%') {
        return None;
    }
    value.trim_end_matches("px").trim().parse::<f64>().ok()
}

/// An already-rendered document the engine can read from
///
/// `tree()` exposes the rendered markup with stable keys; everything else is
/// addressed by those keys. Implementations never mutate what they render.
#[allow(async_fn_in_trait)]
pub trait RenderSurface {
    /// The keyed rendered tree
    fn tree(&self) -> &RenderedTree;

    /// Resolved layout metrics of an element
    fn metrics(&self, key: &NodeKey) -> Option<VisualMetrics>;

    /// Resolved value of one CSS property
    fn computed_style(&self, key: &NodeKey, property: &str) -> Option<String>;

    /// Whether a declaratively rendered visual has finished rendering
    async fn is_rendered(&self, key: &NodeKey) -> bool;

    /// Encoded PNG of an immediate-mode raster surface's pixels
    async fn read_pixels(&self, key: &NodeKey) -> Result<Vec<u8>>;

    /// Encoded PNG snapshot of an element as rendered
    async fn capture(&self, key: &NodeKey) -> Result<Vec<u8>>;

    /// Whether the whole document has stopped changing
    async fn is_settled(&self) -> bool {
        true
    }
}

impl<T: RenderSurface> RenderSurface for &T {
    fn tree(&self) -> &RenderedTree {
        (**self).tree()
    }

    fn metrics(&self, key: &NodeKey) -> Option<VisualMetrics> {
        (**self).metrics(key)
    }

    fn computed_style(&self, key: &NodeKey, property: &str) -> Option<String> {
        (**self).computed_style(key, property)
    }

    async fn is_rendered(&self, key: &NodeKey) -> bool {
        (**self).is_rendered(key).await
    }

    async fn read_pixels(&self, key: &NodeKey) -> Result<Vec<u8>> {
        (**self).read_pixels(key).await
    }

    async fn capture(&self, key: &NodeKey) -> Result<Vec<u8>> {
        (**self).capture(key).await
    }

    async fn is_settled(&self) -> bool {
        (**self).is_settled().await
    }
}

/// One isolated rendering context showing one section
#[allow(async_fn_in_trait)]
pub trait IsolatedContext {
    type Surface: RenderSurface;

    /// Resolve once the section has loaded
    async fn wait_loaded(&mut self) -> Result<()>;

    /// The rendered section
    async fn surface(&mut self) -> Result<Self::Surface>;

    /// Tear the context down. Called on every path, success or not.
    async fn destroy(self) -> Result<()>;
}

/// Creates isolated rendering contexts for section URLs
#[allow(async_fn_in_trait)]
pub trait ContextProvider {
    type Context: IsolatedContext;

    async fn create(&self, url: &url::Url) -> Result<Self::Context>;
}

/// Decides when rendering has stabilized
#[allow(async_fn_in_trait)]
pub trait RenderStability {
    /// Wait until the visual carrying `key` has rendered; false when it never did
    async fn wait_rendered<S: RenderSurface>(&self, surface: &S, key: &NodeKey) -> bool;

    /// Wait until the document settles; false when the wait ran out
    async fn settle<S: RenderSurface>(&self, surface: &S) -> bool;
}

/// Binary object storage for rasterized visuals
#[allow(async_fn_in_trait)]
pub trait ContentStore {
    /// Store `bytes` at `path` and return a retrievable reference
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String>;
}

/// Storage for target documents
#[allow(async_fn_in_trait)]
pub trait DocumentStore {
    /// Read a document; a missing document is `TargetNotFound`
    async fn read(&self, id: &str) -> Result<TargetDocument>;

    /// Replace the stored document
    async fn write_full(&self, document: &TargetDocument) -> Result<()>;

    /// Replace one section's pages and order, leaving every other field alone
    async fn write_field(&self, id: &str, section: &str, pages: &[PageRecord], order: &[String]) -> Result<()>;

    /// Store a new document and return its id
    async fn create_new(&self, document: &TargetDocument) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_px_handles_units() {
        assert_eq!(parse_px("320px"), Some(320.0));
        assert_eq!(parse_px(" 12.5 "), Some(12.5));
        assert_eq!(parse_px("100%"), None);
        assert_eq!(parse_px("auto"), None);
    }

    #[test]
    fn metrics_pixel_accessors() {
        let m = VisualMetrics {
            width: Some("640px".into()),
            height: Some("50%".into()),
            ..Default::default()
        };
        assert_eq!(m.width_px(), Some(640.0));
        assert_eq!(m.height_px(), None);
    }
}
