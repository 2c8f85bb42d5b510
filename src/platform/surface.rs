//! Static markup surface
//!
//! Wraps markup captured after rendering (or fetched out-of-band). Metrics and
//! styles come from inline `style` declarations and sizing attributes, since
//! there is no layout engine behind it. It has no pixels, so every raster
//! request fails and the converter keeps the original markup.

use scraper::ElementRef;

use super::{RenderSurface, VisualMetrics};
use crate::dom::{self, NodeKey, RenderedTree};
use crate::{Error, Result};

/// A surface over markup that was rendered somewhere else
#[derive(Debug)]
pub struct StaticSurface {
    tree: RenderedTree,
}

impl StaticSurface {
    pub fn parse(markup: &str) -> Self {
        StaticSurface { tree: RenderedTree::parse(markup) }
    }

    pub fn from_tree(tree: RenderedTree) -> Self {
        StaticSurface { tree }
    }

    fn sized(element: &ElementRef<'_>, property: &str) -> Option<String> {
        if let Some(v) = dom::inline_style(element, property) {
            return Some(v);
        }
        let attr = element.value().attr(property)?.trim();
        if attr.is_empty() {
            None
        } else if attr.chars().all(|c| c.is_ascii_digit() || c == '.') {
            Some(format!("{}px", attr))
        } else {
            Some(attr.to_string())
        }
    }
}

/// Reads the metrics an element declares inline
pub(crate) fn declared_metrics(element: &ElementRef<'_>) -> VisualMetrics {
    let parent_max_width = element
        .parent()
        .and_then(ElementRef::wrap)
        .and_then(|p| dom::inline_style(&p, "max-width"))
        .filter(|v| v != "none");

    VisualMetrics {
        width: StaticSurface::sized(element, "width"),
        height: StaticSurface::sized(element, "height"),
        display: dom::inline_style(element, "display"),
        margin: dom::inline_style(element, "margin"),
        max_width: dom::inline_style(element, "max-width"),
        parent_max_width,
    }
}

impl RenderSurface for StaticSurface {
    fn tree(&self) -> &RenderedTree {
        &self.tree
    }

    fn metrics(&self, key: &NodeKey) -> Option<VisualMetrics> {
        self.tree.element(key).map(|el| declared_metrics(&el))
    }

    fn computed_style(&self, key: &NodeKey, property: &str) -> Option<String> {
        let element = self.tree.element(key)?;
        dom::inline_style(&element, property)
    }

    async fn is_rendered(&self, key: &NodeKey) -> bool {
        // a diagram renderer leaves an svg behind (mermaid also marks data-processed)
        match self.tree.element(key) {
            Some(el) => {
                el.value().attr("data-processed") == Some("true")
                    || el.descendants().skip(1).filter_map(ElementRef::wrap).any(|d| d.value().name() == "svg")
            }
            None => false,
        }
    }

    async fn read_pixels(&self, key: &NodeKey) -> Result<Vec<u8>> {
        Err(Error::RenderError(format!("static markup has no pixels for {}", key)))
    }

    async fn capture(&self, key: &NodeKey) -> Result<Vec<u8>> {
        Err(Error::RenderError(format!("static markup cannot be captured ({})", key)))
    }
}
