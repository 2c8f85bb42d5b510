//! pagemigrate
//!
//! Converts a rendered, free-form document made of visually laid-out page
//! containers into a structured page collection that can be stored and edited
//! again later.
//!
//! # Features
//!
//! - **Extraction**: finds `[data-page-container]` boundaries, resolves titles
//!   and key messages, strips transient UI chrome
//! - **Rasterization**: replaces canvases, rendered diagrams and large inline
//!   SVGs with stored images while keeping their layout metrics
//! - **Aggregation**: walks independently rendered sections one at a time
//!   through isolated rendering contexts
//! - **Merging**: `overwrite`, `append` and `createNew` policies that always keep
//!   the cover page first
//! - **HTTP backend** (default): fetches sections over HTTP as static markup
//! - **CDP backend** (`cdp` feature): live pixels and element snapshots from
//!   headless Chrome
//!
//! # Example
//!
//! ```no_run
//! use pagemigrate::platform::{MemoryContentStore, MemoryDocumentStore, StaticSurface};
//! use pagemigrate::{MergePolicy, MigrationConfig, MigrationOrchestrator, MigrationRequest, TargetRef};
//!
//! # async fn run() -> pagemigrate::Result<()> {
//! let surface = StaticSurface::parse("<div data-page-container=\"1\"><h2>Plan</h2></div>");
//! let mut orchestrator = MigrationOrchestrator::new(
//!     MigrationConfig::default(),
//!     MemoryContentStore::new(),
//!     MemoryDocumentStore::new(),
//! );
//! orchestrator.on_progress(|event| println!("{:?}: {}", event.state, event.message));
//!
//! let request = MigrationRequest::new(MergePolicy::Append, TargetRef::Existing("plan-1".into()))
//!     .with_section("overview");
//! let result = orchestrator.run(&surface, &request).await?;
//! println!("{}", result.summary);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod dom;
pub mod format;
pub mod model;

// Collaborator traits and bundled backends (stores, surfaces, contexts)
pub mod platform;

pub mod snapshot;
pub mod extract;
pub mod aggregate;
pub mod merge;
pub mod orchestrator;

// Headless Chrome rendering substrate, owned by a worker thread
#[cfg(feature = "cdp")]
pub mod cdp;

pub use aggregate::{SectionAggregation, SectionAggregator, SectionDescriptor, SectionFailure};
pub use dom::{MarkupClone, NodeKey, RenderedTree};
pub use extract::PageExtractor;
pub use merge::{Incoming, MergePlan, MergePlanner};
pub use model::{
    ConversionReport, MergePolicy, PageRecord, SectionPageSet, TargetDocument, VisualKind,
};
pub use orchestrator::{
    CancelHandle, MigrationOrchestrator, MigrationRequest, MigrationResult, MigrationState,
    ProgressEvent, Selection, TargetRef,
};
pub use snapshot::VisualSnapshotConverter;

#[cfg(feature = "cdp")]
pub use cdp::CdpBrowser;

/// Configuration for extraction, aggregation and rasterization
///
/// The defaults follow the layouts this engine was built for:
/// - boundaries are elements carrying `data-page-container`
/// - a section gets 10 seconds to load and up to 1 second to settle
/// - inline SVGs are only rasterized once they are large enough to be figures
///
/// # Examples
///
/// ```
/// let cfg = pagemigrate::MigrationConfig::default();
/// assert_eq!(cfg.boundary_attribute, "data-page-container");
/// assert_eq!(cfg.title_excerpt_chars, 50);
/// ```
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Attribute that marks a boundary container; its value is the page key
    pub boundary_attribute: String,
    /// Hard timeout for one section's isolated context to finish loading
    pub section_load_timeout_ms: u64,
    /// Maximum time to wait for a loaded section to settle
    pub settle_max_ms: u64,
    /// Maximum time to wait for one diagram to finish rendering
    pub diagram_render_max_ms: u64,
    /// First polling interval of the stability predicate (doubles each round)
    pub poll_interval_ms: u64,
    /// Upper bound for the polling interval
    pub max_poll_interval_ms: u64,
    /// Maximum length of a title taken from the first text line
    pub title_excerpt_chars: usize,
    /// An svg whose width or height attribute reaches this is rasterized
    pub svg_min_attribute_px: f64,
    /// An svg whose viewBox width reaches this is rasterized
    pub svg_min_viewbox_width: f64,
    /// An svg whose resolved width or height reaches this is rasterized
    pub svg_min_resolved_px: f64,
    /// Buttons whose text contains one of these labels are removed as chrome
    pub chrome_button_labels: Vec<String>,
    /// Style applied to a diagram's replacement image when no metrics resolve
    pub diagram_fallback_style: String,
    /// User agent used by the HTTP context provider
    pub user_agent: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            boundary_attribute: "data-page-container".to_string(),
            section_load_timeout_ms: 10_000,
            settle_max_ms: 1_000,
            diagram_render_max_ms: 2_000,
            poll_interval_ms: 50,
            max_poll_interval_ms: 400,
            title_excerpt_chars: 50,
            svg_min_attribute_px: 100.0,
            svg_min_viewbox_width: 200.0,
            svg_min_resolved_px: 200.0,
            chrome_button_labels: vec!["ダウンロード".to_string(), "Download".to_string()],
            diagram_fallback_style: "max-width: 100%; height: auto; display: block; margin: 16px auto;"
                .to_string(),
            user_agent: format!("pagemigrate/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl MigrationConfig {
    /// CSS selector matching boundary containers
    pub fn boundary_selector(&self) -> String {
        format!("[{}]", self.boundary_attribute)
    }
}
