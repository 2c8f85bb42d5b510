//! Visual snapshot conversion
//!
//! Replaces dynamic and vector visuals in a page clone with references to
//! stored raster images. Three classes are handled:
//!
//! - **canvas**: pixels are read directly; canvases convert concurrently
//! - **diagram**: mermaid containers (or bare `.mermaid` / `[data-mermaid-diagram]`
//!   elements outside a container) are snapshotted once rendering is stable
//! - **svg**: top-level inline SVGs that are large enough to be figures
//!
//! Every failure stays local to its visual: it is logged, recorded in the
//! page's [`ConversionReport`], and the original markup is kept.

use futures::future::join_all;
use log::{debug, warn};
use scraper::{ElementRef, Selector};

use crate::dom::{self, MarkupClone, NodeKey};
use crate::model::{ConversionReport, ConvertedVisual, VisualFailure, VisualKind};
use crate::platform::{parse_px, ContentStore, RenderStability, RenderSurface, VisualMetrics};
use crate::{Error, MigrationConfig, Result};

const DIAGRAM_CONTAINER_CLASS: &str = "mermaid-diagram-container";

/// One visual found inside a container
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedVisual {
    pub key: NodeKey,
    pub kind: VisualKind,
    /// Position among visuals of the same kind in this container
    pub index: usize,
}

/// The edited clone plus what happened to each visual
#[derive(Debug)]
pub struct ConversionOutcome<'t> {
    pub clone: MarkupClone<'t>,
    pub report: ConversionReport,
}

struct VisualSelectors {
    canvas: Selector,
    diagram_container: Selector,
    bare_diagram: Selector,
    svg: Selector,
}

/// Turns live visuals into stored images referenced from the clone
pub struct VisualSnapshotConverter<'a, C, R> {
    config: &'a MigrationConfig,
    content: &'a C,
    stability: &'a R,
    selectors: VisualSelectors,
}

impl<'a, C, R> VisualSnapshotConverter<'a, C, R>
where
    C: ContentStore,
    R: RenderStability,
{
    pub fn new(config: &'a MigrationConfig, content: &'a C, stability: &'a R) -> Result<Self> {
        Ok(VisualSnapshotConverter {
            config,
            content,
            stability,
            selectors: VisualSelectors {
                canvas: dom::selector("canvas")?,
                diagram_container: dom::selector(&format!(".{}", DIAGRAM_CONTAINER_CLASS))?,
                bare_diagram: dom::selector(".mermaid, [data-mermaid-diagram]")?,
                svg: dom::selector("svg")?,
            },
        })
    }

    /// Find the visuals of `container` that are still part of `clone`
    pub fn detect<S: RenderSurface>(
        &self,
        surface: &S,
        container: ElementRef<'_>,
        clone: &MarkupClone<'_>,
    ) -> Vec<DetectedVisual> {
        let tree = surface.tree();
        let mut visuals = Vec::new();

        let canvases = container
            .select(&self.selectors.canvas)
            .filter(|el| !clone.is_detached(el));
        for (index, el) in canvases.enumerate() {
            visuals.push(DetectedVisual { key: tree.key_of(&el), kind: VisualKind::Canvas, index });
        }

        let mut diagrams: Vec<ElementRef<'_>> = container.select(&self.selectors.diagram_container).collect();
        if diagrams.is_empty() {
            diagrams = container
                .select(&self.selectors.bare_diagram)
                .filter(|el| !dom::has_ancestor(el, |a| dom::has_class(a, DIAGRAM_CONTAINER_CLASS)))
                .collect();
        } else {
            let bare: Vec<ElementRef<'_>> = container
                .select(&self.selectors.bare_diagram)
                .filter(|el| {
                    !dom::has_class(el, DIAGRAM_CONTAINER_CLASS)
                        && !dom::has_ancestor(el, |a| dom::has_class(a, DIAGRAM_CONTAINER_CLASS))
                })
                .collect();
            diagrams.extend(bare);
        }
        let diagrams = diagrams.into_iter().filter(|el| !clone.is_detached(el));
        for (index, el) in diagrams.enumerate() {
            visuals.push(DetectedVisual { key: tree.key_of(&el), kind: VisualKind::Diagram, index });
        }

        let svgs = container.select(&self.selectors.svg).filter(|el| {
            !clone.is_detached(el)
                && !dom::has_ancestor(el, |a| a.value().name() == "svg" || is_diagram(a))
                && self.is_large_svg(surface, el)
        });
        for (index, el) in svgs.enumerate() {
            visuals.push(DetectedVisual { key: tree.key_of(&el), kind: VisualKind::Vector, index });
        }

        visuals
    }

    fn is_large_svg<S: RenderSurface>(&self, surface: &S, svg: &ElementRef<'_>) -> bool {
        let attr_px = |name: &str| {
            svg.value()
                .attr(name)
                .filter(|v| !v.trim().ends_with('%'))
                .and_then(parse_px)
        };
        let min_attr = self.config.svg_min_attribute_px;
        if attr_px("width").map_or(false, |w| w >= min_attr) || attr_px("height").map_or(false, |h| h >= min_attr) {
            return true;
        }

        if let Some(view_box) = svg.value().attr("viewBox") {
            let parts: Vec<f64> = view_box
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|p| !p.is_empty())
                .filter_map(|p| p.parse().ok())
                .collect();
            if parts.len() == 4 && parts[2] >= self.config.svg_min_viewbox_width {
                return true;
            }
        }

        let min_resolved = self.config.svg_min_resolved_px;
        match surface.metrics(&surface.tree().key_of(svg)) {
            Some(m) => {
                m.width_px().map_or(false, |w| w >= min_resolved) || m.height_px().map_or(false, |h| h >= min_resolved)
            }
            None => false,
        }
    }

    /// Convert every visual of `container` inside `clone`
    pub async fn convert<'t, S: RenderSurface>(
        &self,
        surface: &'t S,
        container: ElementRef<'t>,
        mut clone: MarkupClone<'t>,
        namespace: &str,
        boundary_key: &str,
        stamp: i64,
    ) -> ConversionOutcome<'t> {
        let visuals = self.detect(surface, container, &clone);
        let mut report = ConversionReport::default();
        if visuals.is_empty() {
            return ConversionOutcome { clone, report };
        }
        debug!("container {} has {} visuals", boundary_key, visuals.len());

        let (canvases, rest): (Vec<&DetectedVisual>, Vec<&DetectedVisual>) =
            visuals.iter().partition(|v| v.kind == VisualKind::Canvas);

        let canvas_results = join_all(
            canvases
                .iter()
                .map(|v| self.rasterize(surface, v, namespace, boundary_key, stamp)),
        )
        .await;
        for (visual, result) in canvases.iter().zip(canvas_results) {
            apply(&mut clone, &mut report, visual, result);
        }

        // diagrams first, then vectors; each one at a time
        for visual in rest.iter().filter(|v| v.kind == VisualKind::Diagram) {
            let result = self.rasterize(surface, visual, namespace, boundary_key, stamp).await;
            apply(&mut clone, &mut report, visual, result);
        }
        for visual in rest.iter().filter(|v| v.kind == VisualKind::Vector) {
            let result = self.rasterize(surface, visual, namespace, boundary_key, stamp).await;
            apply(&mut clone, &mut report, visual, result);
        }

        ConversionOutcome { clone, report }
    }

    async fn rasterize<S: RenderSurface>(
        &self,
        surface: &S,
        visual: &DetectedVisual,
        namespace: &str,
        boundary_key: &str,
        stamp: i64,
    ) -> Result<(String, String)> {
        let bytes = match visual.kind {
            VisualKind::Canvas => surface.read_pixels(&visual.key).await?,
            VisualKind::Diagram => {
                if !self.stability.wait_rendered(surface, &visual.key).await {
                    return Err(Error::RenderError("diagram did not finish rendering".into()));
                }
                surface.capture(&visual.key).await?
            }
            VisualKind::Vector => surface.capture(&visual.key).await?,
        };
        if bytes.is_empty() {
            return Err(Error::RenderError("empty image".into()));
        }

        let path = image_path(namespace, boundary_key, visual.kind, visual.index, stamp);
        let reference = self.content.upload(&path, bytes).await.map_err(|e| match e {
            Error::StorageUnavailable(_) => e,
            other => Error::StorageUnavailable(other.to_string()),
        })?;

        let style = self.image_style(visual.kind, surface.metrics(&visual.key));
        let markup = format!(
            "<img src=\"{}\" alt=\"{}\" style=\"{}\" data-visual-kind=\"{}\">",
            dom::escape_attr(&reference),
            alt_text(visual.kind),
            dom::escape_attr(&style),
            visual.kind
        );
        Ok((reference, markup))
    }

    /// Inline style for the replacement image, preserving resolved layout
    pub fn image_style(&self, kind: VisualKind, metrics: Option<VisualMetrics>) -> String {
        let metrics = match metrics {
            Some(m) if m.width.is_some() || m.height.is_some() => m,
            _ if kind == VisualKind::Diagram => return self.config.diagram_fallback_style.clone(),
            other => other.unwrap_or_default(),
        };
        let (display, margin) = match kind {
            VisualKind::Diagram => ("block", "16px auto"),
            _ => ("inline-block", "0"),
        };
        format!(
            "width: {}; height: {}; max-width: {}; display: {}; margin: {};",
            metrics.width.as_deref().unwrap_or("auto"),
            metrics.height.as_deref().unwrap_or("auto"),
            metrics
                .parent_max_width
                .as_deref()
                .or(metrics.max_width.as_deref())
                .filter(|v| *v != "none")
                .unwrap_or("100%"),
            metrics.display.as_deref().unwrap_or(display),
            metrics.margin.as_deref().unwrap_or(margin),
        )
    }
}

fn is_diagram(element: &ElementRef<'_>) -> bool {
    dom::has_class(element, DIAGRAM_CONTAINER_CLASS)
        || dom::has_class(element, "mermaid")
        || element.value().attr("data-mermaid-diagram").is_some()
}

fn apply(
    clone: &mut MarkupClone<'_>,
    report: &mut ConversionReport,
    visual: &DetectedVisual,
    result: Result<(String, String)>,
) {
    let result = result.and_then(|(reference, markup)| {
        if clone.replace(&visual.key, markup) {
            Ok(reference)
        } else {
            Err(Error::RenderError("visual is not part of the page clone".into()))
        }
    });
    match result {
        Ok(reference) => report.converted.push(ConvertedVisual {
            node_key: visual.key.to_string(),
            kind: visual.kind,
            reference,
        }),
        Err(e) => {
            let failure = Error::VisualConversionFailed {
                key: visual.key.to_string(),
                kind: visual.kind.to_string(),
                reason: e.to_string(),
            };
            warn!("{}; keeping original markup", failure);
            report.failed.push(VisualFailure {
                node_key: visual.key.to_string(),
                kind: visual.kind,
                reason: e.to_string(),
            });
        }
    }
}

fn alt_text(kind: VisualKind) -> &'static str {
    match kind {
        VisualKind::Canvas => "Canvas snapshot",
        VisualKind::Diagram => "Diagram",
        VisualKind::Vector => "SVG graphic",
    }
}

/// `{namespace}/diagram-{boundaryKey}-{kind}-{index}-{stamp}.png`
pub fn image_path(namespace: &str, boundary_key: &str, kind: VisualKind, index: usize, stamp: i64) -> String {
    let safe_key: String = boundary_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let namespace = namespace.trim_matches('/');
    format!("{}/diagram-{}-{}-{}-{}.png", namespace, safe_key, kind.as_str(), index, stamp)
}
