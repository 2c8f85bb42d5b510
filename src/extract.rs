//! Page extraction from one rendered section
//!
//! Each boundary container becomes one [`PageRecord`]: its title and key
//! messages are resolved from the live tree, a clone is stripped of UI chrome,
//! visuals are rasterized into stored images, and the remaining markup is
//! reformatted for hand editing. Containers are processed concurrently and
//! joined before the cover page is moved to the front.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use futures::future::join_all;
use log::{debug, info, warn};
use scraper::{ElementRef, Selector};

use crate::dom::{self, NodeKey};
use crate::format::reformat;
use crate::model::PageRecord;
use crate::platform::{ContentStore, RenderStability, RenderSurface, StaticSurface};
use crate::snapshot::VisualSnapshotConverter;
use crate::{MigrationConfig, Result};

struct PageSelectors {
    boundary: Selector,
    flagged_title: Selector,
    flagged_h4: Selector,
    headings: Selector,
    h4: Selector,
    key_message_container: Selector,
    key_message_title: Selector,
    key_message_subtitle: Selector,
    page_number: Selector,
    button: Selector,
}

impl PageSelectors {
    fn new(config: &MigrationConfig) -> Result<Self> {
        Ok(PageSelectors {
            boundary: dom::selector(&config.boundary_selector())?,
            flagged_title: dom::selector("[data-pdf-title-h3=\"true\"]")?,
            flagged_h4: dom::selector("h4[data-pdf-title-h3=\"true\"]")?,
            headings: dom::selector("h1, h2, h3, .page-title")?,
            h4: dom::selector("h4")?,
            key_message_container: dom::selector(".key-message-container")?,
            key_message_title: dom::selector(".key-message-title")?,
            key_message_subtitle: dom::selector(".key-message-subtitle")?,
            page_number: dom::selector(".container-page-number")?,
            button: dom::selector("button")?,
        })
    }
}

/// Extracts page records from rendered sections
pub struct PageExtractor<'a, C, R> {
    config: &'a MigrationConfig,
    converter: VisualSnapshotConverter<'a, C, R>,
    selectors: PageSelectors,
    last_stamp: AtomicI64,
}

impl<'a, C, R> PageExtractor<'a, C, R>
where
    C: ContentStore,
    R: RenderStability,
{
    pub fn new(config: &'a MigrationConfig, content: &'a C, stability: &'a R) -> Result<Self> {
        Ok(PageExtractor {
            config,
            converter: VisualSnapshotConverter::new(config, content, stability)?,
            selectors: PageSelectors::new(config)?,
            last_stamp: AtomicI64::new(0),
        })
    }

    /// Number of boundary containers on the surface
    pub fn count_containers<S: RenderSurface>(&self, surface: &S) -> usize {
        surface.tree().select(&self.selectors.boundary).len()
    }

    /// Extract every page of the surface
    pub async fn extract<S: RenderSurface>(&self, surface: &S, namespace: &str) -> Vec<PageRecord> {
        self.extract_section(surface, namespace, None).await
    }

    /// Extract markup that was fetched out-of-band
    pub async fn extract_markup(&self, markup: &str, namespace: &str) -> Vec<PageRecord> {
        let surface = StaticSurface::parse(markup);
        self.extract(&surface, namespace).await
    }

    /// Extract every page of the surface, tagging records with `section`
    pub async fn extract_section<S: RenderSurface>(
        &self,
        surface: &S,
        namespace: &str,
        section: Option<&str>,
    ) -> Vec<PageRecord> {
        let containers = surface.tree().select(&self.selectors.boundary);
        if containers.is_empty() {
            debug!("no boundary containers in {}", section.unwrap_or("current document"));
            return Vec::new();
        }
        let stamp = self.next_stamp();

        let mut records = join_all(
            containers
                .iter()
                .enumerate()
                .map(|(index, container)| self.extract_container(surface, *container, index, namespace, section, stamp)),
        )
        .await;

        if let Some(pos) = records.iter().position(PageRecord::is_cover) {
            if pos > 0 {
                let cover = records.remove(pos);
                info!("moving cover page {} to the front", cover.id);
                records.insert(0, cover);
            }
        }
        records
    }

    // Millisecond stamp, strictly increasing across calls on this extractor
    fn next_stamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(previous + 1)
    }

    async fn extract_container<S: RenderSurface>(
        &self,
        surface: &S,
        container: ElementRef<'_>,
        index: usize,
        namespace: &str,
        section: Option<&str>,
        stamp: i64,
    ) -> PageRecord {
        let boundary_key = match container.value().attr(&self.config.boundary_attribute) {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => format!("page-{}", index),
        };

        let (key_message, sub_message) = self.key_messages(container);
        let (mut title, mut title_element) = self.resolve_title(surface, container, index);

        if key_message.as_deref() == Some(title.as_str()) {
            warn!(
                "title of page {} duplicates its key message ({:?}); looking for a flagged h4",
                boundary_key, title
            );
            if let Some(h4) = container.select(&self.selectors.flagged_h4).next() {
                let text = dom::text_of(&h4).trim().to_string();
                if !text.is_empty() && text != title {
                    title = text;
                    title_element = Some(h4);
                }
            }
        }

        let mut clone = surface.tree().clone_of(container);
        if let Some(el) = title_element {
            clone.remove(&el);
        }
        if let Some(banner) = container.select(&self.selectors.key_message_container).next() {
            clone.remove(&banner);
        }
        for badge in container.select(&self.selectors.page_number) {
            clone.remove(&badge);
        }
        for button in container.select(&self.selectors.button) {
            let text = dom::text_of(&button);
            if self.config.chrome_button_labels.iter().any(|label| text.contains(label.as_str())) {
                clone.remove(&button);
            }
        }

        let outcome = self
            .converter
            .convert(surface, container, clone, namespace, &boundary_key, stamp)
            .await;
        let content = reformat(&outcome.clone.inner_html());

        PageRecord {
            id: format!("migrated-{}-{}-{}", boundary_key, stamp, index),
            boundary_key,
            title,
            key_message,
            sub_message,
            content,
            ordinal_hint: index,
            section_id: section.map(str::to_string),
            extracted_at: Some(Utc::now()),
            conversion: outcome.report,
        }
    }

    /// Title text plus the element it came from (removed from content)
    fn resolve_title<'t, S: RenderSurface>(
        &self,
        surface: &S,
        container: ElementRef<'t>,
        index: usize,
    ) -> (String, Option<ElementRef<'t>>) {
        let non_empty = |el: ElementRef<'t>| {
            let text = dom::text_of(&el).trim().to_string();
            (!text.is_empty()).then_some((text, el))
        };

        if let Some((text, el)) = container.select(&self.selectors.flagged_title).find_map(non_empty) {
            return (text, Some(el));
        }

        let heading = container
            .select(&self.selectors.headings)
            .filter(|el| !dom::has_class(el, "key-message-title"))
            .find_map(non_empty);
        if let Some((text, el)) = heading {
            return (text, Some(el));
        }

        let bordered = container
            .select(&self.selectors.h4)
            .filter(|el| {
                let key: NodeKey = surface.tree().key_of(el);
                surface
                    .computed_style(&key, "border-left")
                    .map_or(false, |v| has_visible_border(&v))
            })
            .find_map(non_empty);
        if let Some((text, el)) = bordered {
            return (text, Some(el));
        }

        let text = dom::text_of(&container);
        let first_line = text.trim().lines().next().unwrap_or("").trim();
        if !first_line.is_empty() {
            return (first_line.chars().take(self.config.title_excerpt_chars).collect(), None);
        }

        (format!("Page {}", index + 1), None)
    }

    fn key_messages(&self, container: ElementRef<'_>) -> (Option<String>, Option<String>) {
        let text = |el: Option<ElementRef<'_>>| {
            el.map(|e| dom::text_of(&e).trim().to_string()).filter(|t| !t.is_empty())
        };
        match container.select(&self.selectors.key_message_container).next() {
            Some(banner) => (
                text(banner.select(&self.selectors.key_message_title).next()),
                text(banner.select(&self.selectors.key_message_subtitle).next()),
            ),
            None => (
                text(container.select(&self.selectors.key_message_title).next()),
                text(container.select(&self.selectors.key_message_subtitle).next()),
            ),
        }
    }
}

/// A resolved `border-left` that actually draws something
fn has_visible_border(value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() || value == "none" {
        return false;
    }
    let first = value.split_whitespace().next().unwrap_or("");
    if first == "0" || first == "0px" {
        return false;
    }
    !value.split_whitespace().any(|token| token == "none" || token == "hidden")
}
