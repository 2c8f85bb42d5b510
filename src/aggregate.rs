//! Cross-section aggregation
//!
//! Sections are rendered independently, so each one is opened in its own
//! isolated context, given a hard load timeout, allowed to settle, and then
//! extracted. Sections are processed strictly one after another and every
//! context is destroyed on every path. A failing section is recorded and the
//! walk continues.

use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use url::Url;

use crate::extract::PageExtractor;
use crate::model::{PageRecord, SectionPageSet};
use crate::platform::{ContentStore, ContextProvider, IsolatedContext, RenderStability};
use crate::{Error, MigrationConfig, Result};

/// A section to visit: its id and a path relative to the base URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionDescriptor {
    pub id: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl SectionDescriptor {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        SectionDescriptor { id: id.into(), path: path.into(), label: None }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

/// Why one section contributed no pages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionFailure {
    pub section: String,
    pub message: String,
    pub timed_out: bool,
}

/// Pages per section plus the sections that failed
#[derive(Debug, Clone, Default)]
pub struct SectionAggregation {
    pub pages: SectionPageSet,
    pub failures: Vec<SectionFailure>,
}

impl SectionAggregation {
    pub fn page_count(&self) -> usize {
        self.pages.values().map(Vec::len).sum()
    }
}

/// Walks sections through isolated contexts
pub struct SectionAggregator<'a, P, R> {
    config: &'a MigrationConfig,
    provider: &'a P,
    stability: &'a R,
}

impl<'a, P, R> SectionAggregator<'a, P, R>
where
    P: ContextProvider,
    R: RenderStability,
{
    pub fn new(config: &'a MigrationConfig, provider: &'a P, stability: &'a R) -> Self {
        SectionAggregator { config, provider, stability }
    }

    /// Visit every section in order and collect its pages
    pub async fn aggregate_all<C: ContentStore>(
        &self,
        extractor: &PageExtractor<'_, C, R>,
        sections: &[SectionDescriptor],
        base_url: &Url,
        namespace: &str,
    ) -> SectionAggregation {
        self.aggregate_with_progress(extractor, sections, base_url, namespace, |_, _| {}).await
    }

    /// Like [`aggregate_all`](Self::aggregate_all), reporting `(done, total)` after each section
    pub async fn aggregate_with_progress<C, F>(
        &self,
        extractor: &PageExtractor<'_, C, R>,
        sections: &[SectionDescriptor],
        base_url: &Url,
        namespace: &str,
        mut progress: F,
    ) -> SectionAggregation
    where
        C: ContentStore,
        F: FnMut(usize, &SectionDescriptor),
    {
        let mut aggregation = SectionAggregation::default();

        for (done, section) in sections.iter().enumerate() {
            match self.visit(extractor, section, base_url, namespace).await {
                Ok(pages) if pages.is_empty() => {
                    debug!("section {} has no pages", section.display_name());
                }
                Ok(pages) => {
                    info!("section {}: {} pages", section.display_name(), pages.len());
                    aggregation.pages.insert(section.id.clone(), pages);
                }
                Err(e) => {
                    warn!("section {} skipped: {}", section.display_name(), e);
                    aggregation.failures.push(SectionFailure {
                        section: section.id.clone(),
                        message: e.to_string(),
                        timed_out: matches!(e, Error::SectionTimeout { .. }),
                    });
                }
            }
            progress(done + 1, section);
        }

        aggregation
    }

    async fn visit<C: ContentStore>(
        &self,
        extractor: &PageExtractor<'_, C, R>,
        section: &SectionDescriptor,
        base_url: &Url,
        namespace: &str,
    ) -> Result<Vec<PageRecord>> {
        let url = base_url
            .join(&section.path)
            .map_err(|e| Error::ConfigError(format!("bad section path '{}': {}", section.path, e)))?;
        debug!("opening section {} at {}", section.id, url);

        let mut context = self.provider.create(&url).await?;
        let result = self.load_and_extract(&mut context, extractor, section, namespace).await;
        if let Err(e) = context.destroy().await {
            warn!("failed to destroy context for section {}: {}", section.id, e);
        }
        result
    }

    async fn load_and_extract<C: ContentStore>(
        &self,
        context: &mut P::Context,
        extractor: &PageExtractor<'_, C, R>,
        section: &SectionDescriptor,
        namespace: &str,
    ) -> Result<Vec<PageRecord>> {
        let limit = Duration::from_millis(self.config.section_load_timeout_ms);
        match timeout(limit, context.wait_loaded()).await {
            Ok(loaded) => loaded?,
            Err(_) => {
                return Err(Error::SectionTimeout {
                    section: section.id.clone(),
                    timeout_ms: self.config.section_load_timeout_ms,
                })
            }
        }

        let surface = context.surface().await?;
        if !self.stability.settle(&surface).await {
            warn!("section {} did not settle; extracting anyway", section.id);
        }
        Ok(extractor.extract_section(&surface, namespace, Some(&section.id)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_labels() {
        let s = SectionDescriptor::new("market", "sections/market");
        assert_eq!(s.display_name(), "market");
        let s = s.with_label("Market analysis");
        assert_eq!(s.display_name(), "Market analysis");
    }

    #[test]
    fn aggregation_counts_pages() {
        let mut agg = SectionAggregation::default();
        agg.pages.insert("a".into(), vec![crate::model::page("1", "1"), crate::model::page("2", "2")]);
        agg.pages.insert("b".into(), vec![crate::model::page("3", "1")]);
        assert_eq!(agg.page_count(), 3);
    }
}
