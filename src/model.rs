//! Page records, section page sets and target documents
//!
//! Records are produced once by extraction and never mutated afterwards; the
//! merge planner only copies them. A `TargetDocument` keeps pages and order
//! per section, and [`TargetDocument::validate`] checks the invariants every
//! persisted document must hold.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Boundary keys that mark a cover page
pub const COVER_KEYS: [&str; 2] = ["0", "page-0"];

/// Template page id that also marks a cover
pub const TEMPLATE_COVER_ID: &str = "page-0";

pub fn is_cover_key(key: &str) -> bool {
    COVER_KEYS.contains(&key)
}

/// Class of a dynamic or vector visual
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisualKind {
    /// Immediate-mode raster surface (`canvas`)
    Canvas,
    /// Declaratively rendered diagram (mermaid)
    Diagram,
    /// Large inline `svg`
    Vector,
}

impl VisualKind {
    /// Short name used in stored image paths
    pub fn as_str(&self) -> &'static str {
        match self {
            VisualKind::Canvas => "canvas",
            VisualKind::Diagram => "mermaid",
            VisualKind::Vector => "svg",
        }
    }
}

impl fmt::Display for VisualKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A visual that was replaced by a stored image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertedVisual {
    pub node_key: String,
    pub kind: VisualKind,
    pub reference: String,
}

/// A visual that kept its original markup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualFailure {
    pub node_key: String,
    pub kind: VisualKind,
    pub reason: String,
}

/// Per-page record of visual conversion outcomes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionReport {
    #[serde(default)]
    pub converted: Vec<ConvertedVisual>,
    #[serde(default)]
    pub failed: Vec<VisualFailure>,
}

impl ConversionReport {
    pub fn is_empty(&self) -> bool {
        self.converted.is_empty() && self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.converted.len() + self.failed.len()
    }

    pub fn merge(&mut self, other: ConversionReport) {
        self.converted.extend(other.converted);
        self.failed.extend(other.failed);
    }
}

/// One migrated page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRecord {
    /// `migrated-{boundaryKey}-{timestampMillis}-{index}`
    pub id: String,
    /// Value of the boundary container attribute (`page-{index}` when empty)
    pub boundary_key: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_message: Option<String>,
    /// Reformatted markup with chrome removed and visuals replaced
    pub content: String,
    /// Position within the source section
    #[serde(default)]
    pub ordinal_hint: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "ConversionReport::is_empty")]
    pub conversion: ConversionReport,
}

impl PageRecord {
    pub fn is_cover(&self) -> bool {
        is_cover_key(&self.boundary_key)
    }

    /// Copy of this record that no longer claims the cover position.
    /// Only the boundary key changes; content is untouched.
    pub fn demoted(&self) -> PageRecord {
        PageRecord {
            boundary_key: format!("{}-demoted", self.boundary_key),
            ..self.clone()
        }
    }
}

/// Pages extracted per section; sections without pages are absent
pub type SectionPageSet = BTreeMap<String, Vec<PageRecord>>;

/// How incoming pages combine with the target's existing pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergePolicy {
    Overwrite,
    Append,
    CreateNew,
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergePolicy::Overwrite => "overwrite",
            MergePolicy::Append => "append",
            MergePolicy::CreateNew => "createNew",
        };
        f.write_str(s)
    }
}

/// A stored document holding ordered pages per section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDocument {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub pages_by_section: BTreeMap<String, Vec<PageRecord>>,
    #[serde(default)]
    pub order_by_section: BTreeMap<String, Vec<String>>,
    /// Opaque key-visual settings carried between documents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_visual: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TargetDocument {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        TargetDocument {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    /// Pages of `section` in stored order.
    ///
    /// Ids in the order list without a page are skipped; pages missing from
    /// the order list follow in page-list order.
    pub fn ordered_pages(&self, section: &str) -> Vec<PageRecord> {
        let pages = match self.pages_by_section.get(section) {
            Some(p) => p,
            None => return Vec::new(),
        };
        let mut placed = HashSet::new();
        let mut out = Vec::with_capacity(pages.len());
        if let Some(order) = self.order_by_section.get(section) {
            for id in order {
                if placed.contains(id.as_str()) {
                    continue;
                }
                if let Some(page) = pages.iter().find(|p| &p.id == id) {
                    placed.insert(page.id.as_str());
                    out.push(page.clone());
                }
            }
        }
        for page in pages {
            if placed.insert(page.id.as_str()) {
                out.push(page.clone());
            }
        }
        out
    }

    /// Replace a section's pages; the order is recomputed from the page list
    pub fn set_section(&mut self, section: impl Into<String>, pages: Vec<PageRecord>) {
        let section = section.into();
        let order = pages.iter().map(|p| p.id.clone()).collect();
        self.pages_by_section.insert(section.clone(), pages);
        self.order_by_section.insert(section, order);
    }

    /// Cover page of one section, recognizing template covers by id as well
    pub fn template_cover(&self, section: &str) -> Option<PageRecord> {
        self.ordered_pages(section)
            .into_iter()
            .find(|p| p.is_cover() || p.id == TEMPLATE_COVER_ID)
    }

    /// First template cover found in any section
    pub fn first_template_cover(&self) -> Option<PageRecord> {
        self.pages_by_section
            .keys()
            .find_map(|section| self.template_cover(section))
    }

    pub fn page_count(&self) -> usize {
        self.pages_by_section.values().map(Vec::len).sum()
    }

    /// Check the page/order invariants of every section
    pub fn validate(&self) -> Result<()> {
        for section in self.order_by_section.keys() {
            if !self.pages_by_section.contains_key(section) {
                return Err(violation(section, "order present without pages".into()));
            }
        }
        self.validate_sections(self.pages_by_section.keys().map(String::as_str))
    }

    /// Check the page/order invariants of the given sections only
    pub fn validate_sections<'s, I>(&self, sections: I) -> Result<()>
    where
        I: IntoIterator<Item = &'s str>,
    {
        for section in sections {
            self.validate_section(section)?;
        }
        Ok(())
    }

    fn validate_section(&self, section: &str) -> Result<()> {
        let Some(pages) = self.pages_by_section.get(section) else {
            if self.order_by_section.contains_key(section) {
                return Err(violation(section, "order present without pages".into()));
            }
            return Ok(());
        };
        let order = self
            .order_by_section
            .get(section)
            .ok_or_else(|| violation(section, "pages present without order".into()))?;

        let mut page_ids = HashSet::new();
        for page in pages {
            if !page_ids.insert(page.id.as_str()) {
                return Err(violation(section, format!("duplicate page id {}", page.id)));
            }
        }
        let mut order_ids = HashSet::new();
        for id in order {
            if !order_ids.insert(id.as_str()) {
                return Err(violation(section, format!("duplicate order id {}", id)));
            }
        }
        if page_ids != order_ids {
            return Err(violation(
                section,
                format!("order ({}) and pages ({}) hold different ids", order.len(), pages.len()),
            ));
        }

        let covers: Vec<&PageRecord> = pages.iter().filter(|p| p.is_cover()).collect();
        if covers.len() > 1 {
            return Err(violation(section, format!("{} cover pages", covers.len())));
        }
        if let Some(cover) = covers.first() {
            if order.first() != Some(&cover.id) {
                return Err(violation(section, format!("cover {} is not first", cover.id)));
            }
        }
        Ok(())
    }
}

fn violation(section: &str, detail: String) -> Error {
    Error::InvariantViolation {
        section: section.to_string(),
        detail,
    }
}

#[cfg(test)]
pub(crate) fn page(id: &str, boundary_key: &str) -> PageRecord {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_keys() {
        assert!(page("a", "0").is_cover());
        assert!(page("a", "page-0").is_cover());
        assert!(!page("a", "1").is_cover());
        assert!(!page("a", "0").demoted().is_cover());
    }

    #[test]
    fn demotion_keeps_content() {
        let original = page("c", "0");
        let demoted = original.demoted();
        assert_eq!(demoted.id, original.id);
        assert_eq!(demoted.content, original.content);
        assert_eq!(demoted.boundary_key, "0-demoted");
    }

    #[test]
    fn ordered_pages_repairs_order() {
        let mut doc = TargetDocument::new("d", "Doc");
        doc.pages_by_section
            .insert("s".into(), vec![page("a", "1"), page("b", "2"), page("c", "3")]);
        doc.order_by_section
            .insert("s".into(), vec!["c".into(), "ghost".into(), "a".into(), "c".into()]);
        let ids: Vec<String> = doc.ordered_pages("s").into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn validate_accepts_well_formed() {
        let mut doc = TargetDocument::new("d", "Doc");
        doc.set_section("s", vec![page("cover", "0"), page("b", "2")]);
        doc.validate().unwrap();
    }

    #[test]
    fn validate_rejects_cover_not_first() {
        let mut doc = TargetDocument::new("d", "Doc");
        doc.set_section("s", vec![page("b", "2"), page("cover", "0")]);
        assert!(matches!(doc.validate(), Err(Error::InvariantViolation { .. })));
    }

    #[test]
    fn validate_rejects_mismatched_ids() {
        let mut doc = TargetDocument::new("d", "Doc");
        doc.pages_by_section.insert("s".into(), vec![page("a", "1")]);
        doc.order_by_section.insert("s".into(), vec!["a".into(), "b".into()]);
        assert!(doc.validate().is_err());

        let mut doc = TargetDocument::new("d", "Doc");
        doc.pages_by_section.insert("s".into(), vec![page("a", "1")]);
        assert!(doc.validate().is_err());
    }

    #[test]
    fn validate_rejects_two_covers() {
        let mut doc = TargetDocument::new("d", "Doc");
        doc.set_section("s", vec![page("x", "0"), page("y", "page-0")]);
        let err = doc.validate().unwrap_err();
        assert!(err.to_string().contains("2 cover pages"));
    }

    #[test]
    fn validate_sections_ignores_other_sections() {
        let mut doc = TargetDocument::new("d", "Doc");
        doc.set_section("s", vec![page("a", "1")]);
        doc.pages_by_section.insert("legacy".into(), vec![page("old", "1")]);
        assert!(doc.validate().is_err());
        doc.validate_sections(["s"]).unwrap();
        assert!(matches!(
            doc.validate_sections(["legacy"]),
            Err(Error::InvariantViolation { ref section, .. }) if section == "legacy"
        ));
    }

    #[test]
    fn template_cover_by_id() {
        let mut doc = TargetDocument::new("t", "Template");
        doc.set_section("intro", vec![page("page-0", "cover"), page("p1", "1")]);
        assert_eq!(doc.template_cover("intro").unwrap().id, "page-0");
        assert_eq!(doc.first_template_cover().unwrap().id, "page-0");
        assert!(doc.template_cover("other").is_none());
    }

    #[test]
    fn document_json_shape() {
        let mut doc = TargetDocument::new("d", "Doc");
        doc.set_section("s", vec![page("a", "1")]);
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["pagesBySection"]["s"][0]["boundaryKey"].is_string());
        assert_eq!(json["orderBySection"]["s"][0], "a");
        let back: TargetDocument = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc);
    }
}
