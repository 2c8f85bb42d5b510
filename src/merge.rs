//! Merge planning
//!
//! Computes the new page list of every touched section under a merge policy.
//! Order lists are always recomputed from the planned page list, and the
//! cover page is placed first by construction: wherever a second cover would
//! appear, a demoted copy is used instead.

use std::collections::{BTreeMap, HashSet};

use log::{debug, info};

use crate::model::{MergePolicy, PageRecord, SectionPageSet, TargetDocument};

/// Pages to merge, either for one destination section or per source section
#[derive(Debug, Clone)]
pub enum Incoming {
    Single { section: String, pages: Vec<PageRecord> },
    Sections(SectionPageSet),
}

impl Incoming {
    pub fn page_count(&self) -> usize {
        match self {
            Incoming::Single { pages, .. } => pages.len(),
            Incoming::Sections(set) => set.values().map(Vec::len).sum(),
        }
    }

    fn into_sections(self) -> SectionPageSet {
        match self {
            Incoming::Single { section, pages } => {
                let mut set = SectionPageSet::new();
                set.insert(section, pages);
                set
            }
            Incoming::Sections(set) => set,
        }
    }
}

/// Planned outcome of one section
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SectionPlan {
    pub pages: Vec<PageRecord>,
    pub order: Vec<String>,
    /// Ids of records that were copied with their cover key demoted
    pub demoted: Vec<String>,
    /// Incoming ids dropped because the section already had them
    pub skipped: Vec<String>,
}

impl SectionPlan {
    fn from_pages(pages: Vec<PageRecord>, demoted: Vec<String>, skipped: Vec<String>) -> Self {
        let order = pages.iter().map(|p| p.id.clone()).collect();
        SectionPlan { pages, order, demoted, skipped }
    }
}

/// Planned outcome for every touched section
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub policy: MergePolicy,
    pub sections: BTreeMap<String, SectionPlan>,
}

impl MergePlan {
    /// Write the planned sections into `document`; untouched sections stay as they are
    pub fn apply_to(&self, document: &mut TargetDocument) {
        for (section, plan) in &self.sections {
            document.pages_by_section.insert(section.clone(), plan.pages.clone());
            document.order_by_section.insert(section.clone(), plan.order.clone());
        }
    }

    pub fn page_count(&self) -> usize {
        self.sections.values().map(|s| s.pages.len()).sum()
    }
}

/// Stateless planner for the three merge policies
#[derive(Debug, Clone, Copy, Default)]
pub struct MergePlanner;

impl MergePlanner {
    pub fn new() -> Self {
        MergePlanner
    }

    /// Plan a merge of `incoming` into `existing`.
    ///
    /// `existing` is ignored for `CreateNew`; `template` is only consulted
    /// for `CreateNew`.
    pub fn plan(
        &self,
        existing: Option<&TargetDocument>,
        incoming: Incoming,
        policy: MergePolicy,
        template: Option<&TargetDocument>,
    ) -> MergePlan {
        let mut sections = BTreeMap::new();
        for (section, pages) in incoming.into_sections() {
            let plan = match policy {
                MergePolicy::Overwrite => overwrite(pages),
                MergePolicy::Append => {
                    let current = existing.map(|d| d.ordered_pages(&section)).unwrap_or_default();
                    append(current, pages)
                }
                MergePolicy::CreateNew => {
                    let cover = template.and_then(|t| t.template_cover(&section).or_else(|| t.first_template_cover()));
                    create_new(cover, pages)
                }
            };
            debug!(
                "{} plan for section {}: {} pages ({} demoted, {} skipped)",
                policy,
                section,
                plan.pages.len(),
                plan.demoted.len(),
                plan.skipped.len()
            );
            sections.insert(section, plan);
        }
        MergePlan { policy, sections }
    }
}

/// Move the first cover to the front and demote any further covers in place
fn pin_cover(pages: Vec<PageRecord>, demoted: &mut Vec<String>) -> Vec<PageRecord> {
    let mut pages = pages;
    if let Some(pos) = pages.iter().position(PageRecord::is_cover) {
        if pos > 0 {
            let cover = pages.remove(pos);
            pages.insert(0, cover);
        }
        for page in pages.iter_mut().skip(1) {
            if page.is_cover() {
                demoted.push(page.id.clone());
                *page = page.demoted();
            }
        }
    }
    pages
}

fn demote_all(pages: Vec<PageRecord>, demoted: &mut Vec<String>) -> Vec<PageRecord> {
    pages
        .into_iter()
        .map(|p| {
            if p.is_cover() {
                demoted.push(p.id.clone());
                p.demoted()
            } else {
                p
            }
        })
        .collect()
}

fn overwrite(incoming: Vec<PageRecord>) -> SectionPlan {
    let mut demoted = Vec::new();
    let pages = pin_cover(incoming, &mut demoted);
    SectionPlan::from_pages(pages, demoted, Vec::new())
}

fn append(existing: Vec<PageRecord>, incoming: Vec<PageRecord>) -> SectionPlan {
    let mut demoted = Vec::new();
    let mut skipped = Vec::new();

    let existing = pin_cover(existing, &mut demoted);
    let mut known: HashSet<String> = existing.iter().map(|p| p.id.clone()).collect();
    let fresh: Vec<PageRecord> = incoming
        .into_iter()
        .filter(|p| {
            if known.insert(p.id.clone()) {
                true
            } else {
                skipped.push(p.id.clone());
                false
            }
        })
        .collect();
    if !skipped.is_empty() {
        info!("append skipped {} pages already in the section", skipped.len());
    }

    let existing_has_cover = existing.first().map_or(false, PageRecord::is_cover);
    let pages = if existing_has_cover {
        existing
            .into_iter()
            .chain(demote_all(fresh, &mut demoted))
            .collect()
    } else {
        match fresh.iter().position(PageRecord::is_cover) {
            Some(pos) => {
                let mut rest = fresh;
                let cover = rest.remove(pos);
                let mut pages = Vec::with_capacity(existing.len() + rest.len() + 1);
                pages.push(cover);
                pages.extend(existing);
                pages.extend(demote_all(rest, &mut demoted));
                pages
            }
            None => existing.into_iter().chain(fresh).collect(),
        }
    };
    SectionPlan::from_pages(pages, demoted, skipped)
}

fn create_new(template_cover: Option<PageRecord>, incoming: Vec<PageRecord>) -> SectionPlan {
    let mut demoted = Vec::new();
    let pages = match template_cover {
        Some(cover) => {
            let (covers, rest): (Vec<PageRecord>, Vec<PageRecord>) =
                incoming.into_iter().filter(|p| p.id != cover.id).partition(PageRecord::is_cover);
            let mut pages = Vec::with_capacity(covers.len() + rest.len() + 1);
            pages.push(cover);
            pages.extend(demote_all(covers, &mut demoted));
            pages.extend(rest);
            pages
        }
        None => pin_cover(incoming, &mut demoted),
    };
    SectionPlan::from_pages(pages, demoted, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::page;

    fn ids(plan: &SectionPlan) -> Vec<&str> {
        plan.pages.iter().map(|p| p.id.as_str()).collect()
    }

    fn single(section: &str, pages: Vec<PageRecord>) -> Incoming {
        Incoming::Single { section: section.to_string(), pages }
    }

    #[test]
    fn overwrite_pins_first_cover() {
        let plan = MergePlanner::new().plan(
            None,
            single("s", vec![page("a", "1"), page("c", "0"), page("d", "page-0")]),
            MergePolicy::Overwrite,
            None,
        );
        let s = &plan.sections["s"];
        assert_eq!(ids(s), vec!["c", "a", "d"]);
        assert_eq!(s.order, vec!["c", "a", "d"]);
        assert_eq!(s.demoted, vec!["d"]);
        assert!(!s.pages[2].is_cover());
    }

    #[test]
    fn append_after_existing_cover_demotes_incoming_cover() {
        let mut existing = TargetDocument::new("t", "T");
        existing.set_section("s", vec![page("cover", "0"), page("e1", "1")]);
        let plan = MergePlanner::new().plan(
            Some(&existing),
            single("s", vec![page("n0", "0"), page("n1", "1")]),
            MergePolicy::Append,
            None,
        );
        let s = &plan.sections["s"];
        assert_eq!(ids(s), vec!["cover", "e1", "n0", "n1"]);
        assert_eq!(s.pages[2].boundary_key, "0-demoted");
        assert_eq!(s.pages[2].content, "<p>n0</p>");
    }

    #[test]
    fn append_without_existing_cover_puts_incoming_cover_first() {
        let mut existing = TargetDocument::new("t", "T");
        existing.set_section("s", vec![page("e1", "1"), page("e2", "2")]);
        let plan = MergePlanner::new().plan(
            Some(&existing),
            single("s", vec![page("n1", "3"), page("n0", "0")]),
            MergePolicy::Append,
            None,
        );
        assert_eq!(ids(&plan.sections["s"]), vec!["n0", "e1", "e2", "n1"]);
    }

    #[test]
    fn append_skips_known_ids_and_respects_existing_order() {
        let mut existing = TargetDocument::new("t", "T");
        existing.pages_by_section.insert("s".into(), vec![page("e1", "1"), page("e2", "2")]);
        existing.order_by_section.insert("s".into(), vec!["e2".into(), "e1".into()]);
        let plan = MergePlanner::new().plan(
            Some(&existing),
            single("s", vec![page("e1", "1"), page("n1", "3")]),
            MergePolicy::Append,
            None,
        );
        let s = &plan.sections["s"];
        assert_eq!(ids(s), vec!["e2", "e1", "n1"]);
        assert_eq!(s.skipped, vec!["e1"]);
    }

    #[test]
    fn create_new_seeds_template_cover() {
        let mut template = TargetDocument::new("tpl", "Template");
        template.set_section("other", vec![page("page-0", "cover")]);
        let plan = MergePlanner::new().plan(
            None,
            single("s", vec![page("n1", "1"), page("n0", "0"), page("n2", "2")]),
            MergePolicy::CreateNew,
            Some(&template),
        );
        let s = &plan.sections["s"];
        assert_eq!(ids(s), vec!["page-0", "n0", "n1", "n2"]);
        assert_eq!(s.pages[1].boundary_key, "0-demoted");
    }

    #[test]
    fn create_new_prefers_same_section_template_cover() {
        let mut template = TargetDocument::new("tpl", "Template");
        template.set_section("a", vec![page("cover-a", "0")]);
        template.set_section("s", vec![page("cover-s", "0")]);
        let plan = MergePlanner::new().plan(
            None,
            single("s", vec![page("n1", "1")]),
            MergePolicy::CreateNew,
            Some(&template),
        );
        assert_eq!(ids(&plan.sections["s"]), vec!["cover-s", "n1"]);
    }

    #[test]
    fn create_new_without_template_uses_own_cover() {
        let plan = MergePlanner::new().plan(
            None,
            single("s", vec![page("n1", "1"), page("n0", "0")]),
            MergePolicy::CreateNew,
            None,
        );
        assert_eq!(ids(&plan.sections["s"]), vec!["n0", "n1"]);
    }

    #[test]
    fn multi_section_leaves_absent_sections_alone() {
        let mut existing = TargetDocument::new("t", "T");
        existing.set_section("keep", vec![page("k", "1")]);
        existing.set_section("a", vec![page("a1", "1")]);

        let mut set = SectionPageSet::new();
        set.insert("a".into(), vec![page("a2", "2")]);
        set.insert("b".into(), vec![page("b0", "0")]);
        let plan = MergePlanner::new().plan(Some(&existing), Incoming::Sections(set), MergePolicy::Append, None);

        let mut doc = existing.clone();
        plan.apply_to(&mut doc);
        assert_eq!(doc.order_by_section["keep"], vec!["k"]);
        assert_eq!(doc.order_by_section["a"], vec!["a1", "a2"]);
        assert_eq!(doc.order_by_section["b"], vec!["b0"]);
        doc.validate().unwrap();
    }
}
