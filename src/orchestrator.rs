//! Migration orchestration
//!
//! `MigrationOrchestrator` sequences a run:
//!
//! ```text
//! Idle -> Discovering -> Extracting -> AwaitingSelection -> Merging -> Persisting -> Done
//! ```
//!
//! Any state past `Idle` can end in `Failed`. Extraction and migration are
//! separate calls so a caller can show the extracted pages, let a user pick a
//! subset, and then migrate; [`run`](MigrationOrchestrator::run) and
//! [`run_sections`](MigrationOrchestrator::run_sections) do both at once.
//! A run can be cancelled through its [`CancelHandle`] until merging starts.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use log::{error, info, warn};
use url::Url;

use crate::aggregate::{SectionAggregation, SectionAggregator, SectionDescriptor, SectionFailure};
use crate::extract::PageExtractor;
use crate::merge::{Incoming, MergePlan, MergePlanner};
use crate::model::{MergePolicy, PageRecord, SectionPageSet, TargetDocument};
use crate::platform::{ContentStore, ContextProvider, DocumentStore, PollStability, RenderStability, RenderSurface};
use crate::{Error, MigrationConfig, Result};

type OnProgressHandler = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Idle,
    Discovering,
    Extracting,
    AwaitingSelection,
    Merging,
    Persisting,
    Done,
    Failed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationState::Idle => "idle",
            MigrationState::Discovering => "discovering",
            MigrationState::Extracting => "extracting",
            MigrationState::AwaitingSelection => "awaiting selection",
            MigrationState::Merging => "merging",
            MigrationState::Persisting => "persisting",
            MigrationState::Done => "done",
            MigrationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A state transition reported to the progress callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub state: MigrationState,
    pub message: String,
}

/// Cancels a run before it reaches `Merging`
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Which extracted pages to migrate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Selection {
    #[default]
    All,
    Ids(BTreeSet<String>),
}

impl Selection {
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection::Ids(ids.into_iter().map(Into::into).collect())
    }

    pub fn includes(&self, id: &str) -> bool {
        match self {
            Selection::All => true,
            Selection::Ids(ids) => ids.contains(id),
        }
    }
}

/// Destination of a migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRef {
    /// An existing document (`overwrite` and `append`)
    Existing(String),
    /// A new document (`createNew`), named after its source and seeded from a template
    New { source_title: String, template: Option<String> },
}

/// A fully resolved migration request
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub policy: MergePolicy,
    pub target: TargetRef,
    /// Destination section for pages extracted from the current document
    pub section_id: Option<String>,
    pub selection: Selection,
    /// Document whose key-visual settings carry over
    pub key_visual_source: Option<String>,
    /// Path prefix for stored images; defaults to the target id
    pub snapshot_namespace: Option<String>,
}

impl MigrationRequest {
    pub fn new(policy: MergePolicy, target: TargetRef) -> Self {
        MigrationRequest {
            policy,
            target,
            section_id: None,
            selection: Selection::All,
            key_visual_source: None,
            snapshot_namespace: None,
        }
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section_id = Some(section.into());
        self
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_key_visual_from(mut self, document: impl Into<String>) -> Self {
        self.key_visual_source = Some(document.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.snapshot_namespace = Some(namespace.into());
        self
    }

    /// Image path prefix for this request
    pub fn namespace(&self) -> String {
        if let Some(ns) = &self.snapshot_namespace {
            return ns.clone();
        }
        match &self.target {
            TargetRef::Existing(id) => id.clone(),
            TargetRef::New { .. } => format!("new-{}", Utc::now().timestamp_millis()),
        }
    }

    fn validate(&self) -> Result<()> {
        match (&self.policy, &self.target) {
            (MergePolicy::CreateNew, TargetRef::Existing(id)) => Err(Error::ConfigError(format!(
                "createNew needs a new target, got existing document {}",
                id
            ))),
            (MergePolicy::Overwrite | MergePolicy::Append, TargetRef::New { .. }) => Err(Error::ConfigError(
                format!("{} needs an existing target document", self.policy),
            )),
            _ => Ok(()),
        }
    }
}

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct MigrationResult {
    pub target_id: String,
    pub policy: MergePolicy,
    pub migrated_pages: usize,
    /// Sections that were written
    pub sections: Vec<String>,
    pub visuals_converted: usize,
    pub visuals_failed: usize,
    pub section_failures: Vec<SectionFailure>,
    pub summary: String,
}

/// `"{converted}/{total} visuals converted; {failed} kept as original markup"`
pub fn visual_summary(converted: usize, failed: usize) -> String {
    format!(
        "{}/{} visuals converted; {} kept as original markup",
        converted,
        converted + failed,
        failed
    )
}

/// `"{title} (componentized {YYYY-MM-DD})"`
pub fn componentized_title(source_title: &str, date: NaiveDate) -> String {
    format!("{} (componentized {})", source_title, date.format("%Y-%m-%d"))
}

enum Extracted {
    Current(Vec<PageRecord>),
    Sections(SectionAggregation),
}

impl Extracted {
    fn page_count(&self) -> usize {
        match self {
            Extracted::Current(pages) => pages.len(),
            Extracted::Sections(agg) => agg.page_count(),
        }
    }

    fn pages(&self) -> Vec<&PageRecord> {
        match self {
            Extracted::Current(pages) => pages.iter().collect(),
            Extracted::Sections(agg) => agg.pages.values().flatten().collect(),
        }
    }
}

struct Progress {
    state: MigrationState,
    handler: Option<OnProgressHandler>,
}

impl Progress {
    fn transition(&mut self, state: MigrationState, message: impl Into<String>) {
        let event = ProgressEvent { state, message: message.into() };
        info!("[{}] {}", state, event.message);
        self.state = state;
        if let Some(cb) = &self.handler {
            cb(&event);
        }
    }

    /// Abandon the run (back to `Idle`) when the handle was cancelled
    fn check_cancelled(&mut self, cancel: &CancelHandle) -> Result<()> {
        if !cancel.is_cancelled() {
            return Ok(());
        }
        let during = self.state;
        self.transition(MigrationState::Idle, format!("Cancelled during {}", during));
        Err(Error::Cancelled(during.to_string()))
    }

    fn fail(&mut self, err: Error) -> Error {
        error!("migration failed during {}: {}", self.state, err);
        self.transition(MigrationState::Failed, err.to_string());
        err
    }
}

/// Drives extraction, selection, merging and persistence
pub struct MigrationOrchestrator<C, D, R = PollStability> {
    config: MigrationConfig,
    content: C,
    documents: D,
    stability: R,
    planner: MergePlanner,
    progress: Progress,
    extracted: Option<Extracted>,
    cancel: CancelHandle,
}

impl<C, D> MigrationOrchestrator<C, D, PollStability>
where
    C: ContentStore,
    D: DocumentStore,
{
    pub fn new(config: MigrationConfig, content: C, documents: D) -> Self {
        let stability = PollStability::from_config(&config);
        Self::with_stability(config, content, documents, stability)
    }
}

impl<C, D, R> MigrationOrchestrator<C, D, R>
where
    C: ContentStore,
    D: DocumentStore,
    R: RenderStability,
{
    pub fn with_stability(config: MigrationConfig, content: C, documents: D, stability: R) -> Self {
        MigrationOrchestrator {
            config,
            content,
            documents,
            stability,
            planner: MergePlanner::new(),
            progress: Progress { state: MigrationState::Idle, handler: None },
            extracted: None,
            cancel: CancelHandle::default(),
        }
    }

    /// Register a callback invoked at every state transition
    pub fn on_progress<F>(&mut self, cb: F)
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.progress.handler = Some(Arc::new(cb));
    }

    pub fn clear_on_progress(&mut self) {
        self.progress.handler = None;
    }

    pub fn state(&self) -> MigrationState {
        self.progress.state
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn content_store(&self) -> &C {
        &self.content
    }

    pub fn document_store(&self) -> &D {
        &self.documents
    }

    /// Pages waiting for selection
    pub fn extracted_pages(&self) -> Vec<&PageRecord> {
        self.extracted.as_ref().map(Extracted::pages).unwrap_or_default()
    }

    fn begin(&mut self) {
        self.cancel.reset();
        self.extracted = None;
    }

    /// Extract every page of the current document
    pub async fn extract_current<S: RenderSurface>(&mut self, surface: &S, namespace: &str) -> Result<Vec<PageRecord>> {
        self.begin();
        self.progress
            .transition(MigrationState::Discovering, "Scanning the current document for page containers");
        let extractor = match PageExtractor::new(&self.config, &self.content, &self.stability) {
            Ok(e) => e,
            Err(e) => return Err(self.progress.fail(e)),
        };

        let found = extractor.count_containers(surface);
        if found == 0 {
            let err = Error::NoContainersFound {
                scope: "current document".to_string(),
                checked: found,
            };
            return Err(self.progress.fail(err));
        }
        self.progress.check_cancelled(&self.cancel)?;

        self.progress
            .transition(MigrationState::Extracting, format!("Extracting {} pages", found));
        let pages = extractor.extract(surface, namespace).await;
        self.progress.check_cancelled(&self.cancel)?;

        let (converted, failed) = count_visuals(pages.iter());
        self.progress.transition(
            MigrationState::AwaitingSelection,
            format!("{} pages ready; {}", pages.len(), visual_summary(converted, failed)),
        );
        self.extracted = Some(Extracted::Current(pages.clone()));
        Ok(pages)
    }

    /// Extract every section through isolated contexts
    pub async fn extract_all_sections<P: ContextProvider>(
        &mut self,
        provider: &P,
        sections: &[SectionDescriptor],
        base_url: &Url,
        namespace: &str,
    ) -> Result<SectionAggregation> {
        self.begin();
        self.progress
            .transition(MigrationState::Discovering, format!("Preparing {} sections", sections.len()));
        if sections.is_empty() {
            let err = Error::NoContainersFound { scope: "section list".to_string(), checked: 0 };
            return Err(self.progress.fail(err));
        }
        self.progress.check_cancelled(&self.cancel)?;

        self.progress
            .transition(MigrationState::Extracting, format!("Extracting {} sections", sections.len()));
        let total = sections.len();
        let aggregation = {
            let extractor = match PageExtractor::new(&self.config, &self.content, &self.stability) {
                Ok(e) => e,
                Err(e) => return Err(self.progress.fail(e)),
            };
            let aggregator = SectionAggregator::new(&self.config, provider, &self.stability);
            let progress = &mut self.progress;
            aggregator
                .aggregate_with_progress(&extractor, sections, base_url, namespace, |done, section| {
                    progress.transition(
                        MigrationState::Extracting,
                        format!("Section {}/{} done: {}", done, total, section.id),
                    );
                })
                .await
        };
        self.progress.check_cancelled(&self.cancel)?;

        if aggregation.pages.is_empty() {
            let err = Error::NoContainersFound {
                scope: format!("{} sections", total),
                checked: total,
            };
            return Err(self.progress.fail(err));
        }

        let (converted, failed) = count_visuals(aggregation.pages.values().flatten());
        self.progress.transition(
            MigrationState::AwaitingSelection,
            format!(
                "{} pages ready from {} sections ({} skipped); {}",
                aggregation.page_count(),
                aggregation.pages.len(),
                aggregation.failures.len(),
                visual_summary(converted, failed)
            ),
        );
        self.extracted = Some(Extracted::Sections(aggregation.clone()));
        Ok(aggregation)
    }

    /// Merge the selected extracted pages into the target and persist it
    pub async fn migrate(&mut self, request: &MigrationRequest) -> Result<MigrationResult> {
        if self.progress.state != MigrationState::AwaitingSelection || self.extracted.is_none() {
            return Err(Error::ConfigError(
                "nothing to migrate; extract pages before migrating".to_string(),
            ));
        }
        if let Err(e) = self.progress.check_cancelled(&self.cancel) {
            self.extracted = None;
            return Err(e);
        }
        if let Err(e) = request.validate() {
            return Err(self.progress.fail(e));
        }

        let (incoming, section_failures) = match self.select(request) {
            Ok(v) => v,
            Err(e) => return Err(self.progress.fail(e)),
        };

        self.progress.transition(
            MigrationState::Merging,
            format!("Merging {} pages ({})", incoming.page_count(), request.policy),
        );
        match self.merge_and_persist(request, incoming, section_failures).await {
            Ok(result) => {
                self.extracted = None;
                self.progress.transition(MigrationState::Done, result.summary.clone());
                Ok(result)
            }
            Err(e) => Err(self.progress.fail(e)),
        }
    }

    /// Extract the current document and migrate it in one go
    pub async fn run<S: RenderSurface>(&mut self, surface: &S, request: &MigrationRequest) -> Result<MigrationResult> {
        let namespace = request.namespace();
        self.extract_current(surface, &namespace).await?;
        self.migrate(request).await
    }

    /// Extract every section and migrate the aggregate in one go
    pub async fn run_sections<P: ContextProvider>(
        &mut self,
        provider: &P,
        sections: &[SectionDescriptor],
        base_url: &Url,
        request: &MigrationRequest,
    ) -> Result<MigrationResult> {
        let namespace = request.namespace();
        self.extract_all_sections(provider, sections, base_url, &namespace).await?;
        self.migrate(request).await
    }

    fn select(&self, request: &MigrationRequest) -> Result<(Incoming, Vec<SectionFailure>)> {
        let extracted = self
            .extracted
            .as_ref()
            .ok_or_else(|| Error::ConfigError("nothing extracted".to_string()))?;
        let available = extracted.page_count();

        match extracted {
            Extracted::Current(pages) => {
                let section = request
                    .section_id
                    .clone()
                    .ok_or_else(|| Error::ConfigError("a destination section is required".to_string()))?;
                let chosen: Vec<PageRecord> = pages
                    .iter()
                    .filter(|p| request.selection.includes(&p.id))
                    .cloned()
                    .collect();
                if chosen.is_empty() {
                    return Err(Error::NoPagesSelected { available });
                }
                Ok((Incoming::Single { section, pages: chosen }, Vec::new()))
            }
            Extracted::Sections(aggregation) => {
                let mut chosen = SectionPageSet::new();
                for (section, pages) in &aggregation.pages {
                    let picked: Vec<PageRecord> = pages
                        .iter()
                        .filter(|p| request.selection.includes(&p.id))
                        .cloned()
                        .collect();
                    if !picked.is_empty() {
                        chosen.insert(section.clone(), picked);
                    }
                }
                if chosen.is_empty() {
                    return Err(Error::NoPagesSelected { available });
                }
                Ok((Incoming::Sections(chosen), aggregation.failures.clone()))
            }
        }
    }

    async fn merge_and_persist(
        &mut self,
        request: &MigrationRequest,
        incoming: Incoming,
        section_failures: Vec<SectionFailure>,
    ) -> Result<MigrationResult> {
        let (target_id, plan) = match &request.target {
            TargetRef::Existing(id) => {
                let existing = self.documents.read(id).await?;
                let plan = self.planner.plan(Some(&existing), incoming, request.policy, None);

                let mut document = existing;
                plan.apply_to(&mut document);
                if request.policy == MergePolicy::Overwrite && document.key_visual.is_none() {
                    document.key_visual = self.carried_key_visual(request).await?;
                }
                document.updated_at = Some(Utc::now());
                // sections this merge did not touch are stored as they were
                document.validate_sections(plan.sections.keys().map(String::as_str))?;

                self.progress
                    .transition(MigrationState::Persisting, format!("Writing document {}", id));
                match request.policy {
                    MergePolicy::Append => {
                        for (section, section_plan) in &plan.sections {
                            self.documents
                                .write_field(id, section, &section_plan.pages, &section_plan.order)
                                .await?;
                        }
                    }
                    _ => self.documents.write_full(&document).await?,
                }
                (id.clone(), plan)
            }
            TargetRef::New { source_title, template } => {
                let template = match template {
                    Some(template_id) => match self.documents.read(template_id).await {
                        Ok(doc) => Some(doc),
                        Err(Error::TargetNotFound(_)) => {
                            warn!("template {} not found; creating without a template cover", template_id);
                            None
                        }
                        Err(e) => return Err(e),
                    },
                    None => None,
                };
                let plan = self.planner.plan(None, incoming, MergePolicy::CreateNew, template.as_ref());

                let mut document =
                    TargetDocument::new("", componentized_title(source_title, Utc::now().date_naive()));
                document.key_visual = match self.carried_key_visual(request).await? {
                    Some(kv) => Some(kv),
                    None => template.and_then(|t| t.key_visual),
                };
                plan.apply_to(&mut document);
                document.updated_at = Some(Utc::now());
                document.validate()?;

                self.progress
                    .transition(MigrationState::Persisting, format!("Creating \"{}\"", document.title));
                let id = self.documents.create_new(&document).await?;
                (id, plan)
            }
        };

        Ok(self.result(target_id, request.policy, &plan, section_failures))
    }

    async fn carried_key_visual(&self, request: &MigrationRequest) -> Result<Option<serde_json::Value>> {
        let Some(source) = &request.key_visual_source else {
            return Ok(None);
        };
        match self.documents.read(source).await {
            Ok(doc) => Ok(doc.key_visual),
            Err(Error::TargetNotFound(_)) => {
                warn!("key-visual source {} not found; nothing carried over", source);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn result(
        &self,
        target_id: String,
        policy: MergePolicy,
        plan: &MergePlan,
        section_failures: Vec<SectionFailure>,
    ) -> MigrationResult {
        // count only pages this run brought in, not pre-existing or template pages
        let migrated: Vec<&PageRecord> = self
            .extracted
            .as_ref()
            .map(Extracted::pages)
            .unwrap_or_default()
            .into_iter()
            .filter(|p| {
                plan.sections
                    .values()
                    .any(|s| s.pages.iter().any(|planned| planned.id == p.id))
            })
            .collect();
        let (converted, failed) = count_visuals(migrated.iter().copied());

        let mut summary = format!(
            "Migrated {} pages into {} ({}); {}",
            migrated.len(),
            target_id,
            policy,
            visual_summary(converted, failed)
        );
        if !section_failures.is_empty() {
            summary.push_str(&format!("; {} sections skipped", section_failures.len()));
        }

        MigrationResult {
            target_id,
            policy,
            migrated_pages: migrated.len(),
            sections: plan.sections.keys().cloned().collect(),
            visuals_converted: converted,
            visuals_failed: failed,
            section_failures,
            summary,
        }
    }
}

fn count_visuals<'p>(pages: impl Iterator<Item = &'p PageRecord>) -> (usize, usize) {
    pages.fold((0, 0), |(c, f), p| (c + p.conversion.converted.len(), f + p.conversion.failed.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visual_summary_format() {
        assert_eq!(visual_summary(7, 2), "7/9 visuals converted; 2 kept as original markup");
    }

    #[test]
    fn componentized_titles() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(componentized_title("Plan", date), "Plan (componentized 2024-03-05)");
    }

    #[test]
    fn selection_filters_ids() {
        assert!(Selection::All.includes("x"));
        let s = Selection::ids(["a", "b"]);
        assert!(s.includes("a"));
        assert!(!s.includes("c"));
    }

    #[test]
    fn requests_check_policy_against_target() {
        let bad = MigrationRequest::new(MergePolicy::CreateNew, TargetRef::Existing("d".into()));
        assert!(matches!(bad.validate(), Err(Error::ConfigError(_))));
        let bad = MigrationRequest::new(
            MergePolicy::Append,
            TargetRef::New { source_title: "t".into(), template: None },
        );
        assert!(bad.validate().is_err());
        let ok = MigrationRequest::new(MergePolicy::Overwrite, TargetRef::Existing("d".into()));
        assert!(ok.validate().is_ok());
        assert_eq!(ok.namespace(), "d");
    }

    #[test]
    fn cancel_handle_is_shared() {
        let a = CancelHandle::default();
        let b = a.clone();
        b.cancel();
        assert!(a.is_cancelled());
        a.reset();
        assert!(!b.is_cancelled());
    }
}
