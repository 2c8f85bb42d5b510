//! Headless Chrome rendering substrate
//!
//! A dedicated worker thread owns the `headless_chrome::Browser` and all of
//! its tabs; async callers talk to it through a command channel and get their
//! answers back over `tokio::sync::oneshot`. One tab is one isolated context.
//!
//! When a tab is snapshotted, every element is stamped with a
//! `data-migrate-key` attribute and the markup is read back afterwards, so the
//! keys in the parsed tree address the same live elements that pixels and
//! element screenshots are taken from.

use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use base64::Engine as Base64Engine;
use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions};
use log::{debug, warn};
use serde::Deserialize;
use tokio::sync::oneshot;
use url::Url;

use crate::dom::{NodeKey, RenderedTree, KEY_ATTRIBUTE};
use crate::platform::{ContextProvider, IsolatedContext, RenderSurface, VisualMetrics};
use crate::{Error, MigrationConfig, Result};

type TabId = u64;

enum Command {
    Open(String, oneshot::Sender<Result<TabId>>),
    WaitLoaded(TabId, oneshot::Sender<Result<()>>),
    Snapshot(TabId, oneshot::Sender<Result<String>>),
    CanvasPng(TabId, String, oneshot::Sender<Result<Vec<u8>>>),
    ElementPng(TabId, String, oneshot::Sender<Result<Vec<u8>>>),
    IsRendered(TabId, String, oneshot::Sender<Result<bool>>),
    IsSettled(TabId, oneshot::Sender<Result<bool>>),
    CloseTab(TabId, oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

// Stamps keys and collects computed metrics of elements the engine inspects
const SNAPSHOT_JS: &str = r#"
(function() {
    const attr = '{{KEY_ATTR}}';
    const inspected = 'canvas, svg, h4, .mermaid-diagram-container, .mermaid, [data-mermaid-diagram]';
    const metrics = {};
    let n = 0;
    for (const el of document.querySelectorAll('*')) {
        let key = el.getAttribute(attr);
        if (!key) {
            key = 'k' + n;
            el.setAttribute(attr, key);
        }
        n++;
        if (!el.matches(inspected)) continue;
        const cs = getComputedStyle(el);
        const parent = el.parentElement ? getComputedStyle(el.parentElement).maxWidth : 'none';
        metrics[key] = {
            width: cs.width,
            height: cs.height,
            display: cs.display,
            margin: cs.margin,
            maxWidth: cs.maxWidth,
            parentMaxWidth: parent && parent !== 'none' ? parent : null,
            borderLeft: cs.borderLeft
        };
    }
    return JSON.stringify({ html: document.documentElement.outerHTML, metrics: metrics });
})()
"#;

const CANVAS_JS: &str = r#"
(function() {
    const el = document.querySelector('[{{KEY_ATTR}}=' + JSON.stringify({{KEY}}) + ']');
    if (!el || typeof el.toDataURL !== 'function') return null;
    try { return el.toDataURL('image/png'); } catch (e) { return null; }
})()
"#;

const RENDERED_JS: &str = r#"
(function() {
    const el = document.querySelector('[{{KEY_ATTR}}=' + JSON.stringify({{KEY}}) + ']');
    if (!el) return false;
    return el.getAttribute('data-processed') === 'true' || el.querySelector('svg') !== null;
})()
"#;

fn keyed_script(template: &str, key: &str) -> Result<String> {
    let literal = serde_json::to_string(key)?;
    Ok(template.replace("{{KEY_ATTR}}", KEY_ATTRIBUTE).replace("{{KEY}}", &literal))
}

fn key_selector(key: &str) -> Result<String> {
    Ok(format!("[{}={}]", KEY_ATTRIBUTE, serde_json::to_string(key)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetrics {
    width: Option<String>,
    height: Option<String>,
    display: Option<String>,
    margin: Option<String>,
    max_width: Option<String>,
    parent_max_width: Option<String>,
    border_left: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    html: String,
    #[serde(default)]
    metrics: HashMap<String, RawMetrics>,
}

fn eval_value(tab: &Tab, script: &str) -> Result<Option<serde_json::Value>> {
    let remote = tab
        .evaluate(script, false)
        .map_err(|e| Error::RenderError(format!("Evaluation failed: {}", e)))?;
    Ok(remote.value.filter(|v| !v.is_null()))
}

struct Worker {
    browser: Browser,
    tabs: HashMap<TabId, Arc<Tab>>,
    next_tab: TabId,
    user_agent: String,
    timeout: Duration,
}

impl Worker {
    fn tab(&self, id: TabId) -> Result<&Arc<Tab>> {
        self.tabs
            .get(&id)
            .ok_or_else(|| Error::RenderError(format!("tab {} is closed", id)))
    }

    fn open(&mut self, url: &str) -> Result<TabId> {
        let tab = self
            .browser
            .new_tab()
            .map_err(|e| Error::LoadError(format!("Failed to create tab: {}", e)))?;
        tab.set_default_timeout(self.timeout);
        tab.set_user_agent(&self.user_agent, None, None)
            .map_err(|e| Error::LoadError(format!("Failed to set user agent: {}", e)))?;
        tab.navigate_to(url)
            .map_err(|e| Error::LoadError(format!("Navigation failed: {}", e)))?;

        self.next_tab += 1;
        self.tabs.insert(self.next_tab, tab);
        Ok(self.next_tab)
    }

    fn wait_loaded(&self, id: TabId) -> Result<()> {
        self.tab(id)?
            .wait_until_navigated()
            .map_err(|e| Error::LoadError(format!("Wait for navigation failed: {}", e)))?;
        Ok(())
    }

    fn snapshot(&self, id: TabId) -> Result<String> {
        let script = SNAPSHOT_JS.replace("{{KEY_ATTR}}", KEY_ATTRIBUTE);
        match eval_value(self.tab(id)?, &script)? {
            Some(serde_json::Value::String(s)) => Ok(s),
            Some(other) => Ok(other.to_string()),
            None => Err(Error::RenderError("No value returned from snapshot".into())),
        }
    }

    fn canvas_png(&self, id: TabId, key: &str) -> Result<Vec<u8>> {
        let value = eval_value(self.tab(id)?, &keyed_script(CANVAS_JS, key)?)?;
        let data_url = value
            .as_ref()
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::RenderError(format!("canvas {} has no pixels", key)))?;
        let (_, payload) = data_url
            .split_once(',')
            .ok_or_else(|| Error::RenderError("malformed data URL".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| Error::RenderError(format!("bad canvas data: {}", e)))
    }

    fn element_png(&self, id: TabId, key: &str) -> Result<Vec<u8>> {
        let tab = self.tab(id)?;
        let element = tab
            .find_element(&key_selector(key)?)
            .map_err(|e| Error::RenderError(format!("element {} not found: {}", key, e)))?;
        element
            .capture_screenshot(Page::CaptureScreenshotFormatOption::Png)
            .map_err(|e| Error::RenderError(format!("Screenshot failed: {}", e)))
    }

    fn is_rendered(&self, id: TabId, key: &str) -> Result<bool> {
        let value = eval_value(self.tab(id)?, &keyed_script(RENDERED_JS, key)?)?;
        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    fn is_settled(&self, id: TabId) -> Result<bool> {
        let value = eval_value(self.tab(id)?, "document.readyState === 'complete'")?;
        Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
    }

    fn close_tab(&mut self, id: TabId) -> Result<()> {
        if let Some(tab) = self.tabs.remove(&id) {
            tab.close(false)?;
        }
        Ok(())
    }
}

/// Async handle to a headless Chrome worker thread
#[derive(Clone)]
pub struct CdpBrowser {
    cmd_tx: Sender<Command>,
}

impl CdpBrowser {
    /// Launch Chrome on a background thread that owns it
    pub async fn launch(config: &MigrationConfig) -> Result<Self> {
        let user_agent = config.user_agent.clone();
        let timeout = Duration::from_millis(config.section_load_timeout_ms);

        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
        let (init_tx, init_rx) = oneshot::channel::<Result<()>>();

        thread::spawn(move || {
            let launch = LaunchOptions::default_builder()
                .headless(true)
                .window_size(Some((1280, 720)))
                .build()
                .map_err(|e| Error::CdpError(format!("Failed to build launch options: {}", e)))
                .and_then(|options| {
                    Browser::new(options).map_err(|e| Error::CdpError(format!("Failed to launch browser: {}", e)))
                });
            let browser = match launch {
                Ok(b) => b,
                Err(err) => {
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };
            let _ = init_tx.send(Ok(()));

            let mut worker = Worker { browser, tabs: HashMap::new(), next_tab: 0, user_agent, timeout };
            while let Ok(cmd) = cmd_rx.recv() {
                match cmd {
                    Command::Open(url, resp) => {
                        let _ = resp.send(worker.open(&url));
                    }
                    Command::WaitLoaded(id, resp) => {
                        let _ = resp.send(worker.wait_loaded(id));
                    }
                    Command::Snapshot(id, resp) => {
                        let _ = resp.send(worker.snapshot(id));
                    }
                    Command::CanvasPng(id, key, resp) => {
                        let _ = resp.send(worker.canvas_png(id, &key));
                    }
                    Command::ElementPng(id, key, resp) => {
                        let _ = resp.send(worker.element_png(id, &key));
                    }
                    Command::IsRendered(id, key, resp) => {
                        let _ = resp.send(worker.is_rendered(id, &key));
                    }
                    Command::IsSettled(id, resp) => {
                        let _ = resp.send(worker.is_settled(id));
                    }
                    Command::CloseTab(id, resp) => {
                        let _ = resp.send(worker.close_tab(id));
                    }
                    Command::Shutdown(resp) => {
                        let ids: Vec<TabId> = worker.tabs.keys().copied().collect();
                        for id in ids {
                            if let Err(e) = worker.close_tab(id) {
                                warn!("closing tab {} on shutdown: {}", id, e);
                            }
                        }
                        let _ = resp.send(Ok(()));
                        break;
                    }
                }
            }
            debug!("cdp worker exiting");
        });

        init_rx
            .await
            .map_err(|e| Error::Other(format!("Worker init canceled: {}", e)))??;
        Ok(Self { cmd_tx })
    }

    async fn request<T>(&self, what: &str, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| Error::CdpError("browser worker has exited".into()))?;
        rx.await
            .map_err(|e| Error::Other(format!("{} canceled: {}", what, e)))?
    }

    /// Open `url` in a new tab
    pub async fn open(&self, url: &Url) -> Result<CdpContext> {
        let tab = self.request("Open", |tx| Command::Open(url.to_string(), tx)).await?;
        Ok(CdpContext { browser: self.clone(), tab })
    }

    /// Shut the worker and its browser down
    pub async fn close(self) -> Result<()> {
        self.request("Shutdown", Command::Shutdown).await
    }
}

/// One tab showing one section
pub struct CdpContext {
    browser: CdpBrowser,
    tab: TabId,
}

impl IsolatedContext for CdpContext {
    type Surface = CdpSurface;

    async fn wait_loaded(&mut self) -> Result<()> {
        let tab = self.tab;
        self.browser.request("WaitLoaded", |tx| Command::WaitLoaded(tab, tx)).await
    }

    async fn surface(&mut self) -> Result<CdpSurface> {
        let tab = self.tab;
        let json = self.browser.request("Snapshot", |tx| Command::Snapshot(tab, tx)).await?;
        let raw: RawSnapshot = serde_json::from_str(&json)?;
        Ok(CdpSurface {
            browser: self.browser.clone(),
            tab,
            tree: RenderedTree::parse(&raw.html),
            metrics: raw.metrics,
        })
    }

    async fn destroy(self) -> Result<()> {
        let tab = self.tab;
        self.browser.request("CloseTab", |tx| Command::CloseTab(tab, tx)).await
    }
}

/// Opens one tab per section URL
#[derive(Clone)]
pub struct CdpContextProvider {
    browser: CdpBrowser,
}

impl CdpContextProvider {
    pub fn new(browser: CdpBrowser) -> Self {
        CdpContextProvider { browser }
    }
}

impl ContextProvider for CdpContextProvider {
    type Context = CdpContext;

    async fn create(&self, url: &Url) -> Result<CdpContext> {
        self.browser.open(url).await
    }
}

/// A live tab: parsed markup with stamped keys plus pixel access
pub struct CdpSurface {
    browser: CdpBrowser,
    tab: TabId,
    tree: RenderedTree,
    metrics: HashMap<String, RawMetrics>,
}

impl RenderSurface for CdpSurface {
    fn tree(&self) -> &RenderedTree {
        &self.tree
    }

    fn metrics(&self, key: &NodeKey) -> Option<VisualMetrics> {
        let raw = self.metrics.get(key.as_str())?;
        Some(VisualMetrics {
            width: raw.width.clone(),
            height: raw.height.clone(),
            display: raw.display.clone(),
            margin: raw.margin.clone(),
            max_width: raw.max_width.clone(),
            parent_max_width: raw.parent_max_width.clone(),
        })
    }

    // only the properties collected at snapshot time are available
    fn computed_style(&self, key: &NodeKey, property: &str) -> Option<String> {
        let raw = self.metrics.get(key.as_str())?;
        match property {
            "border-left" => raw.border_left.clone(),
            "width" => raw.width.clone(),
            "height" => raw.height.clone(),
            "display" => raw.display.clone(),
            "margin" => raw.margin.clone(),
            "max-width" => raw.max_width.clone(),
            _ => None,
        }
    }

    async fn is_rendered(&self, key: &NodeKey) -> bool {
        let (tab, key) = (self.tab, key.to_string());
        match self.browser.request("IsRendered", |tx| Command::IsRendered(tab, key, tx)).await {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("render check failed: {}", e);
                false
            }
        }
    }

    async fn read_pixels(&self, key: &NodeKey) -> Result<Vec<u8>> {
        let (tab, key) = (self.tab, key.to_string());
        self.browser.request("CanvasPng", |tx| Command::CanvasPng(tab, key, tx)).await
    }

    async fn capture(&self, key: &NodeKey) -> Result<Vec<u8>> {
        let (tab, key) = (self.tab, key.to_string());
        self.browser.request("ElementPng", |tx| Command::ElementPng(tab, key, tx)).await
    }

    async fn is_settled(&self) -> bool {
        let tab = self.tab;
        self.browser
            .request("IsSettled", |tx| Command::IsSettled(tab, tx))
            .await
            .unwrap_or(false)
    }
}
