//! HTTP-backed isolated contexts
//!
//! Each context performs one GET for its section and exposes the response as
//! a [`StaticSurface`]. This is the browser-less way to aggregate sections:
//! there is no script execution, so the served markup must already be the
//! rendered form.

use std::time::Duration;

use log::debug;
use reqwest::Client;
use url::Url;

use super::{ContextProvider, IsolatedContext, StaticSurface};
use crate::{Error, MigrationConfig, Result};

/// Creates one [`HttpContext`] per section URL
#[derive(Debug, Clone)]
pub struct HttpContextProvider {
    client: Client,
}

impl HttpContextProvider {
    pub fn new(config: &MigrationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.section_load_timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(HttpContextProvider { client })
    }
}

impl ContextProvider for HttpContextProvider {
    type Context = HttpContext;

    async fn create(&self, url: &Url) -> Result<HttpContext> {
        Ok(HttpContext {
            client: self.client.clone(),
            url: url.clone(),
            markup: None,
        })
    }
}

/// One fetched section
#[derive(Debug)]
pub struct HttpContext {
    client: Client,
    url: Url,
    markup: Option<String>,
}

impl HttpContext {
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl IsolatedContext for HttpContext {
    type Surface = StaticSurface;

    async fn wait_loaded(&mut self) -> Result<()> {
        let res = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| Error::LoadError(format!("HTTP GET {} failed: {}", self.url, e)))?;

        let status = res.status();
        if !status.is_success() {
            return Err(Error::NetworkError(format!("{} returned {}", self.url, status)));
        }

        let body = res
            .text()
            .await
            .map_err(|e| Error::LoadError(format!("Failed to read response body: {}", e)))?;
        debug!("loaded {} ({} bytes)", self.url, body.len());
        self.markup = Some(body);
        Ok(())
    }

    async fn surface(&mut self) -> Result<StaticSurface> {
        let markup = self
            .markup
            .as_deref()
            .ok_or_else(|| Error::LoadError(format!("{} has not loaded", self.url)))?;
        Ok(StaticSurface::parse(markup))
    }

    async fn destroy(self) -> Result<()> {
        debug!("closing context for {}", self.url);
        Ok(())
    }
}
