//! Polling render-stability predicate
//!
//! Instead of sleeping a fixed amount and hoping the renderer finished,
//! `PollStability` asks the surface repeatedly, doubling the interval each
//! round, and gives up after a maximum wait.

use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio::time::{sleep, Instant};

use super::{RenderStability, RenderSurface};
use crate::dom::NodeKey;
use crate::MigrationConfig;

/// Exponential-backoff polling against the surface's own readiness signals
#[derive(Debug, Clone)]
pub struct PollStability {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Upper bound for `wait_rendered`
    pub render_max_wait: Duration,
    /// Upper bound for `settle`
    pub settle_max_wait: Duration,
}

impl Default for PollStability {
    fn default() -> Self {
        Self::from_config(&MigrationConfig::default())
    }
}

impl PollStability {
    pub fn from_config(config: &MigrationConfig) -> Self {
        PollStability {
            initial_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            max_interval: Duration::from_millis(config.max_poll_interval_ms.max(config.poll_interval_ms).max(1)),
            render_max_wait: Duration::from_millis(config.diagram_render_max_ms),
            settle_max_wait: Duration::from_millis(config.settle_max_ms),
        }
    }

    /// Poll `probe` until it reports true or `max_wait` elapses
    pub async fn poll<F, Fut>(&self, max_wait: Duration, mut probe: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = Instant::now();
        let mut interval = self.initial_interval;
        let mut rounds = 0u32;
        loop {
            if probe().await {
                return true;
            }
            rounds += 1;
            let elapsed = start.elapsed();
            if elapsed >= max_wait {
                debug!("stability poll gave up after {} rounds ({:?})", rounds, elapsed);
                return false;
            }
            sleep(interval.min(max_wait - elapsed)).await;
            interval = (interval * 2).min(self.max_interval);
        }
    }
}

impl RenderStability for PollStability {
    async fn wait_rendered<S: RenderSurface>(&self, surface: &S, key: &NodeKey) -> bool {
        self.poll(self.render_max_wait, move || surface.is_rendered(key)).await
    }

    async fn settle<S: RenderSurface>(&self, surface: &S) -> bool {
        self.poll(self.settle_max_wait, move || surface.is_settled()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn returns_immediately_when_ready() {
        let stability = PollStability::default();
        let start = Instant::now();
        assert!(stability.poll(Duration::from_secs(1), || async { true }).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_until_ready() {
        let stability = PollStability::default();
        let calls = Cell::new(0);
        let ready = stability
            .poll(Duration::from_secs(1), || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move { n >= 4 }
            })
            .await;
        assert!(ready);
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_wait() {
        let stability = PollStability::default();
        let start = Instant::now();
        assert!(!stability.poll(Duration::from_millis(500), || async { false }).await);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(500));
        assert!(waited < Duration::from_millis(600));
    }
}
