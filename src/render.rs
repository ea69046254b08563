//! Render orchestration
//!
//! [`Renderer::render`] turns one inbound request into rendered HTML. Each
//! attempt borrows the shared browser from [`BrowserLifecycle`], opens a
//! private page, applies the identity and blocking policy, navigates, extracts
//! and rewrites the document. Failed attempts are retried with a fixed backoff,
//! carrying the same request parameters every time.

use crate::engine::{BrowserInstance, EngineError, RenderPage, ResourceKind, BLOCKED_RESOURCES};
use crate::lifecycle::{BrowserLifecycle, LifecycleError};
use crate::rewrite::rewrite_asset_urls;
use axum::http::HeaderValue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

/// User agent sent when the caller's is missing or not a valid header value
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0";

pub const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Render errors
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Browser unavailable")]
    BrowserUnavailable,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Render failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<RenderError>,
    },
}

impl RenderError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RenderError::Lifecycle(LifecycleError::ShutDown))
    }
}

/// Render policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderOptions {
    /// Bound on navigation plus the network-idle wait
    pub navigation_timeout: Duration,

    /// Retries after the first failed attempt
    pub max_retries: u32,

    /// Fixed pause between attempts
    pub retry_backoff: Duration,

    /// Request types aborted during navigation
    pub blocked_resources: Vec<ResourceKind>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            blocked_resources: BLOCKED_RESOURCES.to_vec(),
        }
    }
}

/// One inbound render
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub target_url: Url,
    pub user_agent: Option<String>,
    pub client_ip: Option<String>,
}

impl RenderRequest {
    pub fn new(target_url: Url) -> Self {
        Self {
            target_url,
            user_agent: None,
            client_ip: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }
}

#[derive(Default)]
struct RenderCounters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time counters for the render service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub browser_launches: u64,
    pub browser_restarts: u64,
    pub zombies_signalled: u64,
}

/// Normalize a caller-supplied user agent. Never fails; anything unusable
/// becomes [`DEFAULT_USER_AGENT`].
pub fn sanitize_user_agent(user_agent: Option<&str>) -> String {
    user_agent
        .map(str::trim)
        .filter(|ua| !ua.is_empty() && HeaderValue::from_str(ua).is_ok())
        .unwrap_or(DEFAULT_USER_AGENT)
        .to_string()
}

/// Per-request render coordinator
pub struct Renderer {
    lifecycle: Arc<BrowserLifecycle>,
    options: RenderOptions,
    counters: RenderCounters,
}

impl Renderer {
    pub fn new(lifecycle: Arc<BrowserLifecycle>, options: RenderOptions) -> Self {
        Self {
            lifecycle,
            options,
            counters: RenderCounters::default(),
        }
    }

    pub fn lifecycle(&self) -> &Arc<BrowserLifecycle> {
        &self.lifecycle
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub fn stats(&self) -> RenderStats {
        let lifecycle = self.lifecycle.stats();
        RenderStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            browser_launches: lifecycle.launches,
            browser_restarts: lifecycle.restarts,
            zombies_signalled: self.lifecycle.reaper().total_signalled(),
        }
    }

    /// Render `request` to HTML, retrying up to `max_retries` times
    pub async fn render(&self, request: &RenderRequest) -> Result<String, RenderError> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            match self.attempt(request).await {
                Ok(html) => {
                    self.counters.successes.fetch_add(1, Ordering::Relaxed);
                    info!(
                        url = %request.target_url,
                        attempts = attempt + 1,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Rendered page"
                    );
                    return Ok(html);
                }
                Err(e) if attempt < self.options.max_retries && e.is_retryable() => {
                    attempt += 1;
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        url = %request.target_url,
                        "Render attempt failed ({}), retrying {}/{}",
                        e,
                        attempt,
                        self.options.max_retries
                    );
                    tokio::time::sleep(self.options.retry_backoff).await;
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    error!(url = %request.target_url, "Render failed: {}", e);
                    return Err(RenderError::Exhausted {
                        attempts: attempt + 1,
                        last: Box::new(e),
                    });
                }
            }
        }
    }

    async fn attempt(&self, request: &RenderRequest) -> Result<String, RenderError> {
        self.lifecycle.restart_if_due().await;

        let browser = self.acquire_browser().await?;
        let mut page = browser.new_page().await?;

        let result = self.drive(page.as_mut(), request).await;

        if let Err(e) = page.close().await {
            debug!("Failed to close page: {}", e);
        }

        let html = result?;
        let count = self.lifecycle.record_render();
        debug!(render_count = count, "Render counted");
        Ok(html)
    }

    /// Borrow a connected browser, relaunching once if the current one is
    /// missing or disconnected.
    async fn acquire_browser(&self) -> Result<Arc<dyn BrowserInstance>, RenderError> {
        match self.lifecycle.ensure_browser().await {
            Ok(browser) if browser.is_connected() => return Ok(browser),
            Ok(stale) => {
                warn!("Browser not connected, relaunching");
                // Another request may already have replaced it.
                self.lifecycle.close_if_current(&stale).await;
            }
            Err(e @ LifecycleError::ShutDown) => return Err(e.into()),
            // A failed launch leaves no handle behind; nothing to close.
            Err(e) => warn!("Browser unavailable ({}), relaunching", e),
        }

        let browser = self.lifecycle.ensure_browser().await?;
        if !browser.is_connected() {
            return Err(RenderError::BrowserUnavailable);
        }
        Ok(browser)
    }

    async fn drive(
        &self,
        page: &mut dyn RenderPage,
        request: &RenderRequest,
    ) -> Result<String, RenderError> {
        let user_agent = sanitize_user_agent(request.user_agent.as_deref());
        page.set_user_agent(&user_agent).await?;

        if let Some(client_ip) = request.client_ip.as_deref() {
            if let Err(e) = page.set_forwarded_for(client_ip).await {
                warn!("Failed to set X-Forwarded-For: {}", e);
            }
        }

        page.set_cache_enabled(true).await?;
        page.block_resources(&self.options.blocked_resources).await?;

        page.goto_network_idle(request.target_url.as_str(), self.options.navigation_timeout)
            .await?;

        let html = page.content().await?;
        Ok(rewrite_asset_urls(&html, &request.target_url))
    }
}
