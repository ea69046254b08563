//! Rendering capability consumed by the lifecycle manager and the orchestrator
//!
//! The browser is reached only through these traits. [`crate::chromium`]
//! implements them over the DevTools protocol; tests substitute in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Browser capability errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("Timed out connecting to browser: {0}")]
    HandshakeTimeout(String),

    #[error("Browser disconnected")]
    Disconnected,

    #[error("Page error: {0}")]
    PageError(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Timeout exceeded: {0:?}")]
    Timeout(Duration),

    #[error("Failed to terminate browser process {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Network resource categories as reported by the browser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Document,
    Script,
    Stylesheet,
    Image,
    Font,
    Media,
    Xhr,
    Fetch,
    Other,
}

/// Resources aborted during a render. Rendered output feeds crawlers and other
/// automated consumers, so visual assets are never fetched.
pub const BLOCKED_RESOURCES: [ResourceKind; 3] =
    [ResourceKind::Image, ResourceKind::Stylesheet, ResourceKind::Font];

/// Whether a request of `kind` is aborted under the `blocked` list
pub fn should_block(kind: ResourceKind, blocked: &[ResourceKind]) -> bool {
    blocked.contains(&kind)
}

/// Starts browser processes
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Launch a fresh browser and return a connected handle
    async fn launch(&self) -> EngineResult<Arc<dyn BrowserInstance>>;
}

/// One running browser process
#[async_trait]
pub trait BrowserInstance: Send + Sync {
    /// Whether the control connection to the browser is still alive
    fn is_connected(&self) -> bool;

    /// OS process id, if the browser was spawned by this process
    fn pid(&self) -> Option<u32>;

    /// Open a blank page private to the caller
    async fn new_page(&self) -> EngineResult<Box<dyn RenderPage>>;

    /// Ask the browser to shut down
    async fn close(&self) -> EngineResult<()>;

    /// Force-terminate the browser process. Must succeed when the process
    /// already exited.
    async fn kill(&self) -> EngineResult<()>;
}

/// A page borrowed from a [`BrowserInstance`] for a single render
#[async_trait]
pub trait RenderPage: Send {
    async fn set_user_agent(&mut self, user_agent: &str) -> EngineResult<()>;

    /// Send `X-Forwarded-For` with every request the page makes
    async fn set_forwarded_for(&mut self, client_ip: &str) -> EngineResult<()>;

    async fn set_cache_enabled(&mut self, enabled: bool) -> EngineResult<()>;

    /// Abort requests of the given kinds and let every other request through
    async fn block_resources(&mut self, kinds: &[ResourceKind]) -> EngineResult<()>;

    /// Navigate and wait until the network goes idle, bounded by `timeout`
    async fn goto_network_idle(&mut self, url: &str, timeout: Duration) -> EngineResult<()>;

    /// Serialized HTML of the current document
    async fn content(&mut self) -> EngineResult<String>;

    async fn close(&mut self) -> EngineResult<()>;
}
