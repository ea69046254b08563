//! Prism Render - server-side rendering proxy
//!
//! Renders client-side applications to static HTML with a single shared
//! headless Chrome, and proxies every other request to the backend app:
//! - One browser process, launched on demand and restarted on a threshold
//! - Crash detection with a relaunch cycle and bounded render retries
//! - Image, stylesheet and font requests blocked during renders
//! - Zombie browser process reaping

pub mod chromium;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod process;
pub mod proxy;
pub mod reaper;
pub mod render;
pub mod rewrite;
pub mod server;

#[cfg(test)]
pub(crate) mod fake;

pub use chromium::{ChromiumLauncher, LaunchOptions};
pub use config::{ConfigError, ProxyConfig};
pub use engine::{
    BrowserInstance, BrowserLauncher, EngineError, EngineResult, RenderPage, ResourceKind,
    BLOCKED_RESOURCES,
};
pub use lifecycle::{BrowserLifecycle, LifecycleError, LifecycleOptions, LifecycleStats};
pub use process::{system_process_table, ProcessRecord, ProcessState, ProcessTable};
pub use proxy::{BackendProxy, ProxyError};
pub use reaper::ZombieReaper;
pub use render::{RenderError, RenderOptions, RenderRequest, RenderStats, Renderer};
pub use rewrite::rewrite_asset_urls;
pub use server::{build_router, serve, serve_until, AppState};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prism_render=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
