//! Chrome/Chromium implementation of the rendering capability

use crate::engine::{
    should_block, BrowserInstance, BrowserLauncher, EngineError, EngineResult, RenderPage,
    ResourceKind,
};
use crate::process;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams, RequestPattern,
    RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ErrorReason, Headers, ResourceType, SetCacheDisabledParams, SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    EventLifecycleEvent, FrameId, SetLifecycleEventsEnabledParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default DevTools protocol timeout
pub const DEFAULT_PROTOCOL_TIMEOUT: Duration = Duration::from_secs(240);

/// Lifecycle event Chrome emits once no network connections remain for 500ms
const NETWORK_IDLE_EVENT: &str = "networkIdle";

/// Lifecycle event marking the start of a new document
const NAVIGATION_INIT_EVENT: &str = "init";

/// How long to wait for the killed process to be collected
const EXIT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Browser launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Chrome executable; auto-detected when unset
    pub executable: Option<PathBuf>,

    /// Headless mode
    pub headless: bool,

    /// Timeout for individual DevTools protocol requests
    pub protocol_timeout: Duration,

    /// Extra command line switches
    pub args: Vec<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            protocol_timeout: DEFAULT_PROTOCOL_TIMEOUT,
            args: vec![
                "--disable-setuid-sandbox".to_string(),
                "--disable-gpu".to_string(),
            ],
        }
    }
}

/// Launches Chrome over the DevTools protocol
#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    options: LaunchOptions,
}

impl ChromiumLauncher {
    pub fn new(options: LaunchOptions) -> Self {
        Self { options }
    }

    fn build_config(&self) -> EngineResult<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(self.options.protocol_timeout)
            .args(self.options.args.clone());

        if !self.options.headless {
            builder = builder.with_head();
        }

        if let Some(executable) = &self.options.executable {
            builder = builder.chrome_executable(executable);
        }

        builder
            .build()
            .map_err(|e| EngineError::LaunchFailed(format!("Failed to build config: {}", e)))
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> EngineResult<Arc<dyn BrowserInstance>> {
        info!("Launching browser...");

        let config = self.build_config()?;

        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| classify_launch_error(&e.to_string()))?;

        let pid = browser
            .get_mut_child()
            .and_then(|child| child.as_mut_inner().id());

        // The handler drives the websocket; when it ends the browser is gone.
        let connected = Arc::new(AtomicBool::new(true));
        let handler_connected = Arc::clone(&connected);
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler error: {}", e);
                }
            }
            handler_connected.store(false, Ordering::SeqCst);
            warn!("Browser connection closed");
        });

        info!(pid = ?pid, "Browser launched successfully");

        Ok(Arc::new(ChromiumBrowser {
            browser: Mutex::new(browser),
            pid,
            connected,
            handler_task,
        }))
    }
}

/// Launch errors carrying the DevTools handshake timeout signature leave a
/// half-started process behind and are reported separately.
pub fn classify_launch_error(message: &str) -> EngineError {
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        EngineError::HandshakeTimeout(message.to_string())
    } else {
        EngineError::LaunchFailed(message.to_string())
    }
}

/// A running Chrome process
pub struct ChromiumBrowser {
    browser: Mutex<Browser>,
    pid: Option<u32>,
    connected: Arc<AtomicBool>,
    handler_task: JoinHandle<()>,
}

#[async_trait]
impl BrowserInstance for ChromiumBrowser {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.handler_task.is_finished()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn new_page(&self) -> EngineResult<Box<dyn RenderPage>> {
        if !self.is_connected() {
            return Err(EngineError::Disconnected);
        }

        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| EngineError::PageError(e.to_string()))?;

        Ok(Box::new(ChromiumPage::new(page)))
    }

    async fn close(&self) -> EngineResult<()> {
        self.browser
            .lock()
            .await
            .close()
            .await
            .map_err(|e| EngineError::PageError(e.to_string()))?;
        Ok(())
    }

    async fn kill(&self) -> EngineResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.handler_task.abort();

        let Some(pid) = self.pid else {
            return Ok(());
        };

        debug!(pid, "Killing browser process");
        process::force_kill(pid).map_err(|e| EngineError::KillFailed {
            pid,
            reason: e.to_string(),
        })?;

        // Collect the exit status so the process does not linger as a zombie.
        let mut browser = self.browser.lock().await;
        match tokio::time::timeout(EXIT_WAIT_TIMEOUT, browser.wait()).await {
            Ok(Ok(_)) => debug!(pid, "Browser process exited"),
            Ok(Err(e)) => debug!(pid, "Failed to wait for browser process: {}", e),
            Err(_) => warn!(pid, "Browser process did not exit after kill"),
        }

        Ok(())
    }
}

impl Drop for ChromiumBrowser {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

impl From<&ResourceType> for ResourceKind {
    fn from(resource_type: &ResourceType) -> Self {
        match resource_type {
            ResourceType::Document => ResourceKind::Document,
            ResourceType::Script => ResourceKind::Script,
            ResourceType::Stylesheet => ResourceKind::Stylesheet,
            ResourceType::Image => ResourceKind::Image,
            ResourceType::Font => ResourceKind::Font,
            ResourceType::Media => ResourceKind::Media,
            ResourceType::Xhr => ResourceKind::Xhr,
            ResourceType::Fetch => ResourceKind::Fetch,
            _ => ResourceKind::Other,
        }
    }
}

/// Follows lifecycle events until the main frame's new document goes idle.
///
/// Events from child frames are ignored; an iframe settling first says
/// nothing about the page. Without a known main frame every frame counts.
struct NetworkIdleWatch {
    main_frame: Option<FrameId>,
    started: bool,
}

impl NetworkIdleWatch {
    fn new(main_frame: Option<FrameId>) -> Self {
        Self {
            main_frame,
            started: false,
        }
    }

    /// Returns true once the network is idle
    fn observe(&mut self, frame_id: &FrameId, name: &str) -> bool {
        if let Some(main_frame) = &self.main_frame {
            if main_frame != frame_id {
                return false;
            }
        }

        match name {
            NAVIGATION_INIT_EVENT => {
                self.started = true;
                false
            }
            NETWORK_IDLE_EVENT => self.started,
            _ => false,
        }
    }
}

/// A Chrome tab used for one render
pub struct ChromiumPage {
    page: Page,
    interceptor: Option<JoinHandle<()>>,
    closed: bool,
}

impl ChromiumPage {
    fn new(page: Page) -> Self {
        Self {
            page,
            interceptor: None,
            closed: false,
        }
    }
}

fn page_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::PageError(e.to_string())
}

#[async_trait]
impl RenderPage for ChromiumPage {
    async fn set_user_agent(&mut self, user_agent: &str) -> EngineResult<()> {
        self.page
            .set_user_agent(user_agent)
            .await
            .map_err(page_error)?;
        Ok(())
    }

    async fn set_forwarded_for(&mut self, client_ip: &str) -> EngineResult<()> {
        let headers = Headers::new(serde_json::json!({ "X-Forwarded-For": client_ip }));
        self.page
            .execute(SetExtraHttpHeadersParams::new(headers))
            .await
            .map_err(page_error)?;
        Ok(())
    }

    async fn set_cache_enabled(&mut self, enabled: bool) -> EngineResult<()> {
        self.page
            .execute(SetCacheDisabledParams::new(!enabled))
            .await
            .map_err(page_error)?;
        Ok(())
    }

    async fn block_resources(&mut self, kinds: &[ResourceKind]) -> EngineResult<()> {
        let mut paused = self
            .page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(page_error)?;

        let pattern = RequestPattern::builder()
            .url_pattern("*")
            .request_stage(RequestStage::Request)
            .build();
        self.page
            .execute(EnableParams::builder().pattern(pattern).build())
            .await
            .map_err(page_error)?;

        let page = self.page.clone();
        let blocked = kinds.to_vec();
        self.interceptor = Some(tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let kind = ResourceKind::from(&event.resource_type);
                let outcome = if should_block(kind, &blocked) {
                    page.execute(FailRequestParams::new(
                        event.request_id.clone(),
                        ErrorReason::BlockedByClient,
                    ))
                    .await
                    .map(|_| ())
                } else {
                    page.execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(|_| ())
                };

                if let Err(e) = outcome {
                    debug!("Failed to resolve intercepted request: {}", e);
                }
            }
        }));

        Ok(())
    }

    async fn goto_network_idle(&mut self, url: &str, timeout: Duration) -> EngineResult<()> {
        self.page
            .execute(SetLifecycleEventsEnabledParams::new(true))
            .await
            .map_err(page_error)?;

        // Subscribe before navigating so early lifecycle events are buffered.
        let mut lifecycle = self
            .page
            .event_listener::<EventLifecycleEvent>()
            .await
            .map_err(page_error)?;

        let main_frame = self.page.mainframe().await.map_err(page_error)?;
        if main_frame.is_none() {
            debug!("Main frame unknown, accepting lifecycle events from any frame");
        }
        let mut watch = NetworkIdleWatch::new(main_frame);

        let page = &self.page;
        let navigation = async move {
            page.goto(url)
                .await
                .map_err(|e| EngineError::NavigationFailed(e.to_string()))?;

            while let Some(event) = lifecycle.next().await {
                if watch.observe(&event.frame_id, &event.name) {
                    return Ok(());
                }
            }

            Err(EngineError::Disconnected)
        };

        tokio::time::timeout(timeout, navigation)
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
    }

    async fn content(&mut self) -> EngineResult<String> {
        self.page.content().await.map_err(page_error)
    }

    async fn close(&mut self) -> EngineResult<()> {
        if let Some(interceptor) = self.interceptor.take() {
            interceptor.abort();
        }

        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.page.clone().close().await.map_err(page_error)
    }
}

impl Drop for ChromiumPage {
    fn drop(&mut self) {
        if let Some(interceptor) = self.interceptor.take() {
            interceptor.abort();
        }

        // Dropped mid-render, e.g. when the client went away.
        if !self.closed {
            let page = self.page.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = page.close().await {
                        debug!("Failed to close abandoned page: {}", e);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BLOCKED_RESOURCES;

    #[test]
    fn test_launch_options_default() {
        let options = LaunchOptions::default();
        assert!(options.headless);
        assert!(options.executable.is_none());
        assert_eq!(options.protocol_timeout, DEFAULT_PROTOCOL_TIMEOUT);
        assert!(options.args.contains(&"--disable-gpu".to_string()));
        assert!(options.args.contains(&"--disable-setuid-sandbox".to_string()));
    }

    #[test]
    fn test_handshake_timeout_classification() {
        let err = classify_launch_error("Timed out after 30000 ms while trying to connect to the browser");
        assert!(matches!(err, EngineError::HandshakeTimeout(_)));

        let err = classify_launch_error("Request timeout");
        assert!(matches!(err, EngineError::HandshakeTimeout(_)));
    }

    #[test]
    fn test_other_launch_errors() {
        let err = classify_launch_error("Could not auto detect a chrome executable");
        assert!(matches!(err, EngineError::LaunchFailed(_)));
    }

    #[test]
    fn test_resource_type_mapping() {
        assert_eq!(ResourceKind::from(&ResourceType::Image), ResourceKind::Image);
        assert_eq!(ResourceKind::from(&ResourceType::Stylesheet), ResourceKind::Stylesheet);
        assert_eq!(ResourceKind::from(&ResourceType::Font), ResourceKind::Font);
        assert_eq!(ResourceKind::from(&ResourceType::Script), ResourceKind::Script);
        assert_eq!(ResourceKind::from(&ResourceType::WebSocket), ResourceKind::Other);
    }

    #[test]
    fn test_visual_resources_are_blocked() {
        let blocked = |resource_type: ResourceType| {
            should_block(ResourceKind::from(&resource_type), &BLOCKED_RESOURCES)
        };

        assert!(blocked(ResourceType::Image));
        assert!(blocked(ResourceType::Stylesheet));
        assert!(blocked(ResourceType::Font));
        assert!(!blocked(ResourceType::Document));
        assert!(!blocked(ResourceType::Script));
        assert!(!blocked(ResourceType::Xhr));
        assert!(!blocked(ResourceType::Fetch));
        assert!(!blocked(ResourceType::Media));
    }

    #[test]
    fn test_network_idle_waits_for_main_frame() {
        let main = FrameId::new("main");
        let child = FrameId::new("child");
        let mut watch = NetworkIdleWatch::new(Some(main.clone()));

        assert!(!watch.observe(&main, "networkIdle"));
        assert!(!watch.observe(&child, "init"));
        assert!(!watch.observe(&child, "networkIdle"));
        assert!(!watch.observe(&main, "init"));
        assert!(!watch.observe(&child, "networkIdle"));
        assert!(!watch.observe(&main, "load"));
        assert!(watch.observe(&main, "networkIdle"));
    }

    #[test]
    fn test_network_idle_without_known_main_frame() {
        let frame = FrameId::new("any");
        let mut watch = NetworkIdleWatch::new(None);

        assert!(!watch.observe(&frame, "networkIdle"));
        assert!(!watch.observe(&frame, "init"));
        assert!(watch.observe(&frame, "networkIdle"));
    }
}
