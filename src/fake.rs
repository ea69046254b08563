//! In-memory rendering capability for unit tests

use crate::engine::{
    BrowserInstance, BrowserLauncher, EngineError, EngineResult, RenderPage, ResourceKind,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a page saw during one render
#[derive(Debug, Clone, Default)]
pub struct PageRecord {
    pub user_agent: Option<String>,
    pub forwarded_for: Option<String>,
    pub cache_enabled: Option<bool>,
    pub blocked: Vec<ResourceKind>,
    pub url: Option<String>,
    pub closed: bool,
}

/// Page behaviour shared by every browser a launcher creates
struct PageScript {
    html: Mutex<String>,
    navigation_failures: AtomicUsize,
    fail_forwarded_for: AtomicBool,
    pages: Mutex<Vec<Arc<Mutex<PageRecord>>>>,
}

type BrowserSetup = Box<dyn Fn(FakeBrowser) -> FakeBrowser + Send + Sync>;

pub struct FakeLauncher {
    script: Arc<PageScript>,
    launch_delay: Duration,
    setup: Option<BrowserSetup>,
    failures: Mutex<VecDeque<EngineError>>,
    browsers: Mutex<Vec<Arc<FakeBrowser>>>,
    attempts: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    overlapping: AtomicUsize,
    next_pid: AtomicU32,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            script: Arc::new(PageScript {
                html: Mutex::new("<html><body>rendered</body></html>".to_string()),
                navigation_failures: AtomicUsize::new(0),
                fail_forwarded_for: AtomicBool::new(false),
                pages: Mutex::new(Vec::new()),
            }),
            launch_delay: Duration::ZERO,
            setup: None,
            failures: Mutex::new(VecDeque::new()),
            browsers: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            overlapping: AtomicUsize::new(0),
            next_pid: AtomicU32::new(1000),
        }
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn with_browser(
        mut self,
        setup: impl Fn(FakeBrowser) -> FakeBrowser + Send + Sync + 'static,
    ) -> Self {
        self.setup = Some(Box::new(setup));
        self
    }

    pub fn with_html(self, html: &str) -> Self {
        *self.script.html.lock() = html.to_string();
        self
    }

    /// Fail the next `count` navigations
    pub fn fail_navigations(&self, count: usize) {
        self.script
            .navigation_failures
            .store(count, Ordering::SeqCst);
    }

    pub fn fail_forwarded_for(&self) {
        self.script.fail_forwarded_for.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_launch(&self, error: EngineError) {
        self.failures.lock().push_back(error);
    }

    /// Successful launches
    pub fn launches(&self) -> usize {
        self.browsers.lock().len()
    }

    /// Launch attempts, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_launches(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Successful launches made while an earlier browser was still alive
    pub fn overlapping_launches(&self) -> usize {
        self.overlapping.load(Ordering::SeqCst)
    }

    pub fn browser(&self, index: usize) -> Arc<FakeBrowser> {
        Arc::clone(&self.browsers.lock()[index])
    }

    pub fn pages(&self) -> Vec<PageRecord> {
        self.script
            .pages
            .lock()
            .iter()
            .map(|page| page.lock().clone())
            .collect()
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> EngineResult<Arc<dyn BrowserInstance>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let mut browser = FakeBrowser::new(
            self.next_pid.fetch_add(1, Ordering::SeqCst),
            Arc::clone(&self.script),
        );
        if let Some(setup) = &self.setup {
            browser = setup(browser);
        }

        let browser = Arc::new(browser);
        let mut browsers = self.browsers.lock();
        if browsers.iter().any(|earlier| !earlier.was_killed()) {
            self.overlapping.fetch_add(1, Ordering::SeqCst);
        }
        browsers.push(Arc::clone(&browser));
        drop(browsers);
        Ok(browser)
    }
}

pub struct FakeBrowser {
    pid: u32,
    script: Arc<PageScript>,
    connected: AtomicBool,
    hang_on_close: bool,
    fail_on_close: bool,
    closed: AtomicBool,
    kills: AtomicUsize,
}

impl FakeBrowser {
    fn new(pid: u32, script: Arc<PageScript>) -> Self {
        Self {
            pid,
            script,
            connected: AtomicBool::new(true),
            hang_on_close: false,
            fail_on_close: false,
            closed: AtomicBool::new(false),
            kills: AtomicUsize::new(0),
        }
    }

    pub fn hang_on_close(mut self) -> Self {
        self.hang_on_close = true;
        self
    }

    pub fn fail_on_close(mut self) -> Self {
        self.fail_on_close = true;
        self
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn was_killed(&self) -> bool {
        self.kill_count() > 0
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserInstance for FakeBrowser {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn new_page(&self) -> EngineResult<Box<dyn RenderPage>> {
        if !self.is_connected() {
            return Err(EngineError::Disconnected);
        }

        let record = Arc::new(Mutex::new(PageRecord::default()));
        self.script.pages.lock().push(Arc::clone(&record));
        Ok(Box::new(FakePage {
            script: Arc::clone(&self.script),
            record,
        }))
    }

    async fn close(&self) -> EngineResult<()> {
        if self.hang_on_close {
            futures::future::pending::<()>().await;
        }
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_on_close {
            return Err(EngineError::PageError("close failed".to_string()));
        }
        Ok(())
    }

    async fn kill(&self) -> EngineResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakePage {
    script: Arc<PageScript>,
    record: Arc<Mutex<PageRecord>>,
}

#[async_trait]
impl RenderPage for FakePage {
    async fn set_user_agent(&mut self, user_agent: &str) -> EngineResult<()> {
        self.record.lock().user_agent = Some(user_agent.to_string());
        Ok(())
    }

    async fn set_forwarded_for(&mut self, client_ip: &str) -> EngineResult<()> {
        if self.script.fail_forwarded_for.load(Ordering::SeqCst) {
            return Err(EngineError::PageError("headers rejected".to_string()));
        }
        self.record.lock().forwarded_for = Some(client_ip.to_string());
        Ok(())
    }

    async fn set_cache_enabled(&mut self, enabled: bool) -> EngineResult<()> {
        self.record.lock().cache_enabled = Some(enabled);
        Ok(())
    }

    async fn block_resources(&mut self, kinds: &[ResourceKind]) -> EngineResult<()> {
        self.record.lock().blocked = kinds.to_vec();
        Ok(())
    }

    async fn goto_network_idle(&mut self, url: &str, _timeout: Duration) -> EngineResult<()> {
        self.record.lock().url = Some(url.to_string());

        let failed = self
            .script
            .navigation_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EngineError::NavigationFailed("net::ERR_CONNECTION_REFUSED".to_string()));
        }
        Ok(())
    }

    async fn content(&mut self) -> EngineResult<String> {
        Ok(self.script.html.lock().clone())
    }

    async fn close(&mut self) -> EngineResult<()> {
        self.record.lock().closed = true;
        Ok(())
    }
}
