//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use prism_render::{
    AppState, BackendProxy, BrowserInstance, BrowserLauncher, BrowserLifecycle, EngineError,
    EngineResult, LifecycleOptions, ProcessRecord, ProcessTable, RenderOptions, RenderPage,
    Renderer, ResourceKind, ZombieReaper,
};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// How every navigation ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    Succeed,
    Fail,
    Hang,
}

/// Engine that renders fixed HTML, or fails or stalls every navigation
pub struct StaticLauncher {
    html: String,
    navigation: Navigation,
    launches: AtomicUsize,
    navigations: Arc<AtomicUsize>,
    browsers: parking_lot::Mutex<Vec<Arc<StaticBrowser>>>,
}

impl StaticLauncher {
    pub fn rendering(html: &str) -> Self {
        Self {
            html: html.to_string(),
            navigation: Navigation::Succeed,
            launches: AtomicUsize::new(0),
            navigations: Arc::new(AtomicUsize::new(0)),
            browsers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            navigation: Navigation::Fail,
            ..Self::rendering("")
        }
    }

    /// Navigations never finish
    pub fn hanging() -> Self {
        Self {
            navigation: Navigation::Hang,
            ..Self::rendering("")
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> usize {
        self.navigations.load(Ordering::SeqCst)
    }

    pub fn all_killed(&self) -> bool {
        self.browsers.lock().iter().all(|b| b.killed.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl BrowserLauncher for StaticLauncher {
    async fn launch(&self) -> EngineResult<Arc<dyn BrowserInstance>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let browser = Arc::new(StaticBrowser {
            html: self.html.clone(),
            navigation: self.navigation,
            navigations: Arc::clone(&self.navigations),
            killed: AtomicBool::new(false),
        });
        self.browsers.lock().push(Arc::clone(&browser));
        Ok(browser)
    }
}

pub struct StaticBrowser {
    html: String,
    navigation: Navigation,
    navigations: Arc<AtomicUsize>,
    killed: AtomicBool,
}

#[async_trait]
impl BrowserInstance for StaticBrowser {
    fn is_connected(&self) -> bool {
        !self.killed.load(Ordering::SeqCst)
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    async fn new_page(&self) -> EngineResult<Box<dyn RenderPage>> {
        Ok(Box::new(StaticPage {
            html: self.html.clone(),
            navigation: self.navigation,
            navigations: Arc::clone(&self.navigations),
        }))
    }

    async fn close(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn kill(&self) -> EngineResult<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct StaticPage {
    html: String,
    navigation: Navigation,
    navigations: Arc<AtomicUsize>,
}

#[async_trait]
impl RenderPage for StaticPage {
    async fn set_user_agent(&mut self, _user_agent: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn set_forwarded_for(&mut self, _client_ip: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn set_cache_enabled(&mut self, _enabled: bool) -> EngineResult<()> {
        Ok(())
    }

    async fn block_resources(&mut self, _kinds: &[ResourceKind]) -> EngineResult<()> {
        Ok(())
    }

    async fn goto_network_idle(&mut self, _url: &str, timeout: Duration) -> EngineResult<()> {
        self.navigations.fetch_add(1, Ordering::SeqCst);
        match self.navigation {
            Navigation::Succeed => Ok(()),
            Navigation::Fail => Err(EngineError::Timeout(timeout)),
            Navigation::Hang => std::future::pending().await,
        }
    }

    async fn content(&mut self) -> EngineResult<String> {
        Ok(self.html.clone())
    }

    async fn close(&mut self) -> EngineResult<()> {
        Ok(())
    }
}

/// Process table with nothing in it
pub struct EmptyProcessTable;

impl ProcessTable for EmptyProcessTable {
    fn snapshot(&self) -> io::Result<Vec<ProcessRecord>> {
        Ok(Vec::new())
    }

    fn force_kill(&self, _pid: u32) -> io::Result<()> {
        Ok(())
    }

    fn reap_child(&self, _pid: u32) -> io::Result<bool> {
        Ok(false)
    }
}

/// Application state over `launcher`, proxying to `backend`
pub fn app_state(launcher: Arc<StaticLauncher>, backend: &str) -> AppState {
    let reaper = Arc::new(ZombieReaper::new(
        Arc::new(EmptyProcessTable),
        vec!["chrome".to_string()],
    ));
    let lifecycle = Arc::new(BrowserLifecycle::new(
        launcher,
        reaper,
        LifecycleOptions::default(),
    ));
    let renderer = Arc::new(Renderer::new(
        lifecycle,
        RenderOptions {
            retry_backoff: Duration::from_millis(1),
            ..Default::default()
        },
    ));
    let proxy = BackendProxy::new(&Url::parse(backend).unwrap()).unwrap();

    AppState::new(renderer, Arc::new(proxy))
}
