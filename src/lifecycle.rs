//! Ownership and lifecycle of the single shared browser instance
//!
//! [`BrowserLifecycle`] is the only owner of the browser handle. Render
//! requests borrow the handle through [`BrowserLifecycle::ensure_browser`].
//!
//! Handle states: `ABSENT -> LAUNCHING -> READY -> (CLOSING -> ABSENT)`, plus
//! `READY -> ABSENT` when the connection drops. Only one launch may be in
//! progress; callers arriving during a launch wait on a notification and then
//! re-check the handle.

use crate::engine::{BrowserInstance, BrowserLauncher, EngineError};
use crate::reaper::ZombieReaper;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default bound on a graceful browser close
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle errors
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(#[source] EngineError),

    #[error("Browser handshake timed out, partial state discarded: {0}")]
    HandshakeTimeout(#[source] EngineError),

    #[error("Browser lifecycle has shut down")]
    ShutDown,
}

/// Lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleOptions {
    /// Restart the browser after this many successful renders; `None` disables
    pub restart_threshold: Option<u32>,

    /// Bound on a graceful close before the process is killed
    pub close_timeout: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            restart_threshold: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// Lifecycle counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleStats {
    pub launches: u64,
    pub failed_launches: u64,
    pub restarts: u64,
    pub closes: u64,
}

#[derive(Default)]
struct LifecycleCounters {
    launches: AtomicU64,
    failed_launches: AtomicU64,
    restarts: AtomicU64,
    closes: AtomicU64,
}

struct LifecycleState {
    handle: Option<Arc<dyn BrowserInstance>>,
    // Set while a launch, close or restart owns the handle slot.
    restarting: bool,
    render_count: u32,
    shut_down: bool,
}

/// Owner of the shared browser handle
pub struct BrowserLifecycle {
    launcher: Arc<dyn BrowserLauncher>,
    reaper: Arc<ZombieReaper>,
    options: LifecycleOptions,
    state: Mutex<LifecycleState>,
    // Bumped each time the handle slot is released.
    slot_released: watch::Sender<u64>,
    close_lock: tokio::sync::Mutex<()>,
    counters: LifecycleCounters,
}

/// Exclusive ownership of the handle slot.
///
/// Dropping it installs `handle` (if any), clears `restarting` in the same
/// critical section and wakes waiters, so nobody observes a finished launch
/// or close half-applied.
struct SlotGuard<'a> {
    lifecycle: &'a BrowserLifecycle,
    handle: Option<Arc<dyn BrowserInstance>>,
    reset_render_count: bool,
}

impl<'a> SlotGuard<'a> {
    fn new(lifecycle: &'a BrowserLifecycle) -> Self {
        Self {
            lifecycle,
            handle: None,
            reset_render_count: false,
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.lifecycle.state.lock();
            if let Some(handle) = self.handle.take() {
                state.handle = Some(handle);
            }
            if self.reset_render_count {
                state.render_count = 0;
            }
            state.restarting = false;
        }
        self.lifecycle
            .slot_released
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

enum Slot<'a> {
    Current(Arc<dyn BrowserInstance>),
    Claimed(SlotGuard<'a>),
}

fn same_browser(a: &Arc<dyn BrowserInstance>, b: &Arc<dyn BrowserInstance>) -> bool {
    // Data pointers only; vtable pointers may differ across codegen units.
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl BrowserLifecycle {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        reaper: Arc<ZombieReaper>,
        options: LifecycleOptions,
    ) -> Self {
        let (slot_released, _) = watch::channel(0);

        Self {
            launcher,
            reaper,
            options,
            state: Mutex::new(LifecycleState {
                handle: None,
                restarting: false,
                render_count: 0,
                shut_down: false,
            }),
            slot_released,
            close_lock: tokio::sync::Mutex::new(()),
            counters: LifecycleCounters::default(),
        }
    }

    pub fn options(&self) -> &LifecycleOptions {
        &self.options
    }

    pub fn reaper(&self) -> &Arc<ZombieReaper> {
        &self.reaper
    }

    /// Whether a launch, close or restart is in progress
    pub fn is_restarting(&self) -> bool {
        self.state.lock().restarting
    }

    /// Whether a handle is currently held, connected or not
    pub fn has_browser(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    /// Successful renders since the last restart
    pub fn render_count(&self) -> u32 {
        self.state.lock().render_count
    }

    pub fn stats(&self) -> LifecycleStats {
        LifecycleStats {
            launches: self.counters.launches.load(Ordering::Relaxed),
            failed_launches: self.counters.failed_launches.load(Ordering::Relaxed),
            restarts: self.counters.restarts.load(Ordering::Relaxed),
            closes: self.counters.closes.load(Ordering::Relaxed),
        }
    }

    /// Wait until no launch, close or restart is running, then claim the slot.
    ///
    /// Returns the current handle instead when `reuse` accepts it.
    async fn claim_slot(&self, reuse: impl Fn(&Arc<dyn BrowserInstance>) -> bool) -> Slot<'_> {
        loop {
            let mut released = {
                let mut state = self.state.lock();

                if !state.restarting {
                    if let Some(handle) = state.handle.as_ref().filter(|h| reuse(*h)) {
                        return Slot::Current(Arc::clone(handle));
                    }
                    state.restarting = true;
                    break;
                }

                // Subscribed under the lock, so the release cannot be missed.
                self.slot_released.subscribe()
            };

            debug!("Browser is restarting, waiting for it to finish...");
            if released.changed().await.is_err() {
                // Sender lives as long as self; unreachable in practice.
                tokio::task::yield_now().await;
            }
        }

        Slot::Claimed(SlotGuard::new(self))
    }

    /// Return the current handle when connected, otherwise launch a new one.
    ///
    /// Concurrent callers never launch twice: while a launch, close or restart
    /// runs the rest wait for it to finish and then re-check the handle.
    pub async fn ensure_browser(&self) -> Result<Arc<dyn BrowserInstance>, LifecycleError> {
        let mut guard = match self.claim_slot(|handle| handle.is_connected()).await {
            Slot::Current(handle) => return Ok(handle),
            Slot::Claimed(guard) => guard,
        };

        if self.state.lock().shut_down {
            return Err(LifecycleError::ShutDown);
        }

        let stale = self.state.lock().handle.take();
        if let Some(stale) = stale {
            warn!(pid = ?stale.pid(), "Discarding disconnected browser");
            self.dispose(stale).await;
        }

        match self.launcher.launch().await {
            Ok(handle) => {
                self.counters.launches.fetch_add(1, Ordering::Relaxed);
                guard.handle = Some(Arc::clone(&handle));
                drop(guard);
                Ok(handle)
            }
            Err(e @ EngineError::HandshakeTimeout(_)) => {
                self.counters.failed_launches.fetch_add(1, Ordering::Relaxed);
                // The half-started process never produced a handle; it is
                // only reachable through the process table.
                warn!("Browser handshake timed out, discarding partial state: {}", e);
                self.reaper.reap().await;
                drop(guard);
                Err(LifecycleError::HandshakeTimeout(e))
            }
            Err(e) => {
                self.counters.failed_launches.fetch_add(1, Ordering::Relaxed);
                drop(guard);
                warn!("Browser launch failed: {}", e);
                Err(LifecycleError::LaunchFailed(e))
            }
        }
    }

    /// Close the browser, if any.
    ///
    /// The handle is released before anything else happens. A graceful close
    /// is attempted within the close timeout and the process is then killed
    /// regardless of how that went. Callers of [`Self::ensure_browser`] wait
    /// until the kill is done. Concurrent calls serialize; later callers find
    /// no handle and return.
    pub async fn close_browser(&self) {
        self.close_matching(None).await;
    }

    /// Close `handle` only if it is still the current browser.
    ///
    /// A request that saw a dead browser uses this so it cannot tear down a
    /// replacement another request launched meanwhile. Returns whether the
    /// handle was closed.
    pub async fn close_if_current(&self, handle: &Arc<dyn BrowserInstance>) -> bool {
        self.close_matching(Some(handle)).await
    }

    async fn close_matching(&self, expected: Option<&Arc<dyn BrowserInstance>>) -> bool {
        let _closing = self.close_lock.lock().await;

        let claimed = self
            .claim_slot(|current| expected.map_or(false, |expected| !same_browser(current, expected)))
            .await;
        let guard = match claimed {
            Slot::Claimed(guard) => guard,
            // A different browser replaced the one asked for.
            Slot::Current(_) => return false,
        };

        let handle = self.state.lock().handle.take();
        let closed = match handle {
            Some(handle) => {
                self.dispose(handle).await;
                true
            }
            None => false,
        };

        drop(guard);
        closed
    }

    async fn dispose(&self, handle: Arc<dyn BrowserInstance>) {
        let pid = handle.pid();
        info!(pid = ?pid, "Closing browser...");

        match tokio::time::timeout(self.options.close_timeout, handle.close()).await {
            Ok(Ok(())) => debug!("Browser closed gracefully"),
            Ok(Err(e)) => warn!("Error closing browser: {}", e),
            Err(_) => warn!(
                "Browser close timed out after {:?}, killing process",
                self.options.close_timeout
            ),
        }

        if let Err(e) = handle.kill().await {
            warn!("Failed to kill browser process: {}", e);
        }

        self.counters.closes.fetch_add(1, Ordering::Relaxed);
        self.reaper.reap().await;
    }

    /// Whether the render count has reached the configured restart threshold
    pub fn should_restart(&self) -> bool {
        self.threshold_reached(self.state.lock().render_count)
    }

    fn threshold_reached(&self, render_count: u32) -> bool {
        self.options
            .restart_threshold
            .map_or(false, |threshold| render_count >= threshold)
    }

    /// Close and discard the browser when the restart threshold is reached.
    ///
    /// The slot stays claimed until the old process is killed, and the render
    /// count drops to zero when that completes. Concurrent callers trigger a
    /// single restart; the rest wait in [`Self::ensure_browser`], which then
    /// launches a fresh process. Returns whether a restart happened.
    pub async fn restart_if_due(&self) -> bool {
        let (mut guard, stale) = {
            let mut state = self.state.lock();
            if state.shut_down || state.restarting || !self.threshold_reached(state.render_count) {
                return false;
            }
            state.restarting = true;
            (SlotGuard::new(self), state.handle.take())
        };
        guard.reset_render_count = true;

        info!("Restarting browser to free up resources...");
        self.counters.restarts.fetch_add(1, Ordering::Relaxed);

        if let Some(handle) = stale {
            self.dispose(handle).await;
        }

        drop(guard);
        true
    }

    /// Count one successful render; returns the new count
    pub fn record_render(&self) -> u32 {
        let mut state = self.state.lock();
        state.render_count = state.render_count.saturating_add(1);
        state.render_count
    }

    /// Scan for zombie browser processes now
    pub async fn reap_zombies(&self) -> Option<usize> {
        self.reaper.reap().await
    }

    /// Start the periodic zombie scan
    pub fn spawn_reaper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        Arc::clone(&self.reaper).spawn_periodic(interval, shutdown)
    }

    /// Process-exit hook: close the browser and reap leftovers.
    ///
    /// Afterwards no browser is launched again; [`Self::ensure_browser`]
    /// returns [`LifecycleError::ShutDown`].
    pub async fn shutdown(&self) {
        info!("Running browser cleanup before exit...");
        self.state.lock().shut_down = true;
        // Waits for a launch already in flight, then closes what it produced.
        self.close_browser().await;
        self.reaper.reap().await;
        info!("Browser cleanup complete");
    }
}
