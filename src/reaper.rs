//! Zombie browser process reaping
//!
//! Chrome leaves terminated helper processes behind when it is killed while
//! pages are still open. The reaper scans the process table for zombie
//! entries whose command matches the browser binary and signals each one.
//! At most one scan runs at a time; a trigger that arrives while a scan is in
//! flight is dropped rather than queued.

use crate::process::{ProcessState, ProcessTable};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default period of the background scan
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Command names treated as the browser engine
pub const DEFAULT_BROWSER_BINARIES: [&str; 3] = ["chrome", "chromium", "headless_shell"];

/// Scans for and signals zombie browser processes
pub struct ZombieReaper {
    table: Arc<dyn ProcessTable>,
    binary_names: Vec<String>,
    in_flight: AtomicBool,
    signalled: AtomicU64,
}

/// Clears the in-flight flag when the scan finishes, even if it panics
struct ScanGuard(Arc<ZombieReaper>);

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::SeqCst);
    }
}

impl ZombieReaper {
    pub fn new(table: Arc<dyn ProcessTable>, binary_names: Vec<String>) -> Self {
        let binary_names = binary_names
            .into_iter()
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .collect();

        Self {
            table,
            binary_names,
            in_flight: AtomicBool::new(false),
            signalled: AtomicU64::new(0),
        }
    }

    /// Whether a scan is currently running
    pub fn is_scanning(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Total zombies signalled over the reaper's lifetime
    pub fn total_signalled(&self) -> u64 {
        self.signalled.load(Ordering::Relaxed)
    }

    /// Whether a command name belongs to the browser engine
    pub fn matches_binary(&self, command: &str) -> bool {
        let command = command.to_lowercase();
        self.binary_names
            .iter()
            .any(|name| command.contains(name.as_str()))
    }

    /// Run one scan.
    ///
    /// Returns the number of processes signalled, or `None` when another scan
    /// was already in flight. Failures are logged, never returned.
    pub async fn reap(self: &Arc<Self>) -> Option<usize> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Zombie scan already in flight, skipping");
            return None;
        }

        let guard = ScanGuard(Arc::clone(self));
        let scan = tokio::task::spawn_blocking(move || {
            let signalled = guard.0.scan_and_signal();
            drop(guard);
            signalled
        });

        match scan.await {
            Ok(signalled) => Some(signalled),
            Err(e) => {
                warn!("Zombie scan task failed: {}", e);
                Some(0)
            }
        }
    }

    fn scan_and_signal(&self) -> usize {
        let records = match self.table.snapshot() {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to enumerate processes: {}", e);
                return 0;
            }
        };

        let own_pid = std::process::id();
        let mut signalled = 0;

        for record in records
            .iter()
            .filter(|record| record.state == ProcessState::Zombie)
            .filter(|record| self.matches_binary(&record.command))
        {
            match self.table.force_kill(record.pid) {
                Ok(()) => {
                    signalled += 1;
                    info!(pid = record.pid, command = %record.command, "Killed zombie browser process");
                }
                Err(e) => {
                    warn!("Failed to kill zombie process {}: {}", record.pid, e);
                }
            }

            if record.parent_pid == Some(own_pid) {
                match self.table.reap_child(record.pid) {
                    Ok(true) => debug!(pid = record.pid, "Reaped own child"),
                    Ok(false) => {}
                    Err(e) => warn!("Failed to reap child {}: {}", record.pid, e),
                }
            }
        }

        if signalled > 0 {
            self.signalled.fetch_add(signalled as u64, Ordering::Relaxed);
        }

        signalled
    }

    /// Scan on a fixed interval until `shutdown` is cancelled
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Zombie reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.reap().await;
                    }
                }
            }
        })
    }
}
