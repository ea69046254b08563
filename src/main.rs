//! Prism Render server

use anyhow::Context;
use clap::Parser;
use prism_render::config::backend_origin_for_port;
use prism_render::{
    init_logging, serve_until, system_process_table, AppState, BackendProxy, BrowserLifecycle,
    ChromiumLauncher, ProxyConfig, Renderer, ZombieReaper,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "prism-render")]
#[command(about = "Server-side rendering proxy", long_about = None)]
struct Cli {
    /// Listening port
    #[arg(long, env = "PORT", default_value_t = prism_render::config::DEFAULT_PORT)]
    port: u16,

    /// Backend application port on localhost
    #[arg(long, env = "BACKEND_PORT", default_value_t = prism_render::config::DEFAULT_BACKEND_PORT)]
    backend_port: u16,

    /// Backend application origin; overrides --backend-port
    #[arg(long, env = "BACKEND_ORIGIN")]
    backend_origin: Option<String>,

    /// Restart the browser after this many successful renders
    #[arg(long, env = "RENDER_RESTART_THRESHOLD")]
    restart_threshold: Option<u32>,

    /// Navigation timeout (seconds)
    #[arg(long, env = "RENDER_NAVIGATION_TIMEOUT_SECS", default_value_t = 120)]
    navigation_timeout: u64,

    /// Graceful browser close timeout (seconds)
    #[arg(long, env = "BROWSER_CLOSE_TIMEOUT_SECS", default_value_t = 30)]
    close_timeout: u64,

    /// DevTools protocol timeout (seconds)
    #[arg(long, env = "BROWSER_PROTOCOL_TIMEOUT_SECS", default_value_t = 240)]
    protocol_timeout: u64,

    /// Retries after a failed render
    #[arg(long, env = "RENDER_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Pause between render attempts (milliseconds)
    #[arg(long, env = "RENDER_RETRY_BACKOFF_MS", default_value_t = 1000)]
    retry_backoff: u64,

    /// Zombie process scan interval (seconds)
    #[arg(long, env = "ZOMBIE_REAP_INTERVAL_SECS", default_value_t = 60)]
    reap_interval: u64,

    /// Bound on draining in-flight requests after a shutdown signal (seconds)
    #[arg(long, env = "SHUTDOWN_DRAIN_TIMEOUT_SECS", default_value_t = 10)]
    drain_timeout: u64,

    /// Chrome executable
    #[arg(long, env = "CHROME_PATH")]
    chrome_path: Option<PathBuf>,

    /// Browser command names matched by the zombie reaper
    #[arg(
        long,
        env = "BROWSER_BINARY_NAMES",
        value_delimiter = ',',
        default_value = "chrome,chromium,headless_shell"
    )]
    browser_binaries: Vec<String>,

    /// Run the browser with a visible window
    #[arg(long)]
    headed: bool,
}

impl Cli {
    fn into_config(self) -> ProxyConfig {
        ProxyConfig {
            port: self.port,
            backend_origin: self
                .backend_origin
                .unwrap_or_else(|| backend_origin_for_port(self.backend_port)),
            restart_threshold: self.restart_threshold,
            navigation_timeout_secs: self.navigation_timeout,
            close_timeout_secs: self.close_timeout,
            protocol_timeout_secs: self.protocol_timeout,
            max_retries: self.max_retries,
            retry_backoff_ms: self.retry_backoff,
            reap_interval_secs: self.reap_interval,
            drain_timeout_secs: self.drain_timeout,
            chrome_path: self.chrome_path,
            browser_binaries: self.browser_binaries,
            headless: !self.headed,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = Cli::parse().into_config();
    config.validate().context("Invalid configuration")?;

    let backend = config.backend_url()?;
    let proxy = BackendProxy::new(&backend).context("Failed to create backend client")?;

    let reaper = Arc::new(ZombieReaper::new(
        system_process_table(),
        config.browser_binaries.clone(),
    ));
    let launcher = Arc::new(ChromiumLauncher::new(config.launch_options()));
    let lifecycle = Arc::new(BrowserLifecycle::new(
        launcher,
        reaper,
        config.lifecycle_options(),
    ));
    let renderer = Arc::new(Renderer::new(
        Arc::clone(&lifecycle),
        config.render_options(),
    ));

    let reaper_shutdown = CancellationToken::new();
    let reaper_task = lifecycle.spawn_reaper(config.reap_interval(), reaper_shutdown.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(backend = %proxy.origin(), "Proxying non-render traffic");

    let state = AppState::new(Arc::clone(&renderer), Arc::new(proxy));
    let served = serve_until(
        listener,
        state,
        shutdown_signal(),
        config.drain_timeout(),
    )
    .await;

    reaper_shutdown.cancel();
    if let Err(e) = reaper_task.await {
        warn!("Zombie reaper task failed: {}", e);
    }
    lifecycle.shutdown().await;

    let stats = renderer.stats();
    info!(
        requests = stats.requests,
        successes = stats.successes,
        failures = stats.failures,
        retries = stats.retries,
        launches = stats.browser_launches,
        restarts = stats.browser_restarts,
        zombies = stats.zombies_signalled,
        "Render statistics"
    );

    served.context("Server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
