//! Service configuration

use crate::chromium::{LaunchOptions, DEFAULT_PROTOCOL_TIMEOUT};
use crate::lifecycle::{LifecycleOptions, DEFAULT_CLOSE_TIMEOUT};
use crate::reaper::{DEFAULT_BROWSER_BINARIES, DEFAULT_REAP_INTERVAL};
use crate::render::{
    RenderOptions, DEFAULT_MAX_RETRIES, DEFAULT_NAVIGATION_TIMEOUT, DEFAULT_RETRY_BACKOFF,
};
use crate::server::DEFAULT_DRAIN_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_BACKEND_PORT: u16 = 4200;

/// Configuration errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Invalid backend origin {origin}: {reason}")]
    InvalidBackendOrigin { origin: String, reason: String },
}

/// Full service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listening port
    pub port: u16,

    /// Backend application origin, e.g. `http://localhost:4200`
    pub backend_origin: String,

    /// Successful renders between browser restarts; `None` disables
    pub restart_threshold: Option<u32>,

    pub navigation_timeout_secs: u64,
    pub close_timeout_secs: u64,
    pub protocol_timeout_secs: u64,

    pub max_retries: u32,
    pub retry_backoff_ms: u64,

    pub reap_interval_secs: u64,

    /// Bound on draining in-flight requests once a shutdown signal arrives
    pub drain_timeout_secs: u64,

    /// Chrome executable; auto-detected when unset
    pub chrome_path: Option<PathBuf>,

    /// Command names matched when reaping zombies
    pub browser_binaries: Vec<String>,

    pub headless: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            backend_origin: backend_origin_for_port(DEFAULT_BACKEND_PORT),
            restart_threshold: None,
            navigation_timeout_secs: DEFAULT_NAVIGATION_TIMEOUT.as_secs(),
            close_timeout_secs: DEFAULT_CLOSE_TIMEOUT.as_secs(),
            protocol_timeout_secs: DEFAULT_PROTOCOL_TIMEOUT.as_secs(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF.as_millis() as u64,
            reap_interval_secs: DEFAULT_REAP_INTERVAL.as_secs(),
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT.as_secs(),
            chrome_path: None,
            browser_binaries: DEFAULT_BROWSER_BINARIES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            headless: true,
        }
    }
}

/// Backend on the loopback interface
pub fn backend_origin_for_port(port: u16) -> String {
    format!("http://localhost:{}", port)
}

impl ProxyConfig {
    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("navigation timeout", self.navigation_timeout_secs),
            ("close timeout", self.close_timeout_secs),
            ("protocol timeout", self.protocol_timeout_secs),
            ("reap interval", self.reap_interval_secs),
            ("drain timeout", self.drain_timeout_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.restart_threshold == Some(0) {
            return Err(ConfigError::Zero("restart threshold"));
        }

        self.backend_url()?;
        Ok(())
    }

    /// Parsed backend origin; only http and https are accepted
    pub fn backend_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidBackendOrigin {
            origin: self.backend_origin.clone(),
            reason,
        };

        let url = Url::parse(&self.backend_origin).map_err(|e| invalid(e.to_string()))?;
        match url.scheme() {
            "http" | "https" if url.has_host() => Ok(url),
            "http" | "https" => Err(invalid("missing host".to_string())),
            scheme => Err(invalid(format!("unsupported scheme {}", scheme))),
        }
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn lifecycle_options(&self) -> LifecycleOptions {
        LifecycleOptions {
            restart_threshold: self.restart_threshold,
            close_timeout: Duration::from_secs(self.close_timeout_secs),
        }
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            navigation_timeout: Duration::from_secs(self.navigation_timeout_secs),
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..Default::default()
        }
    }

    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            executable: self.chrome_path.clone(),
            headless: self.headless,
            protocol_timeout: Duration::from_secs(self.protocol_timeout_secs),
            ..Default::default()
        }
    }
}
