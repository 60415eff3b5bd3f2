//! TOML configuration for speedcheck.
//!
//! Every section has defaults, so an empty file (or no file at all) gives a
//! usable configuration. The file path may be overridden with the
//! `SPEEDCHECK_CONFIG` environment variable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::speedtest::ServerAddress;

const SYSTEM_CONFIG_PATH: &str = "/etc/speedcheck/speedcheck.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedCheckConfig {
    #[serde(default)]
    pub iperf: IperfConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default = "default_servers")]
    pub servers: Vec<ServerAddress>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for SpeedCheckConfig {
    fn default() -> Self {
        Self {
            iperf: IperfConfig::default(),
            control: ControlConfig::default(),
            servers: default_servers(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_servers() -> Vec<ServerAddress> {
    vec![ServerAddress::new("localhost", 5000, 5201)]
}

impl SpeedCheckConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded speedcheck configuration");
        Ok(config)
    }

    /// Try, in order: `SPEEDCHECK_CONFIG`, `/etc/speedcheck/speedcheck.toml`,
    /// compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("SPEEDCHECK_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SPEEDCHECK_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// An explicit path must load; otherwise fall back as in [`load_or_default`](Self::load_or_default).
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }
}

// ---------------------------------------------------------------------------
// iperf
// ---------------------------------------------------------------------------

/// Throughput tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IperfConfig {
    /// Binary name (looked up on `$PATH`) or absolute path.
    pub path: PathBuf,
    /// Writable directory holding the named pipe pair.
    pub work_dir: PathBuf,
    /// Reporting interval in seconds.
    pub interval_sec: f64,
    /// Target bitrate ceiling, in iperf's notation.
    pub bitrate: String,
    pub udp: bool,
    /// Arguments the peer's control endpoint passes to its iperf server.
    pub server_args: String,
}

impl Default for IperfConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("iperf"),
            work_dir: std::env::temp_dir(),
            interval_sec: 0.1,
            bitrate: "120m".to_string(),
            udp: true,
            server_args: "-s -u".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Remote control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Timeout for each start/stop request (milliseconds).
    pub timeout_ms: u64,
    /// Control port assumed for servers given without one.
    pub default_port: u16,
}

impl ControlConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            default_port: 5000,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
