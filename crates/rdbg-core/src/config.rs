//! Settings parser for .rdbg/config.toml
//!
//! Defines:
//! - `Settings` - Global settings loaded from the config file
//! - `DebuggerSettings` - Endpoint, target application, and timing
//! - `SimctlSettings` - Simulator command behaviour

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::prelude::*;
use crate::types::DebuggerKind;

const CONFIG_FILENAME: &str = "config.toml";
const RDBG_DIR: &str = ".rdbg";

/// Application settings (.rdbg/config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub debugger: DebuggerSettings,

    #[serde(default)]
    pub simctl: SimctlSettings,
}

/// What to target when no application matches the expected bundle id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetFallback {
    /// Leave the session without a target.
    #[default]
    None,
    /// Pick the first known application (lowest identifier key).
    FirstAvailable,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct DebuggerSettings {
    #[serde(default)]
    pub kind: DebuggerKind,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Unix socket of the simulator's inspector endpoint; preferred over
    /// `host`/`port` for the native variant when set.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Bundle identifier of the application to target.
    #[serde(default)]
    pub bundle_id: Option<String>,

    #[serde(default)]
    pub platform_version: Option<String>,

    /// Application names that are never tracked.
    #[serde(default)]
    pub skipped_apps: Vec<String>,

    #[serde(default)]
    pub target_fallback: TargetFallback,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_page_load_timeout_ms")]
    pub page_load_timeout_ms: u64,

    #[serde(default = "default_page_ready_poll_ms")]
    pub page_ready_poll_ms: u64,
}

impl Default for DebuggerSettings {
    fn default() -> Self {
        Self {
            kind: DebuggerKind::default(),
            host: default_host(),
            port: default_port(),
            socket_path: None,
            bundle_id: None,
            platform_version: None,
            skipped_apps: Vec::new(),
            target_fallback: TargetFallback::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            page_load_timeout_ms: default_page_load_timeout_ms(),
            page_ready_poll_ms: default_page_ready_poll_ms(),
        }
    }
}

impl DebuggerSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_millis(self.page_load_timeout_ms)
    }

    pub fn page_ready_poll(&self) -> Duration {
        Duration::from_millis(self.page_ready_poll_ms)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    27753
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_page_load_timeout_ms() -> u64 {
    30_000
}

fn default_page_ready_poll_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct SimctlSettings {
    /// Per-command timeout; `0` waits indefinitely.
    #[serde(default)]
    pub command_timeout_ms: u64,

    #[serde(default = "default_launch_retries")]
    pub launch_retries: u32,
}

impl Default for SimctlSettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: 0,
            launch_retries: default_launch_retries(),
        }
    }
}

impl SimctlSettings {
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_ms > 0).then(|| Duration::from_millis(self.command_timeout_ms))
    }
}

fn default_launch_retries() -> u32 {
    5
}

/// Load settings from `.rdbg/config.toml` under `project_path`.
///
/// A missing or malformed file yields defaults.
pub fn load_settings(project_path: &Path) -> Settings {
    let config_path = project_path.join(RDBG_DIR).join(CONFIG_FILENAME);

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Write settings back to `.rdbg/config.toml`, creating the directory.
pub fn save_settings(project_path: &Path, settings: &Settings) -> Result<()> {
    let dir = project_path.join(RDBG_DIR);
    std::fs::create_dir_all(&dir)
        .map_err(|e| Error::config(format!("Failed to create .rdbg dir: {}", e)))?;

    let content = toml::to_string_pretty(settings)
        .map_err(|e| Error::config(format!("Failed to serialize settings: {}", e)))?;
    std::fs::write(dir.join(CONFIG_FILENAME), content).context("Failed to write settings")
}
