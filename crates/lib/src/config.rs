//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.docchat/config.json`) and environment.
//! Every field has a default, so an empty `{}` file is a valid config.

use crate::session::Model;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "http://localhost:5009";

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Backend location and transport limits.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Chat defaults (model, upload gating).
    #[serde(default)]
    pub chat: ChatConfig,

    /// Upload validation and status polling.
    #[serde(default)]
    pub upload: UploadConfig,
}

/// Backend base URL and request deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Base URL of the analysis service. Overridden by DOCCHAT_API_BASE_URL env.
    pub base_url: Option<String>,

    /// Wall-clock deadline for a chat stream or an upload POST, in seconds (default 600).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Clear server-side documents when an interactive session starts (default true).
    #[serde(default = "default_true")]
    pub clear_on_start: bool,
}

/// Chat defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfig {
    /// Model selected when a session starts.
    #[serde(default)]
    pub default_model: Model,

    /// When true, chat submission is refused until a document upload has completed. When false, questions can be asked with no document loaded.
    #[serde(default = "default_true")]
    pub require_upload: bool,
}

/// Upload size limit and status polling schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfig {
    /// Largest accepted document, in bytes (default 16 MiB).
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Delay between status polls for the first `slowAfterAttempts` polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Delay between status polls after that.
    #[serde(default = "default_slow_poll_interval_ms")]
    pub slow_poll_interval_ms: u64,

    #[serde(default = "default_slow_after_attempts")]
    pub slow_after_attempts: u32,

    /// Polls before giving up and reporting the job as still in progress.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Deadline for a single status request; a poll that exceeds it counts as a failed attempt.
    #[serde(default = "default_poll_request_timeout_ms")]
    pub poll_request_timeout_ms: u64,
}

fn default_request_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_max_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_slow_poll_interval_ms() -> u64 {
    5000
}

fn default_slow_after_attempts() -> u32 {
    10
}

fn default_max_attempts() -> u32 {
    60
}

fn default_poll_request_timeout_ms() -> u64 {
    30_000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            clear_on_start: true,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_model: Model::default(),
            require_upload: true,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            poll_interval_ms: default_poll_interval_ms(),
            slow_poll_interval_ms: default_slow_poll_interval_ms(),
            slow_after_attempts: default_slow_after_attempts(),
            max_attempts: default_max_attempts(),
            poll_request_timeout_ms: default_poll_request_timeout_ms(),
        }
    }
}

/// Resolve the backend base URL: env DOCCHAT_API_BASE_URL overrides config, then the built-in default.
pub fn resolve_base_url(config: &Config) -> String {
    std::env::var("DOCCHAT_API_BASE_URL")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .backend
                .base_url
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("DOCCHAT_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".docchat").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path (or the default path). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
