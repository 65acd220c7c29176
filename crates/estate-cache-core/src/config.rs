//! Cache controller configuration.
//!
//! The version tag and the static asset manifest are fixed at build time.
//! `Config` carries them (plus the origin that relative manifest entries
//! resolve against) into the controller, so tests can run several versions
//! side by side.
//!
//! An optional override file lives at `~/.config/estate-tools/sw.json`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{ControllerError, Result};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "estate-tools";

/// Config file name
const CONFIG_FILE: &str = "sw.json";

/// Version tag of the current cache bucket.
/// Bump whenever `STATIC_ASSETS` changes so the next deploy purges and repopulates.
pub const CACHE_NAME: &str = "estate-tools-v2";

/// Assets stored in the bucket at install time.
pub const STATIC_ASSETS: &[&str] = &[
    "/",
    "/static/index.html",
    "/static/logo.jpg",
    "https://fonts.googleapis.com/css2?family=Noto+Sans+JP:wght@400;500;700&display=swap",
    "https://cdn.jsdelivr.net/npm/chart.js",
];

/// Requests whose path starts with this prefix go to the network first.
pub const API_PREFIX: &str = "/api/";

/// Origin of the estate-tools server (Flask default port).
pub const DEFAULT_ORIGIN: &str = "http://localhost:5000";

/// Environment variable overriding the version tag
pub const CACHE_NAME_ENV: &str = "ESTATE_CACHE_NAME";

/// Environment variable overriding the origin
pub const ORIGIN_ENV: &str = "ESTATE_ORIGIN";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub cache_name: String,
    pub static_assets: Vec<String>,
    pub api_prefix: String,
    pub origin: String,
    /// Ask the host to activate right after install.
    pub skip_waiting: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_name: CACHE_NAME.to_string(),
            static_assets: STATIC_ASSETS.iter().map(|s| s.to_string()).collect(),
            api_prefix: API_PREFIX.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            skip_waiting: true,
        }
    }
}

impl Config {
    /// Load the config file if present, then apply environment overrides.
    pub fn load() -> std::io::Result<Self> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => {
                debug!(path = %path.display(), "Loading cache config");
                let contents = std::fs::read_to_string(&path)?;
                serde_json::from_str(&contents)?
            }
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(name) = std::env::var(CACHE_NAME_ENV) {
            if !name.trim().is_empty() {
                self.cache_name = name.trim().to_string();
            }
        }
        if let Ok(origin) = std::env::var(ORIGIN_ENV) {
            if !origin.trim().is_empty() {
                self.origin = origin.trim().to_string();
            }
        }
    }

    /// Same config with a different version tag.
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = name.into();
        self
    }

    pub fn with_static_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.static_assets = assets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
        self.skip_waiting = skip_waiting;
        self
    }

    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join(APP_NAME))
    }

    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin).map_err(|source| ControllerError::InvalidUrl {
            url: self.origin.clone(),
            source,
        })
    }

    /// Resolve a manifest entry or request target against the origin.
    /// Absolute URLs (cross-origin assets) pass through unchanged.
    pub fn resolve(&self, target: &str) -> Result<Url> {
        self.origin_url()?
            .join(target)
            .map_err(|source| ControllerError::InvalidUrl {
                url: target.to_string(),
                source,
            })
    }

    /// The manifest as absolute URLs, in manifest order.
    pub fn manifest_urls(&self) -> Result<Vec<Url>> {
        self.static_assets.iter().map(|a| self.resolve(a)).collect()
    }
}
