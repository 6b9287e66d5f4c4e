//! Runtime configuration.
//!
//! Values come from the environment (a `.env` file is honored by the binary).
//! The static asset manifest can optionally be replaced by a JSON file listing paths.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const DEFAULT_API_BASE: &str = "http://localhost:8000/api";
const DEFAULT_ORIGIN: &str = "http://localhost:8000";
const DEFAULT_PROXY_ADDR: &str = "127.0.0.1:8080";

/// Preview page size used by the original web client.
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Paths populated into the cache at install time.
pub const DEFAULT_STATIC_ASSETS: &[&str] = &[
    "/",
    "/index.html",
    "/styles.css",
    "/app.js",
    "/manifest.json",
    "/favicon.svg",
    "/favicon-16x16.png",
    "/favicon-32x32.png",
    "/apple-touch-icon.png",
    "/icon-192x192.png",
    "/icon-512x512.png",
];

/// Settings for the preview/export orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the conversion service API, without trailing slash.
    pub api_base: String,
    /// Rows per preview page.
    pub page_size: u32,
    /// Rows fetched for the single-row preview during export-mode resolution.
    pub single_row_preview_rows: u32,
    /// Rows per table for the multi-table preview.
    pub table_preview_rows: u32,
    /// How long a visible error stays up before it clears itself.
    #[serde(with = "secs")]
    pub error_dismiss_after: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            single_row_preview_rows: 5,
            table_preview_rows: 5,
            error_dismiss_after: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Read `PARSEWIZ_*` variables, falling back to defaults for unset ones.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let api_base = std::env::var("PARSEWIZ_API_BASE")
            .unwrap_or(defaults.api_base)
            .trim_end_matches('/')
            .to_string();

        let config = Self {
            api_base,
            page_size: env_number("PARSEWIZ_PAGE_SIZE", defaults.page_size)?,
            single_row_preview_rows: env_number(
                "PARSEWIZ_SINGLE_ROW_PREVIEW_ROWS",
                defaults.single_row_preview_rows,
            )?,
            table_preview_rows: env_number("PARSEWIZ_TABLE_PREVIEW_ROWS", defaults.table_preview_rows)?,
            error_dismiss_after: Duration::from_secs(env_number(
                "PARSEWIZ_ERROR_DISMISS_SECS",
                defaults.error_dismiss_after.as_secs(),
            )?),
        };

        if config.page_size == 0 {
            anyhow::bail!("PARSEWIZ_PAGE_SIZE must be > 0");
        }

        Ok(config)
    }
}

/// Settings for the resource cache policy and the proxy that hosts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Origin the cached pages are served from, e.g. `http://localhost:8000`.
    pub origin: String,
    /// Path prefix of API calls (network-first, never cached).
    pub api_prefix: String,
    /// Prefix shared by every cache this system creates.
    pub cache_prefix: String,
    pub cache_version: String,
    /// Paths populated at install.
    pub static_assets: Vec<String>,
    /// Document served for navigations when both cache and network miss.
    pub navigation_fallback: String,
    /// Listen address of the proxy host.
    pub listen_addr: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            api_prefix: "/api/".to_string(),
            cache_prefix: "parsewiz-".to_string(),
            cache_version: "v1".to_string(),
            static_assets: DEFAULT_STATIC_ASSETS.iter().map(|s| s.to_string()).collect(),
            navigation_fallback: "/index.html".to_string(),
            listen_addr: DEFAULT_PROXY_ADDR.to_string(),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(origin) = std::env::var("PARSEWIZ_ORIGIN") {
            config.origin = origin.trim_end_matches('/').to_string();
        }
        if let Ok(prefix) = std::env::var("PARSEWIZ_CACHE_PREFIX") {
            config.cache_prefix = prefix;
        }
        if let Ok(version) = std::env::var("PARSEWIZ_CACHE_VERSION") {
            config.cache_version = version;
        }
        if let Ok(addr) = std::env::var("PARSEWIZ_PROXY_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(path) = std::env::var("PARSEWIZ_MANIFEST") {
            config.static_assets = load_manifest(Path::new(&path))?;
        }

        if config.cache_prefix.is_empty() {
            anyhow::bail!("PARSEWIZ_CACHE_PREFIX must not be empty");
        }

        Ok(config)
    }

    /// Versioned cache name, e.g. `parsewiz-v1`.
    pub fn cache_name(&self) -> String {
        format!("{}{}", self.cache_prefix, self.cache_version)
    }
}

/// Load a static asset manifest: a JSON array of absolute paths.
pub fn load_manifest(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {:?}", path))?;

    let assets: Vec<String> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse manifest: {:?}", path))?;

    if let Some(bad) = assets.iter().find(|p| !p.starts_with('/')) {
        anyhow::bail!("Manifest paths must start with '/': {}", bad);
    }

    info!("Loaded {} static assets from {:?}", assets.len(), path);
    Ok(assets)
}

fn env_number<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
