//! Resource cache policy.
//!
//! Decides per outgoing request whether to answer from cache, from the network or
//! with a synthesized fallback:
//!
//! - non-GET and cross-origin requests pass through untouched
//! - API requests are network-first; an unreachable network yields a 503 JSON body
//! - everything else is cache-first with background revalidation
//!
//! Caches are versioned (`<prefix><version>`). Install populates the static
//! manifest into the current cache; activate prunes other caches carrying the prefix.

pub mod network;
pub mod storage;

use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::Url;
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CacheConfig;
pub use network::{Network, ReqwestNetwork};
pub use storage::CacheStorage;

/// Body of the synthesized API response while offline.
pub const OFFLINE_MESSAGE: &str = "You are offline. Please check your connection and try again.";

/// How a request was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Full-page navigation.
    Navigate,
    Other,
}

/// The parts of an outgoing request the policy looks at.
#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub method: String,
    pub url: Url,
    pub mode: RequestMode,
}

impl CacheRequest {
    pub fn new(method: impl Into<String>, url: Url, mode: RequestMode) -> Self {
        Self {
            method: method.into().to_uppercase(),
            url,
            mode,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new("GET", url, RequestMode::Other)
    }

    pub fn navigate(url: Url) -> Self {
        Self::new("GET", url, RequestMode::Navigate)
    }

    /// Cache key: the full URL.
    pub fn key(&self) -> String {
        self.url.to_string()
    }
}

/// A stored or synthesized response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let body: String = body.into();
        Self {
            status,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Bytes::from(body),
        }
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(value.to_string()),
        }
    }

    /// 503 returned for API calls when the network is unreachable.
    pub fn offline_api() -> Self {
        Self::json(503, &serde_json::json!({ "error": OFFLINE_MESSAGE }))
    }

    /// 503 returned for other requests when neither cache nor network can answer.
    pub fn offline() -> Self {
        Self::text(503, "Offline")
    }

    /// Only plain 200s are stored.
    pub fn is_cacheable(&self) -> bool {
        self.status == 200
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// What the policy decided for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Not intercepted; the caller performs the request as usual.
    Passthrough,
    Respond(CachedResponse),
}

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkerState {
    #[default]
    Parsed,
    Installing,
    /// Installed, waiting to be activated.
    Installed,
    Activating,
    Activated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lifecycle {
    pub state: WorkerState,
    /// Activation may happen without waiting for open pages to close.
    pub skip_waiting: bool,
    /// All open pages are controlled immediately after activation.
    pub clients_claimed: bool,
}

/// Messages the foreground page can post to the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    SkipWaiting,
}

/// Service-worker style cache policy.
pub struct CachePolicy {
    config: CacheConfig,
    origin: Url,
    storage: CacheStorage,
    network: Arc<dyn Network>,
    lifecycle: RwLock<Lifecycle>,
    revalidations: Mutex<Vec<JoinHandle<()>>>,
}

impl CachePolicy {
    pub fn new(config: CacheConfig, storage: CacheStorage, network: Arc<dyn Network>) -> Result<Self> {
        let origin = Url::parse(&config.origin)
            .with_context(|| format!("Invalid origin: {}", config.origin))?;

        Ok(Self {
            config,
            origin,
            storage,
            network,
            lifecycle: RwLock::new(Lifecycle::default()),
            revalidations: Mutex::new(Vec::new()),
        })
    }

    pub fn cache_name(&self) -> String {
        self.config.cache_name()
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve a path against the origin.
    pub fn url_for(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .with_context(|| format!("Invalid path: {}", path))
    }

    fn set_lifecycle(&self, f: impl FnOnce(&mut Lifecycle)) {
        let mut lifecycle = self.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut lifecycle);
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Populate the static manifest into a freshly named cache.
    ///
    /// All-or-nothing: if any asset fails, nothing is stored and skip-waiting is
    /// cleared, so only a later `SKIP_WAITING` message activates the worker. Older caches are left alone until activation.
    pub async fn install(&self) -> Result<usize> {
        self.set_lifecycle(|l| l.state = WorkerState::Installing);
        let cache_name = self.cache_name();

        let populated = self.fetch_manifest().await;
        let result = match populated {
            Ok(entries) => {
                let count = entries.len();
                self.storage.put_all(&cache_name, entries);
                info!("[cache] Cached {} static assets into {}", count, cache_name);
                self.set_lifecycle(|l| l.skip_waiting = true);
                Ok(count)
            }
            Err(e) => {
                error!("[cache] Failed to cache static assets: {:#}", e);
                // An earlier SKIP_WAITING does not carry over a failed install
                self.set_lifecycle(|l| l.skip_waiting = false);
                Err(e)
            }
        };

        self.set_lifecycle(|l| l.state = WorkerState::Installed);
        result
    }

    async fn fetch_manifest(&self) -> Result<Vec<(String, CachedResponse)>> {
        let mut entries = Vec::with_capacity(self.config.static_assets.len());

        for path in &self.config.static_assets {
            let request = CacheRequest::get(self.url_for(path)?);
            let response = self
                .network
                .fetch(&request)
                .await
                .with_context(|| format!("Failed to fetch {}", path))?;

            if !(200..300).contains(&response.status) {
                anyhow::bail!("Request for {} returned status {}", path, response.status);
            }
            entries.push((request.key(), response));
        }

        Ok(entries)
    }

    /// Delete every cache with our prefix but a different version, then claim clients.
    pub fn activate(&self) -> Vec<String> {
        self.set_lifecycle(|l| l.state = WorkerState::Activating);
        let current = self.cache_name();

        let stale: Vec<String> = self
            .storage
            .keys()
            .into_iter()
            .filter(|name| name.starts_with(&self.config.cache_prefix) && *name != current)
            .collect();

        for name in &stale {
            info!("[cache] Deleting old cache: {}", name);
            self.storage.delete(name);
        }

        self.set_lifecycle(|l| {
            l.state = WorkerState::Activated;
            l.clients_claimed = true;
        });
        stale
    }

    /// Activate now if installed and allowed to skip waiting.
    pub fn activate_if_ready(&self) -> Option<Vec<String>> {
        let lifecycle = self.lifecycle();
        if lifecycle.state == WorkerState::Installed && lifecycle.skip_waiting {
            Some(self.activate())
        } else {
            None
        }
    }

    /// Handle a message from the foreground page.
    pub fn handle_message(&self, message: ControlMessage) {
        match message {
            ControlMessage::SkipWaiting => {
                info!("[cache] Skip waiting requested");
                self.set_lifecycle(|l| l.skip_waiting = true);
                self.activate_if_ready();
            }
        }
    }

    // ------------------------------------------------------------------------
    // Fetch
    // ------------------------------------------------------------------------

    /// Decide how to answer `request`.
    pub async fn handle_fetch(&self, request: &CacheRequest) -> FetchOutcome {
        if request.method != "GET" || request.url.origin() != self.origin.origin() {
            return FetchOutcome::Passthrough;
        }
        if self.lifecycle().state != WorkerState::Activated {
            return FetchOutcome::Passthrough;
        }

        if request.url.path().starts_with(&self.config.api_prefix) {
            return FetchOutcome::Respond(self.network_first(request).await);
        }

        FetchOutcome::Respond(self.cache_first(request).await)
    }

    async fn network_first(&self, request: &CacheRequest) -> CachedResponse {
        match self.network.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("[cache] API request {} failed offline: {:#}", request.url, e);
                CachedResponse::offline_api()
            }
        }
    }

    async fn cache_first(&self, request: &CacheRequest) -> CachedResponse {
        let key = request.key();

        if let Some(cached) = self.storage.match_any(&key) {
            debug!("[cache] Hit {}", key);
            self.revalidate(request.clone());
            return cached;
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                if response.is_cacheable() {
                    self.storage.put(&self.cache_name(), &key, response.clone());
                }
                response
            }
            Err(e) => {
                debug!("[cache] Miss and offline for {}: {:#}", key, e);
                if request.mode == RequestMode::Navigate {
                    let fallback = self
                        .url_for(&self.config.navigation_fallback)
                        .ok()
                        .and_then(|url| self.storage.match_any(url.as_str()));
                    if let Some(document) = fallback {
                        return document;
                    }
                }
                CachedResponse::offline()
            }
        }
    }

    /// Refetch in the background and overwrite the entry on success. Errors are dropped.
    fn revalidate(&self, request: CacheRequest) {
        let network = Arc::clone(&self.network);
        let storage = self.storage.clone();
        let cache_name = self.cache_name();

        let handle = tokio::spawn(async move {
            match network.fetch(&request).await {
                Ok(response) if response.is_cacheable() => {
                    storage.put(&cache_name, &request.key(), response);
                }
                Ok(response) => {
                    debug!("[cache] Revalidation of {} returned {}", request.url, response.status);
                }
                Err(_) => {}
            }
        });

        let mut pending = self.revalidations.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait for all background revalidations started so far.
    pub async fn settle(&self) {
        let pending: Vec<JoinHandle<()>> = {
            let mut guard = self.revalidations.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for handle in pending {
            let _ = handle.await;
        }
    }
}
