//! Network access used by the cache policy.

use anyhow::{Context, Result};
use reqwest::Client;
use tracing::debug;

use super::{CacheRequest, CachedResponse};

/// Headers that describe one hop and must not be stored or replayed.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A source of fresh responses. `Err` means the network is unreachable.
#[async_trait::async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse>;
}

/// Plain reqwest fetch.
#[derive(Clone, Default)]
pub struct ReqwestNetwork {
    client: Client,
}

impl ReqwestNetwork {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Network for ReqwestNetwork {
    async fn fetch(&self, request: &CacheRequest) -> Result<CachedResponse> {
        debug!("Network fetch: {} {}", request.method, request.url);

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .with_context(|| format!("Invalid method: {}", request.method))?;

        let response = self
            .client
            .request(method, request.url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", request.url))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of {}", request.url))?;

        Ok(CachedResponse {
            status,
            headers,
            body,
        })
    }
}
