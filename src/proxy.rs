//! Local proxy hosting the cache policy in front of the upstream origin.
//!
//! Every request goes through [`CachePolicy::handle_fetch`]; whatever the policy
//! declines is forwarded to the upstream unchanged.

use anyhow::{Context, Result};
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use reqwest::Url;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::cache::network::HOP_BY_HOP;
use crate::cache::{CachePolicy, CacheRequest, CachedResponse, ControlMessage, FetchOutcome, RequestMode};
use crate::config::CacheConfig;

/// Largest request body forwarded upstream (file uploads).
const MAX_FORWARD_BODY: usize = 100 * 1024 * 1024;

/// Path of the control-message endpoint.
pub const MESSAGE_PATH: &str = "/__parsewiz/message";

/// Proxy state shared across handlers.
#[derive(Clone)]
pub struct ProxyState {
    policy: Arc<CachePolicy>,
    upstream: reqwest::Client,
    origin: Url,
}

impl ProxyState {
    pub fn new(policy: Arc<CachePolicy>, upstream: reqwest::Client, origin: &str) -> Result<Self> {
        let origin = Url::parse(origin).with_context(|| format!("Invalid origin: {}", origin))?;
        Ok(Self {
            policy,
            upstream,
            origin,
        })
    }
}

pub fn router(state: ProxyState) -> Router {
    Router::new()
        .route(MESSAGE_PATH, post(post_message))
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Install and activate the policy, then serve until the listener closes.
pub async fn serve(config: CacheConfig, policy: Arc<CachePolicy>) -> Result<()> {
    if let Err(e) = policy.install().await {
        warn!("Install incomplete, serving without precache: {:#}", e);
    }
    if let Some(deleted) = policy.activate_if_ready() {
        info!("Activated {} (pruned {} old caches)", policy.cache_name(), deleted.len());
    }

    let state = ProxyState::new(policy, reqwest::Client::new(), &config.origin)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Proxy listening on http://{} -> {}", config.listen_addr, config.origin);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Deliver a control message to the policy.
async fn post_message(
    State(state): State<ProxyState>,
    Json(message): Json<ControlMessage>,
) -> Json<serde_json::Value> {
    state.policy.handle_message(message);
    let lifecycle = state.policy.lifecycle();
    Json(serde_json::json!({
        "state": format!("{:?}", lifecycle.state),
        "skip_waiting": lifecycle.skip_waiting,
    }))
}

async fn handle_request(State(state): State<ProxyState>, req: Request) -> Response {
    let url = match request_url(&state.origin, &req) {
        Ok(url) => url,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let cache_request = CacheRequest::new(req.method().as_str(), url, request_mode(req.headers()));

    match state.policy.handle_fetch(&cache_request).await {
        FetchOutcome::Respond(response) => to_axum_response(response),
        FetchOutcome::Passthrough => match forward(&state, cache_request.url, req).await {
            Ok(response) => response,
            Err(e) => {
                error!("Upstream request failed: {:#}", e);
                (StatusCode::BAD_GATEWAY, format!("Upstream request failed: {}", e)).into_response()
            }
        },
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Absolute-form request targets keep their own origin; everything else is
/// resolved against the upstream origin.
fn request_url(origin: &Url, req: &Request) -> Result<Url> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Url::parse(&uri.to_string()).context("Invalid request URI");
    }
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    origin.join(path).context("Invalid request path")
}

fn request_mode(headers: &HeaderMap) -> RequestMode {
    let fetch_mode = headers.get("sec-fetch-mode").and_then(|v| v.to_str().ok());
    if let Some(mode) = fetch_mode {
        return if mode == "navigate" {
            RequestMode::Navigate
        } else {
            RequestMode::Other
        };
    }

    let accepts_html = headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false);
    if accepts_html {
        RequestMode::Navigate
    } else {
        RequestMode::Other
    }
}

async fn forward(state: &ProxyState, url: Url, req: Request) -> Result<Response> {
    let (parts, body) = req.into_parts();
    let body = to_bytes(body, MAX_FORWARD_BODY)
        .await
        .context("Failed to read request body")?;

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .context("Invalid request method")?;
    let mut upstream = state.upstream.request(method, url);
    for (name, value) in parts.headers.iter() {
        let name = name.as_str();
        if name == "host" || name == "content-length" || HOP_BY_HOP.contains(&name) {
            continue;
        }
        upstream = upstream.header(name, value.as_bytes());
    }

    let response = upstream.body(body).send().await?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    let body = response.bytes().await?;

    Ok(to_axum_response(CachedResponse {
        status,
        headers,
        body,
    }))
}

fn to_axum_response(response: CachedResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut headers = HeaderMap::new();
    for (name, value) in &response.headers {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
            || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    (status, headers, Body::from(response.body)).into_response()
}
