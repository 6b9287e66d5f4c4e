use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use reqwest::Url;
use tokio::sync::Semaphore;

use parsewiz::cache::{
    CachePolicy, CacheRequest, CacheStorage, CachedResponse, ControlMessage, FetchOutcome, Network,
    WorkerState, OFFLINE_MESSAGE,
};
use parsewiz::config::CacheConfig;

const ORIGIN: &str = "http://app.test";

/// Scripted network: fixed responses per URL, an on/off switch and an optional gate.
#[derive(Default)]
struct FakeNetwork {
    responses: Mutex<HashMap<String, CachedResponse>>,
    offline: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
    fetched: Mutex<Vec<String>>,
}

impl FakeNetwork {
    fn serve(&self, path: &str, status: u16, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(format!("{}{}", ORIGIN, path), CachedResponse::text(status, body));
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Block fetches until permits are added to the returned semaphore.
    fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    fn fetch_count(&self, path: &str) -> usize {
        let url = format!("{}{}", ORIGIN, path);
        self.fetched.lock().unwrap().iter().filter(|u| **u == url).count()
    }
}

#[async_trait::async_trait]
impl Network for FakeNetwork {
    async fn fetch(&self, request: &CacheRequest) -> anyhow::Result<CachedResponse> {
        self.fetched.lock().unwrap().push(request.url.to_string());

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await?;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("network unreachable"));
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(request.url.as_str())
            .cloned()
            .unwrap_or_else(|| CachedResponse::text(404, "Not Found")))
    }
}

fn config() -> CacheConfig {
    CacheConfig {
        origin: ORIGIN.to_string(),
        static_assets: vec!["/".to_string(), "/index.html".to_string(), "/app.js".to_string()],
        ..CacheConfig::default()
    }
}

fn network_with_assets() -> Arc<FakeNetwork> {
    let network = FakeNetwork::default();
    network.serve("/", 200, "<html>home v1</html>");
    network.serve("/index.html", 200, "<html>index v1</html>");
    network.serve("/app.js", 200, "console.log('v1')");
    Arc::new(network)
}

fn policy(network: Arc<FakeNetwork>, storage: CacheStorage) -> CachePolicy {
    CachePolicy::new(config(), storage, network).unwrap()
}

async fn activated(network: Arc<FakeNetwork>) -> CachePolicy {
    let policy = policy(network, CacheStorage::new());
    policy.install().await.unwrap();
    policy.activate_if_ready().unwrap();
    policy
}

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn body(outcome: &FetchOutcome) -> String {
    match outcome {
        FetchOutcome::Respond(r) => String::from_utf8(r.body.to_vec()).unwrap(),
        FetchOutcome::Passthrough => panic!("expected a response"),
    }
}

fn status(outcome: &FetchOutcome) -> u16 {
    match outcome {
        FetchOutcome::Respond(r) => r.status,
        FetchOutcome::Passthrough => panic!("expected a response"),
    }
}

#[tokio::test]
async fn test_install_populates_manifest_and_requests_skip_waiting() {
    let network = network_with_assets();
    let policy = policy(network, CacheStorage::new());

    assert_eq!(policy.install().await.unwrap(), 3);

    let lifecycle = policy.lifecycle();
    assert_eq!(lifecycle.state, WorkerState::Installed);
    assert!(lifecycle.skip_waiting);
    assert_eq!(policy.storage().len("parsewiz-v1"), 3);

    policy.activate_if_ready().unwrap();
    let lifecycle = policy.lifecycle();
    assert_eq!(lifecycle.state, WorkerState::Activated);
    assert!(lifecycle.clients_claimed);
}

#[tokio::test]
async fn test_old_versions_survive_install_and_are_pruned_on_activate() {
    let storage = CacheStorage::new();
    storage.put("parsewiz-v0", "http://app.test/app.js", CachedResponse::text(200, "old"));
    storage.open("someone-elses-cache");

    let policy = policy(network_with_assets(), storage.clone());
    policy.install().await.unwrap();
    assert!(storage.has("parsewiz-v0"));

    let deleted = policy.activate();

    assert_eq!(deleted, vec!["parsewiz-v0"]);
    assert_eq!(storage.keys(), vec!["someone-elses-cache", "parsewiz-v1"]);
}

#[tokio::test]
async fn test_failed_install_caches_nothing() {
    let network = network_with_assets();
    network.serve("/app.js", 500, "boom");
    let policy = policy(network, CacheStorage::new());

    assert!(policy.install().await.is_err());

    assert_eq!(policy.storage().len("parsewiz-v1"), 0);
    assert!(!policy.lifecycle().skip_waiting);
    assert!(policy.activate_if_ready().is_none());

    policy.handle_message(ControlMessage::SkipWaiting);
    assert_eq!(policy.lifecycle().state, WorkerState::Activated);
}

#[tokio::test]
async fn test_early_skip_waiting_does_not_survive_failed_install() {
    let network = network_with_assets();
    network.serve("/index.html", 404, "missing");
    let policy = policy(network, CacheStorage::new());

    policy.handle_message(ControlMessage::SkipWaiting);
    assert_eq!(policy.lifecycle().state, WorkerState::Parsed);

    assert!(policy.install().await.is_err());

    let lifecycle = policy.lifecycle();
    assert_eq!(lifecycle.state, WorkerState::Installed);
    assert!(!lifecycle.skip_waiting);
    assert!(policy.activate_if_ready().is_none());
    assert_eq!(policy.lifecycle().state, WorkerState::Installed);
}

#[tokio::test]
async fn test_skip_waiting_message_parses() {
    let message: ControlMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
    assert_eq!(message, ControlMessage::SkipWaiting);
    assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"RELOAD"}"#).is_err());
}

#[tokio::test]
async fn test_non_get_and_cross_origin_pass_through() {
    let policy = activated(network_with_assets()).await;

    let post = CacheRequest::new("POST", url("/api/preview"), parsewiz::cache::RequestMode::Other);
    assert_eq!(policy.handle_fetch(&post).await, FetchOutcome::Passthrough);

    let foreign = CacheRequest::get(Url::parse("https://analytics.example.com/app.js").unwrap());
    assert_eq!(policy.handle_fetch(&foreign).await, FetchOutcome::Passthrough);
}

#[tokio::test]
async fn test_not_intercepting_before_activation() {
    let policy = policy(network_with_assets(), CacheStorage::new());
    policy.install().await.unwrap();

    let outcome = policy.handle_fetch(&CacheRequest::get(url("/app.js"))).await;
    assert_eq!(outcome, FetchOutcome::Passthrough);
}

#[tokio::test]
async fn test_api_offline_synthesizes_503_json() {
    let network = network_with_assets();
    let policy = activated(Arc::clone(&network)).await;
    network.set_offline(true);

    let outcome = policy.handle_fetch(&CacheRequest::get(url("/api/health"))).await;

    let FetchOutcome::Respond(response) = outcome else {
        panic!("API request must be answered");
    };
    assert_eq!(response.status, 503);
    assert_eq!(response.header("Content-Type"), Some("application/json"));
    let json: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(json["error"], OFFLINE_MESSAGE);
    assert!(!OFFLINE_MESSAGE.is_empty());
}

#[tokio::test]
async fn test_api_online_is_network_first_and_not_cached() {
    let network = network_with_assets();
    network.serve("/api/health", 200, r#"{"status":"ok"}"#);
    let policy = activated(Arc::clone(&network)).await;

    let outcome = policy.handle_fetch(&CacheRequest::get(url("/api/health"))).await;

    assert_eq!(body(&outcome), r#"{"status":"ok"}"#);
    assert!(policy.storage().match_any(url("/api/health").as_str()).is_none());
}

#[tokio::test]
async fn test_cached_asset_served_before_revalidation_completes() {
    let network = network_with_assets();
    let policy = activated(Arc::clone(&network)).await;

    network.serve("/app.js", 200, "console.log('v2')");
    let gate = network.hold();

    let first = policy.handle_fetch(&CacheRequest::get(url("/app.js"))).await;
    assert_eq!(body(&first), "console.log('v1')");

    // Revalidation has started but is held at the gate
    while network.fetch_count("/app.js") < 2 {
        tokio::task::yield_now().await;
    }
    let stored = policy.storage().match_in("parsewiz-v1", url("/app.js").as_str()).unwrap();
    assert_eq!(stored.body.as_ref(), b"console.log('v1')");

    gate.add_permits(10);
    policy.settle().await;

    let second = policy.handle_fetch(&CacheRequest::get(url("/app.js"))).await;
    assert_eq!(body(&second), "console.log('v2')");
}

#[tokio::test]
async fn test_revalidation_errors_are_swallowed() {
    let network = network_with_assets();
    let policy = activated(Arc::clone(&network)).await;
    network.set_offline(true);

    let outcome = policy.handle_fetch(&CacheRequest::get(url("/index.html"))).await;
    policy.settle().await;

    assert_eq!(body(&outcome), "<html>index v1</html>");
    let stored = policy.storage().match_in("parsewiz-v1", url("/index.html").as_str()).unwrap();
    assert_eq!(stored.body.as_ref(), b"<html>index v1</html>");
}

#[tokio::test]
async fn test_miss_caches_only_successful_responses() {
    let network = network_with_assets();
    network.serve("/logo.png", 200, "png");
    let policy = activated(Arc::clone(&network)).await;

    let hit = policy.handle_fetch(&CacheRequest::get(url("/logo.png"))).await;
    assert_eq!(body(&hit), "png");
    assert!(policy.storage().match_any(url("/logo.png").as_str()).is_some());

    let missing = policy.handle_fetch(&CacheRequest::get(url("/missing.css"))).await;
    assert_eq!(status(&missing), 404);
    assert!(policy.storage().match_any(url("/missing.css").as_str()).is_none());
}

#[tokio::test]
async fn test_offline_navigation_falls_back_to_index() {
    let network = network_with_assets();
    let policy = activated(Arc::clone(&network)).await;
    network.set_offline(true);

    let page = policy.handle_fetch(&CacheRequest::navigate(url("/reports/42"))).await;
    assert_eq!(body(&page), "<html>index v1</html>");

    let asset = policy.handle_fetch(&CacheRequest::get(url("/styles.css"))).await;
    assert_eq!(status(&asset), 503);
    assert_eq!(body(&asset), "Offline");
}
