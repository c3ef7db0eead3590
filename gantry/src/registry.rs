//! In-memory service registry with single-hop peer replication.
//!
//! Endpoints register themselves by name; the registry stamps the
//! registration time and, unless the request carried `noSpread`, forwards
//! the payload to each configured peer with `noSpread=true` so peers never
//! re-fan. A background sweeper marks endpoints that have not refreshed
//! within the staleness horizon `offline`. Entries are never deleted, so
//! operators keep seeing historical presence.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::Result;
use crate::http::HttpServer;
use crate::http::metrics::RuntimeInfo;

/// Registrations older than this are marked offline.
pub const STALENESS_HORIZON: Duration = Duration::from_secs(500);
/// How often the sweeper wakes.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

pub const REGISTRY_PATH: &str = "/_service/endpoint/registry";
pub const QUERY_PATH: &str = "/_service/endpoints";
pub const KEY_HEADER: &str = "registry-key";

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

/// A registered service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Epoch millis stamped by the receiving registry.
    #[serde(default, rename = "registerTime")]
    pub register_time: i64,
    #[serde(default, rename = "runtimeInfo")]
    pub runtime_info: Option<RuntimeInfo>,
}

struct RegistryShared {
    endpoints: RwLock<HashMap<String, ServiceEndpoint>>,
    peers: Vec<String>,
    key: Option<String>,
    client: reqwest::Client,
}

#[derive(Clone)]
pub struct ServiceRegistry {
    shared: Arc<RegistryShared>,
}

impl ServiceRegistry {
    pub fn new(peers: Vec<String>, key: Option<String>) -> Self {
        ServiceRegistry {
            shared: Arc::new(RegistryShared {
                endpoints: RwLock::new(HashMap::new()),
                peers,
                key,
                client: reqwest::Client::new(),
            }),
        }
    }

    /// Store an endpoint by name, last writer wins. Stamps the
    /// registration time and resets the status to online.
    pub fn register(&self, mut endpoint: ServiceEndpoint) -> ServiceEndpoint {
        endpoint.register_time = chrono::Utc::now().timestamp_millis();
        endpoint.status = STATUS_ONLINE.to_string();
        self.shared
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.name.clone(), endpoint.clone());
        info!(name = %endpoint.name, "service endpoint registered");
        endpoint
    }

    pub fn endpoints(&self) -> HashMap<String, ServiceEndpoint> {
        self.shared.endpoints.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get(&self, name: &str) -> Option<ServiceEndpoint> {
        self.shared
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Forward a registration to every peer, single hop. Fan-out is
    /// best-effort: a failing peer is logged and skipped.
    async fn spread(&self, endpoint: &ServiceEndpoint) {
        for peer in &self.shared.peers {
            let url = format!("{peer}{REGISTRY_PATH}?noSpread=true");
            let mut headers = HashMap::new();
            if let Some(key) = &self.shared.key {
                headers.insert(KEY_HEADER.to_string(), key.clone());
            }
            if let Err(err) = post_json(&self.shared.client, &url, &headers, endpoint, Duration::from_secs(30)).await {
                warn!(%peer, %err, "registry fan-out failed");
            }
        }
    }

    /// One sweep pass: endpoints whose registration is older than the
    /// staleness horizon go offline. The write lock is taken and released
    /// per entry, never across the whole pass.
    pub fn sweep_once(&self) {
        let horizon = chrono::Utc::now().timestamp_millis() - STALENESS_HORIZON.as_millis() as i64;
        let stale: Vec<String> = {
            let endpoints = self.shared.endpoints.read().unwrap_or_else(PoisonError::into_inner);
            endpoints
                .values()
                .filter(|e| e.register_time < horizon && e.status != STATUS_OFFLINE)
                .map(|e| e.name.clone())
                .collect()
        };
        for name in stale {
            let mut endpoints = self.shared.endpoints.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(endpoint) = endpoints.get_mut(&name) {
                if endpoint.register_time < horizon {
                    endpoint.status = STATUS_OFFLINE.to_string();
                    info!(%name, "service endpoint went offline");
                }
            }
        }
    }

    /// Run the staleness sweeper until the token is cancelled.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = interval.tick() => registry.sweep_once(),
                    _ = shutdown.cancelled() => {
                        info!("registry sweeper stopped");
                        return;
                    }
                }
            }
        });
    }
}

/// Periodically announce this process to a remote registry. Each beat
/// refreshes the runtime snapshot before posting, so the remote side sees
/// current host state; registration time is stamped remotely. Failures are
/// logged and the next beat retries.
pub fn spawn_heartbeat(
    registry_url: &str,
    mut endpoint: ServiceEndpoint,
    key: Option<String>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let url = format!("{}{}", registry_url.trim_end_matches('/'), REGISTRY_PATH);
    let client = reqwest::Client::new();
    let mut headers = HashMap::new();
    if let Some(key) = key {
        headers.insert(KEY_HEADER.to_string(), key);
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    endpoint.runtime_info = Some(crate::http::metrics::runtime_info());
                    if let Err(err) = post_json(&client, &url, &headers, &endpoint, Duration::from_secs(30)).await {
                        warn!(%url, %err, "registry heartbeat failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(name = %endpoint.name, "registry heartbeat stopped");
                    return;
                }
            }
        }
    });
}

/// POST a JSON value with extra headers and a bounded timeout. Returns the
/// response status and body.
pub async fn post_json<T: Serialize>(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
    body: &T,
    timeout: Duration,
) -> Result<(u16, bytes::Bytes)> {
    let mut request = client.post(url).json(body).timeout(timeout);
    for (name, value) in headers {
        request = request.header(name, value);
    }
    let response = request.send().await?;
    let status = response.status().as_u16();
    let body = response.bytes().await?;
    Ok((status, body))
}

/// Expose the registry over HTTP: `POST /_service/endpoint/registry`
/// registers (authenticated by the optional pre-shared key) and, when
/// enabled, `GET /_service/endpoints` returns the full map.
pub fn register_registry_service(server: &HttpServer, registry: &ServiceRegistry, enable_query: bool) {
    let accept = registry.clone();
    server.register_handler(REGISTRY_PATH, move |ctx| {
        let registry = accept.clone();
        async move {
            if let Some(expected) = &registry.shared.key {
                if ctx.header(KEY_HEADER).as_deref() != Some(expected.as_str()) {
                    let _ = ctx.fail("invalid registry key");
                    return;
                }
            }
            let endpoint: ServiceEndpoint = match ctx.json_as().await {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    let _ = ctx.fail(err.to_string());
                    return;
                }
            };
            let stored = registry.register(endpoint);
            let no_spread = ctx.query_param("noSpread").as_deref() == Some("true");
            if !no_spread && !registry.shared.peers.is_empty() {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.spread(&stored).await;
                });
            }
            let _ = ctx.api_response(0, "", Value::Null);
        }
    });

    if enable_query {
        let query = registry.clone();
        server.register_handler(QUERY_PATH, move |ctx| {
            let registry = query.clone();
            async move {
                let _ = ctx.api_response(0, "", registry.endpoints());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str) -> ServiceEndpoint {
        ServiceEndpoint {
            name: name.to_string(),
            status: String::new(),
            properties: HashMap::new(),
            register_time: 0,
            runtime_info: None,
        }
    }

    #[test]
    fn register_stamps_time_and_status() {
        let registry = ServiceRegistry::new(Vec::new(), None);
        let stored = registry.register(endpoint("svc-a"));
        assert_eq!(stored.status, STATUS_ONLINE);
        assert!(stored.register_time > 0);
        assert_eq!(registry.endpoints().len(), 1);
    }

    #[test]
    fn last_writer_wins_by_name() {
        let registry = ServiceRegistry::new(Vec::new(), None);
        let mut first = endpoint("svc-a");
        first.properties.insert("v".to_string(), "1".to_string());
        registry.register(first);

        let mut second = endpoint("svc-a");
        second.properties.insert("v".to_string(), "2".to_string());
        registry.register(second);

        let stored = registry.get("svc-a").unwrap();
        assert_eq!(stored.properties["v"], "2");
        assert_eq!(registry.endpoints().len(), 1);
    }

    #[test]
    fn sweep_marks_stale_entries_offline_but_keeps_them() {
        let registry = ServiceRegistry::new(Vec::new(), None);
        registry.register(endpoint("fresh"));
        registry.register(endpoint("stale"));

        // age one entry past the horizon
        {
            let mut endpoints = registry.shared.endpoints.write().unwrap();
            endpoints.get_mut("stale").unwrap().register_time -= STALENESS_HORIZON.as_millis() as i64 + 1_000;
        }

        registry.sweep_once();

        assert_eq!(registry.get("fresh").unwrap().status, STATUS_ONLINE);
        assert_eq!(registry.get("stale").unwrap().status, STATUS_OFFLINE);
        assert_eq!(registry.endpoints().len(), 2, "sweeper never deletes");
    }

    #[test]
    fn endpoint_payload_deserializes_with_defaults() {
        let endpoint: ServiceEndpoint = serde_json::from_str(r#"{"name": "svc-b"}"#).unwrap();
        assert_eq!(endpoint.name, "svc-b");
        assert!(endpoint.properties.is_empty());
        assert_eq!(endpoint.register_time, 0);
        assert!(endpoint.runtime_info.is_none());
    }
}
