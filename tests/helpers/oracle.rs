//! Services and bridges wired to the bundled mock oracle.

// Shared across test binaries; not every binary uses every helper.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use oracle_ls::bridge::{Bridge, BridgeConfig};
use oracle_ls::config::{CacheConfig, DebounceInterval};
use oracle_ls::scheduler::SchedulerConfig;
use oracle_ls::service::Service;
use oracle_ls::transport::TransportConfig;
use serde_json::{Value, json};
use url::Url;

pub fn mock_oracle_path() -> &'static str {
    env!("CARGO_BIN_EXE_mock-oracle")
}

pub fn mock_transport() -> TransportConfig {
    TransportConfig::new(mock_oracle_path())
}

/// Short timeouts and restart delays so failure paths run quickly.
pub fn bridge_config(transport: TransportConfig) -> BridgeConfig {
    let mut config = BridgeConfig::new(transport);
    config.call_timeout = Duration::from_secs(5);
    config.restart.backoff = Duration::from_millis(10);
    config
}

pub fn scheduler_config(debounce_ms: u64) -> SchedulerConfig {
    SchedulerConfig {
        debounce: DebounceInterval::from_millis(debounce_ms).expect("valid debounce"),
        max_in_flight: 4,
        aging: Duration::from_secs(1),
    }
}

pub async fn start_bridge(transport: TransportConfig) -> Arc<Bridge> {
    let bridge = Bridge::new(bridge_config(transport));
    bridge.start().await.expect("mock oracle should start");
    bridge
}

pub async fn start_service_with(
    transport: TransportConfig,
    debounce_ms: u64,
    cache: CacheConfig,
) -> Arc<Service> {
    let bridge = Bridge::new(bridge_config(transport));
    let service = Service::with_bridge(bridge, scheduler_config(debounce_ms), &cache);
    service.start().await.expect("mock oracle should start");
    service
}

pub async fn start_service() -> Arc<Service> {
    start_service_with(mock_transport(), 250, CacheConfig::default()).await
}

pub fn file_uri(name: &str) -> Url {
    Url::parse(&format!("file:///workspace/{}", name)).expect("valid uri")
}

/// Per-method call counts reported by the running mock oracle.
pub async fn call_counts(bridge: &Bridge) -> Value {
    bridge
        .call("get_call_counts", json!({}))
        .await
        .expect("get_call_counts")
}

pub fn count_of(counts: &Value, method: &str) -> u64 {
    counts["calls"][method].as_u64().unwrap_or(0)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
