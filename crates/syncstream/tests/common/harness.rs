//! Test harness wiring a registry to scripted collaborators.

use std::sync::Arc;
use std::time::Duration;

use syncstream::persist::{MemoryStore, PersistenceBridge};
use syncstream::stream::StaticCredentials;
use syncstream::{StreamConfig, SubscriptionRegistry};

use super::transport::{Script, ScriptedTransport};

/// Registry plus handles to everything it talks to.
pub struct TestHarness {
    pub registry: SubscriptionRegistry,
    pub transport: Arc<ScriptedTransport>,
    pub store: Arc<MemoryStore>,
    pub credentials: Arc<StaticCredentials>,
}

impl TestHarness {
    /// Registry with a short grace window and the given connection scripts.
    pub fn new(scripts: Vec<Script>) -> Self {
        let mut config = StreamConfig::new("http://api.test");
        config.grace_window_ms = 300;
        Self::with_config(config, scripts, Arc::new(MemoryStore::new()))
    }

    pub fn with_config(config: StreamConfig, scripts: Vec<Script>, store: Arc<MemoryStore>) -> Self {
        let transport = Arc::new(ScriptedTransport::new(scripts));
        let credentials = Arc::new(StaticCredentials::new("test-token", Some("org-1")));
        let registry = SubscriptionRegistry::new(
            config,
            transport.clone(),
            credentials.clone(),
            PersistenceBridge::new(store.clone()),
        );

        Self {
            registry,
            transport,
            store,
            credentials,
        }
    }

    /// Bridge over the harness store, for seeding and inspecting records.
    pub fn bridge(&self) -> PersistenceBridge {
        PersistenceBridge::new(self.store.clone())
    }
}

/// One wire frame carrying `json`.
pub fn frame(json: &str) -> Vec<u8> {
    format!("data: {}\n\n", json).into_bytes()
}

/// Polls `condition` for up to two seconds.
pub async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    wait_for_within(Duration::from_secs(2), condition).await
}

pub async fn wait_for_within<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
