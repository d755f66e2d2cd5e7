//! Shared registry of live sync subscriptions.
//!
//! One stream per key no matter how many callers ask for it. The map of
//! subscriptions is copy-on-write: every change builds a new map and swaps
//! it in, so readers holding an `Arc` of the old map keep a consistent view.
//! A generation number on each entry keeps a superseded read loop or grace
//! timer from touching the subscription that replaced it.

pub mod health;
pub mod subscription;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, JobLauncher};
use crate::broadcast::{HealthBroadcaster, HealthEvent, SnapshotBroadcaster, SnapshotUpdate};
use crate::config::StreamConfig;
use crate::persist::PersistenceBridge;
use crate::progress::SyncSnapshot;
use crate::stream::{
    CredentialProvider, Endpoint, FrameParser, FrameSource, StreamTransport, SyncEvent,
    TransportError,
};

pub use health::{find_stale, HealthMonitor};
pub use subscription::{Subscription, SubscriptionStatus};

type SubscriptionMap = HashMap<String, Subscription>;

/// Why a subscription left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownReason {
    Unsubscribed,
    GraceExpired,
    Replaced,
    Shutdown,
}

impl std::fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeardownReason::Unsubscribed => write!(f, "unsubscribed"),
            TeardownReason::GraceExpired => write!(f, "grace window expired"),
            TeardownReason::Replaced => write!(f, "replaced"),
            TeardownReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Handle to the registry. Clones share the same subscriptions.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    config: StreamConfig,
    transport: Arc<dyn StreamTransport>,
    credentials: Arc<dyn CredentialProvider>,
    persistence: PersistenceBridge,
    subscriptions: RwLock<Arc<SubscriptionMap>>,
    next_generation: AtomicU64,
    updates: SnapshotBroadcaster,
    health_events: HealthBroadcaster,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl SubscriptionRegistry {
    pub fn new(
        config: StreamConfig,
        transport: Arc<dyn StreamTransport>,
        credentials: Arc<dyn CredentialProvider>,
        persistence: PersistenceBridge,
    ) -> Self {
        let updates = SnapshotBroadcaster::new(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(RegistryInner {
                config,
                transport,
                credentials,
                persistence,
                subscriptions: RwLock::new(Arc::new(SubscriptionMap::new())),
                next_generation: AtomicU64::new(0),
                updates,
                health_events: HealthBroadcaster::default(),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Starts tracking `stream_id` under `key`.
    ///
    /// Returns false when an active subscription already exists for the key;
    /// the caller then shares that subscription's snapshot. A finished
    /// subscription still inside its grace window is replaced. Must be
    /// called from within a tokio runtime.
    pub fn subscribe(&self, key: &str, stream_id: &str) -> bool {
        self.inner.subscribe(key, stream_id)
    }

    /// Cancels and removes the subscription for `key`, including its
    /// persisted record. Calling it again is a no-op.
    pub fn unsubscribe(&self, key: &str) {
        self.inner.teardown(key, None, TeardownReason::Unsubscribed);
    }

    /// Re-attaches to a run after a reload.
    ///
    /// True when `key` already tracks `stream_id`, or when a persisted,
    /// non-terminal record for exactly that run seeded a new subscription.
    pub fn restore(&self, key: &str, stream_id: &str) -> bool {
        self.inner.restore(key, stream_id)
    }

    /// Latest snapshot for `key`, if it is tracked.
    pub fn get_snapshot(&self, key: &str) -> Option<SyncSnapshot> {
        self.inner
            .read_map()
            .get(key)
            .map(|sub| sub.snapshot.clone())
    }

    /// Full entry for `key`, including status and stream id.
    pub fn subscription(&self, key: &str) -> Option<Subscription> {
        self.inner.read_map().get(key).cloned()
    }

    /// True only while the subscription for `key` is still streaming.
    pub fn has_active(&self, key: &str) -> bool {
        self.inner
            .read_map()
            .get(key)
            .is_some_and(Subscription::is_active)
    }

    /// True while the health monitor considers `key` silent.
    pub fn is_stale(&self, key: &str) -> bool {
        self.inner
            .read_map()
            .get(key)
            .is_some_and(Subscription::is_stale)
    }

    /// Keys currently tracked, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.read_map().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read_map().is_empty()
    }

    /// Snapshot updates for every key, ending with a `Removed` update per key.
    pub fn updates(&self) -> broadcast::Receiver<SnapshotUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn health_events(&self) -> broadcast::Receiver<HealthEvent> {
        self.inner.health_events.subscribe()
    }

    /// True while the health monitor task is running.
    pub fn is_monitoring(&self) -> bool {
        lock_monitor(&self.inner.monitor).is_some()
    }

    /// Cancels every subscription and stops the health monitor.
    ///
    /// Records of still-active runs stay persisted so the next session can
    /// restore them.
    pub fn shutdown_all(&self) {
        self.inner.shutdown_all();
    }

    /// Starts a run for `key` and subscribes to it.
    ///
    /// When `key` is already streaming, no new run is started and the
    /// tracked stream id is returned instead.
    pub async fn start_and_track(
        &self,
        launcher: &dyn JobLauncher,
        key: &str,
    ) -> Result<String, ApiError> {
        if let Some(sub) = self.subscription(key).filter(Subscription::is_active) {
            debug!(key, stream_id = %sub.stream_id, "run already tracked");
            return Ok(sub.stream_id);
        }

        let stream_id = launcher.start_run(key).await?;
        info!(key, stream_id = %stream_id, "run started");
        self.subscribe(key, &stream_id);
        Ok(stream_id)
    }
}

impl RegistryInner {
    fn read_map(&self) -> Arc<SubscriptionMap> {
        match self.subscriptions.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => {
                warn!("subscription map lock was poisoned, recovering");
                Arc::clone(&poisoned.into_inner())
            }
        }
    }

    /// Builds the next map from a copy of the current one and swaps it in.
    fn with_map_mut<R>(&self, f: impl FnOnce(&mut SubscriptionMap) -> R) -> R {
        let mut guard = match self.subscriptions.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("subscription map lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        let mut next = SubscriptionMap::clone(&guard);
        let result = f(&mut next);
        *guard = Arc::new(next);
        result
    }

    fn subscribe(self: &Arc<Self>, key: &str, stream_id: &str) -> bool {
        // Persisted state is never consulted while a live stream exists.
        if self.read_map().get(key).is_some_and(Subscription::is_active) {
            debug!(key, "already subscribed, sharing existing stream");
            return false;
        }

        let now = Utc::now();
        let (snapshot, restored) = match self.restorable_snapshot(key, stream_id, now) {
            Some(snapshot) => (snapshot, true),
            None => (SyncSnapshot::new(now), false),
        };

        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let created = Subscription::new(key, stream_id, generation, snapshot, restored);

        let inserted = self.with_map_mut(|map| {
            if map.get(key).is_some_and(Subscription::is_active) {
                return None;
            }
            Some(map.insert(key.to_string(), created.clone()))
        });

        let Some(replaced) = inserted else {
            debug!(key, "lost subscribe race, sharing existing stream");
            return false;
        };

        if let Some(old) = replaced {
            if old.begin_teardown() {
                old.cancel.cancel();
                debug!(
                    key,
                    old_stream_id = %old.stream_id,
                    reason = %TeardownReason::Replaced,
                    "subscription torn down"
                );
            }
        }

        info!(key, stream_id, generation, restored, "subscription created");
        self.publish(&created);
        self.ensure_monitor();

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_subscription(created).await });
        true
    }

    /// Snapshot to seed a new subscription with, when a persisted record
    /// exists for exactly this run and the run had not finished.
    fn restorable_snapshot(
        &self,
        key: &str,
        stream_id: &str,
        now: DateTime<Utc>,
    ) -> Option<SyncSnapshot> {
        let record = match self.persistence.load(key) {
            Ok(record) => record?,
            Err(e) => {
                error!(key, error = %e, "failed to load persisted progress");
                return None;
            }
        };

        if !record.can_restore(stream_id) {
            debug!(
                key,
                stored_stream_id = %record.stream_id,
                stream_id,
                "persisted progress not restorable for this run"
            );
            return None;
        }

        debug!(key, stream_id, "restoring persisted progress");
        let mut snapshot = record.snapshot;
        // Staleness is measured from when watching resumed.
        snapshot.last_event_at = now;
        Some(snapshot)
    }

    fn restore(self: &Arc<Self>, key: &str, stream_id: &str) -> bool {
        if let Some(existing) = self.read_map().get(key) {
            if existing.stream_id == stream_id {
                return true;
            }
            if existing.is_active() {
                return false;
            }
        }

        match self.persistence.load(key) {
            Ok(Some(record)) if record.can_restore(stream_id) => self.subscribe(key, stream_id),
            Ok(_) => false,
            Err(e) => {
                error!(key, error = %e, "failed to load persisted progress");
                false
            }
        }
    }

    async fn run_subscription(self: Arc<Self>, sub: Subscription) {
        let Some(credentials) = self.credentials.credentials() else {
            self.fail(&sub, TransportError::MissingCredentials);
            return;
        };

        let endpoint = Endpoint::get(self.config.sync_stream_url(&sub.stream_id));
        let opened = tokio::select! {
            biased;
            _ = sub.cancel.cancelled() => return,
            opened = self.transport.open(&endpoint, &credentials) => opened,
        };
        drop(credentials);

        let chunks = match opened {
            Ok(chunks) => chunks,
            Err(e) => {
                self.fail(&sub, e);
                return;
            }
        };
        debug!(key = %sub.key, url = %endpoint.url, "progress stream opened");

        let mut source = FrameSource::new(chunks, sub.cancel.clone());
        let mut parser = FrameParser::<SyncEvent>::new();

        while let Some(chunk) = source.next_chunk().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.fail(&sub, e);
                    return;
                }
            };
            for event in parser.push(&bytes) {
                if self.apply_event(&sub, &event) == Flow::Stop {
                    return;
                }
            }
        }

        if sub.cancel.is_cancelled() {
            debug!(key = %sub.key, "read loop cancelled");
            return;
        }

        if let Some(event) = parser.finish() {
            if self.apply_event(&sub, &event) == Flow::Stop {
                return;
            }
        }
        self.fail(&sub, TransportError::ClosedEarly);
    }

    /// Folds one event into the live entry for `sub`.
    fn apply_event(self: &Arc<Self>, sub: &Subscription, event: &SyncEvent) -> Flow {
        let now = Utc::now();
        let applied = self.with_map_mut(|map| {
            let current = map.get(&sub.key)?;
            if current.generation != sub.generation || !current.is_active() {
                return None;
            }
            let was_stale = current.stale;
            let next = current.with_snapshot(current.snapshot.apply(event, now));
            map.insert(sub.key.clone(), next.clone());
            Some((next, was_stale))
        });

        let Some((next, was_stale)) = applied else {
            return Flow::Stop;
        };

        if was_stale {
            info!(key = %next.key, "subscription recovered");
            self.health_events.send(HealthEvent::Recovered {
                key: next.key.clone(),
                stream_id: next.stream_id.clone(),
            });
        }

        self.persist(&next);
        self.publish(&next);

        if next.is_active() {
            return Flow::Continue;
        }

        match next.status {
            SubscriptionStatus::Failed => warn!(
                key = %next.key,
                error = next.snapshot.error_message.as_deref().unwrap_or_default(),
                "sync failed"
            ),
            _ => info!(
                key = %next.key,
                total = next.snapshot.counters.total(),
                "sync completed"
            ),
        }
        self.schedule_teardown(&next);
        Flow::Stop
    }

    /// Marks `sub` failed after a fatal transport error. Nothing is retried.
    fn fail(self: &Arc<Self>, sub: &Subscription, err: TransportError) {
        if sub.cancel.is_cancelled() {
            return;
        }

        warn!(key = %sub.key, stream_id = %sub.stream_id, error = %err, "progress stream failed");
        if err.is_auth_failure() {
            self.credentials.invalidate();
        }

        let now = Utc::now();
        let message = err.user_message();
        let failed = self.with_map_mut(|map| {
            let current = map.get(&sub.key)?;
            if current.generation != sub.generation || !current.is_active() {
                return None;
            }
            let next = current.with_snapshot(current.snapshot.failed(&message, now));
            map.insert(sub.key.clone(), next.clone());
            Some(next)
        });

        if let Some(next) = failed {
            self.persist(&next);
            self.publish(&next);
            self.schedule_teardown(&next);
        }
    }

    fn schedule_teardown(self: &Arc<Self>, sub: &Subscription) {
        let inner = Arc::clone(self);
        let key = sub.key.clone();
        let generation = sub.generation;
        let grace = self.config.grace_window();

        tokio::spawn(async move {
            if grace > Duration::ZERO {
                tokio::time::sleep(grace).await;
            }
            inner.teardown(&key, Some(generation), TeardownReason::GraceExpired);
        });
    }

    /// Removes the entry for `key`, once. With a generation, only that
    /// exact subscription is removed.
    fn teardown(&self, key: &str, generation: Option<u64>, reason: TeardownReason) -> bool {
        let Some(sub) = self.read_map().get(key).cloned() else {
            return false;
        };
        if generation.is_some_and(|g| g != sub.generation) {
            debug!(key, reason = %reason, "teardown skipped for superseded subscription");
            return false;
        }
        if !sub.begin_teardown() {
            return false;
        }

        sub.cancel.cancel();
        self.with_map_mut(|map| {
            if map.get(key).is_some_and(|s| s.generation == sub.generation) {
                map.remove(key);
            }
        });

        if let Err(e) = self.persistence.remove(key) {
            error!(key, error = %e, "failed to remove persisted progress");
        }

        info!(key, stream_id = %sub.stream_id, reason = %reason, "subscription torn down");
        self.updates.send(SnapshotUpdate::new(
            key,
            &sub.stream_id,
            SubscriptionStatus::Removed,
            sub.snapshot.clone(),
        ));
        self.stop_monitor_if_idle();
        true
    }

    fn shutdown_all(&self) {
        let drained = self.with_map_mut(std::mem::take);

        for sub in drained.values() {
            if !sub.begin_teardown() {
                continue;
            }
            sub.cancel.cancel();

            // Active runs keep their record for the next session.
            if !sub.is_active() {
                if let Err(e) = self.persistence.remove(&sub.key) {
                    error!(key = %sub.key, error = %e, "failed to remove persisted progress");
                }
            }

            debug!(key = %sub.key, reason = %TeardownReason::Shutdown, "subscription torn down");
            self.updates.send(SnapshotUpdate::new(
                &sub.key,
                &sub.stream_id,
                SubscriptionStatus::Removed,
                sub.snapshot.clone(),
            ));
        }

        if let Some(monitor) = lock_monitor(&self.monitor).take() {
            monitor.stop();
        }
        info!(count = drained.len(), "all subscriptions shut down");
    }

    fn persist(&self, sub: &Subscription) {
        if let Err(e) = self
            .persistence
            .save(&sub.key, &sub.stream_id, &sub.snapshot)
        {
            error!(key = %sub.key, error = %e, "failed to persist progress");
        }
    }

    fn publish(&self, sub: &Subscription) {
        self.updates.send(SnapshotUpdate::new(
            &sub.key,
            &sub.stream_id,
            sub.status,
            sub.snapshot.clone(),
        ));
    }

    fn ensure_monitor(self: &Arc<Self>) {
        let mut monitor = lock_monitor(&self.monitor);
        if monitor.is_none() {
            let health = &self.config.health;
            *monitor = Some(HealthMonitor::start(
                Arc::downgrade(self),
                health.interval(),
                health.stale_after(),
            ));
            debug!(interval_secs = health.interval_secs, "health monitor started");
        }
    }

    fn stop_monitor_if_idle(&self) {
        let mut monitor = lock_monitor(&self.monitor);
        if self.read_map().is_empty() {
            if let Some(running) = monitor.take() {
                running.stop();
                debug!("health monitor stopped");
            }
        }
    }

    /// Flags active subscriptions that went quiet. Called by the monitor.
    pub(crate) fn check_health(&self, now: DateTime<Utc>, stale_after: Duration) {
        let map = self.read_map();
        let candidates: Vec<(String, u64)> = find_stale(map.values(), now, stale_after)
            .into_iter()
            .map(|sub| (sub.key.clone(), sub.generation))
            .collect();

        for (key, generation) in candidates {
            let flagged = self.with_map_mut(|map| {
                let current = map.get(&key)?;
                if current.generation != generation || !current.is_active() || current.stale {
                    return None;
                }
                let next = current.marked_stale();
                map.insert(key.clone(), next.clone());
                Some(next)
            });

            if let Some(sub) = flagged {
                let idle_secs = (now - sub.snapshot.last_event_at).num_seconds();
                warn!(key = %sub.key, stream_id = %sub.stream_id, idle_secs, "subscription stale");
                self.health_events.send(HealthEvent::Stale {
                    key: sub.key.clone(),
                    stream_id: sub.stream_id.clone(),
                    last_event_at: sub.snapshot.last_event_at,
                    idle_secs,
                });
            }
        }
    }
}

fn lock_monitor(monitor: &Mutex<Option<HealthMonitor>>) -> MutexGuard<'_, Option<HealthMonitor>> {
    match monitor.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;
    use crate::stream::{ChunkStream, Credentials, StaticCredentials};
    use async_trait::async_trait;
    use futures_util::{stream, StreamExt};

    /// Transport whose streams never produce anything.
    struct SilentTransport;

    #[async_trait]
    impl StreamTransport for SilentTransport {
        async fn open(
            &self,
            _endpoint: &Endpoint,
            _credentials: &Credentials,
        ) -> Result<ChunkStream, TransportError> {
            Ok(stream::pending().boxed())
        }
    }

    fn registry() -> (SubscriptionRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let registry = SubscriptionRegistry::new(
            StreamConfig::new("http://localhost"),
            Arc::new(SilentTransport),
            Arc::new(StaticCredentials::new("token", None)),
            PersistenceBridge::new(store.clone()),
        );
        (registry, store)
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_shares_entry() {
        let (registry, _store) = registry();

        assert!(registry.subscribe("src-1", "job-1"));
        assert!(!registry.subscribe("src-1", "job-2"));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.subscription("src-1").unwrap().stream_id(), "job-1");
        assert!(registry.has_active("src-1"));
        registry.shutdown_all();
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_is_noop() {
        let (registry, _store) = registry();
        let mut updates = registry.updates();
        registry.subscribe("src-1", "job-1");

        registry.unsubscribe("src-1");
        registry.unsubscribe("src-1");

        assert!(registry.get_snapshot("src-1").is_none());
        assert!(!registry.is_monitoring());

        let mut removed = 0;
        while let Ok(update) = updates.try_recv() {
            if update.status == SubscriptionStatus::Removed {
                removed += 1;
            }
        }
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn test_monitor_follows_subscription_count() {
        let (registry, _store) = registry();
        assert!(!registry.is_monitoring());

        registry.subscribe("a", "job-a");
        registry.subscribe("b", "job-b");
        assert!(registry.is_monitoring());

        registry.unsubscribe("a");
        assert!(registry.is_monitoring());
        registry.unsubscribe("b");
        assert!(!registry.is_monitoring());
    }

    #[tokio::test]
    async fn test_shutdown_keeps_active_records() {
        let (registry, store) = registry();
        registry.subscribe("src-1", "job-1");
        registry
            .inner
            .persist(&registry.subscription("src-1").unwrap());
        assert_eq!(store.len(), 1);

        registry.shutdown_all();

        assert!(registry.is_empty());
        assert!(!registry.is_monitoring());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_check_health_flags_once() {
        let (registry, _store) = registry();
        let mut health = registry.health_events();
        registry.subscribe("src-1", "job-1");

        let later = Utc::now() + chrono::Duration::minutes(10);
        registry.inner.check_health(later, Duration::from_secs(60));
        registry.inner.check_health(later, Duration::from_secs(60));

        assert!(registry.is_stale("src-1"));
        assert!(matches!(health.try_recv(), Ok(HealthEvent::Stale { .. })));
        assert!(health.try_recv().is_err());
        registry.shutdown_all();
    }
}
