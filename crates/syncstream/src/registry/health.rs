//! Periodic staleness checks over active subscriptions.
//!
//! The monitor is advisory: it flags subscriptions that went quiet and
//! broadcasts a [`HealthEvent`](crate::broadcast::HealthEvent), it never
//! cancels or reconnects anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use super::subscription::Subscription;
use super::RegistryInner;

/// Background task ticking while at least one subscription exists.
pub struct HealthMonitor {
    shutdown: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl HealthMonitor {
    /// Starts the tick loop. The loop holds only a weak reference so a
    /// dropped registry ends it on the next tick.
    pub(crate) fn start(
        registry: Weak<RegistryInner>,
        interval: Duration,
        stale_after: Duration,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let task = tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            interval_timer.tick().await; // skip immediate first tick

            loop {
                interval_timer.tick().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }
                let Some(inner) = registry.upgrade() else {
                    break;
                };
                inner.check_health(Utc::now(), stale_after);
            }
            tracing::debug!("health monitor loop exited");
        });

        Self { shutdown, task }
    }

    /// Stops the loop without waiting for it.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.task.abort();
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Active subscriptions silent for at least `stale_after` that are not
/// already flagged.
pub fn find_stale<'a, I>(subscriptions: I, now: DateTime<Utc>, stale_after: Duration) -> Vec<&'a Subscription>
where
    I: IntoIterator<Item = &'a Subscription>,
{
    subscriptions
        .into_iter()
        .filter(|sub| sub.is_active() && !sub.is_stale())
        .filter(|sub| {
            (now - sub.snapshot.last_event_at)
                .to_std()
                .map(|idle| idle >= stale_after)
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SyncSnapshot;
    use crate::stream::event::{ProgressPayload, SyncEvent};

    fn subscription_idle_for(key: &str, idle: chrono::Duration, now: DateTime<Utc>) -> Subscription {
        Subscription::new(key, "job-1", 1, SyncSnapshot::new(now - idle), false)
    }

    #[test]
    fn test_find_stale_by_threshold() {
        let now = Utc::now();
        let quiet = subscription_idle_for("quiet", chrono::Duration::minutes(10), now);
        let busy = subscription_idle_for("busy", chrono::Duration::seconds(5), now);

        let stale = find_stale([&quiet, &busy], now, Duration::from_secs(300));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].key(), "quiet");
    }

    #[test]
    fn test_already_flagged_not_reported_twice() {
        let now = Utc::now();
        let quiet = subscription_idle_for("quiet", chrono::Duration::minutes(10), now).marked_stale();

        assert!(find_stale([&quiet], now, Duration::from_secs(300)).is_empty());
    }

    #[test]
    fn test_finished_subscriptions_ignored() {
        let now = Utc::now();
        let started = now - chrono::Duration::minutes(10);
        let sub = subscription_idle_for("done", chrono::Duration::minutes(10), now);
        let done = sub.with_snapshot(sub.snapshot.apply(
            &SyncEvent::Progress(ProgressPayload {
                is_complete: true,
                ..Default::default()
            }),
            started,
        ));

        assert!(find_stale([&done], now, Duration::from_secs(300)).is_empty());
    }

    #[test]
    fn test_future_timestamp_is_not_stale() {
        let now = Utc::now();
        let sub = Subscription::new(
            "clock-skew",
            "job-1",
            1,
            SyncSnapshot::new(now + chrono::Duration::minutes(1)),
            false,
        );
        assert!(find_stale([&sub], now, Duration::from_secs(0)).is_empty());
    }
}
