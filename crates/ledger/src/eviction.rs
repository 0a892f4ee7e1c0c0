//! Periodic pruning of a bucket's entry store.
//!
//! Each cycle runs under the store's exclusive lock and rebuilds the map in two
//! phases:
//!
//! 1. **Age filter** -- entries idle for `idle_ttl` or longer are dropped
//!    unconditionally.
//! 2. **Capacity cap** -- the survivors are ordered by ascending average wait
//!    (most recently used first on ties) and only the first `max_entries` are
//!    kept.
//!
//! The result replaces the previous map wholesale. A key dropped here simply
//! starts over with a full limiter on its next request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::digest::KeyDigest;
use crate::store::{Entry, EntryStore};

/// What one eviction cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub retained: usize,
    pub dropped_idle: usize,
    pub dropped_over_cap: usize,
}

/// Select the entries that survive a cycle at `now`.
pub fn select_survivors(
    entries: HashMap<KeyDigest, Entry>,
    now: Instant,
    idle_ttl: Duration,
    max_entries: usize,
) -> (HashMap<KeyDigest, Entry>, EvictionReport) {
    let total = entries.len();

    let mut recent: Vec<(KeyDigest, Entry)> = entries
        .into_iter()
        .filter(|(_, entry)| now.saturating_duration_since(entry.last_used()) < idle_ttl)
        .collect();
    let dropped_idle = total - recent.len();

    // TODO: ascending wait keeps the least throttled keys; confirm whether the
    // most throttled ones should be kept instead.
    recent.sort_by(|(_, a), (_, b)| {
        a.avg_wait()
            .cmp(&b.avg_wait())
            .then_with(|| b.last_used().cmp(&a.last_used()))
    });
    let dropped_over_cap = recent.len().saturating_sub(max_entries);
    recent.truncate(max_entries);

    let report = EvictionReport {
        retained: recent.len(),
        dropped_idle,
        dropped_over_cap,
    };
    (recent.into_iter().collect(), report)
}

/// Run one eviction cycle against `store` using its current settings.
pub fn run_cycle(store: &EntryStore, now: Instant) -> EvictionReport {
    store.replace_with(|settings, entries| {
        select_survivors(entries, now, settings.idle_ttl, settings.max_entries)
    })
}

/// Spawn the eviction loop for one bucket.
///
/// The period is re-read from the store's settings before every sleep, so a
/// reconfiguration takes effect from the next cycle. The loop ends when
/// `shutdown` turns `true` or its sender is dropped.
pub fn spawn_eviction_task(
    bucket: String,
    store: Arc<EntryStore>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(bucket = %bucket, "eviction task started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let period = store.settings().eviction_interval;
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let report = run_cycle(&store, Instant::now());
            debug!(
                bucket = %bucket,
                retained = report.retained,
                dropped_idle = report.dropped_idle,
                dropped_over_cap = report.dropped_over_cap,
                "eviction cycle complete"
            );
        }

        info!(bucket = %bucket, "eviction task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketSettings;

    const TTL: Duration = Duration::from_secs(60);

    fn populate(store: &EntryStore, key: &str, last_used: Instant, wait: Duration) {
        store.transact(|txn| {
            let entry = txn.get_or_create(KeyDigest::of(key), key.to_string(), last_used);
            if !wait.is_zero() {
                // Ten samples of `wait` settle the average near it.
                for _ in 0..10 {
                    entry.record(last_used, last_used, 0.0, wait);
                }
            }
        });
    }

    fn labels(store: &EntryStore) -> Vec<String> {
        let mut labels: Vec<String> = store.snapshot().into_iter().map(|v| v.label).collect();
        labels.sort();
        labels
    }

    #[test]
    fn drops_idle_entries() {
        let store = EntryStore::new(BucketSettings::for_tests(1.0, 30.0, 100));
        let base = Instant::now();
        let now = base + Duration::from_secs(61);

        populate(&store, "stale", base, Duration::ZERO);
        populate(&store, "edge", base + Duration::from_secs(1), Duration::ZERO);
        populate(&store, "fresh", base + Duration::from_secs(30), Duration::ZERO);

        let report = run_cycle(&store, now);

        // Exactly 60s idle is already too old.
        assert_eq!(labels(&store), vec!["fresh"]);
        assert_eq!(
            report,
            EvictionReport {
                retained: 1,
                dropped_idle: 2,
                dropped_over_cap: 0,
            }
        );
    }

    #[test]
    fn caps_by_ascending_average_wait() {
        let store = EntryStore::new(BucketSettings::for_tests(1.0, 30.0, 2));
        let now = Instant::now();

        populate(&store, "slow", now, Duration::from_secs(9));
        populate(&store, "idle", now, Duration::ZERO);
        populate(&store, "busy", now, Duration::from_secs(3));

        let report = run_cycle(&store, now);

        assert_eq!(labels(&store), vec!["busy", "idle"]);
        assert_eq!(report.retained, 2);
        assert_eq!(report.dropped_over_cap, 1);
        assert!(store.len() <= 2);
    }

    #[test]
    fn ties_prefer_recent_entries() {
        let base = Instant::now();
        let store = EntryStore::new(BucketSettings::for_tests(1.0, 30.0, 1));

        populate(&store, "older", base, Duration::ZERO);
        populate(&store, "newer", base + Duration::from_secs(5), Duration::ZERO);

        run_cycle(&store, base + Duration::from_secs(10));
        assert_eq!(labels(&store), vec!["newer"]);
    }

    #[test]
    fn bound_holds_for_large_population() {
        let store = EntryStore::new(BucketSettings::for_tests(1.0, 30.0, 50));
        let base = Instant::now();
        for i in 0..500 {
            let age = Duration::from_millis(i * 200);
            populate(&store, &format!("k{}", i), base + age, Duration::from_millis(i % 7));
        }

        let now = base + Duration::from_secs(100);
        run_cycle(&store, now);

        let views = store.snapshot();
        assert!(views.len() <= 50);
        assert!(views
            .iter()
            .all(|v| now.saturating_duration_since(v.last_used) < TTL));
    }

    #[tokio::test]
    async fn task_stops_on_shutdown() {
        let store = Arc::new(EntryStore::new(BucketSettings {
            eviction_interval: Duration::from_millis(10),
            ..BucketSettings::for_tests(1.0, 30.0, 10)
        }));
        let (tx, rx) = watch::channel(false);

        let handle = spawn_eviction_task("test".into(), Arc::clone(&store), rx);
        tokio::time::sleep(Duration::from_millis(30)).await;

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("eviction task did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn task_stops_when_sender_dropped() {
        let store = Arc::new(EntryStore::new(BucketSettings::for_tests(1.0, 30.0, 10)));
        let (tx, rx) = watch::channel(false);

        let handle = spawn_eviction_task("test".into(), store, rx);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("eviction task did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn task_prunes_idle_entries() {
        let store = Arc::new(EntryStore::new(BucketSettings {
            eviction_interval: Duration::from_millis(10),
            idle_ttl: Duration::from_millis(20),
            ..BucketSettings::for_tests(1.0, 30.0, 10)
        }));
        populate(&store, "a", Instant::now(), Duration::ZERO);

        let (tx, rx) = watch::channel(false);
        let handle = spawn_eviction_task("test".into(), Arc::clone(&store), rx);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
