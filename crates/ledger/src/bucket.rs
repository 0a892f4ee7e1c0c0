use std::sync::Arc;
use std::time::{Duration, Instant};

use cadence_common::{BucketConfig, BucketStrategy, CadenceResult, LedgerConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, trace};

use crate::classifier::{Classifier, ClientRequest, ProxyTrust};
use crate::digest::KeyDigest;
use crate::eviction::{self, EvictionReport};
use crate::store::{EntryStore, EntryView};
use crate::token_bucket::Reservation;

/// Everything a bucket reads on the request path and in its eviction cycle.
/// Swapped as a unit by [`Bucket::reconfigure`].
#[derive(Debug, Clone, PartialEq)]
pub struct BucketSettings {
    /// Cost units per second.
    pub rate: f64,
    /// Capacity in cost units.
    pub burst: f64,
    pub max_entries: usize,
    pub idle_ttl: Duration,
    pub eviction_interval: Duration,
    pub trust: ProxyTrust,
}

impl BucketSettings {
    pub fn from_config(ledger: &LedgerConfig, bucket: &BucketConfig) -> CadenceResult<Self> {
        Ok(Self {
            rate: bucket.rate,
            burst: ledger.burst_for(bucket),
            max_entries: ledger.max_entries_for(bucket),
            idle_ttl: Duration::from_secs(ledger.idle_ttl_secs),
            eviction_interval: Duration::from_secs(ledger.eviction_interval_secs),
            trust: ProxyTrust::new(ledger.trusted_networks()?, ledger.forwarded_headers.clone()),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(rate: f64, burst: f64, max_entries: usize) -> Self {
        Self {
            rate,
            burst,
            max_entries,
            idle_ttl: Duration::from_secs(60),
            eviction_interval: Duration::from_secs(60),
            trust: ProxyTrust::default(),
        }
    }
}

impl Classifier {
    pub fn from_config(bucket: &BucketConfig) -> Self {
        match bucket.strategy {
            BucketStrategy::Subnet => Classifier::Subnet {
                netmask: bucket.netmask.unwrap_or(32),
            },
            BucketStrategy::UserAgent => Classifier::UserAgent,
        }
    }
}

/// One classification strategy bound to its own entry store.
///
/// Buckets share nothing with each other; every lock a bucket takes is its
/// own store's.
pub struct Bucket {
    name: String,
    classifier: Classifier,
    store: Arc<EntryStore>,
}

impl Bucket {
    pub fn new(name: impl Into<String>, classifier: Classifier, settings: BucketSettings) -> Self {
        let name = name.into();
        info!(
            bucket = %name,
            strategy = %classifier.describe(),
            rate = settings.rate,
            burst = settings.burst,
            max_entries = settings.max_entries,
            "creating bucket"
        );
        Self {
            name,
            classifier,
            store: Arc::new(EntryStore::new(settings)),
        }
    }

    /// Build a bucket from its entry in a validated [`LedgerConfig`].
    pub fn from_config(ledger: &LedgerConfig, bucket: &BucketConfig) -> CadenceResult<Self> {
        Ok(Self::new(
            bucket.name.clone(),
            Classifier::from_config(bucket),
            BucketSettings::from_config(ledger, bucket)?,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn classifier(&self) -> Classifier {
        self.classifier
    }

    /// Reserve `cost` units for `request`, taken at `start`.
    pub fn reserve(&self, request: &ClientRequest<'_>, start: Instant, cost: f64) -> Reservation {
        self.reserve_at(request, start, Instant::now(), cost)
    }

    /// As [`reserve`](Self::reserve), with the bookkeeping clock supplied.
    ///
    /// Classification, the limiter update and the statistics update all
    /// happen inside one critical section, against one generation of settings.
    pub fn reserve_at(
        &self,
        request: &ClientRequest<'_>,
        start: Instant,
        now: Instant,
        cost: f64,
    ) -> Reservation {
        self.store.transact(|txn| {
            let label = self.classifier.classify(request, &txn.settings().trust);
            let id = KeyDigest::of(&label);
            let entry = txn.get_or_create(id, label, now);
            let reservation = entry.limiter_mut().reserve(start, cost);
            entry.record(start, now, cost, reservation.delay);

            trace!(
                bucket = %self.name,
                key = entry.label(),
                cost,
                delay_ms = u64::try_from(reservation.delay.as_millis()).unwrap_or(u64::MAX),
                admitted = reservation.admitted,
                "reservation"
            );
            reservation
        })
    }

    /// Copies of every live entry, in no particular order.
    pub fn snapshot(&self) -> Vec<EntryView> {
        self.store.snapshot()
    }

    pub fn settings(&self) -> BucketSettings {
        self.store.settings()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Install new settings.
    ///
    /// Existing entries are dropped in the same critical section, so every
    /// later reservation runs against a limiter built from `settings`.
    pub fn reconfigure(&self, settings: BucketSettings) {
        let rate = settings.rate;
        let burst = settings.burst;
        let max_entries = settings.max_entries;
        let dropped = self.store.reset(settings);
        info!(
            bucket = %self.name,
            rate,
            burst,
            max_entries,
            dropped,
            "bucket reconfigured"
        );
    }

    /// Drop the entry with the given id. Returns whether it existed.
    pub fn forget(&self, id: &str) -> bool {
        self.store.remove_all(|digest, _| digest.as_str() == id) > 0
    }

    /// Run one eviction cycle as of `now`.
    pub fn evict_at(&self, now: Instant) -> EvictionReport {
        eviction::run_cycle(&self.store, now)
    }

    /// Start this bucket's periodic eviction task. Must be called from within a
    /// Tokio runtime.
    pub fn spawn_eviction(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        eviction::spawn_eviction_task(self.name.clone(), Arc::clone(&self.store), shutdown)
    }
}
