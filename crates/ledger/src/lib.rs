//! Per-key admission ledger.
//!
//! A [`Ledger`] holds one [`Bucket`] per configured classification strategy.
//! Each bucket maps a request to a classification key (a client subnet or a
//! user-agent string), charges the request's cost against that key's token
//! bucket and reports how long the request must wait, or that it must be
//! refused.
//!
//! - **Classifier** -- turns peer address and headers into a stable key,
//!   honouring forwarded headers only from trusted proxies.
//! - **Token bucket** -- reserving limiter; a reservation is debited
//!   immediately and returns the delay the caller owes.
//! - **Entry store** -- one lock per bucket guarding the key map, the
//!   limiters and the bucket's settings, plus advisory moving averages per key.
//! - **Eviction** -- a periodic task per bucket that drops idle keys and caps
//!   the store size.
//!
//! Buckets are independent: no operation ever holds two buckets' locks.

pub mod bucket;
pub mod classifier;
pub mod digest;
pub mod eviction;
pub mod store;
pub mod token_bucket;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use cadence_common::{CadenceError, CadenceResult, LedgerConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use bucket::{Bucket, BucketSettings};
pub use classifier::{Classifier, ClientRequest, ProxyTrust, SENTINEL_KEY};
pub use digest::KeyDigest;
pub use eviction::EvictionReport;
pub use store::EntryView;
pub use token_bucket::{Reservation, DENIAL_PENALTY, TOKEN_SCALE};

/// One bucket's answer for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketDecision {
    pub bucket: String,
    pub reservation: Reservation,
}

/// Combined answer of every bucket for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Longest delay any bucket asked for, or the denial penalty.
    pub delay: Duration,
    /// `false` if any bucket refused the request.
    pub admitted: bool,
    pub decisions: Vec<BucketDecision>,
}

impl Verdict {
    fn from_decisions(decisions: Vec<BucketDecision>) -> Self {
        let admitted = decisions.iter().all(|d| d.reservation.admitted);
        let delay = if admitted {
            decisions
                .iter()
                .map(|d| d.reservation.delay)
                .max()
                .unwrap_or(Duration::ZERO)
        } else {
            DENIAL_PENALTY
        };
        Self {
            delay,
            admitted,
            decisions,
        }
    }
}

/// The set of configured buckets and their shared lifecycle.
///
/// Cheaply cloneable (backed by `Arc`) and safe to share across tasks and
/// threads.
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<LedgerInner>,
}

struct LedgerInner {
    buckets: Vec<Bucket>,
    config: ArcSwap<LedgerConfig>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Held for the whole of a reconfiguration so concurrent reloads apply
    /// one after the other.
    reconfigure: Mutex<()>,
}

impl Ledger {
    /// Validate `config` and build one bucket per entry, in order.
    pub fn new(config: &LedgerConfig) -> CadenceResult<Self> {
        config.validate()?;

        let buckets = config
            .buckets
            .iter()
            .map(|bucket| Bucket::from_config(config, bucket))
            .collect::<CadenceResult<Vec<_>>>()?;

        info!(buckets = buckets.len(), "ledger created");

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(LedgerInner {
                buckets,
                config: ArcSwap::from_pointee(config.clone()),
                shutdown,
                tasks: Mutex::new(Vec::new()),
                reconfigure: Mutex::new(()),
            }),
        })
    }

    /// Reserve `cost` units for `request` in every bucket.
    pub fn reserve(&self, request: &ClientRequest<'_>, start: Instant, cost: f64) -> Verdict {
        let decisions = self
            .inner
            .buckets
            .iter()
            .map(|bucket| BucketDecision {
                bucket: bucket.name().to_string(),
                reservation: bucket.reserve(request, start, cost),
            })
            .collect();
        Verdict::from_decisions(decisions)
    }

    /// Apply a new configuration to every bucket.
    ///
    /// The bucket layout (names, strategies, netmasks, order) is fixed for the
    /// life of the ledger. A config that changes it, or fails validation, is
    /// rejected and the running configuration stays in place.
    pub fn reconfigure(&self, config: &LedgerConfig) -> CadenceResult<()> {
        let _serial = self
            .inner
            .reconfigure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Err(e) = self.check_reconfigure(config) {
            warn!(error = %e, "rejected ledger reconfiguration");
            return Err(e);
        }

        let settings = config
            .buckets
            .iter()
            .map(|bucket| BucketSettings::from_config(config, bucket))
            .collect::<CadenceResult<Vec<_>>>()?;

        for (bucket, settings) in self.inner.buckets.iter().zip(settings) {
            bucket.reconfigure(settings);
        }
        self.inner.config.store(Arc::new(config.clone()));

        info!("ledger reconfigured");
        Ok(())
    }

    fn check_reconfigure(&self, config: &LedgerConfig) -> CadenceResult<()> {
        config.validate()?;

        let same_layout = config.buckets.len() == self.inner.buckets.len()
            && self
                .inner
                .buckets
                .iter()
                .zip(&config.buckets)
                .all(|(bucket, next)| {
                    bucket.name() == next.name && bucket.classifier() == Classifier::from_config(next)
                });
        if !same_layout {
            return Err(CadenceError::Config(
                "bucket layout cannot change while running".to_string(),
            ));
        }
        Ok(())
    }

    /// The configuration currently in force.
    pub fn config(&self) -> Arc<LedgerConfig> {
        self.inner.config.load_full()
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.inner.buckets
    }

    pub fn bucket(&self, name: &str) -> Option<&Bucket> {
        self.inner.buckets.iter().find(|b| b.name() == name)
    }

    /// Like [`bucket`](Self::bucket), as an error for unknown names.
    pub fn require_bucket(&self, name: &str) -> CadenceResult<&Bucket> {
        self.bucket(name)
            .ok_or_else(|| CadenceError::UnknownBucket(name.to_string()))
    }

    /// Spawn the eviction task of every bucket. Must be called from within a
    /// Tokio runtime; calling it again after [`shutdown`](Self::shutdown) has
    /// no effect.
    pub fn start_eviction(&self) {
        if *self.inner.shutdown.borrow() {
            return;
        }
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }
        for bucket in &self.inner.buckets {
            tasks.push(bucket.spawn_eviction(self.inner.shutdown.subscribe()));
        }
        info!(tasks = tasks.len(), "eviction tasks started");
    }

    /// Stop every eviction task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "eviction task ended abnormally");
            }
        }
        info!("ledger shut down");
    }
}
