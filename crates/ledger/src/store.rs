use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::bucket::BucketSettings;
use crate::digest::KeyDigest;
use crate::token_bucket::TokenBucket;

/// Weight of the newest sample in every moving average.
const EMA_WEIGHT: f64 = 0.1;

/// Inter-arrival samples at or beyond this gap are not averaged.
const MAX_ARRIVAL_GAP: Duration = Duration::from_secs(60);

/// Cost-rate samples at or above this many units per second are not averaged.
const MAX_COST_RATE: f64 = 100.0;

/// Ledger state for one classification key.
#[derive(Debug, Clone)]
pub struct Entry {
    label: String,
    limiter: TokenBucket,
    last_used: Instant,
    avg_wait: Duration,
    avg_since_prev: Duration,
    avg_cpu_secs: f64,
}

impl Entry {
    fn new(label: String, limiter: TokenBucket, now: Instant) -> Self {
        Self {
            label,
            limiter,
            last_used: now,
            avg_wait: Duration::ZERO,
            avg_since_prev: Duration::ZERO,
            avg_cpu_secs: 0.0,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limiter_mut(&mut self) -> &mut TokenBucket {
        &mut self.limiter
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn avg_wait(&self) -> Duration {
        self.avg_wait
    }

    pub fn avg_since_prev(&self) -> Duration {
        self.avg_since_prev
    }

    pub fn avg_cpu_secs(&self) -> f64 {
        self.avg_cpu_secs
    }

    /// Fold one reservation into the moving averages.
    ///
    /// `start` is when the reservation was taken, `now` when it is recorded;
    /// only the part of `delay` still ahead of `now` counts as waiting. The
    /// averages are advisory and never feed back into admission.
    pub fn record(&mut self, start: Instant, now: Instant, cost: f64, delay: Duration) {
        let delay_remaining = delay.saturating_sub(now.saturating_duration_since(start));

        let since_prev = now.saturating_duration_since(self.last_used);
        if since_prev > Duration::ZERO && since_prev < MAX_ARRIVAL_GAP {
            self.avg_since_prev = ema_duration(self.avg_since_prev, since_prev);
        }
        self.last_used = now;

        self.avg_wait = ema_duration(self.avg_wait, delay_remaining);

        // Undefined until the first inter-arrival sample lands.
        let cost_rate = cost.max(0.0) / self.avg_since_prev.as_secs_f64();
        if cost_rate.is_finite() && cost_rate < MAX_COST_RATE {
            self.avg_cpu_secs = ema(self.avg_cpu_secs, cost_rate);
        }
    }

    pub fn view(&self, id: &KeyDigest) -> EntryView {
        EntryView {
            id: id.clone(),
            label: self.label.clone(),
            last_used: self.last_used,
            avg_wait: self.avg_wait,
            avg_since_prev: self.avg_since_prev,
            avg_cpu_secs: self.avg_cpu_secs,
        }
    }
}

/// Point-in-time copy of an [`Entry`] for display and scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryView {
    pub id: KeyDigest,
    pub label: String,
    pub last_used: Instant,
    pub avg_wait: Duration,
    pub avg_since_prev: Duration,
    pub avg_cpu_secs: f64,
}

/// `avg * (1 - w) + sample * w`
pub fn ema(avg: f64, sample: f64) -> f64 {
    avg * (1.0 - EMA_WEIGHT) + sample * EMA_WEIGHT
}

fn ema_duration(avg: Duration, sample: Duration) -> Duration {
    avg.mul_f64(1.0 - EMA_WEIGHT) + sample.mul_f64(EMA_WEIGHT)
}

struct StoreState {
    settings: BucketSettings,
    entries: HashMap<KeyDigest, Entry>,
}

/// Concurrency-safe map from key digest to [`Entry`], together with the
/// settings the entries were built from.
///
/// One reader-writer lock guards both, so a reservation never sees settings
/// and entries from different generations. The lock never leaves this type.
pub struct EntryStore {
    state: RwLock<StoreState>,
}

/// Exclusive access to a store for the duration of one [`EntryStore::transact`].
pub struct StoreTxn<'a> {
    state: &'a mut StoreState,
}

impl StoreTxn<'_> {
    pub fn settings(&self) -> &BucketSettings {
        &self.state.settings
    }

    /// Existing entry for `id`, or a new one with a full limiter built from the
    /// current settings.
    pub fn get_or_create(&mut self, id: KeyDigest, label: String, now: Instant) -> &mut Entry {
        let StoreState { settings, entries } = &mut *self.state;
        entries.entry(id).or_insert_with(|| {
            Entry::new(label, TokenBucket::new(settings.rate, settings.burst), now)
        })
    }
}

impl EntryStore {
    pub fn new(settings: BucketSettings) -> Self {
        Self {
            state: RwLock::new(StoreState {
                settings,
                entries: HashMap::new(),
            }),
        }
    }

    /// Run `f` with exclusive access to settings and entries.
    pub fn transact<R>(&self, f: impl FnOnce(&mut StoreTxn<'_>) -> R) -> R {
        let mut guard = self.write();
        let mut txn = StoreTxn { state: &mut *guard };
        f(&mut txn)
    }

    /// Copies of every entry.
    pub fn snapshot(&self) -> Vec<EntryView> {
        self.read()
            .entries
            .iter()
            .map(|(id, entry)| entry.view(id))
            .collect()
    }

    /// Remove every entry matching `predicate`. Returns how many were removed.
    pub fn remove_all(&self, mut predicate: impl FnMut(&KeyDigest, &Entry) -> bool) -> usize {
        let mut guard = self.write();
        let before = guard.entries.len();
        guard.entries.retain(|id, entry| !predicate(id, entry));
        before - guard.entries.len()
    }

    /// Replace the whole entry map with whatever `f` builds from it.
    pub fn replace_with<R>(
        &self,
        f: impl FnOnce(&BucketSettings, HashMap<KeyDigest, Entry>) -> (HashMap<KeyDigest, Entry>, R),
    ) -> R {
        let mut guard = self.write();
        let entries = std::mem::take(&mut guard.entries);
        let (kept, result) = f(&guard.settings, entries);
        guard.entries = kept;
        result
    }

    /// Install new settings and drop every entry, in one critical section.
    /// Returns the number of entries dropped.
    pub fn reset(&self, settings: BucketSettings) -> usize {
        let mut guard = self.write();
        let dropped = guard.entries.len();
        guard.settings = settings;
        guard.entries.clear();
        dropped
    }

    pub fn settings(&self) -> BucketSettings {
        self.read().settings.clone()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Poisoning is ignored: every critical section leaves the map consistent.
    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
