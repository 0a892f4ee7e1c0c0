use std::sync::Arc;

use cadence_common::{CadenceResult, LedgerConfig};
use cadence_ledger::{Ledger, Verdict};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

/// Shared state type alias used across all route handlers.
pub type SharedState = Arc<AppState>;

/// Central application state: the ledger and the metrics describing it.
pub struct AppState {
    pub ledger: Ledger,
    pub metrics: LedgerMetrics,
    pub start_time: std::time::Instant,
}

/// Prometheus metrics for reservations and the entry stores.
pub struct LedgerMetrics {
    pub registry: Registry,
    pub reservations_total: IntCounterVec,
    pub reservations_denied: IntCounterVec,
    pub reservation_delay: Histogram,
    pub entries: IntGaugeVec,
    pub config_reloads: IntCounter,
}

impl LedgerMetrics {
    /// Create every collector and register it against a fresh registry.
    pub fn new() -> Self {
        let registry = Registry::new();

        let reservations_total = IntCounterVec::new(
            Opts::new("cadence_reservations_total", "Reservations handled, per bucket"),
            &["bucket"],
        )
        .expect("failed to create reservations_total counter");

        let reservations_denied = IntCounterVec::new(
            Opts::new(
                "cadence_reservations_denied_total",
                "Reservations refused with the penalty delay, per bucket",
            ),
            &["bucket"],
        )
        .expect("failed to create reservations_denied counter");

        let reservation_delay = Histogram::with_opts(
            HistogramOpts::new(
                "cadence_reservation_delay_seconds",
                "Delay handed to admitted requests",
            )
            .buckets(vec![0.001, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )
        .expect("failed to create reservation_delay histogram");

        let entries = IntGaugeVec::new(
            Opts::new("cadence_entries", "Live keys held by each bucket"),
            &["bucket"],
        )
        .expect("failed to create entries gauge");

        let config_reloads = IntCounter::with_opts(Opts::new(
            "cadence_config_reloads_total",
            "Configuration changes applied to the ledger",
        ))
        .expect("failed to create config_reloads counter");

        registry.register(Box::new(reservations_total.clone())).expect("failed to register reservations_total");
        registry.register(Box::new(reservations_denied.clone())).expect("failed to register reservations_denied");
        registry.register(Box::new(reservation_delay.clone())).expect("failed to register reservation_delay");
        registry.register(Box::new(entries.clone())).expect("failed to register entries");
        registry.register(Box::new(config_reloads.clone())).expect("failed to register config_reloads");

        Self {
            registry,
            reservations_total,
            reservations_denied,
            reservation_delay,
            entries,
            config_reloads,
        }
    }

    pub fn observe(&self, verdict: &Verdict) {
        for decision in &verdict.decisions {
            self.reservations_total
                .with_label_values(&[decision.bucket.as_str()])
                .inc();
            if !decision.reservation.admitted {
                self.reservations_denied
                    .with_label_values(&[decision.bucket.as_str()])
                    .inc();
            }
        }
        if verdict.admitted {
            self.reservation_delay.observe(verdict.delay.as_secs_f64());
        }
    }

    /// Bring the entry gauges up to date. Called before every scrape.
    pub fn refresh_entries(&self, ledger: &Ledger) {
        for bucket in ledger.buckets() {
            self.entries
                .with_label_values(&[bucket.name()])
                .set(bucket.len() as i64);
        }
    }
}

impl Default for LedgerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            metrics: LedgerMetrics::new(),
            start_time: std::time::Instant::now(),
        }
    }

    /// Apply `config` to the running ledger and count the reload.
    pub fn reload(&self, config: &LedgerConfig) -> CadenceResult<()> {
        self.ledger.reconfigure(config)?;
        self.metrics.config_reloads.inc();
        Ok(())
    }
}
