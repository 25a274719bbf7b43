//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `bonus_orders_submitted_total` - Orders admitted (new rows only)
//! - `bonus_withdrawals_total` - Successful withdrawals
//! - `bonus_accrual_credits_total` - Accruals added to balances
//! - `bonus_verdicts_applied_total` - Order status transitions
//! - `bonus_reconciliation_iterations_total` - Loop iterations
//! - `bonus_reconciliation_failures_total` - Per-order failures inside the loop
//! - `bonus_reconciliation_duration_seconds` - Iteration latency
//! - `bonus_keyed_lock_entries` - Keys registered across both registries

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::fmt;
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Orders admitted
    pub orders_submitted: IntCounter,

    /// Successful withdrawals
    pub withdrawals: IntCounter,

    /// Accruals credited
    pub accrual_credits: IntCounter,

    /// Verdicts that changed an order
    pub verdicts_applied: IntCounter,

    /// Reconciliation iterations
    pub reconciliation_iterations: IntCounter,

    /// Per-order reconciliation failures
    pub reconciliation_failures: IntCounter,

    /// Iteration latency
    pub reconciliation_duration: Histogram,

    /// Keyed lock registry size
    pub keyed_lock_entries: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let orders_submitted = IntCounter::with_opts(Opts::new(
            "bonus_orders_submitted_total",
            "Orders admitted",
        ))?;
        registry.register(Box::new(orders_submitted.clone()))?;

        let withdrawals =
            IntCounter::with_opts(Opts::new("bonus_withdrawals_total", "Successful withdrawals"))?;
        registry.register(Box::new(withdrawals.clone()))?;

        let accrual_credits = IntCounter::with_opts(Opts::new(
            "bonus_accrual_credits_total",
            "Accruals added to balances",
        ))?;
        registry.register(Box::new(accrual_credits.clone()))?;

        let verdicts_applied = IntCounter::with_opts(Opts::new(
            "bonus_verdicts_applied_total",
            "Order status transitions",
        ))?;
        registry.register(Box::new(verdicts_applied.clone()))?;

        let reconciliation_iterations = IntCounter::with_opts(Opts::new(
            "bonus_reconciliation_iterations_total",
            "Reconciliation loop iterations",
        ))?;
        registry.register(Box::new(reconciliation_iterations.clone()))?;

        let reconciliation_failures = IntCounter::with_opts(Opts::new(
            "bonus_reconciliation_failures_total",
            "Per-order failures inside the reconciliation loop",
        ))?;
        registry.register(Box::new(reconciliation_failures.clone()))?;

        let reconciliation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "bonus_reconciliation_duration_seconds",
                "Reconciliation iteration latency",
            )
            .buckets(vec![0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0, 10.0, 30.0]),
        )?;
        registry.register(Box::new(reconciliation_duration.clone()))?;

        let keyed_lock_entries = IntGauge::with_opts(Opts::new(
            "bonus_keyed_lock_entries",
            "Keys registered across keyed lock registries",
        ))?;
        registry.register(Box::new(keyed_lock_entries.clone()))?;

        Ok(Self {
            orders_submitted,
            withdrawals,
            accrual_credits,
            verdicts_applied,
            reconciliation_iterations,
            reconciliation_failures,
            reconciliation_duration,
            keyed_lock_entries,
            registry,
        })
    }

    /// Record one finished iteration
    pub fn record_iteration(&self, duration_seconds: f64, failures: usize) {
        self.reconciliation_iterations.inc();
        self.reconciliation_duration.observe(duration_seconds);
        self.reconciliation_failures.inc_by(failures as u64);
    }

    /// Update keyed lock registry size
    pub fn update_keyed_lock_entries(&self, entries: usize) {
        self.keyed_lock_entries.set(entries as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("orders_submitted", &self.orders_submitted.get())
            .field("withdrawals", &self.withdrawals.get())
            .field("accrual_credits", &self.accrual_credits.get())
            .field("reconciliation_iterations", &self.reconciliation_iterations.get())
            .finish_non_exhaustive()
    }
}
