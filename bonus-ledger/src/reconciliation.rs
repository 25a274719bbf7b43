//! Reconciliation loop
//!
//! Polls the accrual authority for every non-terminal order, applies the
//! verdicts and credits rewards. Each iteration starts with a recovery sweep
//! that credits PROCESSED orders whose credit never landed (crash between the
//! status write and the balance write, or a failed credit on an earlier tick).
//!
//! A failure for one order is logged and counted, and the iteration moves on
//! to the next order. A rate-limit answer ends the iteration early and the
//! loop waits out the requested back-off.

use crate::{
    accrual::AccrualAuthority,
    balance::BalanceLedger,
    config::ReconciliationConfig,
    metrics::Metrics,
    orders::OrderLedger,
    types::Order,
    Error, Result,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// What one iteration did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// Orders the authority was asked about
    pub polled: usize,
    /// Orders whose status changed
    pub updated: usize,
    /// Accruals credited right after a PROCESSED verdict
    pub credited: usize,
    /// Accruals credited by the recovery sweep
    pub swept: usize,
    /// Per-order failures (and failed listings)
    pub failures: usize,
    /// Back-off requested by the authority, if it rate-limited us
    pub rate_limited: Option<Duration>,
    /// Shutdown was observed before the iteration finished
    pub cancelled: bool,
}

/// Background task reconciling local orders with the accrual authority
#[derive(Debug)]
pub struct ReconciliationLoop {
    orders: Arc<OrderLedger>,
    balances: Arc<BalanceLedger>,
    authority: Arc<dyn AccrualAuthority>,
    config: ReconciliationConfig,
    metrics: Option<Arc<Metrics>>,
}

impl ReconciliationLoop {
    /// Create a loop over the two ledgers
    pub fn new(
        orders: Arc<OrderLedger>,
        balances: Arc<BalanceLedger>,
        authority: Arc<dyn AccrualAuthority>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            orders,
            balances,
            authority,
            config,
            metrics: None,
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run iterations until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            interval_ms = self.config.interval_ms,
            request_timeout_ms = self.config.request_timeout_ms,
            "Reconciliation loop started"
        );

        while !shutdown.is_cancelled() {
            let report = self.run_once(&shutdown).await;
            let pause = report.rate_limited.unwrap_or_else(|| self.config.interval());

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!("Reconciliation loop stopped");
    }

    /// Run a single iteration: recovery sweep, then one pass over pending orders
    pub async fn run_once(&self, shutdown: &CancellationToken) -> IterationReport {
        let started = Instant::now();
        let mut report = IterationReport::default();

        self.sweep(shutdown, &mut report).await;

        if !report.cancelled {
            self.poll_pending(shutdown, &mut report).await;
        }

        let elapsed = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.record_iteration(elapsed.as_secs_f64(), report.failures);
            metrics.update_keyed_lock_entries(
                self.orders.lock_entries() + self.balances.lock_entries(),
            );
        }

        tracing::debug!(
            polled = report.polled,
            updated = report.updated,
            credited = report.credited,
            swept = report.swept,
            failures = report.failures,
            elapsed_ms = elapsed.as_millis() as u64,
            "Reconciliation iteration finished"
        );

        report
    }

    async fn sweep(&self, shutdown: &CancellationToken, report: &mut IterationReport) {
        let uncredited = match self
            .bounded("list_awaiting_credit", shutdown, self.orders.list_awaiting_credit())
            .await
        {
            Ok(orders) => orders,
            Err(Error::Cancelled) => {
                report.cancelled = true;
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to list uncredited orders");
                report.failures += 1;
                return;
            }
        };

        for order in uncredited {
            match self
                .bounded("credit_accrual", shutdown, self.balances.credit_accrual(&order))
                .await
            {
                Ok(true) => {
                    tracing::info!(
                        order_number = %order.number,
                        user_id = %order.user_id,
                        "Recovered missing accrual credit"
                    );
                    report.swept += 1;
                }
                Ok(false) => {}
                Err(Error::Cancelled) => {
                    report.cancelled = true;
                    return;
                }
                Err(e) => {
                    tracing::error!(
                        order_number = %order.number,
                        error = %e,
                        "Recovery credit failed"
                    );
                    report.failures += 1;
                }
            }
        }
    }

    async fn poll_pending(&self, shutdown: &CancellationToken, report: &mut IterationReport) {
        let pending = match self
            .bounded(
                "list_for_reconciliation",
                shutdown,
                self.orders.list_for_reconciliation(),
            )
            .await
        {
            Ok(orders) => orders,
            Err(Error::Cancelled) => {
                report.cancelled = true;
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to list orders for reconciliation");
                report.failures += 1;
                return;
            }
        };

        for order in pending {
            if shutdown.is_cancelled() {
                report.cancelled = true;
                return;
            }

            report.polled += 1;
            match self.reconcile_order(&order, shutdown, report).await {
                Ok(()) => {}
                Err(Error::RateLimited { retry_after }) => {
                    report.rate_limited = Some(retry_after);
                    return;
                }
                Err(Error::Cancelled) => {
                    report.cancelled = true;
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        order_number = %order.number,
                        error = %e,
                        error_type = e.error_type(),
                        "Order reconciliation failed, retrying next tick"
                    );
                    report.failures += 1;
                }
            }
        }
    }

    async fn reconcile_order(
        &self,
        order: &Order,
        shutdown: &CancellationToken,
        report: &mut IterationReport,
    ) -> Result<()> {
        let verdict = match self
            .bounded("get_verdict", shutdown, self.authority.get_verdict(&order.number))
            .await?
        {
            Some(verdict) => verdict,
            None => {
                tracing::debug!(order_number = %order.number, "Order not registered at the authority yet");
                return Ok(());
            }
        };

        if verdict.order != order.number {
            return Err(Error::AccrualDecode(format!(
                "verdict for {} returned for order {}",
                verdict.order, order.number
            )));
        }
        let accrual = verdict.accrual_amount()?;

        let applied = self
            .bounded(
                "apply_verdict",
                shutdown,
                self.orders.apply_verdict(
                    &order.number,
                    verdict.status.order_status(),
                    accrual,
                ),
            )
            .await?;

        let Some(applied) = applied else {
            return Ok(());
        };
        report.updated += 1;

        if applied.owes_credit()
            && self
                .bounded("credit_accrual", shutdown, self.balances.credit_accrual(order))
                .await?
        {
            report.credited += 1;
        }

        Ok(())
    }

    // Races `fut` against shutdown and bounds it by the request timeout.
    async fn bounded<T>(
        &self,
        operation: &str,
        shutdown: &CancellationToken,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let budget = self.config.request_timeout();

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(budget, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(Error::Timeout {
                    operation: operation.to_string(),
                    millis: budget.as_millis() as u64,
                }),
            },
        }
    }
}
