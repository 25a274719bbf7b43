//! Order admission and status transitions
//!
//! Every write to an order happens under that order number's key, so
//! admission and verdict application never interleave for the same order.

use crate::{
    keyed_lock::KeyedLock,
    luhn,
    metrics::Metrics,
    storage::Storage,
    types::{to_money, Order, OrderStatus, MAX_MONEY},
    Error, Result,
};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Successful admission outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// New order stored with status NEW
    Accepted,
    /// The same user already uploaded this number; nothing stored
    AlreadySubmittedBySameUser,
}

/// Result of a verdict that changed an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedVerdict {
    /// Order number
    pub number: String,
    /// Owner of the order
    pub owner: String,
    /// Status before the write
    pub previous: OrderStatus,
    /// Status after the write
    pub current: OrderStatus,
    /// Accrual written with the transition (PROCESSED only)
    pub accrual: Option<Decimal>,
}

impl AppliedVerdict {
    /// The transition entered PROCESSED, so a balance credit is owed
    pub fn owes_credit(&self) -> bool {
        self.previous != OrderStatus::Processed && self.current == OrderStatus::Processed
    }
}

/// Admission logic and order status bookkeeping
#[derive(Debug)]
pub struct OrderLedger {
    storage: Arc<dyn Storage>,
    locks: KeyedLock,
    metrics: Option<Arc<Metrics>>,
}

impl OrderLedger {
    /// Create a ledger over `storage`
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            locks: KeyedLock::new("orders"),
            metrics: None,
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Keys registered in the order-number registry
    pub fn lock_entries(&self) -> usize {
        self.locks.len()
    }

    /// Admit an order for `user_id`
    ///
    /// Rejects malformed numbers before taking any lock. A number already
    /// uploaded by the same user is a notice, not an error; a number owned by
    /// someone else is `OrderOwnedByAnotherUser`.
    pub async fn submit(&self, order_number: &str, user_id: &str) -> Result<SubmitOutcome> {
        luhn::validate(order_number)?;

        let _guard = self.locks.acquire(order_number).await;

        match self.storage.find_order(order_number).await? {
            None => {
                let order = Order::new(order_number, user_id);
                self.storage.insert_order(&order).await?;

                if let Some(metrics) = &self.metrics {
                    metrics.orders_submitted.inc();
                }

                tracing::info!(order_number, user_id, "Order accepted");
                Ok(SubmitOutcome::Accepted)
            }
            Some(existing) if existing.user_id == user_id => {
                tracing::debug!(order_number, user_id, "Order already uploaded by this user");
                Ok(SubmitOutcome::AlreadySubmittedBySameUser)
            }
            Some(existing) => {
                tracing::warn!(
                    order_number,
                    user_id,
                    owner = %existing.user_id,
                    "Order already uploaded by another user"
                );
                Err(Error::OrderOwnedByAnotherUser {
                    number: order_number.to_string(),
                })
            }
        }
    }

    /// Orders awaiting a terminal verdict (NEW or PROCESSING)
    pub async fn list_for_reconciliation(&self) -> Result<Vec<Order>> {
        self.storage.list_non_terminal_orders().await
    }

    /// PROCESSED orders whose accrual has not reached the balance yet
    pub async fn list_awaiting_credit(&self) -> Result<Vec<Order>> {
        self.storage.list_uncredited_orders().await
    }

    /// A user's orders, oldest first; `NoRecords` when there are none
    pub async fn list_orders(&self, user_id: &str) -> Result<Vec<Order>> {
        let orders = self.storage.list_orders_by_user(user_id).await?;
        if orders.is_empty() {
            return Err(Error::NoRecords);
        }
        Ok(orders)
    }

    /// Current stored state of one order
    pub async fn find(&self, order_number: &str) -> Result<Option<Order>> {
        self.storage.find_order(order_number).await
    }

    /// Apply an accrual authority verdict
    ///
    /// Returns `None` when nothing changed: the stored status already equals
    /// `new_status`, or the verdict would move the order backwards or out of a
    /// terminal state. The accrual is written only on the transition into
    /// PROCESSED and must lie in `[0, MAX_MONEY]`.
    pub async fn apply_verdict(
        &self,
        order_number: &str,
        new_status: OrderStatus,
        accrual: Decimal,
    ) -> Result<Option<AppliedVerdict>> {
        let accrual = to_money(accrual);
        if new_status == OrderStatus::Processed && (accrual < Decimal::ZERO || accrual > MAX_MONEY)
        {
            return Err(Error::InvalidAmount(accrual));
        }

        let _guard = self.locks.acquire(order_number).await;

        let order = self
            .storage
            .find_order(order_number)
            .await?
            .ok_or_else(|| Error::OrderNotFound(order_number.to_string()))?;

        if order.status == new_status {
            return Ok(None);
        }

        if !order.status.can_advance_to(new_status) {
            tracing::warn!(
                order_number,
                stored = %order.status,
                verdict = %new_status,
                "Ignoring verdict that would regress order status"
            );
            return Ok(None);
        }

        let accrual = (new_status == OrderStatus::Processed).then_some(accrual);
        self.storage
            .update_order_status(order_number, new_status, accrual)
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.verdicts_applied.inc();
        }

        tracing::info!(
            order_number,
            user_id = %order.user_id,
            from = %order.status,
            to = %new_status,
            accrual = ?accrual,
            "Order status updated"
        );

        Ok(Some(AppliedVerdict {
            number: order.number,
            owner: order.user_id,
            previous: order.status,
            current: new_status,
            accrual,
        }))
    }
}
