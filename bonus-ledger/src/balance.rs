//! Per-user balances
//!
//! Every read-modify-write of an account runs under the user's key. Reads
//! for display (`get_balance`, `list_withdrawals`) take no lock.

use crate::{
    keyed_lock::KeyedLock,
    luhn,
    metrics::Metrics,
    storage::Storage,
    types::{money_add, money_sub, to_money, Account, Balance, Order, WithdrawalRecord},
    Error, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Balance bookkeeping for all users
#[derive(Debug)]
pub struct BalanceLedger {
    storage: Arc<dyn Storage>,
    locks: KeyedLock,
    metrics: Option<Arc<Metrics>>,
}

impl BalanceLedger {
    /// Create a ledger over `storage`
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            locks: KeyedLock::new("users"),
            metrics: None,
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Keys registered in the user registry
    pub fn lock_entries(&self) -> usize {
        self.locks.len()
    }

    async fn load_account(&self, user_id: &str) -> Result<Account> {
        Ok(self
            .storage
            .get_account(user_id)
            .await?
            .unwrap_or_else(|| Account::empty(user_id)))
    }

    /// Current balance; zeros for a user with no account row yet
    pub async fn get_balance(&self, user_id: &str) -> Result<Balance> {
        Ok(self.load_account(user_id).await?.balance())
    }

    /// Spend `amount` from the user's balance against `order_reference`
    ///
    /// The amount is truncated to two decimals first and must stay positive.
    /// The funds check and the write happen under the user's key, so two
    /// withdrawals never both pass against the same balance.
    pub async fn withdraw(
        &self,
        user_id: &str,
        order_reference: &str,
        amount: Decimal,
    ) -> Result<WithdrawalRecord> {
        luhn::validate(order_reference)?;

        let amount = to_money(amount);
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(amount));
        }

        let _guard = self.locks.acquire(user_id).await;

        let mut account = self.load_account(user_id).await?;
        if account.current < amount {
            tracing::info!(
                user_id,
                requested = %amount,
                available = %account.current,
                "Withdrawal rejected: insufficient funds"
            );
            return Err(Error::InsufficientFunds {
                requested: amount,
                available: account.current,
            });
        }

        account.current = money_sub(account.current, amount)
            .ok_or_else(|| overflow(&account, amount))?;
        account.withdrawn = money_add(account.withdrawn, amount)
            .ok_or_else(|| overflow(&account, amount))?;

        let record = WithdrawalRecord {
            user_id: user_id.to_string(),
            order_reference: order_reference.to_string(),
            amount,
            processed_at: Utc::now(),
        };
        self.storage.insert_withdrawal(&account, &record).await?;

        if let Some(metrics) = &self.metrics {
            metrics.withdrawals.inc();
        }

        tracing::info!(
            user_id,
            order_reference,
            amount = %amount,
            current = %account.current,
            "Withdrawal committed"
        );

        Ok(record)
    }

    /// Add `amount` to the user's balance
    ///
    /// A zero amount leaves the account untouched.
    pub async fn credit(&self, user_id: &str, amount: Decimal) -> Result<Balance> {
        let amount = to_money(amount);
        if amount < Decimal::ZERO {
            return Err(Error::InvalidAmount(amount));
        }

        let _guard = self.locks.acquire(user_id).await;

        let mut account = self.load_account(user_id).await?;
        if amount.is_zero() {
            return Ok(account.balance());
        }

        account.current =
            money_add(account.current, amount).ok_or_else(|| overflow(&account, amount))?;
        self.storage.upsert_account(&account).await?;

        tracing::debug!(user_id, amount = %amount, current = %account.current, "Balance credited");

        Ok(account.balance())
    }

    /// Credit a PROCESSED order's accrual to its owner exactly once
    ///
    /// The order is re-read under the owner's key; returns `false` when it is
    /// not PROCESSED or was already credited. The balance write and the
    /// credited mark are a single storage call.
    pub async fn credit_accrual(&self, order: &Order) -> Result<bool> {
        let _guard = self.locks.acquire(&order.user_id).await;

        let stored = self
            .storage
            .find_order(&order.number)
            .await?
            .ok_or_else(|| Error::OrderNotFound(order.number.clone()))?;
        if !stored.awaits_credit() {
            return Ok(false);
        }

        let amount = stored.accrual.map(to_money).unwrap_or(Decimal::ZERO);
        if amount < Decimal::ZERO {
            return Err(Error::InvalidAmount(amount));
        }

        let mut account = self.load_account(&stored.user_id).await?;
        account.current =
            money_add(account.current, amount).ok_or_else(|| overflow(&account, amount))?;
        self.storage
            .apply_accrual_credit(&account, &stored.number)
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.accrual_credits.inc();
        }

        tracing::info!(
            order_number = %stored.number,
            user_id = %stored.user_id,
            accrual = %amount,
            current = %account.current,
            "Accrual credited"
        );

        Ok(true)
    }

    /// A user's withdrawals, oldest first; `NoRecords` when there are none
    pub async fn list_withdrawals(&self, user_id: &str) -> Result<Vec<WithdrawalRecord>> {
        let records = self.storage.list_withdrawals(user_id).await?;
        if records.is_empty() {
            return Err(Error::NoRecords);
        }
        Ok(records)
    }
}

fn overflow(account: &Account, amount: Decimal) -> Error {
    Error::BalanceOverflow {
        user_id: account.user_id.clone(),
        current: account.current,
        amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::{OrderStatus, MAX_MONEY};
    use rust_decimal_macros::dec;

    fn ledger() -> (Arc<BalanceLedger>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (Arc::new(BalanceLedger::new(storage.clone())), storage)
    }

    #[tokio::test]
    async fn test_fresh_user_has_zero_balance() {
        let (ledger, _) = ledger();
        let balance = ledger.get_balance("user-1").await.unwrap();
        assert_eq!(balance, Balance::default());
    }

    #[tokio::test]
    async fn test_withdraw_moves_funds() {
        let (ledger, _) = ledger();
        ledger.credit("user-1", dec!(729.98)).await.unwrap();

        let record = ledger
            .withdraw("user-1", "2377225624", dec!(500.001))
            .await
            .unwrap();
        assert_eq!(record.amount, dec!(500));

        let balance = ledger.get_balance("user-1").await.unwrap();
        assert_eq!(balance.current, dec!(229.98));
        assert_eq!(balance.withdrawn, dec!(500));

        let records = ledger.list_withdrawals("user-1").await.unwrap();
        assert_eq!(records, vec![record]);
    }

    #[tokio::test]
    async fn test_withdraw_rejections() {
        let (ledger, _) = ledger();
        ledger.credit("user-1", dec!(10)).await.unwrap();

        assert!(matches!(
            ledger.withdraw("user-1", "2377225625", dec!(1)).await,
            Err(Error::InvalidOrderNumber(_))
        ));
        assert!(matches!(
            ledger.withdraw("user-1", "2377225624", dec!(0.001)).await,
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.withdraw("user-1", "2377225624", dec!(-5)).await,
            Err(Error::InvalidAmount(_))
        ));

        match ledger.withdraw("user-1", "2377225624", dec!(10.01)).await {
            Err(Error::InsufficientFunds {
                requested,
                available,
            }) => {
                assert_eq!(requested, dec!(10.01));
                assert_eq!(available, dec!(10));
            }
            other => panic!("expected insufficient funds, got {:?}", other),
        }

        let balance = ledger.get_balance("user-1").await.unwrap();
        assert_eq!(balance.current, dec!(10));
        assert_eq!(balance.withdrawn, Decimal::ZERO);
        assert!(matches!(
            ledger.list_withdrawals("user-1").await,
            Err(Error::NoRecords)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_withdrawals_never_overdraw() {
        let (ledger, _) = ledger();
        ledger.credit("user-1", dec!(100)).await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.withdraw("user-1", "2377225624", dec!(15)).await })
            })
            .collect();

        let mut succeeded = 0;
        let mut insufficient = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(Error::InsufficientFunds { .. }) => insufficient += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(succeeded, 6);
        assert_eq!(insufficient, 4);

        let balance = ledger.get_balance("user-1").await.unwrap();
        assert_eq!(balance.current, dec!(10));
        assert_eq!(balance.withdrawn, dec!(90));
        assert_eq!(ledger.list_withdrawals("user-1").await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_credit_accrual_exactly_once() {
        let (ledger, storage) = ledger();
        let order = Order::new("79927398713", "user-1");
        storage.insert_order(&order).await.unwrap();

        // Not processed yet
        assert!(!ledger.credit_accrual(&order).await.unwrap());

        storage
            .update_order_status("79927398713", OrderStatus::Processed, Some(dec!(500)))
            .await
            .unwrap();

        assert!(ledger.credit_accrual(&order).await.unwrap());
        assert!(!ledger.credit_accrual(&order).await.unwrap());

        let balance = ledger.get_balance("user-1").await.unwrap();
        assert_eq!(balance.current, dec!(500));
        assert!(storage.list_uncredited_orders().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_credit_accrual_credits_once() {
        let (ledger, storage) = ledger();
        let mut order = Order::new("79927398713", "user-1");
        storage.insert_order(&order).await.unwrap();
        storage
            .update_order_status("79927398713", OrderStatus::Processed, Some(dec!(42.5)))
            .await
            .unwrap();
        order.status = OrderStatus::Processed;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                let order = order.clone();
                tokio::spawn(async move { ledger.credit_accrual(&order).await })
            })
            .collect();

        let mut credited = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                credited += 1;
            }
        }

        assert_eq!(credited, 1);
        assert_eq!(ledger.get_balance("user-1").await.unwrap().current, dec!(42.5));
    }

    #[tokio::test]
    async fn test_storage_outage_leaves_balance_untouched() {
        let (ledger, storage) = ledger();
        ledger.credit("user-1", dec!(50)).await.unwrap();

        storage.set_unavailable(true);
        let err = ledger
            .withdraw("user-1", "2377225624", dec!(20))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        storage.set_unavailable(false);

        let balance = ledger.get_balance("user-1").await.unwrap();
        assert_eq!(balance.current, dec!(50));
        assert_eq!(balance.withdrawn, Decimal::ZERO);

        // Key was released by the failed call
        ledger.withdraw("user-1", "2377225624", dec!(20)).await.unwrap();
    }

    #[tokio::test]
    async fn test_credit_rejects_negative() {
        let (ledger, _) = ledger();
        assert!(matches!(
            ledger.credit("user-1", dec!(-1)).await,
            Err(Error::InvalidAmount(_))
        ));
        assert_eq!(
            ledger.credit("user-1", Decimal::ZERO).await.unwrap(),
            Balance::default()
        );
    }

    #[tokio::test]
    async fn test_credit_accrual_rejects_negative_accrual() {
        let (ledger, storage) = ledger();
        let order = Order::new("79927398713", "user-1");
        storage.insert_order(&order).await.unwrap();
        storage
            .update_order_status("79927398713", OrderStatus::Processed, Some(dec!(-50)))
            .await
            .unwrap();

        assert!(matches!(
            ledger.credit_accrual(&order).await,
            Err(Error::InvalidAmount(_))
        ));

        assert_eq!(ledger.get_balance("user-1").await.unwrap(), Balance::default());
        // Still awaiting credit, nothing was marked
        assert_eq!(storage.list_uncredited_orders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_credit_accrual_overflow_is_an_error() {
        let (ledger, storage) = ledger();
        ledger.credit("user-1", MAX_MONEY).await.unwrap();

        let order = Order::new("79927398713", "user-1");
        storage.insert_order(&order).await.unwrap();
        storage
            .update_order_status("79927398713", OrderStatus::Processed, Some(dec!(0.01)))
            .await
            .unwrap();

        assert!(matches!(
            ledger.credit_accrual(&order).await,
            Err(Error::BalanceOverflow { .. })
        ));
        assert!(matches!(
            ledger.credit("user-1", Decimal::MAX).await,
            Err(Error::BalanceOverflow { .. })
        ));

        let balance = ledger.get_balance("user-1").await.unwrap();
        assert_eq!(balance.current, MAX_MONEY);
        assert_eq!(storage.list_uncredited_orders().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_accrual_credits_and_withdrawals_never_interleave() {
        let (ledger, storage) = ledger();
        let numbers = ["79927398713", "12345678903", "9278923470", "2377225624", "0"];

        let mut orders = Vec::new();
        for number in numbers {
            let mut order = Order::new(number, "user-1");
            storage.insert_order(&order).await.unwrap();
            storage
                .update_order_status(number, OrderStatus::Processed, Some(dec!(20)))
                .await
                .unwrap();
            order.status = OrderStatus::Processed;
            orders.push(order);
        }

        let credits: Vec<_> = orders
            .into_iter()
            .map(|order| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.credit_accrual(&order).await })
            })
            .collect();
        let withdrawals: Vec<_> = (0..10)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.withdraw("user-1", "2377225624", dec!(15)).await })
            })
            .collect();

        for handle in credits {
            assert!(handle.await.unwrap().unwrap());
        }

        let mut withdrawn = Decimal::ZERO;
        for handle in withdrawals {
            match handle.await.unwrap() {
                Ok(record) => withdrawn += record.amount,
                Err(Error::InsufficientFunds { .. }) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        let balance = ledger.get_balance("user-1").await.unwrap();
        assert!(balance.current >= Decimal::ZERO);
        assert_eq!(balance.withdrawn, withdrawn);
        assert_eq!(balance.current + balance.withdrawn, dec!(100));
        assert!(storage.list_uncredited_orders().await.unwrap().is_empty());
    }
}
