//! In-process storage backend

use super::Storage;
use crate::types::{Account, Order, OrderStatus, WithdrawalRecord};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct MemoryState {
    orders: HashMap<String, Order>,
    accounts: HashMap<String, Account>,
    withdrawals: Vec<WithdrawalRecord>,
}

/// Hash-map storage; used when no database is configured and in tests
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,

    /// Simulated outage: every call fails with `Error::Storage`
    unavailable: AtomicBool,
}

impl MemoryStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a simulated outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored orders
    pub fn order_count(&self) -> usize {
        self.state.read().orders.len()
    }

    // Each call yields once so concurrent callers interleave between storage
    // calls the way they would against a network database.
    async fn enter(&self) -> Result<()> {
        tokio::task::yield_now().await;
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Storage("storage unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        self.enter().await?;
        let mut state = self.state.write();
        if state.orders.contains_key(&order.number) {
            return Err(Error::Storage(format!(
                "duplicate order number {}",
                order.number
            )));
        }
        state.orders.insert(order.number.clone(), order.clone());
        Ok(())
    }

    async fn find_order(&self, number: &str) -> Result<Option<Order>> {
        self.enter().await?;
        Ok(self.state.read().orders.get(number).cloned())
    }

    async fn update_order_status(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<()> {
        self.enter().await?;
        let mut state = self.state.write();
        let order = state
            .orders
            .get_mut(number)
            .ok_or_else(|| Error::OrderNotFound(number.to_string()))?;
        order.status = status;
        if accrual.is_some() {
            order.accrual = accrual;
        }
        Ok(())
    }

    async fn list_non_terminal_orders(&self) -> Result<Vec<Order>> {
        self.enter().await?;
        let state = self.state.read();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|order| !order.status.is_terminal())
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at));
        Ok(orders)
    }

    async fn list_orders_by_user(&self, user_id: &str) -> Result<Vec<Order>> {
        self.enter().await?;
        let state = self.state.read();
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|order| order.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at));
        Ok(orders)
    }

    async fn list_uncredited_orders(&self) -> Result<Vec<Order>> {
        self.enter().await?;
        let state = self.state.read();
        Ok(state
            .orders
            .values()
            .filter(|order| order.awaits_credit())
            .cloned()
            .collect())
    }

    async fn get_account(&self, user_id: &str) -> Result<Option<Account>> {
        self.enter().await?;
        Ok(self.state.read().accounts.get(user_id).cloned())
    }

    async fn upsert_account(&self, account: &Account) -> Result<()> {
        self.enter().await?;
        self.state
            .write()
            .accounts
            .insert(account.user_id.clone(), account.clone());
        Ok(())
    }

    async fn insert_withdrawal(&self, account: &Account, record: &WithdrawalRecord) -> Result<()> {
        self.enter().await?;
        let mut state = self.state.write();
        state
            .accounts
            .insert(account.user_id.clone(), account.clone());
        state.withdrawals.push(record.clone());
        Ok(())
    }

    async fn list_withdrawals(&self, user_id: &str) -> Result<Vec<WithdrawalRecord>> {
        self.enter().await?;
        let state = self.state.read();
        let mut records: Vec<WithdrawalRecord> = state
            .withdrawals
            .iter()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.processed_at.cmp(&b.processed_at));
        Ok(records)
    }

    async fn apply_accrual_credit(&self, account: &Account, order_number: &str) -> Result<()> {
        self.enter().await?;
        let mut state = self.state.write();
        let order = state
            .orders
            .get_mut(order_number)
            .ok_or_else(|| Error::OrderNotFound(order_number.to_string()))?;
        order.credited = true;
        state
            .accounts
            .insert(account.user_id.clone(), account.clone());
        Ok(())
    }

    async fn close(&self) {
        self.set_unavailable(true);
    }
}
