//! Storage collaborator
//!
//! Every call is atomic on its own. Multi-call read-check-write sequences rely
//! on the keyed locks held by the ledgers, not on storage transactions.
//!
//! # Backends
//!
//! - [`MemoryStorage`] - hash maps behind a `parking_lot::RwLock`
//! - [`PgStorage`] - PostgreSQL via `sqlx`

pub mod memory;
pub mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PgStorage;

use crate::types::{Account, Order, OrderStatus, WithdrawalRecord};
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Persistence operations used by the ledgers
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Insert a newly admitted order
    async fn insert_order(&self, order: &Order) -> Result<()>;

    /// Look up an order by number
    async fn find_order(&self, number: &str) -> Result<Option<Order>>;

    /// Set an order's status; `accrual` is written only when `Some`
    async fn update_order_status(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<()>;

    /// Orders in NEW or PROCESSING
    async fn list_non_terminal_orders(&self) -> Result<Vec<Order>>;

    /// A user's orders, oldest first
    async fn list_orders_by_user(&self, user_id: &str) -> Result<Vec<Order>>;

    /// PROCESSED orders whose accrual has not reached the balance
    async fn list_uncredited_orders(&self) -> Result<Vec<Order>>;

    /// Account row, `None` if the user was never touched
    async fn get_account(&self, user_id: &str) -> Result<Option<Account>>;

    /// Create or overwrite an account row
    async fn upsert_account(&self, account: &Account) -> Result<()>;

    /// Write the debited account and its withdrawal record as one unit
    async fn insert_withdrawal(&self, account: &Account, record: &WithdrawalRecord) -> Result<()>;

    /// A user's withdrawals, oldest first
    async fn list_withdrawals(&self, user_id: &str) -> Result<Vec<WithdrawalRecord>>;

    /// Write the credited account and mark the order credited as one unit
    async fn apply_accrual_credit(&self, account: &Account, order_number: &str) -> Result<()>;

    /// Release backend resources; later calls fail with `Error::Storage`
    async fn close(&self) {}
}
