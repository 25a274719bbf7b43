//! Service context
//!
//! `BonusSystem` owns the storage handle, both ledgers and the metrics
//! registry. Request handlers and the reconciliation task share it through
//! `Arc`s; nothing lives in a global.

use crate::{
    accrual::AccrualAuthority,
    balance::BalanceLedger,
    config::{Config, ReconciliationConfig},
    metrics::Metrics,
    orders::{OrderLedger, SubmitOutcome},
    reconciliation::ReconciliationLoop,
    storage::{MemoryStorage, PgStorage, Storage},
    types::{Balance, Order, WithdrawalRecord},
    Error, Result,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bonus ledger service context
#[derive(Debug, Clone)]
pub struct BonusSystem {
    storage: Arc<dyn Storage>,
    orders: Arc<OrderLedger>,
    balances: Arc<BalanceLedger>,
    metrics: Arc<Metrics>,
}

impl BonusSystem {
    /// Build the context over an existing storage backend
    pub fn new(storage: Arc<dyn Storage>) -> Result<Self> {
        let metrics = Arc::new(
            Metrics::new().map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?,
        );

        let orders = Arc::new(OrderLedger::new(storage.clone()).with_metrics(metrics.clone()));
        let balances =
            Arc::new(BalanceLedger::new(storage.clone()).with_metrics(metrics.clone()));

        Ok(Self {
            storage,
            orders,
            balances,
            metrics,
        })
    }

    /// Context over fresh in-memory storage
    pub fn in_memory() -> Result<Self> {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Open the backend named by `config`: PostgreSQL when a database URI is
    /// set, in-memory otherwise
    pub async fn from_config(config: &Config) -> Result<Self> {
        let storage: Arc<dyn Storage> = match &config.database_uri {
            Some(uri) => {
                Arc::new(PgStorage::open(uri, config.database_max_connections).await?)
            }
            None => {
                tracing::warn!("No database configured, balances live in memory only");
                Arc::new(MemoryStorage::new())
            }
        };
        Self::new(storage)
    }

    /// Admit an order for `user_id`
    pub async fn submit(&self, order_number: &str, user_id: &str) -> Result<SubmitOutcome> {
        self.orders.submit(order_number, user_id).await
    }

    /// Current balance
    pub async fn get_balance(&self, user_id: &str) -> Result<Balance> {
        self.balances.get_balance(user_id).await
    }

    /// Spend from the user's balance
    pub async fn withdraw(
        &self,
        user_id: &str,
        order_reference: &str,
        amount: Decimal,
    ) -> Result<WithdrawalRecord> {
        self.balances.withdraw(user_id, order_reference, amount).await
    }

    /// The user's orders
    pub async fn list_orders(&self, user_id: &str) -> Result<Vec<Order>> {
        self.orders.list_orders(user_id).await
    }

    /// The user's withdrawals
    pub async fn list_withdrawals(&self, user_id: &str) -> Result<Vec<WithdrawalRecord>> {
        self.balances.list_withdrawals(user_id).await
    }

    /// Reconciliation loop wired to this context
    pub fn reconciliation_loop(
        &self,
        authority: Arc<dyn AccrualAuthority>,
        config: ReconciliationConfig,
    ) -> ReconciliationLoop {
        ReconciliationLoop::new(
            self.orders.clone(),
            self.balances.clone(),
            authority,
            config,
        )
        .with_metrics(self.metrics.clone())
    }

    /// Start the reconciliation loop on the runtime; it stops when
    /// `shutdown` is cancelled
    pub fn spawn_reconciliation(
        &self,
        authority: Arc<dyn AccrualAuthority>,
        config: ReconciliationConfig,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.reconciliation_loop(authority, config).run(shutdown))
    }

    /// Release storage resources; call after the reconciliation task joined
    pub async fn close(&self) {
        self.storage.close().await;
    }

    /// Order ledger
    pub fn orders(&self) -> &Arc<OrderLedger> {
        &self.orders
    }

    /// Balance ledger
    pub fn balances(&self) -> &Arc<BalanceLedger> {
        &self.balances
    }

    /// Storage backend
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderStatus;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_facade_round_trip() {
        let system = BonusSystem::in_memory().unwrap();

        assert_eq!(
            system.submit("79927398713", "user-1").await.unwrap(),
            SubmitOutcome::Accepted
        );
        assert_eq!(
            system.submit("79927398713", "user-1").await.unwrap(),
            SubmitOutcome::AlreadySubmittedBySameUser
        );
        assert!(matches!(
            system.submit("79927398713", "user-2").await,
            Err(Error::OrderOwnedByAnotherUser { .. })
        ));

        let orders = system.list_orders("user-1").await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::New);
        assert!(matches!(
            system.list_orders("user-2").await,
            Err(Error::NoRecords)
        ));

        system.balances().credit("user-1", dec!(20)).await.unwrap();
        system
            .withdraw("user-1", "2377225624", dec!(7.5))
            .await
            .unwrap();

        let balance = system.get_balance("user-1").await.unwrap();
        assert_eq!(balance.current, dec!(12.5));
        assert_eq!(balance.withdrawn, dec!(7.5));
        assert_eq!(system.list_withdrawals("user-1").await.unwrap().len(), 1);

        assert_eq!(system.metrics().orders_submitted.get(), 1);
        assert_eq!(system.metrics().withdrawals.get(), 1);
    }

    #[tokio::test]
    async fn test_from_config_without_database() {
        let system = BonusSystem::from_config(&Config::default()).await.unwrap();
        assert_eq!(
            system.get_balance("user-1").await.unwrap(),
            Balance::default()
        );
    }

    #[tokio::test]
    async fn test_close_releases_storage() {
        let system = BonusSystem::in_memory().unwrap();
        system.submit("79927398713", "user-1").await.unwrap();
        system.close().await;

        let err = system.get_balance("user-1").await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_independent_contexts() {
        let first = BonusSystem::in_memory().unwrap();
        let second = BonusSystem::in_memory().unwrap();

        first.submit("79927398713", "user-1").await.unwrap();
        assert_eq!(
            second.submit("79927398713", "user-2").await.unwrap(),
            SubmitOutcome::Accepted
        );
    }
}
