//! PostgreSQL storage backend
//!
//! # Tables
//!
//! - `orders` - one row per admitted order (key: number)
//! - `accounts` - one row per touched user (key: user_id)
//! - `withdrawals` - append-only spend log

use super::Storage;
use crate::types::{Account, Order, OrderStatus, WithdrawalRecord};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

const CREATE_ORDERS: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    number      VARCHAR(64)    PRIMARY KEY,
    user_id     VARCHAR(64)    NOT NULL,
    status      VARCHAR(16)    NOT NULL,
    accrual     NUMERIC(14, 2),
    credited    BOOLEAN        NOT NULL DEFAULT FALSE,
    uploaded_at TIMESTAMPTZ    NOT NULL
)"#;

const CREATE_ORDERS_USER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS orders_user_id_idx ON orders (user_id, uploaded_at)";

const CREATE_ACCOUNTS: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    user_id   VARCHAR(64)    PRIMARY KEY,
    current   NUMERIC(14, 2) NOT NULL DEFAULT 0 CHECK (current >= 0),
    withdrawn NUMERIC(14, 2) NOT NULL DEFAULT 0
)"#;

const CREATE_WITHDRAWALS: &str = r#"
CREATE TABLE IF NOT EXISTS withdrawals (
    id              BIGSERIAL      PRIMARY KEY,
    user_id         VARCHAR(64)    NOT NULL,
    order_reference VARCHAR(64)    NOT NULL,
    amount          NUMERIC(14, 2) NOT NULL,
    processed_at    TIMESTAMPTZ    NOT NULL
)"#;

const UPSERT_ACCOUNT: &str = r#"
INSERT INTO accounts (user_id, current, withdrawn)
VALUES ($1, $2, $3)
ON CONFLICT (user_id)
DO UPDATE SET current = EXCLUDED.current, withdrawn = EXCLUDED.withdrawn
"#;

#[derive(sqlx::FromRow)]
struct OrderRow {
    number: String,
    user_id: String,
    status: String,
    accrual: Option<Decimal>,
    credited: bool,
    uploaded_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = Error;

    fn try_from(row: OrderRow) -> Result<Self> {
        Ok(Order {
            number: row.number,
            user_id: row.user_id,
            status: row.status.parse()?,
            accrual: row.accrual,
            credited: row.credited,
            uploaded_at: row.uploaded_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    user_id: String,
    current: Decimal,
    withdrawn: Decimal,
}

#[derive(sqlx::FromRow)]
struct WithdrawalRow {
    user_id: String,
    order_reference: String,
    amount: Decimal,
    processed_at: DateTime<Utc>,
}

/// PostgreSQL-backed storage
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    /// Connect and create tables if missing
    pub async fn open(database_uri: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_uri)
            .await?;

        let storage = Self { pool };
        storage.create_tables().await?;

        tracing::info!(max_connections, "Opened PostgreSQL storage");

        Ok(storage)
    }

    async fn create_tables(&self) -> Result<()> {
        for statement in [
            CREATE_ORDERS,
            CREATE_ORDERS_USER_INDEX,
            CREATE_ACCOUNTS,
            CREATE_WITHDRAWALS,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch_orders(&self, sql: &str, bind: Option<&str>) -> Result<Vec<Order>> {
        let mut query = sqlx::query_as::<_, OrderRow>(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Order::try_from)
            .collect()
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (number, user_id, status, accrual, credited, uploaded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&order.number)
        .bind(&order.user_id)
        .bind(order.status.as_str())
        .bind(order.accrual)
        .bind(order.credited)
        .bind(order.uploaded_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(order_number = %order.number, user_id = %order.user_id, "Order inserted");

        Ok(())
    }

    async fn find_order(&self, number: &str) -> Result<Option<Order>> {
        sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT number, user_id, status, accrual, credited, uploaded_at
            FROM orders WHERE number = $1
            "#,
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await?
        .map(Order::try_from)
        .transpose()
    }

    async fn update_order_status(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, accrual = COALESCE($3, accrual)
            WHERE number = $1
            "#,
        )
        .bind(number)
        .bind(status.as_str())
        .bind(accrual)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::OrderNotFound(number.to_string()));
        }
        Ok(())
    }

    async fn list_non_terminal_orders(&self) -> Result<Vec<Order>> {
        self.fetch_orders(
            r#"
            SELECT number, user_id, status, accrual, credited, uploaded_at
            FROM orders WHERE status IN ('NEW', 'PROCESSING')
            ORDER BY uploaded_at
            "#,
            None,
        )
        .await
    }

    async fn list_orders_by_user(&self, user_id: &str) -> Result<Vec<Order>> {
        self.fetch_orders(
            r#"
            SELECT number, user_id, status, accrual, credited, uploaded_at
            FROM orders WHERE user_id = $1
            ORDER BY uploaded_at
            "#,
            Some(user_id),
        )
        .await
    }

    async fn list_uncredited_orders(&self) -> Result<Vec<Order>> {
        self.fetch_orders(
            r#"
            SELECT number, user_id, status, accrual, credited, uploaded_at
            FROM orders WHERE status = 'PROCESSED' AND credited = FALSE
            ORDER BY uploaded_at
            "#,
            None,
        )
        .await
    }

    async fn get_account(&self, user_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT user_id, current, withdrawn FROM accounts WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Account {
            user_id: row.user_id,
            current: row.current,
            withdrawn: row.withdrawn,
        }))
    }

    async fn upsert_account(&self, account: &Account) -> Result<()> {
        sqlx::query(UPSERT_ACCOUNT)
            .bind(&account.user_id)
            .bind(account.current)
            .bind(account.withdrawn)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_withdrawal(&self, account: &Account, record: &WithdrawalRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(UPSERT_ACCOUNT)
            .bind(&account.user_id)
            .bind(account.current)
            .bind(account.withdrawn)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO withdrawals (user_id, order_reference, amount, processed_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.order_reference)
        .bind(record.amount)
        .bind(record.processed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_withdrawals(&self, user_id: &str) -> Result<Vec<WithdrawalRecord>> {
        let rows = sqlx::query_as::<_, WithdrawalRow>(
            r#"
            SELECT user_id, order_reference, amount, processed_at
            FROM withdrawals WHERE user_id = $1
            ORDER BY processed_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| WithdrawalRecord {
                user_id: row.user_id,
                order_reference: row.order_reference,
                amount: row.amount,
                processed_at: row.processed_at,
            })
            .collect())
    }

    async fn apply_accrual_credit(&self, account: &Account, order_number: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let marked = sqlx::query("UPDATE orders SET credited = TRUE WHERE number = $1")
            .bind(order_number)
            .execute(&mut *tx)
            .await?;
        if marked.rows_affected() == 0 {
            return Err(Error::OrderNotFound(order_number.to_string()));
        }

        sqlx::query(UPSERT_ACCOUNT)
            .bind(&account.user_id)
            .bind(account.current)
            .bind(account.withdrawn)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL storage closed");
    }
}
