//! Bonus Ledger
//!
//! Per-user bonus balances accrued from externally validated purchase orders.
//!
//! # Architecture
//!
//! - **Keyed locks**: one exclusive critical section per order number and per user id
//! - **Order admission**: Luhn check, global uniqueness, per-user idempotence
//! - **Balance mutation**: read-check-write under the user's key
//! - **Reconciliation**: a polling task that settles orders against the accrual authority
//!
//! # Invariants
//!
//! - An order number belongs to exactly one user, forever
//! - Order status only moves forward: NEW → PROCESSING → INVALID | PROCESSED
//! - Account `current` never drops below zero, `withdrawn` never decreases
//! - A PROCESSED order's accrual is credited exactly once

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod accrual;
pub mod balance;
pub mod config;
pub mod error;
pub mod keyed_lock;
pub mod luhn;
pub mod metrics;
pub mod orders;
pub mod reconciliation;
pub mod storage;
pub mod system;
pub mod types;

// Re-exports
pub use accrual::{AccrualAuthority, HttpAccrualClient};
pub use balance::BalanceLedger;
pub use config::{Config, ReconciliationConfig};
pub use error::{Error, ErrorKind, Result};
pub use keyed_lock::{KeyGuard, KeyedLock};
pub use orders::{AppliedVerdict, OrderLedger, SubmitOutcome};
pub use reconciliation::{IterationReport, ReconciliationLoop};
pub use storage::{MemoryStorage, PgStorage, Storage};
pub use system::BonusSystem;
pub use types::{Account, Balance, Order, OrderStatus, Verdict, VerdictStatus, WithdrawalRecord};
