//! Error types for the bonus ledger

use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Order number is not a Luhn-valid digit string
    #[error("Invalid order number: {0:?}")]
    InvalidOrderNumber(String),

    /// Withdrawal amount is zero or negative
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    /// Order was already uploaded by a different user
    #[error("Order {number} is owned by another user")]
    OrderOwnedByAnotherUser {
        /// Order number
        number: String,
    },

    /// Withdrawal exceeds the spendable balance
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        /// Requested amount
        requested: Decimal,
        /// Current balance at the time of the check
        available: Decimal,
    },

    /// Balance arithmetic would leave the storable range
    #[error("Balance overflow for user {user_id}: {current} + {amount}")]
    BalanceOverflow {
        /// Account owner
        user_id: String,
        /// Balance before the operation
        current: Decimal,
        /// Amount being applied
        amount: Decimal,
    },

    /// Order does not exist
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// Projection is empty
    #[error("No records")]
    NoRecords,

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Accrual authority unreachable or answered with an unexpected status
    #[error("Accrual authority error: {0}")]
    Accrual(String),

    /// Accrual authority answered with a body we cannot interpret
    #[error("Accrual response decode error: {0}")]
    AccrualDecode(String),

    /// Accrual authority asked us to back off
    #[error("Accrual authority rate limit, retry after {retry_after:?}")]
    RateLimited {
        /// Back-off requested by the authority
        retry_after: Duration,
    },

    /// External call exceeded its time budget
    #[error("Timeout after {millis}ms: {operation}")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Budget in milliseconds
        millis: u64,
    },

    /// Shutdown requested while the operation was in flight
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by callers to decide on retries and responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected before any lock is taken
    Validation,
    /// Business outcome (ownership, funds)
    Conflict,
    /// Nothing to return
    NotFound,
    /// Infrastructure failure; safe to retry later
    Transient,
    /// Misconfiguration or unrecoverable local failure
    Fatal,
}

impl Error {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidOrderNumber(_) | Error::InvalidAmount(_) => ErrorKind::Validation,
            Error::OrderOwnedByAnotherUser { .. }
            | Error::InsufficientFunds { .. }
            | Error::BalanceOverflow { .. } => ErrorKind::Conflict,
            Error::OrderNotFound(_) | Error::NoRecords => ErrorKind::NotFound,
            Error::Storage(_)
            | Error::Accrual(_)
            | Error::AccrualDecode(_)
            | Error::RateLimited { .. }
            | Error::Timeout { .. }
            | Error::Cancelled => ErrorKind::Transient,
            Error::Config(_) | Error::Io(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the unit of work may be retried on a later attempt
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Short machine-readable tag, used as a metrics label and log field
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::InvalidOrderNumber(_) => "invalid_order_number",
            Error::InvalidAmount(_) => "invalid_amount",
            Error::OrderOwnedByAnotherUser { .. } => "order_owned_by_another_user",
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::BalanceOverflow { .. } => "balance_overflow",
            Error::OrderNotFound(_) => "order_not_found",
            Error::NoRecords => "no_records",
            Error::Storage(_) => "storage_error",
            Error::Accrual(_) => "accrual_error",
            Error::AccrualDecode(_) => "accrual_decode_error",
            Error::RateLimited { .. } => "rate_limited",
            Error::Timeout { .. } => "timeout",
            Error::Cancelled => "cancelled",
            Error::Config(_) => "config_error",
            Error::Io(_) => "io_error",
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Error::AccrualDecode(err.to_string())
        } else {
            Error::Accrual(err.to_string())
        }
    }
}
