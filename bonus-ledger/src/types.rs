//! Core types for the bonus ledger
//!
//! All types are designed for:
//! - Exact arithmetic (Decimal for money, two fractional digits)
//! - JSON projections matching the public API (numbers, RFC 3339 timestamps)

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fractional digits kept for every monetary amount
pub const MONEY_SCALE: u32 = 2;

/// Largest amount a `NUMERIC(14, 2)` column holds
pub const MAX_MONEY: Decimal = Decimal::from_parts(276_447_231, 23_283, 0, false, 2);

/// Truncate an amount toward zero to two fractional digits
pub fn to_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::ToZero)
}

/// `a + b`, or `None` when the sum leaves the `[0, MAX_MONEY]` range
pub fn money_add(a: Decimal, b: Decimal) -> Option<Decimal> {
    a.checked_add(b)
        .filter(|sum| *sum >= Decimal::ZERO && *sum <= MAX_MONEY)
}

/// `a - b`, or `None` when the difference leaves the `[0, MAX_MONEY]` range
pub fn money_sub(a: Decimal, b: Decimal) -> Option<Decimal> {
    a.checked_sub(b)
        .filter(|diff| *diff >= Decimal::ZERO && *diff <= MAX_MONEY)
}

/// Local order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Admitted, not yet seen by the accrual authority
    New,
    /// Accrual authority is computing the reward
    Processing,
    /// Rejected by the accrual authority (terminal)
    Invalid,
    /// Reward computed (terminal)
    Processed,
}

impl OrderStatus {
    /// Wire / storage name
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }

    /// No further verdict transitions expected
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }

    /// Position in the lifecycle; transitions must strictly increase it
    pub fn rank(&self) -> u8 {
        match self {
            OrderStatus::New => 0,
            OrderStatus::Processing => 1,
            OrderStatus::Invalid | OrderStatus::Processed => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the lifecycle
    pub fn can_advance_to(&self, next: OrderStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "INVALID" => Ok(OrderStatus::Invalid),
            "PROCESSED" => Ok(OrderStatus::Processed),
            other => Err(crate::Error::Storage(format!(
                "unknown order status {:?}",
                other
            ))),
        }
    }
}

/// Purchase order submitted by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Luhn-valid order number, globally unique
    pub number: String,

    /// Owner; never changes after admission
    #[serde(skip)]
    pub user_id: String,

    /// Current status
    pub status: OrderStatus,

    /// Reward, present once PROCESSED
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub accrual: Option<Decimal>,

    /// Submission time
    pub uploaded_at: DateTime<Utc>,

    /// Accrual already added to the owner's balance
    #[serde(skip)]
    pub credited: bool,
}

impl Order {
    /// Freshly admitted order
    pub fn new(number: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            user_id: user_id.into(),
            status: OrderStatus::New,
            accrual: None,
            uploaded_at: Utc::now(),
            credited: false,
        }
    }

    /// PROCESSED with an accrual that has not reached the balance yet
    pub fn awaits_credit(&self) -> bool {
        self.status == OrderStatus::Processed && !self.credited
    }
}

/// Per-user account row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Owner
    pub user_id: String,
    /// Spendable balance (never negative)
    pub current: Decimal,
    /// Cumulative withdrawn amount (never decreases)
    pub withdrawn: Decimal,
}

impl Account {
    /// Untouched account
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            current: Decimal::ZERO,
            withdrawn: Decimal::ZERO,
        }
    }

    /// Public projection
    pub fn balance(&self) -> Balance {
        Balance {
            current: self.current,
            withdrawn: self.withdrawn,
        }
    }
}

/// Balance projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
    /// Spendable balance
    #[serde(with = "rust_decimal::serde::float")]
    pub current: Decimal,
    /// Cumulative withdrawn amount
    #[serde(with = "rust_decimal::serde::float")]
    pub withdrawn: Decimal,
}

/// Completed withdrawal; append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    /// User who spent the funds
    #[serde(skip)]
    pub user_id: String,

    /// Spend tag (Luhn-valid, need not match a purchase order)
    #[serde(rename = "order")]
    pub order_reference: String,

    /// Amount spent
    #[serde(rename = "sum", with = "rust_decimal::serde::float")]
    pub amount: Decimal,

    /// Time the withdrawal was committed
    pub processed_at: DateTime<Utc>,
}

/// Accrual authority status vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    /// Known to the authority, not yet judged
    Registered,
    /// Rejected, no reward
    Invalid,
    /// Judgement in progress
    Processing,
    /// Judged, reward computed
    Processed,
}

impl VerdictStatus {
    /// Local status this verdict maps onto
    pub fn order_status(&self) -> OrderStatus {
        match self {
            VerdictStatus::Registered => OrderStatus::New,
            VerdictStatus::Invalid => OrderStatus::Invalid,
            VerdictStatus::Processing => OrderStatus::Processing,
            VerdictStatus::Processed => OrderStatus::Processed,
        }
    }
}

/// Accrual authority judgement for one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Order number echoed by the authority
    pub order: String,

    /// Current judgement
    pub status: VerdictStatus,

    /// Reward, only meaningful for PROCESSED
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub accrual: Option<Decimal>,
}

impl Verdict {
    /// Reward truncated to money precision, zero when absent
    ///
    /// Negative rewards and rewards above `MAX_MONEY` are `AccrualDecode`.
    pub fn accrual_amount(&self) -> crate::Result<Decimal> {
        let amount = self.accrual.map(to_money).unwrap_or(Decimal::ZERO);
        if amount < Decimal::ZERO || amount > MAX_MONEY {
            return Err(crate::Error::AccrualDecode(format!(
                "accrual {} for order {} is out of range",
                amount, self.order
            )));
        }
        Ok(amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_to_money_truncates() {
        assert_eq!(to_money(dec!(729.987)), dec!(729.98));
        assert_eq!(to_money(dec!(0.019)), dec!(0.01));
        assert_eq!(to_money(dec!(15)), dec!(15));
    }

    #[test]
    fn test_order_status_lifecycle() {
        assert!(OrderStatus::New.can_advance_to(OrderStatus::Processing));
        assert!(OrderStatus::New.can_advance_to(OrderStatus::Processed));
        assert!(OrderStatus::Processing.can_advance_to(OrderStatus::Invalid));
        assert!(!OrderStatus::Processing.can_advance_to(OrderStatus::New));
        assert!(!OrderStatus::Invalid.can_advance_to(OrderStatus::Processed));
        assert!(!OrderStatus::Processed.can_advance_to(OrderStatus::Processed));

        assert!(!OrderStatus::New.is_terminal());
        assert!(OrderStatus::Invalid.is_terminal());
        assert!(OrderStatus::Processed.is_terminal());
    }

    #[test]
    fn test_order_status_from_str() {
        assert_eq!("PROCESSING".parse::<OrderStatus>().unwrap(), OrderStatus::Processing);
        assert!("DONE".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_verdict_decoding() {
        let verdict: Verdict =
            serde_json::from_str(r#"{"order":"79927398713","status":"PROCESSED","accrual":500.555}"#)
                .unwrap();
        assert_eq!(verdict.status, VerdictStatus::Processed);
        assert_eq!(verdict.accrual_amount().unwrap(), dec!(500.55));
        assert_eq!(verdict.status.order_status(), OrderStatus::Processed);

        let registered: Verdict =
            serde_json::from_str(r#"{"order":"79927398713","status":"REGISTERED"}"#).unwrap();
        assert_eq!(registered.accrual_amount().unwrap(), Decimal::ZERO);
        assert_eq!(registered.status.order_status(), OrderStatus::New);

        let unknown =
            serde_json::from_str::<Verdict>(r#"{"order":"79927398713","status":"LOST"}"#);
        assert!(unknown.is_err());
    }

    #[test]
    fn test_verdict_accrual_out_of_range() {
        let negative: Verdict =
            serde_json::from_str(r#"{"order":"79927398713","status":"PROCESSED","accrual":-50}"#)
                .unwrap();
        assert!(matches!(
            negative.accrual_amount(),
            Err(crate::Error::AccrualDecode(_))
        ));

        let huge: Verdict = serde_json::from_str(
            r#"{"order":"79927398713","status":"PROCESSED","accrual":50000000000000000000000000000}"#,
        )
        .unwrap();
        assert!(matches!(
            huge.accrual_amount(),
            Err(crate::Error::AccrualDecode(_))
        ));

        let ceiling = Verdict {
            order: "79927398713".into(),
            status: VerdictStatus::Processed,
            accrual: Some(MAX_MONEY),
        };
        assert_eq!(ceiling.accrual_amount().unwrap(), dec!(999999999999.99));
    }

    #[test]
    fn test_money_bounds() {
        assert_eq!(MAX_MONEY, dec!(999999999999.99));
        assert_eq!(money_add(dec!(1.5), dec!(2)), Some(dec!(3.5)));
        assert_eq!(money_add(MAX_MONEY, dec!(0.01)), None);
        assert_eq!(money_add(Decimal::MAX, Decimal::MAX), None);
        assert_eq!(money_add(dec!(10), dec!(-20)), None);
        assert_eq!(money_sub(dec!(10), dec!(10)), Some(Decimal::ZERO));
        assert_eq!(money_sub(dec!(10), dec!(10.01)), None);
    }

    #[test]
    fn test_order_projection() {
        let mut order = Order::new("9278923470", "user-1");
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["number"], "9278923470");
        assert_eq!(json["status"], "NEW");
        assert!(json.get("accrual").is_none());
        assert!(json.get("user_id").is_none());

        order.status = OrderStatus::Processed;
        order.accrual = Some(dec!(500));
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["accrual"], 500.0);
    }

    #[test]
    fn test_withdrawal_projection() {
        let record = WithdrawalRecord {
            user_id: "user-1".into(),
            order_reference: "2377225624".into(),
            amount: dec!(751.5),
            processed_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["order"], "2377225624");
        assert_eq!(json["sum"], 751.5);
    }

    #[test]
    fn test_account_balance() {
        let account = Account::empty("user-1");
        assert_eq!(account.balance(), Balance::default());
    }
}
