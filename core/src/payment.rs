//! Payment ledger records.

use crate::types::{Money, OrderId, PaymentId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default time a payment may stay `pending` before the reaper cancels it, in seconds.
pub const DEFAULT_PAYMENT_TIMEOUT_SECS: i64 = 15 * 60;

/// Payment status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Charge requested, provider has not confirmed
    Pending,
    /// Provider confirmed the charge
    Paid,
    /// Timed out or abandoned
    Cancelled,
    /// Money returned after payment
    Refunded,
}

impl PaymentStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Paid | Self::Cancelled) | (Self::Paid, Self::Refunded)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "cancelled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            other => Err(format!("Invalid payment status: {other}")),
        }
    }
}

/// Supported payment providers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Alipay page pay (redirect)
    Alipay,
    /// WeChat Pay native (QR code)
    Wechat,
}

impl PaymentMethod {
    /// Convert method to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Alipay => "alipay",
            Self::Wechat => "wechat",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alipay" => Ok(Self::Alipay),
            "wechat" => Ok(Self::Wechat),
            other => Err(other.to_string()),
        }
    }
}

/// One charge attempt for an order. Never deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Internal identity
    pub id: PaymentId,
    /// External reference sent to the provider (`out_trade_no`)
    pub payment_number: String,
    /// Order being paid
    pub order_id: OrderId,
    /// Payer
    pub owner: UserId,
    /// Equals the order total at creation
    pub amount: Money,
    /// Provider channel
    pub method: PaymentMethod,
    /// Current status
    pub status: PaymentStatus,
    /// Set exactly once, on the `pending → paid` transition
    pub paid_at: Option<DateTime<Utc>>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Last mutation instant
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// A fresh `pending` payment for `order_id`.
    #[must_use]
    pub fn pending(
        order_id: OrderId,
        owner: UserId,
        amount: Money,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            payment_number: payment_number(),
            order_id,
            owner,
            amount,
            method,
            status: PaymentStatus::Pending,
            paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Generate a payment number: 32 lowercase hex characters, independent of
/// the order number and within both providers' `out_trade_no` limits.
#[must_use]
pub fn payment_number() -> String {
    Uuid::new_v4().simple().to_string()
}
