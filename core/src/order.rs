//! Order aggregate: header, line-item snapshots and the status machine.

use crate::types::{AddressId, Money, OrderId, ProductId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default time an unpaid order holds its stock, in seconds.
pub const DEFAULT_RESERVATION_WINDOW_SECS: i64 = 30 * 60;

/// Order lifecycle status.
///
/// ```text
/// pending ──► paid ──► shipped ──► completed
///    │          └────► refunded
///    └──► cancelled
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, stock reserved, awaiting payment
    Pending,
    /// Payment confirmed
    Paid,
    /// Handed to the carrier
    Shipped,
    /// Delivered (terminal)
    Completed,
    /// Cancelled before payment (terminal)
    Cancelled,
    /// Refunded after payment (terminal)
    Refunded,
}

impl OrderStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Shipped => "shipped",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Paid | Self::Cancelled)
                | (Self::Paid, Self::Shipped | Self::Refunded)
                | (Self::Shipped, Self::Completed)
        )
    }

    /// No transition leaves a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Refunded)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "shipped" => Ok(Self::Shipped),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "refunded" => Ok(Self::Refunded),
            other => Err(format!("Invalid order status: {other}")),
        }
    }
}

/// Snapshot of one purchased product, frozen at order creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Product the line was bought from
    pub product_id: ProductId,
    /// Product name at purchase time
    pub product_name: String,
    /// Product image at purchase time
    pub product_image: String,
    /// Unit price at purchase time
    pub price: Money,
    /// Units bought
    pub quantity: u32,
}

impl OrderItem {
    /// `price × quantity`, `None` on overflow.
    #[must_use]
    pub const fn line_total(&self) -> Option<Money> {
        self.price.checked_mul(self.quantity)
    }
}

/// Order header with its owned line items.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Internal identity
    pub id: OrderId,
    /// Human-traceable unique number, see [`order_number`]
    pub order_number: String,
    /// Buyer
    pub owner: UserId,
    /// Current status
    pub status: OrderStatus,
    /// Sum of line totals
    pub total_amount: Money,
    /// Shipping address
    pub address_id: AddressId,
    /// Free-text buyer remark
    pub remark: String,
    /// Reservation deadline while `pending`
    pub expires_at: DateTime<Utc>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
    /// Last mutation instant
    pub updated_at: DateTime<Utc>,
    /// Line items in submission order
    pub items: Vec<OrderItem>,
}

impl Order {
    /// Sum of `price × quantity` over all items.
    #[must_use]
    pub fn items_total(&self) -> Option<Money> {
        self.items
            .iter()
            .try_fold(Money::ZERO, |acc, item| acc.checked_add(item.line_total()?))
    }

    /// Whether the reservation window has elapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == OrderStatus::Pending && self.expires_at < now
    }
}

/// One requested line of a new order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    /// Product to buy
    pub product_id: ProductId,
    /// Units requested
    pub quantity: u32,
}

/// Input of `CreateOrder`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    /// Shipping address, must belong to the buyer
    pub address_id: AddressId,
    /// Requested lines, processed in order
    pub items: Vec<OrderLine>,
    /// Free-text remark
    #[serde(default)]
    pub remark: String,
}

/// Input of `UpdateOrder`. At least one field must be set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderUpdate {
    /// New shipping address
    pub address_id: Option<AddressId>,
    /// New remark
    pub remark: Option<String>,
}

impl OrderUpdate {
    /// True when nothing would change.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.address_id.is_none() && self.remark.is_none()
    }
}

/// Build the order number: creation instant (UTC, millisecond precision)
/// followed by the owner id, e.g. `20250101000000000` + `42`.
#[must_use]
pub fn order_number(created_at: DateTime<Utc>, owner: UserId) -> String {
    format!("{}{}", created_at.format("%Y%m%d%H%M%S%3f"), owner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    const ALL: [OrderStatus; 6] = [
        OrderStatus::Pending,
        OrderStatus::Paid,
        OrderStatus::Shipped,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::Refunded,
    ];

    #[test]
    fn cancel_is_only_allowed_from_pending() {
        for status in ALL {
            assert_eq!(
                status.can_transition_to(OrderStatus::Cancelled),
                status == OrderStatus::Pending,
                "{status} -> cancelled"
            );
        }
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn order_number_is_timestamp_then_owner() {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap()
            + Duration::milliseconds(67);
        assert_eq!(order_number(at, UserId::new(42)), "2025010203040506742");
    }

    fn order_with(items: Vec<OrderItem>) -> Order {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Order {
            id: OrderId::new(),
            order_number: order_number(now, UserId::new(1)),
            owner: UserId::new(1),
            status: OrderStatus::Pending,
            total_amount: Money::ZERO,
            address_id: AddressId::new(1),
            remark: String::new(),
            expires_at: now + Duration::seconds(DEFAULT_RESERVATION_WINDOW_SECS),
            created_at: now,
            updated_at: now,
            items,
        }
    }

    #[test]
    fn items_total_sums_lines() {
        let item = |cents, quantity| OrderItem {
            product_id: ProductId::new(1),
            product_name: "widget".into(),
            product_image: String::new(),
            price: Money::from_cents(cents),
            quantity,
        };
        let order = order_with(vec![item(1000, 2), item(500, 1)]);
        assert_eq!(order.items_total(), Some(Money::from_cents(2500)));
    }

    #[test]
    fn expiry_is_strictly_after_deadline() {
        let order = order_with(Vec::new());
        assert!(!order.is_expired(order.expires_at));
        assert!(order.is_expired(order.expires_at + Duration::milliseconds(1)));
    }

    proptest! {
        #[test]
        fn transitions_never_return_to_pending(from in 0usize..6, to in 0usize..6) {
            if ALL[to] == OrderStatus::Pending {
                prop_assert!(!ALL[from].can_transition_to(ALL[to]));
            }
        }
    }
}
