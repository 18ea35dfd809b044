//! Status changes checked against the order and payment state machines.
//!
//! Every status write in the runtime goes through these two functions, so a
//! `from → to` pair outside [`OrderStatus::can_transition_to`] or
//! [`PaymentStatus::can_transition_to`] never reaches the store.

use chrono::{DateTime, Utc};
use storefront_core::error::CommerceResult;
use storefront_core::order::OrderStatus;
use storefront_core::payment::PaymentStatus;
use storefront_core::store::UnitOfWork;
use storefront_core::{CommerceError, OrderId, PaymentId};

/// Conditionally move an order `from → to`.
///
/// Returns `false` if the order was no longer `from`.
///
/// # Errors
///
/// [`CommerceError::InvalidState`] for a transition the order state machine
/// does not allow, storage errors otherwise.
pub async fn transition_order(
    uow: &mut dyn UnitOfWork,
    order_id: OrderId,
    from: OrderStatus,
    to: OrderStatus,
    at: DateTime<Utc>,
) -> CommerceResult<bool> {
    if !from.can_transition_to(to) {
        return Err(CommerceError::InvalidState {
            order_id,
            status: from,
            action: order_action(to),
        });
    }
    Ok(uow.transition_order(order_id, from, to, at).await?)
}

/// Conditionally move a payment `from → to`.
///
/// Returns `false` if the payment was no longer `from`.
///
/// # Errors
///
/// [`CommerceError::InvalidPaymentState`] for a transition the payment state
/// machine does not allow, storage errors otherwise.
pub async fn transition_payment(
    uow: &mut dyn UnitOfWork,
    payment_id: PaymentId,
    from: PaymentStatus,
    to: PaymentStatus,
    at: DateTime<Utc>,
) -> CommerceResult<bool> {
    if !from.can_transition_to(to) {
        tracing::warn!(%payment_id, %from, %to, "Rejected payment transition");
        return Err(CommerceError::InvalidPaymentState(from));
    }
    Ok(uow.transition_payment(payment_id, from, to, at).await?)
}

const fn order_action(to: OrderStatus) -> &'static str {
    match to {
        OrderStatus::Pending => "reopen",
        OrderStatus::Paid => "mark paid",
        OrderStatus::Shipped => "ship",
        OrderStatus::Completed => "complete",
        OrderStatus::Cancelled => "cancel",
        OrderStatus::Refunded => "refund",
    }
}
