//! Applies provider payment notifications to local payments and orders.
//!
//! Both status writes are conditional, so a redelivered notification, a
//! concurrent timeout and an expiry sweep can race without double-applying
//! anything. The provider always gets an answer in its own encoding.

use crate::metrics::PaymentMetrics;
use crate::transitions::{transition_order, transition_payment};
use std::sync::Arc;
use storefront_core::environment::Clock;
use storefront_core::error::CommerceResult;
use storefront_core::order::OrderStatus;
use storefront_core::payment::{PaymentMethod, PaymentStatus};
use storefront_core::provider::{
    AckOutcome, Acknowledgement, InboundNotification, ProviderError, ProviderRegistry,
};
use storefront_core::store::Database;
use storefront_core::{CommerceError, ErrorKind};

/// What a verified notification did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciliation {
    /// Payment moved `pending → paid`
    Applied,
    /// Payment was already `paid`
    Duplicate,
    /// Provider status is not a success code; nothing written
    NotPaid(String),
    /// Provider reports success for a payment we already cancelled
    Stale(PaymentStatus),
}

impl Reconciliation {
    const fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::NotPaid(_) => "not_paid",
            Self::Stale(_) => "stale",
        }
    }
}

/// Provider callback reconciler.
#[derive(Clone)]
pub struct CallbackReconciler {
    db: Arc<dyn Database>,
    providers: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
}

impl CallbackReconciler {
    /// Reconciler over `db` using `providers` to authenticate notifications.
    #[must_use]
    pub fn new(
        db: Arc<dyn Database>,
        providers: Arc<ProviderRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            providers,
            clock,
        }
    }

    /// Verify and apply a notification, answering in the provider's encoding.
    ///
    /// Success for applied, duplicate, not-paid and stale notifications;
    /// failure with 404 for an unknown payment, 400 for a bad signature,
    /// malformed body or amount mismatch, and 500 on persistence errors so
    /// the provider redelivers. `None` if no provider serves `method`.
    pub async fn handle(
        &self,
        method: PaymentMethod,
        notification: &InboundNotification,
    ) -> Option<Acknowledgement> {
        let provider = self.providers.get(method)?;
        let outcome = match self.reconcile(method, notification).await {
            Ok(result) => {
                PaymentMetrics::record_callback(method, result.label());
                AckOutcome::Accepted
            }
            Err(err) => {
                let outcome = match err.kind() {
                    ErrorKind::NotFound => AckOutcome::NotFound,
                    ErrorKind::Persistence => AckOutcome::Retry,
                    _ => AckOutcome::Rejected,
                };
                if outcome == AckOutcome::Retry {
                    tracing::error!(%method, error = %err, "Notification could not be applied");
                } else {
                    tracing::warn!(%method, error = %err, "Notification rejected");
                }
                PaymentMetrics::record_callback(method, err.code());
                outcome
            }
        };
        Some(provider.acknowledge(outcome))
    }

    /// Verify a notification and apply it.
    ///
    /// # Errors
    ///
    /// - [`CommerceError::UnsupportedPaymentMethod`] if no provider serves `method`
    /// - [`CommerceError::InvalidSignature`] / [`CommerceError::MalformedNotification`]
    /// - [`CommerceError::PaymentNotFound`] for an unknown payment number
    /// - [`CommerceError::AmountMismatch`] if the reported amount differs
    pub async fn reconcile(
        &self,
        method: PaymentMethod,
        notification: &InboundNotification,
    ) -> CommerceResult<Reconciliation> {
        let provider = self
            .providers
            .get(method)
            .ok_or_else(|| CommerceError::UnsupportedPaymentMethod(method.to_string()))?;
        let verified = provider
            .verify_notification(notification)
            .map_err(|e| match e {
                ProviderError::InvalidSignature => CommerceError::InvalidSignature,
                ProviderError::Malformed(detail) => CommerceError::MalformedNotification(detail),
                other => CommerceError::Provider(other.to_string()),
            })?;

        let now = self.clock.now();
        let mut uow = self.db.begin().await?;
        let payment = uow
            .lock_payment_by_number(verified.payment_number.clone())
            .await?
            .ok_or_else(|| CommerceError::PaymentNotFound(verified.payment_number.clone()))?;

        if !verified.paid {
            tracing::info!(
                payment_number = %payment.payment_number,
                trade_status = %verified.trade_status,
                "Non-terminal notification ignored"
            );
            return Ok(Reconciliation::NotPaid(verified.trade_status));
        }
        if let Some(reported) = verified.amount {
            if reported != payment.amount {
                return Err(CommerceError::AmountMismatch {
                    expected: payment.amount,
                    actual: reported,
                });
            }
        }

        match payment.status {
            PaymentStatus::Paid => {
                tracing::info!(payment_number = %payment.payment_number, "Duplicate paid notification");
                return Ok(Reconciliation::Duplicate);
            }
            PaymentStatus::Cancelled | PaymentStatus::Refunded => {
                tracing::error!(
                    payment_number = %payment.payment_number,
                    status = %payment.status,
                    provider_trade_no = ?verified.provider_trade_no,
                    "Provider reports payment for a closed payment, manual refund required"
                );
                return Ok(Reconciliation::Stale(payment.status));
            }
            PaymentStatus::Pending => {}
        }

        // The buyer paid through the other channel after a method switch;
        // record the channel that actually collected the money.
        if payment.method != method {
            tracing::warn!(
                payment_number = %payment.payment_number,
                recorded = %payment.method,
                notified_by = %method,
                "Paid notification from a provider other than the recorded method"
            );
            if !uow.switch_payment_method(payment.id, method, now).await? {
                return Ok(Reconciliation::Duplicate);
            }
        }

        if !transition_payment(uow.as_mut(), payment.id, PaymentStatus::Pending, PaymentStatus::Paid, now)
            .await?
        {
            return Ok(Reconciliation::Duplicate);
        }
        if !transition_order(uow.as_mut(), payment.order_id, OrderStatus::Pending, OrderStatus::Paid, now)
            .await?
        {
            tracing::warn!(
                order_id = %payment.order_id,
                payment_number = %payment.payment_number,
                "Order no longer pending when its payment succeeded, manual refund required"
            );
        }
        uow.commit().await?;

        PaymentMetrics::record_paid(payment.method);
        tracing::info!(
            payment_number = %payment.payment_number,
            order_id = %payment.order_id,
            provider_trade_no = ?verified.provider_trade_no,
            "Payment confirmed"
        );
        Ok(Reconciliation::Applied)
    }
}
