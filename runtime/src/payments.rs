//! Charge flow and payment queries.
//!
//! A charge either reuses the order's pending payment or creates one and
//! schedules its timeout, and asks the provider for a redirect or QR
//! payload. The order is validated first and the locks are released for the
//! provider call; writes happen afterwards in a second unit of work that
//! re-checks the order. A provider failure therefore leaves no local trace
//! and the whole request can be retried.

use crate::metrics::PaymentMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use chrono::Duration;
use std::sync::Arc;
use storefront_core::environment::Clock;
use storefront_core::error::CommerceResult;
use storefront_core::order::{Order, OrderStatus};
use storefront_core::payment::{DEFAULT_PAYMENT_TIMEOUT_SECS, Payment, PaymentMethod, PaymentStatus};
use storefront_core::provider::{ChargeAction, ChargeRequest, ProviderError, ProviderRegistry};
use storefront_core::store::{Database, UnitOfWork};
use storefront_core::task::TaskKind;
use storefront_core::{CommerceError, Money, OrderId, StoreError, UserId};

/// Result of a successful charge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChargeOutcome {
    /// The pending payment, new or reused
    pub payment: Payment,
    /// What the buyer must do next
    pub action: ChargeAction,
    /// Whether an existing pending payment was reused
    pub reused: bool,
}

/// Payment operations.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<dyn Database>,
    providers: Arc<ProviderRegistry>,
    clock: Arc<dyn Clock>,
    payment_timeout: Duration,
    retry: RetryPolicy,
}

impl PaymentService {
    /// Service with the default 15 minute payment timeout.
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
            payment_timeout: Duration::seconds(DEFAULT_PAYMENT_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }

    /// Override how long a payment may stay pending.
    #[must_use]
    pub fn with_payment_timeout(mut self, timeout: Duration) -> Self {
        self.payment_timeout = timeout;
        self
    }

    /// Override the retry policy for transient provider failures.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Start or resume paying `order_id` through `method`.
    ///
    /// # Errors
    ///
    /// - [`CommerceError::OrderNotFound`] / [`CommerceError::Forbidden`]
    /// - [`CommerceError::AmountMismatch`] if `amount` is not the order total
    /// - [`CommerceError::InvalidPaymentState`] if the order's payment is no longer pending
    /// - [`CommerceError::InvalidState`] if the order is no longer pending
    /// - [`CommerceError::UnsupportedPaymentMethod`] if no provider serves `method`
    /// - [`CommerceError::Provider`] if the provider call fails
    pub async fn charge(
        &self,
        requester: UserId,
        order_id: OrderId,
        amount: Money,
        method: PaymentMethod,
    ) -> CommerceResult<ChargeOutcome> {
        match self.try_charge(requester, order_id, amount, method).await {
            // A concurrent charge inserted the pending payment first; the
            // second pass finds and reuses it.
            Err(CommerceError::Storage(StoreError::UniqueViolation(detail))) => {
                tracing::debug!(%order_id, %detail, "Concurrent charge detected, retrying");
                self.try_charge(requester, order_id, amount, method).await
            }
            other => other,
        }
    }

    async fn try_charge(
        &self,
        requester: UserId,
        order_id: OrderId,
        amount: Money,
        method: PaymentMethod,
    ) -> CommerceResult<ChargeOutcome> {
        let provider = self
            .providers
            .get(method)
            .ok_or_else(|| CommerceError::UnsupportedPaymentMethod(method.to_string()))?;
        let now = self.clock.now();

        // Validate and pick the payment number, then release the locks
        // before talking to the provider.
        let (order, planned) = {
            let mut uow = self.db.begin().await?;
            Self::chargeable(uow.as_mut(), requester, order_id, amount).await?
        };
        let payment = planned
            .clone()
            .unwrap_or_else(|| Payment::pending(order_id, requester, amount, method, now));

        let request = ChargeRequest {
            payment_number: payment.payment_number.clone(),
            order_number: order.order_number.clone(),
            amount: payment.amount,
            subject: format!("Order {}", order.order_number),
        };
        let action = retry_with_predicate(
            self.retry.clone(),
            || provider.create_charge(request.clone()),
            ProviderError::is_transient,
        )
        .await
        .map_err(|e| CommerceError::Provider(e.to_string()))?;

        // Re-check under lock; the order may have moved while the provider answered.
        let mut uow = self.db.begin().await?;
        let (_, current) = Self::chargeable(uow.as_mut(), requester, order_id, amount).await?;
        let (payment, reused) = match (planned, current) {
            (Some(planned), Some(mut existing)) if planned.id == existing.id => {
                if existing.method != method {
                    if !uow.switch_payment_method(existing.id, method, now).await? {
                        return Err(CommerceError::InvalidPaymentState(existing.status));
                    }
                    existing.method = method;
                    existing.updated_at = now;
                }
                (existing, true)
            }
            (None, None) => {
                uow.insert_payment(payment.clone()).await?;
                uow.schedule_task(
                    TaskKind::PaymentTimeout,
                    *payment.id.as_uuid(),
                    now + self.payment_timeout,
                )
                .await?;
                (payment, false)
            }
            // Another charge created or replaced the pending payment meanwhile.
            _ => {
                return Err(CommerceError::Storage(StoreError::UniqueViolation(format!(
                    "pending payment of order {order_id} changed during charge"
                ))));
            }
        };
        uow.commit().await?;

        if !reused {
            PaymentMetrics::record_created(method);
        }
        tracing::info!(
            order_id = %order_id,
            payment_number = %payment.payment_number,
            method = %method,
            reused,
            "Charge started"
        );
        Ok(ChargeOutcome {
            payment,
            action,
            reused,
        })
    }

    /// Lock the order and its latest payment and check the charge is allowed.
    async fn chargeable(
        uow: &mut dyn UnitOfWork,
        requester: UserId,
        order_id: OrderId,
        amount: Money,
    ) -> CommerceResult<(Order, Option<Payment>)> {
        let order = uow
            .lock_order(order_id)
            .await?
            .ok_or(CommerceError::OrderNotFound(order_id))?;
        if order.owner != requester {
            return Err(CommerceError::Forbidden(format!(
                "Order {order_id} does not belong to user {requester}"
            )));
        }
        if amount != order.total_amount {
            return Err(CommerceError::AmountMismatch {
                expected: order.total_amount,
                actual: amount,
            });
        }

        let latest = uow.latest_payment_for_order(order_id).await?;
        if let Some(existing) = latest.as_ref().filter(|p| p.status != PaymentStatus::Pending) {
            return Err(CommerceError::InvalidPaymentState(existing.status));
        }
        if order.status != OrderStatus::Pending {
            return Err(CommerceError::InvalidState {
                order_id,
                status: order.status,
                action: "charge",
            });
        }
        Ok((order, latest))
    }

    /// Payments of `owner`, newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Persistence failures only.
    pub async fn list(
        &self,
        owner: UserId,
        status: Option<PaymentStatus>,
    ) -> CommerceResult<Vec<Payment>> {
        Ok(self.db.list_payments(owner, status).await?)
    }
}
