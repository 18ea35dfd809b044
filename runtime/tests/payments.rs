//! Charge flow and callback reconciliation.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::Harness;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;
use storefront_core::order::OrderStatus;
use storefront_core::payment::{PaymentMethod, PaymentStatus};
use storefront_core::provider::{
    AckOutcome, Acknowledgement, ChargeAction, ChargeRequest, InboundNotification,
    PaymentProvider, ProviderError, ProviderRegistry, ProviderResult, VerifiedNotification,
};
use storefront_core::store::Database;
use storefront_core::task::TaskKind;
use storefront_core::{CommerceError, ErrorKind, Money};
use storefront_runtime::{PaymentService, Reconciliation};
use storefront_testing::{InMemoryDatabase, MockProvider};
use storefront_testing::fixtures::{BUYER, OTHER_BUYER};
use storefront_testing::provider::PAID_STATUS;

#[tokio::test]
async fn reference_scenario_charge_then_callback_twice() {
    let h = Harness::new().await;
    let order = h.reference_order().await;

    let charged = h
        .payments
        .charge(BUYER, order.id, Money::parse_decimal("25.00").unwrap(), PaymentMethod::Alipay)
        .await
        .unwrap();
    let payment = &charged.payment;
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.amount, Money::from_cents(2500));
    assert_eq!(payment.paid_at, None);
    assert!(!charged.reused);
    assert_eq!(
        charged.action,
        ChargeAction::Redirect {
            url: MockProvider::checkout_url(&payment.payment_number)
        }
    );
    let sent = h.alipay.charges();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].order_number, order.order_number);
    assert_eq!(sent[0].amount, Money::from_cents(2500));

    let notification =
        MockProvider::signed_notification(&payment.payment_number, PAID_STATUS, Some(payment.amount));
    h.clock.advance(chrono::Duration::minutes(2));
    let ack = h.reconciler.handle(PaymentMethod::Alipay, &notification).await.unwrap();
    assert_eq!((ack.status, ack.body.as_str()), (200, "success"));

    let paid = h.db.payment_by_number(&payment.payment_number).await.unwrap();
    assert_eq!(paid.status, PaymentStatus::Paid);
    let paid_at = paid.paid_at.expect("paid_at set");
    assert_eq!(
        h.orders.get(order.id, BUYER).await.unwrap().status,
        OrderStatus::Paid
    );

    h.clock.advance(chrono::Duration::minutes(5));
    let replay = h.reconciler.reconcile(PaymentMethod::Alipay, &notification).await;
    assert_eq!(replay, Ok(Reconciliation::Duplicate));
    let ack = h.reconciler.handle(PaymentMethod::Alipay, &notification).await.unwrap();
    assert_eq!(ack.status, 200);

    let after = h.db.payment_by_number(&payment.payment_number).await.unwrap();
    assert_eq!(after.status, PaymentStatus::Paid);
    assert_eq!(after.paid_at, Some(paid_at));
}

#[tokio::test]
async fn second_charge_reuses_the_pending_payment() {
    let h = Harness::new().await;
    let order = h.reference_order().await;

    let first = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap();
    let second = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap();

    assert_eq!(first.payment.payment_number, second.payment.payment_number);
    assert!(second.reused);
    assert_eq!(h.db.payments_for_order(order.id).await.len(), 1);
    assert_eq!(h.db.tasks().await.len(), 1);
}

#[tokio::test]
async fn reusing_with_another_method_switches_provider() {
    let h = Harness::new().await;
    let order = h.reference_order().await;

    let first = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap();
    let second = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Wechat)
        .await
        .unwrap();

    assert_eq!(first.payment.payment_number, second.payment.payment_number);
    assert_eq!(second.payment.method, PaymentMethod::Wechat);
    assert_eq!(h.wechat.charges().len(), 1);
    let stored = h.db.payment_by_number(&first.payment.payment_number).await.unwrap();
    assert_eq!(stored.method, PaymentMethod::Wechat);
}

#[tokio::test]
async fn concurrent_charges_create_one_pending_payment() {
    let h = Harness::new().await;
    let order = h.reference_order().await;

    let attempts = (0..5).map(|_| {
        let payments = h.payments.clone();
        let (order_id, amount) = (order.id, order.total_amount);
        tokio::spawn(async move {
            payments
                .charge(BUYER, order_id, amount, PaymentMethod::Alipay)
                .await
        })
    });
    let results = futures::future::join_all(attempts).await;

    let numbers: std::collections::HashSet<String> = results
        .into_iter()
        .map(|r| r.unwrap().unwrap().payment.payment_number)
        .collect();
    assert_eq!(numbers.len(), 1);
    assert_eq!(h.db.payments_for_order(order.id).await.len(), 1);
}

#[tokio::test]
async fn charge_validates_owner_amount_and_state() {
    let h = Harness::new().await;
    let order = h.reference_order().await;

    assert!(matches!(
        h.payments
            .charge(OTHER_BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
            .await,
        Err(CommerceError::Forbidden(_))
    ));
    assert_eq!(
        h.payments
            .charge(BUYER, order.id, Money::from_cents(2499), PaymentMethod::Alipay)
            .await,
        Err(CommerceError::AmountMismatch {
            expected: Money::from_cents(2500),
            actual: Money::from_cents(2499),
        })
    );
    let missing = storefront_core::OrderId::new();
    assert_eq!(
        h.payments
            .charge(BUYER, missing, order.total_amount, PaymentMethod::Alipay)
            .await,
        Err(CommerceError::OrderNotFound(missing))
    );

    h.orders.cancel(order.id, BUYER).await.unwrap();
    let err = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap_err();
    assert!(matches!(err, CommerceError::InvalidState { action: "charge", .. }));
    assert!(h.db.payments_for_order(order.id).await.is_empty());
}

#[tokio::test]
async fn charge_after_payment_resolved_is_rejected() {
    let h = Harness::new().await;
    let order = h.reference_order().await;
    let charged = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap();
    let notification =
        MockProvider::signed_notification(&charged.payment.payment_number, PAID_STATUS, None);
    h.reconciler.reconcile(PaymentMethod::Alipay, &notification).await.unwrap();

    let err = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap_err();
    assert_eq!(err, CommerceError::InvalidPaymentState(PaymentStatus::Paid));
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn provider_failure_leaves_no_local_state() {
    let h = Harness::new().await;
    let order = h.reference_order().await;
    h.alipay.fail_next_charges([ProviderError::Rejected {
        status: 400,
        message: "INVALID_PARAMETER".into(),
    }]);

    let err = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap_err();

    assert!(matches!(err, CommerceError::Provider(_)));
    assert_eq!(err.kind(), ErrorKind::ExternalDependency);
    assert!(h.db.payments_for_order(order.id).await.is_empty());
    assert!(h.db.tasks().await.is_empty());
    assert_eq!(h.alipay.charges().len(), 1);
}

#[tokio::test]
async fn transient_provider_failures_are_retried() {
    let h = Harness::new().await;
    let order = h.reference_order().await;
    h.alipay.fail_next_charges([
        ProviderError::Transport("connection reset".into()),
        ProviderError::Rejected {
            status: 503,
            message: "busy".into(),
        },
    ]);

    let charged = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap();

    assert_eq!(h.alipay.charges().len(), 3);
    assert_eq!(h.db.payments_for_order(order.id).await, vec![charged.payment]);
}

#[tokio::test]
async fn new_payment_schedules_its_timeout() {
    let h = Harness::new().await;
    let order = h.reference_order().await;

    let charged = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Wechat)
        .await
        .unwrap();

    let tasks = h.db.tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].task.kind, TaskKind::PaymentTimeout);
    assert_eq!(tasks[0].task.subject_id, *charged.payment.id.as_uuid());
    assert_eq!(
        tasks[0].task.due_at,
        charged.payment.created_at + chrono::Duration::minutes(15)
    );
}

#[tokio::test]
async fn payments_list_by_owner_and_status() {
    let h = Harness::new().await;
    let order = h.reference_order().await;
    h.payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap();

    assert_eq!(h.payments.list(BUYER, None).await.unwrap().len(), 1);
    assert_eq!(
        h.payments
            .list(BUYER, Some(PaymentStatus::Pending))
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(h.payments.list(BUYER, Some(PaymentStatus::Paid)).await.unwrap().is_empty());
    assert!(h.payments.list(OTHER_BUYER, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn unregistered_method_is_unsupported() {
    let h = Harness::new().await;
    let order = h.reference_order().await;
    let payments = storefront_runtime::PaymentService::new(
        std::sync::Arc::new(h.db.clone()),
        std::sync::Arc::new(storefront_core::provider::ProviderRegistry::new()),
        std::sync::Arc::new(h.clock.clone()),
    );

    let err = payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap_err();

    assert_eq!(err, CommerceError::UnsupportedPaymentMethod("alipay".into()));
    assert!(h.db.payments_for_order(order.id).await.is_empty());
}

/// Provider that opens a unit of work of its own while the charge is in flight.
struct StoreTouchingProvider {
    inner: MockProvider,
    db: InMemoryDatabase,
    store_was_free: AtomicBool,
}

impl PaymentProvider for StoreTouchingProvider {
    fn method(&self) -> PaymentMethod {
        self.inner.method()
    }

    fn create_charge(
        &self,
        request: ChargeRequest,
    ) -> Pin<Box<dyn Future<Output = ProviderResult<ChargeAction>> + Send + '_>> {
        Box::pin(async move {
            let begun = tokio::time::timeout(StdDuration::from_secs(1), self.db.begin()).await;
            self.store_was_free
                .store(matches!(begun, Ok(Ok(_))), Ordering::SeqCst);
            drop(begun);
            self.inner.create_charge(request).await
        })
    }

    fn verify_notification(
        &self,
        notification: &InboundNotification,
    ) -> ProviderResult<VerifiedNotification> {
        self.inner.verify_notification(notification)
    }

    fn acknowledge(&self, outcome: AckOutcome) -> Acknowledgement {
        self.inner.acknowledge(outcome)
    }
}

#[tokio::test]
async fn provider_is_called_without_holding_the_store() {
    let h = Harness::new().await;
    let order = h.reference_order().await;
    let provider = Arc::new(StoreTouchingProvider {
        inner: MockProvider::new(PaymentMethod::Alipay),
        db: h.db.clone(),
        store_was_free: AtomicBool::new(false),
    });
    let payments = PaymentService::new(
        Arc::new(h.db.clone()),
        Arc::new(ProviderRegistry::new().with(provider.clone())),
        Arc::new(h.clock.clone()),
    );

    let charged = payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap();

    assert!(provider.store_was_free.load(Ordering::SeqCst));
    assert_eq!(provider.inner.charges().len(), 1);
    let stored = h.db.payment_by_number(&charged.payment.payment_number).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn unsupported_method_on_a_pending_payment_changes_nothing() {
    let h = Harness::new().await;
    let order = h.reference_order().await;
    let charged = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap();
    let alipay_only = PaymentService::new(
        Arc::new(h.db.clone()),
        Arc::new(ProviderRegistry::new().with(h.alipay.clone())),
        Arc::new(h.clock.clone()),
    );

    let err = alipay_only
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Wechat)
        .await
        .unwrap_err();

    assert_eq!(err, CommerceError::UnsupportedPaymentMethod("wechat".into()));
    let stored = h.db.payment_by_number(&charged.payment.payment_number).await.unwrap();
    assert_eq!(stored.method, PaymentMethod::Alipay);
    assert_eq!(h.db.payments_for_order(order.id).await.len(), 1);
}

// ============================================================================
// Callback reconciliation
// ============================================================================

#[tokio::test]
async fn bad_signature_is_rejected_without_mutation() {
    let h = Harness::new().await;
    let order = h.reference_order().await;
    let charged = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap();
    let forged =
        MockProvider::unsigned_notification(&charged.payment.payment_number, PAID_STATUS, None);

    let ack = h.reconciler.handle(PaymentMethod::Alipay, &forged).await.unwrap();

    assert_eq!((ack.status, ack.body.as_str()), (400, "failure"));
    let stored = h.db.payment_by_number(&charged.payment.payment_number).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn notification_outcomes_map_to_acknowledgements() {
    let h = Harness::new().await;
    let order = h.reference_order().await;
    let charged = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap();
    let number = charged.payment.payment_number.clone();

    let unknown = MockProvider::signed_notification("nope", PAID_STATUS, None);
    assert_eq!(h.reconciler.handle(PaymentMethod::Alipay, &unknown).await.unwrap().status, 404);

    let waiting = MockProvider::signed_notification(&number, "WAIT_BUYER_PAY", None);
    assert_eq!(
        h.reconciler.reconcile(PaymentMethod::Alipay, &waiting).await,
        Ok(Reconciliation::NotPaid("WAIT_BUYER_PAY".into()))
    );
    assert_eq!(h.reconciler.handle(PaymentMethod::Alipay, &waiting).await.unwrap().status, 200);

    let short = MockProvider::signed_notification(&number, PAID_STATUS, Some(Money::from_cents(1)));
    assert_eq!(h.reconciler.handle(PaymentMethod::Alipay, &short).await.unwrap().status, 400);

    let mut garbled = MockProvider::signed_notification(&number, PAID_STATUS, None);
    garbled.body = b"{not json".to_vec();
    assert_eq!(h.reconciler.handle(PaymentMethod::Alipay, &garbled).await.unwrap().status, 400);

    let paid = MockProvider::signed_notification(&number, PAID_STATUS, None);
    h.db.fail_next_commits(1);
    assert_eq!(h.reconciler.handle(PaymentMethod::Alipay, &paid).await.unwrap().status, 500);

    let stored = h.db.payment_by_number(&number).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Pending);
    assert_eq!(h.reconciler.handle(PaymentMethod::Alipay, &paid).await.unwrap().status, 200);
}

#[tokio::test]
async fn payment_for_a_swept_order_is_recorded_but_order_stays_cancelled() {
    let h = Harness::new().await;
    let order = h.reference_order().await;
    let charged = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap();
    h.clock.advance(chrono::Duration::minutes(31));
    h.sweeper.run_once().await.unwrap();

    let notification =
        MockProvider::signed_notification(&charged.payment.payment_number, PAID_STATUS, None);
    let result = h.reconciler.reconcile(PaymentMethod::Alipay, &notification).await;

    assert_eq!(result, Ok(Reconciliation::Applied));
    let stored = h.db.payment_by_number(&charged.payment.payment_number).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Paid);
    assert_eq!(
        h.orders.get(order.id, BUYER).await.unwrap().status,
        OrderStatus::Cancelled
    );
}

#[tokio::test]
async fn paid_notification_records_the_collecting_method() {
    let h = Harness::new().await;
    let order = h.reference_order().await;
    let first = h
        .payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Alipay)
        .await
        .unwrap();
    h.payments
        .charge(BUYER, order.id, order.total_amount, PaymentMethod::Wechat)
        .await
        .unwrap();

    // The buyer finishes the earlier Alipay checkout instead.
    let notification =
        MockProvider::signed_notification(&first.payment.payment_number, PAID_STATUS, None);
    let result = h.reconciler.reconcile(PaymentMethod::Alipay, &notification).await;

    assert_eq!(result, Ok(Reconciliation::Applied));
    let stored = h.db.payment_by_number(&first.payment.payment_number).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Paid);
    assert_eq!(stored.method, PaymentMethod::Alipay);
    assert_eq!(
        h.orders.get(order.id, BUYER).await.unwrap().status,
        OrderStatus::Paid
    );
}

#[tokio::test]
async fn missing_provider_yields_no_acknowledgement() {
    let h = Harness::new().await;
    let reconciler = storefront_runtime::CallbackReconciler::new(
        std::sync::Arc::new(h.db.clone()),
        std::sync::Arc::new(storefront_core::provider::ProviderRegistry::new()),
        std::sync::Arc::new(h.clock.clone()),
    );
    let notification = MockProvider::signed_notification("x", PAID_STATUS, None);

    assert!(reconciler.handle(PaymentMethod::Wechat, &notification).await.is_none());
}
