//! Shared wiring for runtime integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::sync::Arc;
use storefront_core::environment::Clock;
use std::time::Duration;
use storefront_core::order::{NewOrder, Order, OrderLine};
use storefront_core::payment::PaymentMethod;
use storefront_core::provider::ProviderRegistry;
use storefront_core::{AddressId, ProductId};
use storefront_runtime::retry::RetryPolicy;
use storefront_runtime::{
    CallbackReconciler, ExpirySweeper, OrderService, PaymentService, PaymentTimeoutReaper,
};
use storefront_testing::{InMemoryDatabase, ManualClock, MockProvider, fixtures, test_time};

pub struct Harness {
    pub db: InMemoryDatabase,
    pub clock: ManualClock,
    pub alipay: Arc<MockProvider>,
    pub wechat: Arc<MockProvider>,
    pub orders: OrderService,
    pub payments: PaymentService,
    pub reconciler: CallbackReconciler,
    pub sweeper: ExpirySweeper,
    pub reaper: PaymentTimeoutReaper,
}

impl Harness {
    pub async fn new() -> Self {
        storefront_testing::init_test_tracing();
        let db = InMemoryDatabase::new();
        fixtures::seed_catalog(&db).await;
        let clock = ManualClock::starting_at(test_time());
        let alipay = Arc::new(MockProvider::new(PaymentMethod::Alipay));
        let wechat = Arc::new(MockProvider::new(PaymentMethod::Wechat));
        let providers = Arc::new(
            ProviderRegistry::new()
                .with(alipay.clone())
                .with(wechat.clone()),
        );

        let shared = Arc::new(db.clone());
        let clock_arc = Arc::new(clock.clone());
        Self {
            orders: OrderService::new(shared.clone(), shared.clone(), clock_arc.clone()),
            payments: PaymentService::new(shared.clone(), providers.clone(), clock_arc.clone())
                .with_retry_policy(
                    RetryPolicy::builder()
                        .max_retries(2)
                        .initial_delay(Duration::from_millis(1))
                        .build(),
                ),
            reconciler: CallbackReconciler::new(shared.clone(), providers, clock_arc.clone()),
            sweeper: ExpirySweeper::new(shared.clone(), clock_arc.clone()).with_batch_size(2),
            reaper: PaymentTimeoutReaper::new(shared, clock_arc),
            db,
            clock,
            alipay,
            wechat,
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The reference order: 2 × widget (10.00) + 1 × gadget (5.00).
    pub async fn reference_order(&self) -> Order {
        self.orders
            .create(fixtures::BUYER, new_order(&[(fixtures::WIDGET, 2), (fixtures::GADGET, 1)]))
            .await
            .expect("reference order")
    }
}

pub fn new_order(lines: &[(ProductId, u32)]) -> NewOrder {
    new_order_at(fixtures::ADDRESS, lines)
}

pub fn new_order_at(address_id: AddressId, lines: &[(ProductId, u32)]) -> NewOrder {
    NewOrder {
        address_id,
        items: lines
            .iter()
            .map(|&(product_id, quantity)| OrderLine {
                product_id,
                quantity,
            })
            .collect(),
        remark: "leave at the door".into(),
    }
}
