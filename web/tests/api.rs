//! End-to-end HTTP tests over the in-memory database.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use chrono::Duration;
use serde_json::{Value, json};
use std::sync::Arc;
use storefront_core::payment::PaymentMethod;
use storefront_core::provider::ProviderRegistry;
use storefront_core::Money;
use storefront_runtime::{CallbackReconciler, OrderService, PaymentService};
use storefront_testing::{InMemoryDatabase, MockProvider, fixtures, test_clock, test_time};
use storefront_web::{AppState, CORRELATION_ID_HEADER, JwtKeys, router};

const SECRET: &[u8] = b"web-tests-secret-of-sufficient-length";

struct App {
    server: TestServer,
    db: InMemoryDatabase,
    buyer: String,
    other: String,
}

async fn app() -> App {
    storefront_testing::init_test_tracing();
    let db = InMemoryDatabase::new();
    fixtures::seed_catalog(&db).await;
    let shared = Arc::new(db.clone());
    let clock = Arc::new(test_clock());
    let providers = Arc::new(
        ProviderRegistry::new().with(Arc::new(MockProvider::new(PaymentMethod::Alipay))),
    );

    let state = AppState::new(
        OrderService::new(shared.clone(), shared.clone(), clock.clone()),
        PaymentService::new(shared.clone(), providers.clone(), clock.clone()),
        CallbackReconciler::new(shared.clone(), providers, clock.clone()),
        shared,
        clock,
        JwtKeys::from_secret(SECRET),
    );
    let keys = JwtKeys::from_secret(SECRET);
    App {
        server: TestServer::new(router(state)).expect("test server"),
        db,
        buyer: keys
            .issue(fixtures::BUYER, "ada", "buyer", test_time())
            .unwrap(),
        other: keys
            .issue(fixtures::OTHER_BUYER, "grace", "buyer", test_time())
            .unwrap(),
    }
}

fn reference_order() -> Value {
    json!({
        "address_id": fixtures::ADDRESS,
        "items": [
            { "product_id": fixtures::WIDGET, "quantity": 2 },
            { "product_id": fixtures::GADGET, "quantity": 1 },
        ],
        "remark": "leave at the door",
    })
}

async fn create_order(app: &App) -> Value {
    let response = app
        .server
        .post("/orders")
        .authorization_bearer(&app.buyer)
        .json(&reference_order())
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    response.json()
}

#[tokio::test]
async fn health_endpoints_need_no_token() {
    let app = app().await;

    let live = app.server.get("/health").await;
    assert_eq!(live.status_code(), StatusCode::OK);
    assert_eq!(live.json::<Value>()["status"], "ok");

    let ready = app.server.get("/health/ready").await;
    assert_eq!(ready.status_code(), StatusCode::OK);

    assert_eq!(app.server.get("/metrics").await.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn responses_carry_a_correlation_id() {
    let app = app().await;

    let response = app.server.get("/health").await;

    assert!(response.maybe_header(CORRELATION_ID_HEADER).is_some());
}

#[tokio::test]
async fn buyer_routes_require_a_valid_token() {
    let app = app().await;

    let missing = app.server.get("/orders").await;
    assert_eq!(missing.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(missing.json::<Value>()["code"], "UNAUTHORIZED");

    let forged = JwtKeys::from_secret(b"another-secret")
        .issue(fixtures::BUYER, "ada", "buyer", test_time())
        .unwrap();
    let rejected = app.server.get("/orders").authorization_bearer(forged).await;
    assert_eq!(rejected.status_code(), StatusCode::UNAUTHORIZED);

    let expired = JwtKeys::from_secret(SECRET)
        .issue(fixtures::BUYER, "ada", "buyer", test_time() - Duration::days(2))
        .unwrap();
    let stale = app.server.get("/orders").authorization_bearer(expired).await;
    assert_eq!(stale.status_code(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn tokens_near_expiry_are_renewed() {
    let app = app().await;
    let aging = JwtKeys::from_secret(SECRET)
        .issue(fixtures::BUYER, "ada", "buyer", test_time() - Duration::hours(13))
        .unwrap();

    let fresh = app.server.get("/orders").authorization_bearer(&app.buyer).await;
    assert!(fresh.maybe_header("authorization").is_none());

    let renewed = app.server.get("/orders").authorization_bearer(aging).await;
    assert_eq!(renewed.status_code(), StatusCode::OK);
    let header = renewed.header("authorization");
    let token = header.to_str().unwrap().strip_prefix("Bearer ").unwrap();
    let user = JwtKeys::from_secret(SECRET).verify(token, test_time()).unwrap();
    assert_eq!(user.user_id, fixtures::BUYER);
    assert_eq!(user.expires_at, test_time() + Duration::hours(24));
}

#[tokio::test]
async fn logout_revokes_the_token() {
    let app = app().await;

    let logout = app.server.post("/logout").authorization_bearer(&app.buyer).await;
    assert_eq!(logout.status_code(), StatusCode::NO_CONTENT);

    let after = app.server.get("/orders").authorization_bearer(&app.buyer).await;
    assert_eq!(after.status_code(), StatusCode::UNAUTHORIZED);
    let other = app.server.get("/orders").authorization_bearer(&app.other).await;
    assert_eq!(other.status_code(), StatusCode::OK);
}

#[tokio::test]
async fn order_lifecycle_over_http() {
    let app = app().await;

    let order = create_order(&app).await;
    assert_eq!(order["status"], "pending");
    assert_eq!(order["total_amount"], "25.00");
    assert_eq!(order["items"].as_array().unwrap().len(), 2);
    assert_eq!(app.db.stock(fixtures::WIDGET).await, Some(8));
    let id = order["id"].as_str().unwrap().to_string();

    let fetched = app
        .server
        .get(&format!("/orders/{id}"))
        .authorization_bearer(&app.buyer)
        .await;
    assert_eq!(fetched.json::<Value>()["order_number"], order["order_number"]);

    let updated = app
        .server
        .put(&format!("/orders/{id}"))
        .authorization_bearer(&app.buyer)
        .json(&json!({ "remark": "ring twice" }))
        .await;
    assert_eq!(updated.status_code(), StatusCode::OK);
    assert_eq!(updated.json::<Value>()["remark"], "ring twice");

    let listed = app
        .server
        .get("/orders")
        .add_query_param("status", "pending")
        .authorization_bearer(&app.buyer)
        .await;
    assert_eq!(listed.json::<Value>().as_array().unwrap().len(), 1);

    let cancelled = app
        .server
        .post(&format!("/orders/{id}/cancel"))
        .authorization_bearer(&app.buyer)
        .await;
    assert_eq!(cancelled.json::<Value>()["status"], "cancelled");
    assert_eq!(app.db.stock(fixtures::WIDGET).await, Some(10));

    let again = app
        .server
        .post(&format!("/orders/{id}/cancel"))
        .authorization_bearer(&app.buyer)
        .await;
    assert_eq!(again.status_code(), StatusCode::CONFLICT);
    assert_eq!(again.json::<Value>()["code"], "INVALID_STATE");
}

#[tokio::test]
async fn domain_errors_map_to_http_statuses() {
    let app = app().await;
    let order = create_order(&app).await;
    let id = order["id"].as_str().unwrap();

    let foreign = app
        .server
        .get(&format!("/orders/{id}"))
        .authorization_bearer(&app.other)
        .await;
    assert_eq!(foreign.status_code(), StatusCode::FORBIDDEN);

    let missing = app
        .server
        .get(&format!("/orders/{}", uuid::Uuid::new_v4()))
        .authorization_bearer(&app.buyer)
        .await;
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(missing.json::<Value>()["code"], "ORDER_NOT_FOUND");

    let greedy = app
        .server
        .post("/orders")
        .authorization_bearer(&app.buyer)
        .json(&json!({
            "address_id": fixtures::ADDRESS,
            "items": [{ "product_id": fixtures::GADGET, "quantity": 50 }],
        }))
        .await;
    assert_eq!(greedy.status_code(), StatusCode::CONFLICT);
    assert_eq!(greedy.json::<Value>()["code"], "INSUFFICIENT_STOCK");

    let empty = app
        .server
        .post("/orders")
        .authorization_bearer(&app.buyer)
        .json(&json!({ "address_id": fixtures::ADDRESS, "items": [] }))
        .await;
    assert_eq!(empty.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

    let bad_filter = app
        .server
        .get("/orders")
        .add_query_param("status", "lost")
        .authorization_bearer(&app.buyer)
        .await;
    assert_eq!(bad_filter.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn charge_then_paid_callback() {
    let app = app().await;
    let order = create_order(&app).await;
    let order_id = order["id"].as_str().unwrap().to_string();

    let charge = app
        .server
        .post("/payments")
        .authorization_bearer(&app.buyer)
        .json(&json!({ "order_id": order_id, "amount": "25.00", "method": "alipay" }))
        .await;
    assert_eq!(charge.status_code(), StatusCode::CREATED);
    let charge: Value = charge.json();
    assert_eq!(charge["action"]["type"], "redirect");
    assert_eq!(charge["payment"]["status"], "pending");
    let payment_number = charge["payment"]["payment_number"].as_str().unwrap().to_string();

    let again = app
        .server
        .post("/payments")
        .authorization_bearer(&app.buyer)
        .json(&json!({ "order_id": order_id, "amount": 25, "method": "alipay" }))
        .await;
    assert_eq!(again.status_code(), StatusCode::OK);
    assert_eq!(again.json::<Value>()["payment"]["payment_number"], payment_number.as_str());

    let notification = MockProvider::signed_notification(
        &payment_number,
        storefront_testing::provider::PAID_STATUS,
        Some(Money::from_cents(2500)),
    );
    let ack = app
        .server
        .post("/payments/callback")
        .add_header(
            HeaderName::from_static(storefront_testing::provider::SIGNATURE_HEADER),
            HeaderValue::from_static("valid"),
        )
        .content_type("application/json")
        .bytes(notification.body.into())
        .await;
    assert_eq!(ack.status_code(), StatusCode::OK);
    assert_eq!(ack.text(), "success");

    let paid = app
        .server
        .get(&format!("/orders/{order_id}"))
        .authorization_bearer(&app.buyer)
        .await;
    assert_eq!(paid.json::<Value>()["status"], "paid");

    let payments = app
        .server
        .get("/payments")
        .add_query_param("status", "paid")
        .authorization_bearer(&app.buyer)
        .await;
    assert_eq!(payments.json::<Value>().as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn charge_validation_errors() {
    let app = app().await;
    let order = create_order(&app).await;
    let order_id = order["id"].as_str().unwrap();

    let wrong_amount = app
        .server
        .post("/payments")
        .authorization_bearer(&app.buyer)
        .json(&json!({ "order_id": order_id, "amount": "24.99", "method": "alipay" }))
        .await;
    assert_eq!(wrong_amount.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(wrong_amount.json::<Value>()["code"], "AMOUNT_MISMATCH");

    for method in ["paypal", "wechat"] {
        let unsupported = app
            .server
            .post("/payments")
            .authorization_bearer(&app.buyer)
            .json(&json!({ "order_id": order_id, "amount": "25.00", "method": method }))
            .await;
        assert_eq!(unsupported.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            unsupported.json::<Value>()["code"],
            "UNSUPPORTED_PAYMENT_METHOD"
        );
    }
}

#[tokio::test]
async fn callback_failures_use_provider_acknowledgements() {
    let app = app().await;

    let unsigned = app
        .server
        .post("/payments/callback")
        .content_type("application/json")
        .bytes(
            MockProvider::unsigned_notification("nope", "SUCCESS", None)
                .body
                .into(),
        )
        .await;
    assert_eq!(unsigned.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(unsigned.text(), "failure");

    let unknown = app
        .server
        .post("/payments/callback")
        .add_header(
            HeaderName::from_static(storefront_testing::provider::SIGNATURE_HEADER),
            HeaderValue::from_static("valid"),
        )
        .bytes(
            MockProvider::signed_notification("unknown-payment", "SUCCESS", None)
                .body
                .into(),
        )
        .await;
    assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);

    let unconfigured = app.server.post("/payments/wechat/callback").await;
    assert_eq!(unconfigured.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(unconfigured.json::<Value>()["code"], "NOT_FOUND");
}

#[tokio::test]
async fn orders_are_scoped_to_their_owner() {
    let app = app().await;
    create_order(&app).await;

    let theirs = app.server.get("/orders").authorization_bearer(&app.other).await;

    assert!(theirs.json::<Value>().as_array().unwrap().is_empty());
}
