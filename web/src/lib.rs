//! HTTP surface for the storefront.
//!
//! Thin Axum shell over the runtime services: handlers extract the caller
//! and the request body, call one service operation and map the result.
//!
//! # Routes
//!
//! | method | path | auth |
//! |---|---|---|
//! | GET | `/health`, `/health/ready`, `/metrics` | no |
//! | POST, GET | `/orders` | bearer |
//! | GET, PUT | `/orders/:id` | bearer |
//! | POST | `/orders/:id/cancel` | bearer |
//! | POST, GET | `/payments` | bearer |
//! | POST | `/payments/callback` (Alipay) | provider signature |
//! | POST | `/payments/wechat/callback` | provider signature |
//! | POST | `/logout` | bearer |
//!
//! # Example
//!
//! ```ignore
//! use storefront_web::{AppState, router};
//!
//! let app = router(AppState::new(orders, payments, reconciler, db, clock, keys));
//! axum::serve(listener, app).await?;
//! ```

pub mod auth;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod state;

pub use auth::{AuthUser, JwtKeys, TokenRevocations};
pub use error::AppError;
pub use middleware::{CORRELATION_ID_HEADER, CorrelationId, correlation_id_layer};
pub use state::AppState;

use axum::{
    Router,
    routing::{get, post},
};
use handlers::{callbacks, health, orders, payments, session};
use tower_http::trace::TraceLayer;

/// Full application router.
pub fn router(state: AppState) -> Router {
    let buyer = Router::new()
        .route("/orders", post(orders::create).get(orders::list))
        .route("/orders/:id", get(orders::get).put(orders::update))
        .route("/orders/:id/cancel", post(orders::cancel))
        .route("/payments", post(payments::charge).get(payments::list))
        .route("/logout", post(session::logout))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    let public = Router::new()
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness))
        .route("/metrics", get(health::metrics))
        .route("/payments/callback", post(callbacks::alipay))
        .route("/payments/wechat/callback", post(callbacks::wechat));

    Router::new()
        .merge(buyer)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .layer(correlation_id_layer())
        .with_state(state)
}
