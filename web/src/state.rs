//! Application state shared by every handler.

use crate::auth::{JwtKeys, TokenRevocations};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use storefront_core::environment::Clock;
use storefront_core::store::Database;
use storefront_runtime::{CallbackReconciler, OrderService, PaymentService};

/// Services and auth material, cloned into each request.
///
/// # Examples
///
/// ```ignore
/// let state = AppState::new(orders, payments, reconciler, db, clock, keys)
///     .with_metrics(metrics_server.handle().cloned());
/// let app = storefront_web::router(state);
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Order operations
    pub orders: OrderService,
    /// Charge flow
    pub payments: PaymentService,
    /// Provider notification handling
    pub reconciler: CallbackReconciler,
    /// Used by the readiness probe
    pub db: Arc<dyn Database>,
    /// Time source for token expiry
    pub clock: Arc<dyn Clock>,
    /// Token signing keys
    pub jwt: Arc<JwtKeys>,
    /// Logged-out tokens
    pub revocations: Arc<TokenRevocations>,
    /// Prometheus renderer, `None` when metrics are disabled
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// State with an empty revocation list and metrics disabled.
    #[must_use]
    pub fn new(
        orders: OrderService,
        payments: PaymentService,
        reconciler: CallbackReconciler,
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        jwt: JwtKeys,
    ) -> Self {
        Self {
            orders,
            payments,
            reconciler,
            db,
            clock,
            jwt: Arc::new(jwt),
            revocations: Arc::new(TokenRevocations::new()),
            metrics: None,
        }
    }

    /// Share an existing revocation list, e.g. one also swept by a cleanup task.
    #[must_use]
    pub fn with_revocations(mut self, revocations: Arc<TokenRevocations>) -> Self {
        self.revocations = revocations;
        self
    }

    /// Expose metrics at `GET /metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }
}
