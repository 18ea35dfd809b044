//! Prometheus metrics for the order and payment lifecycle.
//!
//! [`MetricsServer`] installs the global recorder; the recorder structs below
//! are the only places that name metrics, so dashboards have a single source.
//!
//! # Example
//!
//! ```rust,no_run
//! use storefront_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new();
//! server.start()?;
//! let exposition = server.render();
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use storefront_core::payment::PaymentMethod;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder handle.
///
/// Rendering is done by the HTTP layer on `GET /metrics`.
#[derive(Default)]
pub struct MetricsServer {
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Not yet installed.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe every metric and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. A recorder
    /// that is already installed (several servers in one test binary) is
    /// tolerated and leaves [`handle`](Self::handle) empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Handle for rendering, if this instance installed the recorder.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!("storefront_orders_created_total", "Orders created");
    describe_counter!(
        "storefront_orders_cancelled_total",
        "Orders cancelled, labelled by reason (user, expired)"
    );
    describe_counter!(
        "storefront_stock_reservation_failures_total",
        "Stock reservations rejected for lack of stock"
    );
    describe_counter!(
        "storefront_payments_created_total",
        "Payments created, labelled by method"
    );
    describe_counter!(
        "storefront_payments_paid_total",
        "Payments confirmed by provider callbacks, labelled by method"
    );
    describe_counter!(
        "storefront_payments_timed_out_total",
        "Pending payments cancelled by the timeout reaper"
    );
    describe_counter!(
        "storefront_callbacks_total",
        "Provider notifications, labelled by provider and outcome"
    );
    describe_histogram!(
        "storefront_job_tick_duration_seconds",
        "Duration of one background job tick, labelled by job"
    );
    describe_counter!("storefront_retry_attempts_total", "Retries of transient failures");
    describe_counter!("storefront_retry_successes_total", "Operations that succeeded after retrying");
    describe_counter!("storefront_retry_exhausted_total", "Operations that ran out of retries");
}

/// Why an order was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// Owner asked for it
    User,
    /// Reservation window elapsed
    Expired,
}

impl CancelReason {
    /// Label value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Expired => "expired",
        }
    }
}

/// Order metrics recorder.
pub struct OrderMetrics;

impl OrderMetrics {
    /// Record an order creation.
    pub fn record_created() {
        counter!("storefront_orders_created_total").increment(1);
    }

    /// Record a cancellation.
    pub fn record_cancelled(reason: CancelReason) {
        counter!("storefront_orders_cancelled_total", "reason" => reason.as_str()).increment(1);
    }

    /// Record a rejected stock reservation.
    pub fn record_reservation_failure() {
        counter!("storefront_stock_reservation_failures_total").increment(1);
    }
}

/// Payment metrics recorder.
pub struct PaymentMetrics;

impl PaymentMetrics {
    /// Record a new pending payment.
    pub fn record_created(method: PaymentMethod) {
        counter!("storefront_payments_created_total", "method" => method.as_str()).increment(1);
    }

    /// Record a payment confirmed by its provider.
    pub fn record_paid(method: PaymentMethod) {
        counter!("storefront_payments_paid_total", "method" => method.as_str()).increment(1);
    }

    /// Record a payment cancelled by the reaper.
    pub fn record_timed_out() {
        counter!("storefront_payments_timed_out_total").increment(1);
    }

    /// Record a provider notification and how it was answered.
    pub fn record_callback(method: PaymentMethod, outcome: &'static str) {
        counter!(
            "storefront_callbacks_total",
            "provider" => method.as_str(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// Background job metrics recorder.
pub struct JobMetrics;

impl JobMetrics {
    /// Record one tick of `job`.
    pub fn record_tick(job: &'static str, duration: Duration) {
        histogram!("storefront_job_tick_duration_seconds", "job" => job)
            .record(duration.as_secs_f64());
    }
}
