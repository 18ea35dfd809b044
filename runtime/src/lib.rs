//! # Storefront Runtime
//!
//! Services implementing the order lifecycle and payment reconciliation core.
//!
//! ## Core Components
//!
//! - **[`InventoryLedger`]**: conditional stock reserve/release
//! - **[`OrderService`]**: create, get, list, update and cancel orders
//! - **[`PaymentService`]**: the charge flow and payment queries
//! - **[`CallbackReconciler`]**: applies provider notifications idempotently
//! - **[`ExpirySweeper`] / [`PaymentTimeoutReaper`]**: background jobs driven by [`JobRunner`]
//!
//! ## Example
//!
//! ```ignore
//! use storefront_runtime::{OrderService, PaymentService};
//!
//! let orders = OrderService::new(db.clone(), addresses, clock.clone());
//! let order = orders.create(user_id, new_order).await?;
//!
//! let payments = PaymentService::new(db, providers, clock);
//! let charged = payments
//!     .charge(user_id, order.id, order.total_amount, PaymentMethod::Alipay)
//!     .await?;
//! ```

/// Inventory ledger
pub mod inventory;

/// Background jobs and their runner
pub mod jobs;

/// Prometheus metrics for observability
pub mod metrics;

/// Order operations
pub mod orders;

/// Charge flow
pub mod payments;

/// Provider callback reconciliation
pub mod reconciler;

/// Retry logic with exponential backoff
pub mod retry;

/// State-machine checked status writes
pub mod transitions;

pub use inventory::InventoryLedger;
pub use jobs::{BackgroundJob, ExpirySweeper, JobRunner, PaymentTimeoutReaper, TickReport};
pub use orders::OrderService;
pub use payments::{ChargeOutcome, PaymentService};
pub use reconciler::{CallbackReconciler, Reconciliation};
