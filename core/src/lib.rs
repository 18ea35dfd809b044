//! # Storefront Core
//!
//! Domain types and contracts for the order lifecycle and payment
//! reconciliation core of the storefront backend.
//!
//! ## Core Concepts
//!
//! - **Order**: header plus immutable line-item snapshots, moving through [`order::OrderStatus`]
//! - **Payment**: append-only charge attempt keyed to one order, see [`payment::PaymentStatus`]
//! - **Unit of work**: [`store::UnitOfWork`], a set of persistence operations that become
//!   visible together or not at all
//! - **Provider**: [`provider::PaymentProvider`], a third-party payment channel
//!
//! Everything that performs I/O is a trait here. Implementations live in
//! `storefront-postgres` (production), `storefront-testing` (in-memory) and
//! `storefront-payments` (provider adapters).
//!
//! ## Example
//!
//! ```ignore
//! use storefront_core::store::Database;
//!
//! async fn restore(db: &dyn Database, product: ProductId) -> Result<(), StoreError> {
//!     let mut uow = db.begin().await?;
//!     uow.release_stock(product, 2).await?;
//!     uow.commit().await
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod error;
pub mod order;
pub mod payment;
pub mod provider;
pub mod store;
pub mod task;
pub mod types;

pub use error::{CommerceError, ErrorKind, StoreError};
pub use types::{AddressId, Money, OrderId, PaymentId, ProductId, UserId};

/// Environment module - injected dependencies that are not persistence.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Production - uses system clock
    /// let clock = SystemClock;
    /// let created_at = clock.now();
    ///
    /// // Test - fixed time for deterministic tests
    /// let clock = storefront_testing::test_clock();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time source used in production.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
