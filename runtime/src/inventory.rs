//! Inventory ledger: conditional stock decrement and increment.
//!
//! Stock only moves through single-row conditional writes in the store
//! (`stock = stock - qty WHERE stock >= qty`), so concurrent reservations can
//! never drive a product negative or lose an update.

use crate::metrics::OrderMetrics;
use std::sync::Arc;
use storefront_core::store::{Database, UnitOfWork};
use storefront_core::{CommerceError, ProductId};
use storefront_core::error::CommerceResult;

/// Reserve and release stock.
#[derive(Clone)]
pub struct InventoryLedger {
    db: Arc<dyn Database>,
}

impl InventoryLedger {
    /// Ledger over `db`.
    #[must_use]
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Decrement stock of `product_id` by `quantity` in its own unit of work.
    ///
    /// # Errors
    ///
    /// [`CommerceError::OutOfStock`] if the product lacks stock or is not on
    /// sale, [`CommerceError::Validation`] for a zero quantity.
    pub async fn reserve(&self, product_id: ProductId, quantity: u32) -> CommerceResult<()> {
        let mut uow = self.db.begin().await?;
        Self::reserve_in(uow.as_mut(), product_id, quantity).await?;
        uow.commit().await?;
        Ok(())
    }

    /// Increment stock of `product_id` by `quantity` in its own unit of work.
    ///
    /// Not idempotent: callers release exactly once per reservation.
    ///
    /// # Errors
    ///
    /// [`CommerceError::ProductNotFound`] if the product no longer exists.
    pub async fn release(&self, product_id: ProductId, quantity: u32) -> CommerceResult<()> {
        let mut uow = self.db.begin().await?;
        Self::release_in(uow.as_mut(), product_id, quantity).await?;
        uow.commit().await?;
        Ok(())
    }

    /// [`reserve`](Self::reserve) inside an open unit of work.
    ///
    /// # Errors
    ///
    /// See [`reserve`](Self::reserve).
    pub async fn reserve_in(
        uow: &mut dyn UnitOfWork,
        product_id: ProductId,
        quantity: u32,
    ) -> CommerceResult<()> {
        if quantity == 0 {
            return Err(CommerceError::Validation("Quantity must be at least 1".into()));
        }
        if uow.reserve_stock(product_id, quantity).await? {
            tracing::debug!(%product_id, quantity, "Stock reserved");
            Ok(())
        } else {
            OrderMetrics::record_reservation_failure();
            Err(CommerceError::OutOfStock(product_id))
        }
    }

    /// [`release`](Self::release) inside an open unit of work.
    ///
    /// # Errors
    ///
    /// See [`release`](Self::release).
    pub async fn release_in(
        uow: &mut dyn UnitOfWork,
        product_id: ProductId,
        quantity: u32,
    ) -> CommerceResult<()> {
        if uow.release_stock(product_id, quantity).await? {
            tracing::debug!(%product_id, quantity, "Stock released");
            Ok(())
        } else {
            Err(CommerceError::ProductNotFound(product_id))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use storefront_testing::{InMemoryDatabase, fixtures};

    async fn ledger() -> (InventoryLedger, InMemoryDatabase) {
        let db = InMemoryDatabase::new();
        fixtures::seed_catalog(&db).await;
        (InventoryLedger::new(Arc::new(db.clone())), db)
    }

    #[tokio::test]
    async fn reserve_decrements_and_release_restores() {
        let (ledger, db) = ledger().await;

        ledger.reserve(fixtures::WIDGET, 4).await.unwrap();
        assert_eq!(db.stock(fixtures::WIDGET).await, Some(6));

        ledger.release(fixtures::WIDGET, 4).await.unwrap();
        assert_eq!(db.stock(fixtures::WIDGET).await, Some(10));
    }

    #[tokio::test]
    async fn reserving_more_than_stock_fails_without_change() {
        let (ledger, db) = ledger().await;

        let err = ledger.reserve(fixtures::GADGET, 6).await.unwrap_err();
        assert_eq!(err, CommerceError::OutOfStock(fixtures::GADGET));
        assert_eq!(db.stock(fixtures::GADGET).await, Some(5));
    }

    #[tokio::test]
    async fn products_off_sale_cannot_be_reserved() {
        let (ledger, _db) = ledger().await;

        let err = ledger.reserve(fixtures::RELIC, 1).await.unwrap_err();
        assert_eq!(err, CommerceError::OutOfStock(fixtures::RELIC));
    }

    #[tokio::test]
    async fn zero_quantity_is_rejected() {
        let (ledger, _db) = ledger().await;
        assert!(matches!(
            ledger.reserve(fixtures::WIDGET, 0).await,
            Err(CommerceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn releasing_an_unknown_product_fails() {
        let (ledger, _db) = ledger().await;
        assert_eq!(
            ledger.release(ProductId::new(999), 1).await,
            Err(CommerceError::ProductNotFound(ProductId::new(999)))
        );
    }
}
