//! Order management: create, read, update and cancel.
//!
//! Every mutation runs in one unit of work. Creation reserves stock line by
//! line in submission order and the first failing line rolls back the whole
//! order, so no partial reservation is ever visible.

use crate::inventory::InventoryLedger;
use crate::metrics::{CancelReason, OrderMetrics};
use crate::transitions::transition_order;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use storefront_core::environment::Clock;
use storefront_core::error::CommerceResult;
use storefront_core::order::{
    DEFAULT_RESERVATION_WINDOW_SECS, NewOrder, Order, OrderItem, OrderStatus, OrderUpdate,
    order_number,
};
use storefront_core::store::{AddressDirectory, Database, UnitOfWork};
use storefront_core::{AddressId, CommerceError, Money, OrderId, StoreError, UserId};

/// Order operations.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<dyn Database>,
    addresses: Arc<dyn AddressDirectory>,
    clock: Arc<dyn Clock>,
    reservation_window: Duration,
}

impl OrderService {
    /// Service with the default 30 minute reservation window.
    #[must_use]
    pub fn new(
        db: Arc<dyn Database>,
        addresses: Arc<dyn AddressDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            addresses,
            clock,
            reservation_window: Duration::seconds(DEFAULT_RESERVATION_WINDOW_SECS),
        }
    }

    /// Override how long an unpaid order holds its stock.
    #[must_use]
    pub fn with_reservation_window(mut self, window: Duration) -> Self {
        self.reservation_window = window;
        self
    }

    /// Create a `pending` order, reserving stock for every line.
    ///
    /// # Errors
    ///
    /// - [`CommerceError::Validation`] for an empty order or a zero quantity
    /// - [`CommerceError::InvalidAddress`] / [`CommerceError::Forbidden`] for
    ///   a missing or foreign address
    /// - [`CommerceError::ProductNotFound`], [`CommerceError::ProductUnavailable`],
    ///   [`CommerceError::InsufficientStock`] or [`CommerceError::OutOfStock`]
    ///   for the first line that cannot be served
    /// - [`CommerceError::OrderCreationFailed`] if the order number collides
    pub async fn create(&self, owner: UserId, request: NewOrder) -> CommerceResult<Order> {
        if request.items.is_empty() {
            return Err(CommerceError::Validation(
                "Order must contain at least one item".into(),
            ));
        }
        if let Some(line) = request.items.iter().find(|line| line.quantity == 0) {
            return Err(CommerceError::Validation(format!(
                "Quantity for product {} must be at least 1",
                line.product_id
            )));
        }
        self.check_address(owner, request.address_id).await?;

        let now = self.clock.now();
        let mut order = Order {
            id: OrderId::new(),
            order_number: order_number(now, owner),
            owner,
            status: OrderStatus::Pending,
            total_amount: Money::ZERO,
            address_id: request.address_id,
            remark: request.remark,
            expires_at: now + self.reservation_window,
            created_at: now,
            updated_at: now,
            items: Vec::with_capacity(request.items.len()),
        };

        let mut uow = self.db.begin().await?;
        uow.insert_order(order.clone()).await.map_err(|e| match e {
            StoreError::UniqueViolation(detail) => CommerceError::OrderCreationFailed(format!(
                "order number {} already exists ({detail})",
                order.order_number
            )),
            other => CommerceError::Storage(other),
        })?;

        let mut total = Money::ZERO;
        for (position, line) in (0u32..).zip(&request.items) {
            let product = uow
                .find_product(line.product_id)
                .await?
                .ok_or(CommerceError::ProductNotFound(line.product_id))?;
            if !product.on_sale {
                return Err(CommerceError::ProductUnavailable(product.id));
            }
            if line.quantity > product.stock {
                OrderMetrics::record_reservation_failure();
                return Err(CommerceError::InsufficientStock {
                    product_id: product.id,
                    requested: line.quantity,
                    available: product.stock,
                });
            }
            InventoryLedger::reserve_in(uow.as_mut(), product.id, line.quantity).await?;

            let item = OrderItem {
                product_id: product.id,
                product_name: product.name,
                product_image: product.image_url,
                price: product.price,
                quantity: line.quantity,
            };
            total = item
                .line_total()
                .and_then(|line_total| total.checked_add(line_total))
                .ok_or_else(|| CommerceError::Validation("Order total is too large".into()))?;
            uow.insert_order_item(order.id, position, item.clone()).await?;
            order.items.push(item);
        }

        uow.set_order_total(order.id, total).await?;
        uow.commit().await?;
        order.total_amount = total;

        OrderMetrics::record_created();
        tracing::info!(
            order_id = %order.id,
            order_number = %order.order_number,
            owner = %owner,
            total = %total,
            items = order.items.len(),
            "Order created"
        );
        Ok(order)
    }

    /// Load an order owned by `requester`.
    ///
    /// # Errors
    ///
    /// [`CommerceError::OrderNotFound`] or [`CommerceError::Forbidden`].
    pub async fn get(&self, order_id: OrderId, requester: UserId) -> CommerceResult<Order> {
        let order = self
            .db
            .find_order(order_id)
            .await?
            .ok_or(CommerceError::OrderNotFound(order_id))?;
        ensure_owner(&order, requester)?;
        Ok(order)
    }

    /// Orders of `owner`, newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Persistence failures only.
    pub async fn list(
        &self,
        owner: UserId,
        status: Option<OrderStatus>,
    ) -> CommerceResult<Vec<Order>> {
        Ok(self.db.list_orders(owner, status).await?)
    }

    /// Change address and/or remark of a `pending` order.
    ///
    /// # Errors
    ///
    /// - [`CommerceError::Validation`] if nothing would change
    /// - [`CommerceError::OrderNotFound`] / [`CommerceError::Forbidden`]
    /// - [`CommerceError::InvalidAddress`] / [`CommerceError::Forbidden`] for the new address
    /// - [`CommerceError::InvalidState`] once the order has left `pending`
    pub async fn update(
        &self,
        order_id: OrderId,
        requester: UserId,
        update: OrderUpdate,
    ) -> CommerceResult<Order> {
        if update.is_empty() {
            return Err(CommerceError::Validation(
                "Provide an address_id or a remark to update".into(),
            ));
        }
        self.get(order_id, requester).await?;
        if let Some(address_id) = update.address_id {
            self.check_address(requester, address_id).await?;
        }

        let now = self.clock.now();
        let mut uow = self.db.begin().await?;
        let mut order = uow
            .lock_order(order_id)
            .await?
            .ok_or(CommerceError::OrderNotFound(order_id))?;
        let updated = uow
            .update_order_details(order_id, update.address_id, update.remark.clone(), now)
            .await?;
        if !updated {
            return Err(CommerceError::InvalidState {
                order_id,
                status: order.status,
                action: "update",
            });
        }
        uow.commit().await?;

        if let Some(address_id) = update.address_id {
            order.address_id = address_id;
        }
        if let Some(remark) = update.remark {
            order.remark = remark;
        }
        order.updated_at = now;
        tracing::info!(order_id = %order_id, owner = %requester, "Order updated");
        Ok(order)
    }

    /// Cancel a `pending` order and restore its stock.
    ///
    /// # Errors
    ///
    /// [`CommerceError::OrderNotFound`], [`CommerceError::Forbidden`], or
    /// [`CommerceError::InvalidState`] if the order is not `pending`.
    pub async fn cancel(&self, order_id: OrderId, requester: UserId) -> CommerceResult<Order> {
        let now = self.clock.now();
        let mut uow = self.db.begin().await?;
        let mut order = uow
            .lock_order(order_id)
            .await?
            .ok_or(CommerceError::OrderNotFound(order_id))?;
        ensure_owner(&order, requester)?;

        if order.status != OrderStatus::Pending || !cancel_in(uow.as_mut(), &order, now).await? {
            return Err(CommerceError::InvalidState {
                order_id,
                status: order.status,
                action: "cancel",
            });
        }
        uow.commit().await?;

        order.status = OrderStatus::Cancelled;
        order.updated_at = now;
        OrderMetrics::record_cancelled(CancelReason::User);
        tracing::info!(
            order_id = %order_id,
            order_number = %order.order_number,
            owner = %requester,
            "Order cancelled"
        );
        Ok(order)
    }

    async fn check_address(&self, owner: UserId, address_id: AddressId) -> CommerceResult<()> {
        match self.addresses.address_owner(address_id).await? {
            None => Err(CommerceError::InvalidAddress(address_id)),
            Some(address_owner) if address_owner != owner => Err(CommerceError::Forbidden(
                format!("Address {address_id} does not belong to user {owner}"),
            )),
            Some(_) => Ok(()),
        }
    }
}

fn ensure_owner(order: &Order, requester: UserId) -> CommerceResult<()> {
    if order.owner == requester {
        Ok(())
    } else {
        Err(CommerceError::Forbidden(format!(
            "Order {} does not belong to user {requester}",
            order.id
        )))
    }
}

/// Move a locked order `pending → cancelled` and release each line's stock.
///
/// Returns `false`, with nothing written, if the order was no longer `pending`.
/// Lines whose product has since been deleted are skipped with a warning.
pub(crate) async fn cancel_in(
    uow: &mut dyn UnitOfWork,
    order: &Order,
    at: DateTime<Utc>,
) -> CommerceResult<bool> {
    if !transition_order(uow, order.id, OrderStatus::Pending, OrderStatus::Cancelled, at).await? {
        return Ok(false);
    }
    for item in &order.items {
        match InventoryLedger::release_in(uow, item.product_id, item.quantity).await {
            Ok(()) => {}
            Err(CommerceError::ProductNotFound(product_id)) => {
                tracing::warn!(
                    order_id = %order.id,
                    %product_id,
                    quantity = item.quantity,
                    "Product gone, stock not restored"
                );
            }
            Err(other) => return Err(other),
        }
    }
    Ok(true)
}
