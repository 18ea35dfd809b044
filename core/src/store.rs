//! Persistence contracts.
//!
//! [`Database`] hands out [`UnitOfWork`]s: everything done through one unit
//! becomes visible on [`UnitOfWork::commit`], and dropping it uncommitted
//! discards every write. Status changes are conditional writes keyed on the
//! expected current status, returning `false` when another actor got there
//! first.
//!
//! # Implementations
//!
//! - `PgDatabase` (in `storefront-postgres`): sqlx transactions
//! - `InMemoryDatabase` (in `storefront-testing`): serialized, copy-on-begin state
//!
//! # Dyn Compatibility
//!
//! Methods return boxed futures instead of `async fn` so services can hold
//! `Arc<dyn Database>` and `Box<dyn UnitOfWork>`.

use crate::error::StoreError;
use crate::order::{Order, OrderItem, OrderStatus};
use crate::payment::{Payment, PaymentMethod, PaymentStatus};
use crate::task::{ScheduledTask, TaskKind};
use crate::types::{AddressId, Money, OrderId, PaymentId, ProductId, UserId};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Boxed, sendable future returned by store methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Catalog view of a product, as needed by order creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProductRecord {
    /// Product identity
    pub id: ProductId,
    /// Display name
    pub name: String,
    /// Image URL
    pub image_url: String,
    /// Current unit price
    pub price: Money,
    /// Units in stock
    pub stock: u32,
    /// Whether the product may be sold
    pub on_sale: bool,
}

/// Entry point to persistence.
pub trait Database: Send + Sync {
    /// Open a new unit of work.
    fn begin(&self) -> BoxFuture<'_, StoreResult<Box<dyn UnitOfWork>>>;

    /// Load an order with its items.
    fn find_order(&self, id: OrderId) -> BoxFuture<'_, StoreResult<Option<Order>>>;

    /// Orders of `owner`, newest first, optionally filtered by status.
    fn list_orders(
        &self,
        owner: UserId,
        status: Option<OrderStatus>,
    ) -> BoxFuture<'_, StoreResult<Vec<Order>>>;

    /// Payments of `owner`, newest first, optionally filtered by status.
    fn list_payments(
        &self,
        owner: UserId,
        status: Option<PaymentStatus>,
    ) -> BoxFuture<'_, StoreResult<Vec<Payment>>>;

    /// Pending orders whose `expires_at` is strictly before `now`, oldest
    /// first, leaving out the ids in `skip`.
    fn expired_orders(
        &self,
        now: DateTime<Utc>,
        skip: Vec<OrderId>,
        limit: usize,
    ) -> BoxFuture<'_, StoreResult<Vec<OrderId>>>;

    /// Ids of uncompleted tasks of `kind` due at or before `now`, oldest first.
    fn due_tasks(
        &self,
        kind: TaskKind,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, StoreResult<Vec<i64>>>;

    /// Record a failed task execution and push it back to `retry_at`.
    ///
    /// Runs outside any unit of work because the failed one was rolled back.
    fn record_task_failure(
        &self,
        task_id: i64,
        error: String,
        retry_at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<()>>;

    /// Cheap connectivity check for readiness probes.
    fn ping(&self) -> BoxFuture<'_, StoreResult<()>>;
}

/// An atomic unit of work. Dropping it without [`commit`](Self::commit) rolls back.
pub trait UnitOfWork: Send {
    // ------------------------------------------------------------------
    // Catalog / inventory
    // ------------------------------------------------------------------

    /// Read a product.
    fn find_product(&mut self, id: ProductId) -> BoxFuture<'_, StoreResult<Option<ProductRecord>>>;

    /// Decrement stock by `quantity` if the product is on sale and has at
    /// least that much. Returns `false` when no row qualified.
    fn reserve_stock(&mut self, id: ProductId, quantity: u32) -> BoxFuture<'_, StoreResult<bool>>;

    /// Increment stock by `quantity`. Returns `false` if the product is gone.
    fn release_stock(&mut self, id: ProductId, quantity: u32) -> BoxFuture<'_, StoreResult<bool>>;

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    /// Insert an order header. Items are inserted with [`insert_order_item`](Self::insert_order_item).
    ///
    /// A duplicate order number yields [`StoreError::UniqueViolation`].
    fn insert_order(&mut self, order: Order) -> BoxFuture<'_, StoreResult<()>>;

    /// Append a line item; `position` keeps submission order.
    fn insert_order_item(
        &mut self,
        order_id: OrderId,
        position: u32,
        item: OrderItem,
    ) -> BoxFuture<'_, StoreResult<()>>;

    /// Persist the computed total on a pending order.
    fn set_order_total(&mut self, id: OrderId, total: Money) -> BoxFuture<'_, StoreResult<()>>;

    /// Load an order with its items and lock it for the rest of the unit.
    fn lock_order(&mut self, id: OrderId) -> BoxFuture<'_, StoreResult<Option<Order>>>;

    /// `from → to` if the order is still `from`.
    fn transition_order(
        &mut self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<bool>>;

    /// Change address and/or remark while the order is still `pending`.
    fn update_order_details(
        &mut self,
        id: OrderId,
        address_id: Option<AddressId>,
        remark: Option<String>,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<bool>>;

    // ------------------------------------------------------------------
    // Payments
    // ------------------------------------------------------------------

    /// Most recent payment of an order, locked.
    fn latest_payment_for_order(
        &mut self,
        order_id: OrderId,
    ) -> BoxFuture<'_, StoreResult<Option<Payment>>>;

    /// Payment by its external number, locked.
    fn lock_payment_by_number(
        &mut self,
        payment_number: String,
    ) -> BoxFuture<'_, StoreResult<Option<Payment>>>;

    /// Payment by id, locked.
    fn lock_payment(&mut self, id: PaymentId) -> BoxFuture<'_, StoreResult<Option<Payment>>>;

    /// Insert a payment. A second pending payment for the same order yields
    /// [`StoreError::UniqueViolation`].
    fn insert_payment(&mut self, payment: Payment) -> BoxFuture<'_, StoreResult<()>>;

    /// `from → to` if the payment is still `from`; moving to `paid` stamps `paid_at = at`.
    fn transition_payment(
        &mut self,
        id: PaymentId,
        from: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<bool>>;

    /// Switch the provider of a still-pending payment.
    fn switch_payment_method(
        &mut self,
        id: PaymentId,
        method: PaymentMethod,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<bool>>;

    // ------------------------------------------------------------------
    // Scheduled tasks
    // ------------------------------------------------------------------

    /// Schedule a one-shot task.
    fn schedule_task(
        &mut self,
        kind: TaskKind,
        subject_id: Uuid,
        due_at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<i64>>;

    /// Lock an uncompleted task, skipping it if another worker holds it.
    fn claim_task(&mut self, id: i64) -> BoxFuture<'_, StoreResult<Option<ScheduledTask>>>;

    /// Mark a task done.
    fn complete_task(&mut self, id: i64, at: DateTime<Utc>) -> BoxFuture<'_, StoreResult<()>>;

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Make every write of this unit visible atomically.
    fn commit(self: Box<Self>) -> BoxFuture<'static, StoreResult<()>>;
}

/// Address collaborator: resolves an address to its owner.
pub trait AddressDirectory: Send + Sync {
    /// Owner of the address, `None` if it does not exist.
    fn address_owner(&self, id: AddressId) -> BoxFuture<'_, StoreResult<Option<UserId>>>;
}
