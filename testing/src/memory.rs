//! In-memory implementation of the persistence contracts.
//!
//! Units of work are serialized: `begin` takes the state lock, works on a
//! copy, and `commit` writes the copy back. Dropping a unit releases the lock
//! and discards the copy, which is exactly rollback. Concurrency tests
//! therefore see linearizable behavior, the same guarantee row locks and
//! conditional updates give the Postgres implementation.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use storefront_core::error::StoreError;
use storefront_core::order::{Order, OrderItem, OrderStatus};
use storefront_core::payment::{Payment, PaymentMethod, PaymentStatus};
use storefront_core::store::{
    AddressDirectory, BoxFuture, Database, ProductRecord, StoreResult, UnitOfWork,
};
use storefront_core::task::{ScheduledTask, TaskKind};
use storefront_core::types::{AddressId, Money, OrderId, PaymentId, ProductId, UserId};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Stored task row including bookkeeping columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskRow {
    /// Claimable view
    pub task: ScheduledTask,
    /// Set once the task ran successfully
    pub completed_at: Option<DateTime<Utc>>,
    /// Message of the last failed attempt
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, Default)]
struct MemoryState {
    products: BTreeMap<ProductId, ProductRecord>,
    addresses: HashMap<AddressId, UserId>,
    orders: HashMap<OrderId, Order>,
    payments: HashMap<PaymentId, Payment>,
    tasks: BTreeMap<i64, TaskRow>,
    next_task_id: i64,
}

/// Failures a test can arm before exercising a service.
#[derive(Debug, Default)]
struct Faults {
    failing_commits: AtomicUsize,
    failing_reservations: Mutex<HashSet<ProductId>>,
    failing_releases: Mutex<HashSet<ProductId>>,
}

impl Faults {
    fn take_commit_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn contains(set: &Mutex<HashSet<ProductId>>, id: ProductId) -> bool {
        set.lock().is_ok_and(|set| set.contains(&id))
    }
}

/// Transactional in-memory database.
///
/// Cloning shares the underlying state.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDatabase {
    state: Arc<AsyncMutex<MemoryState>>,
    faults: Arc<Faults>,
}

impl InMemoryDatabase {
    /// Empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a catalog product.
    pub async fn put_product(&self, product: ProductRecord) {
        self.state.lock().await.products.insert(product.id, product);
    }

    /// Register an address owned by `owner`.
    pub async fn put_address(&self, id: AddressId, owner: UserId) {
        self.state.lock().await.addresses.insert(id, owner);
    }

    /// Current catalog entry.
    pub async fn product(&self, id: ProductId) -> Option<ProductRecord> {
        self.state.lock().await.products.get(&id).cloned()
    }

    /// Current stock of a product.
    pub async fn stock(&self, id: ProductId) -> Option<u32> {
        self.product(id).await.map(|p| p.stock)
    }

    /// Number of persisted orders.
    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    /// Every payment recorded for an order, oldest first.
    pub async fn payments_for_order(&self, order_id: OrderId) -> Vec<Payment> {
        let state = self.state.lock().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        payments
    }

    /// Payment by external number.
    pub async fn payment_by_number(&self, payment_number: &str) -> Option<Payment> {
        let state = self.state.lock().await;
        state
            .payments
            .values()
            .find(|p| p.payment_number == payment_number)
            .cloned()
    }

    /// Every scheduled task row.
    pub async fn tasks(&self) -> Vec<TaskRow> {
        self.state.lock().await.tasks.values().cloned().collect()
    }

    /// Make the next `count` commits fail with a database error.
    pub fn fail_next_commits(&self, count: usize) {
        self.faults.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Make every stock reservation for `product` fail with a database error.
    pub fn fail_reservations_of(&self, product: ProductId) {
        if let Ok(mut set) = self.faults.failing_reservations.lock() {
            set.insert(product);
        }
    }

    /// Make every stock release for `product` fail with a database error.
    pub fn fail_releases_of(&self, product: ProductId) {
        if let Ok(mut set) = self.faults.failing_releases.lock() {
            set.insert(product);
        }
    }
}

fn newest_first<T, K: Ord>(mut rows: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    rows.sort_by(|a, b| key(b).cmp(&key(a)));
    rows
}

impl Database for InMemoryDatabase {
    fn begin(&self) -> BoxFuture<'_, StoreResult<Box<dyn UnitOfWork>>> {
        Box::pin(async move {
            let guard = Arc::clone(&self.state).lock_owned().await;
            let working = guard.clone();
            let uow: Box<dyn UnitOfWork> = Box::new(MemoryUnitOfWork {
                guard,
                working,
                faults: Arc::clone(&self.faults),
            });
            Ok(uow)
        })
    }

    fn find_order(&self, id: OrderId) -> BoxFuture<'_, StoreResult<Option<Order>>> {
        Box::pin(async move { Ok(self.state.lock().await.orders.get(&id).cloned()) })
    }

    fn list_orders(
        &self,
        owner: UserId,
        status: Option<OrderStatus>,
    ) -> BoxFuture<'_, StoreResult<Vec<Order>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let rows = state
                .orders
                .values()
                .filter(|o| o.owner == owner && status.is_none_or(|s| o.status == s))
                .cloned()
                .collect();
            Ok(newest_first(rows, |o: &Order| o.created_at))
        })
    }

    fn list_payments(
        &self,
        owner: UserId,
        status: Option<PaymentStatus>,
    ) -> BoxFuture<'_, StoreResult<Vec<Payment>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let rows = state
                .payments
                .values()
                .filter(|p| p.owner == owner && status.is_none_or(|s| p.status == s))
                .cloned()
                .collect();
            Ok(newest_first(rows, |p: &Payment| p.created_at))
        })
    }

    fn expired_orders(
        &self,
        now: DateTime<Utc>,
        skip: Vec<OrderId>,
        limit: usize,
    ) -> BoxFuture<'_, StoreResult<Vec<OrderId>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut expired: Vec<&Order> = state
                .orders
                .values()
                .filter(|o| o.status == OrderStatus::Pending && o.expires_at < now)
                .filter(|o| !skip.contains(&o.id))
                .collect();
            expired.sort_by_key(|o| (o.expires_at, *o.id.as_uuid()));
            Ok(expired.into_iter().take(limit).map(|o| o.id).collect())
        })
    }

    fn due_tasks(
        &self,
        kind: TaskKind,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, StoreResult<Vec<i64>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut due: Vec<&TaskRow> = state
                .tasks
                .values()
                .filter(|row| {
                    row.completed_at.is_none() && row.task.kind == kind && row.task.due_at <= now
                })
                .collect();
            due.sort_by_key(|row| (row.task.due_at, row.task.id));
            Ok(due.into_iter().take(limit).map(|row| row.task.id).collect())
        })
    }

    fn record_task_failure(
        &self,
        task_id: i64,
        error: String,
        retry_at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if let Some(row) = state.tasks.get_mut(&task_id) {
                row.task.attempts += 1;
                row.task.due_at = retry_at;
                row.last_error = Some(error);
            }
            Ok(())
        })
    }

    fn ping(&self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

impl AddressDirectory for InMemoryDatabase {
    fn address_owner(&self, id: AddressId) -> BoxFuture<'_, StoreResult<Option<UserId>>> {
        Box::pin(async move { Ok(self.state.lock().await.addresses.get(&id).copied()) })
    }
}

struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    faults: Arc<Faults>,
}

fn injected(what: &str, id: ProductId) -> StoreError {
    StoreError::Database(format!("injected {what} failure for product {id}"))
}

impl UnitOfWork for MemoryUnitOfWork {
    fn find_product(&mut self, id: ProductId) -> BoxFuture<'_, StoreResult<Option<ProductRecord>>> {
        Box::pin(async move { Ok(self.working.products.get(&id).cloned()) })
    }

    fn reserve_stock(&mut self, id: ProductId, quantity: u32) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(async move {
            if Faults::contains(&self.faults.failing_reservations, id) {
                return Err(injected("reservation", id));
            }
            match self.working.products.get_mut(&id) {
                Some(product) if product.on_sale && product.stock >= quantity => {
                    product.stock -= quantity;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn release_stock(&mut self, id: ProductId, quantity: u32) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(async move {
            if Faults::contains(&self.faults.failing_releases, id) {
                return Err(injected("release", id));
            }
            match self.working.products.get_mut(&id) {
                Some(product) => {
                    product.stock = product.stock.saturating_add(quantity);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn insert_order(&mut self, order: Order) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            if self
                .working
                .orders
                .values()
                .any(|o| o.order_number == order.order_number)
            {
                return Err(StoreError::UniqueViolation(format!(
                    "orders_order_number_key ({})",
                    order.order_number
                )));
            }
            let mut header = order;
            header.items.clear();
            self.working.orders.insert(header.id, header);
            Ok(())
        })
    }

    fn insert_order_item(
        &mut self,
        order_id: OrderId,
        position: u32,
        item: OrderItem,
    ) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let order = self
                .working
                .orders
                .get_mut(&order_id)
                .ok_or_else(|| StoreError::Database(format!("order {order_id} missing")))?;
            let index = usize::try_from(position).unwrap_or(usize::MAX).min(order.items.len());
            order.items.insert(index, item);
            Ok(())
        })
    }

    fn set_order_total(&mut self, id: OrderId, total: Money) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            if let Some(order) = self.working.orders.get_mut(&id) {
                order.total_amount = total;
            }
            Ok(())
        })
    }

    fn lock_order(&mut self, id: OrderId) -> BoxFuture<'_, StoreResult<Option<Order>>> {
        Box::pin(async move { Ok(self.working.orders.get(&id).cloned()) })
    }

    fn transition_order(
        &mut self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(async move {
            match self.working.orders.get_mut(&id) {
                Some(order) if order.status == from => {
                    order.status = to;
                    order.updated_at = at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn update_order_details(
        &mut self,
        id: OrderId,
        address_id: Option<AddressId>,
        remark: Option<String>,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(async move {
            match self.working.orders.get_mut(&id) {
                Some(order) if order.status == OrderStatus::Pending => {
                    if let Some(address_id) = address_id {
                        order.address_id = address_id;
                    }
                    if let Some(remark) = remark {
                        order.remark = remark;
                    }
                    order.updated_at = at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn latest_payment_for_order(
        &mut self,
        order_id: OrderId,
    ) -> BoxFuture<'_, StoreResult<Option<Payment>>> {
        Box::pin(async move {
            Ok(self
                .working
                .payments
                .values()
                .filter(|p| p.order_id == order_id)
                .max_by_key(|p| p.created_at)
                .cloned())
        })
    }

    fn lock_payment_by_number(
        &mut self,
        payment_number: String,
    ) -> BoxFuture<'_, StoreResult<Option<Payment>>> {
        Box::pin(async move {
            Ok(self
                .working
                .payments
                .values()
                .find(|p| p.payment_number == payment_number)
                .cloned())
        })
    }

    fn lock_payment(&mut self, id: PaymentId) -> BoxFuture<'_, StoreResult<Option<Payment>>> {
        Box::pin(async move { Ok(self.working.payments.get(&id).cloned()) })
    }

    fn insert_payment(&mut self, payment: Payment) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            if payment.status == PaymentStatus::Pending
                && self
                    .working
                    .payments
                    .values()
                    .any(|p| p.order_id == payment.order_id && p.status == PaymentStatus::Pending)
            {
                return Err(StoreError::UniqueViolation(format!(
                    "payments_one_pending_per_order ({})",
                    payment.order_id
                )));
            }
            self.working.payments.insert(payment.id, payment);
            Ok(())
        })
    }

    fn transition_payment(
        &mut self,
        id: PaymentId,
        from: PaymentStatus,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(async move {
            match self.working.payments.get_mut(&id) {
                Some(payment) if payment.status == from => {
                    payment.status = to;
                    payment.updated_at = at;
                    if to == PaymentStatus::Paid {
                        payment.paid_at = Some(at);
                    }
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn switch_payment_method(
        &mut self,
        id: PaymentId,
        method: PaymentMethod,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(async move {
            match self.working.payments.get_mut(&id) {
                Some(payment) if payment.status == PaymentStatus::Pending => {
                    payment.method = method;
                    payment.updated_at = at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn schedule_task(
        &mut self,
        kind: TaskKind,
        subject_id: Uuid,
        due_at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<i64>> {
        Box::pin(async move {
            self.working.next_task_id += 1;
            let id = self.working.next_task_id;
            self.working.tasks.insert(
                id,
                TaskRow {
                    task: ScheduledTask {
                        id,
                        kind,
                        subject_id,
                        due_at,
                        attempts: 0,
                    },
                    completed_at: None,
                    last_error: None,
                },
            );
            Ok(id)
        })
    }

    fn claim_task(&mut self, id: i64) -> BoxFuture<'_, StoreResult<Option<ScheduledTask>>> {
        Box::pin(async move {
            Ok(self
                .working
                .tasks
                .get(&id)
                .filter(|row| row.completed_at.is_none())
                .map(|row| row.task.clone()))
        })
    }

    fn complete_task(&mut self, id: i64, at: DateTime<Utc>) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            if let Some(row) = self.working.tasks.get_mut(&id) {
                row.completed_at = Some(at);
            }
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, StoreResult<()>> {
        Box::pin(async move {
            let Self {
                mut guard,
                working,
                faults,
            } = *self;
            if faults.take_commit_failure() {
                return Err(StoreError::Database("injected commit failure".into()));
            }
            *guard = working;
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[tokio::test]
    async fn dropped_unit_of_work_discards_writes() {
        let db = InMemoryDatabase::new();
        db.put_product(fixtures::product(1, "widget", 1000, 5)).await;

        {
            let mut uow = db.begin().await.unwrap();
            assert!(uow.reserve_stock(ProductId::new(1), 3).await.unwrap());
        }

        assert_eq!(db.stock(ProductId::new(1)).await, Some(5));
    }

    #[tokio::test]
    async fn committed_unit_of_work_is_visible() {
        let db = InMemoryDatabase::new();
        db.put_product(fixtures::product(1, "widget", 1000, 5)).await;

        let mut uow = db.begin().await.unwrap();
        assert!(uow.reserve_stock(ProductId::new(1), 5).await.unwrap());
        assert!(!uow.reserve_stock(ProductId::new(1), 1).await.unwrap());
        uow.commit().await.unwrap();

        assert_eq!(db.stock(ProductId::new(1)).await, Some(0));
    }

    #[tokio::test]
    async fn injected_commit_failure_rolls_back_once() {
        let db = InMemoryDatabase::new();
        db.put_product(fixtures::product(1, "widget", 1000, 5)).await;
        db.fail_next_commits(1);

        let mut uow = db.begin().await.unwrap();
        uow.reserve_stock(ProductId::new(1), 2).await.unwrap();
        assert!(uow.commit().await.is_err());
        assert_eq!(db.stock(ProductId::new(1)).await, Some(5));

        let mut uow = db.begin().await.unwrap();
        uow.reserve_stock(ProductId::new(1), 2).await.unwrap();
        uow.commit().await.expect("second commit succeeds");
        assert_eq!(db.stock(ProductId::new(1)).await, Some(3));
    }
}
