//! One database transaction per unit of work.

use crate::rows::{
    self, ORDER_COLUMNS, PAYMENT_COLUMNS, PRODUCT_COLUMNS, TASK_COLUMNS, cents, db_error,
};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use storefront_core::order::{Order, OrderItem, OrderStatus};
use storefront_core::payment::{Payment, PaymentMethod, PaymentStatus};
use storefront_core::store::{BoxFuture, ProductRecord, StoreResult, UnitOfWork};
use storefront_core::task::{ScheduledTask, TaskKind};
use storefront_core::{AddressId, Money, OrderId, PaymentId, ProductId, StoreError};
use uuid::Uuid;

/// A PostgreSQL transaction. Dropping it uncommitted rolls back.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl std::fmt::Debug for PgUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgUnitOfWork").finish_non_exhaustive()
    }
}

impl PgUnitOfWork {
    pub(crate) const fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }

    async fn locked_order(&mut self, id: OrderId) -> StoreResult<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE");
        let Some(row) = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| db_error("lock order", e))?
        else {
            return Ok(None);
        };
        let order = rows::order_header(&row)?;
        Ok(rows::attach_items(&mut self.tx, vec![order]).await?.pop())
    }

    async fn locked_payment(&mut self, filter: &str, value: PaymentKey) -> StoreResult<Option<Payment>> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE {filter} FOR UPDATE");
        let query = sqlx::query(&sql);
        let query = match value {
            PaymentKey::Id(id) => query.bind(id),
            PaymentKey::Number(number) => query.bind(number),
        };
        query
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| db_error("lock payment", e))?
            .as_ref()
            .map(rows::payment)
            .transpose()
    }
}

enum PaymentKey {
    Id(Uuid),
    Number(String),
}

fn quantity_param(quantity: u32) -> Option<i32> {
    i32::try_from(quantity).ok()
}

impl UnitOfWork for PgUnitOfWork {
    fn find_product(&mut self, id: ProductId) -> BoxFuture<'_, StoreResult<Option<ProductRecord>>> {
        Box::pin(async move {
            let sql = format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1");
            sqlx::query(&sql)
                .bind(id.get())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| db_error("load product", e))?
                .as_ref()
                .map(rows::product)
                .transpose()
        })
    }

    fn reserve_stock(&mut self, id: ProductId, quantity: u32) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(async move {
            // More than i32::MAX units can never be in stock.
            let Some(quantity) = quantity_param(quantity) else {
                return Ok(false);
            };
            let result = sqlx::query(
                "UPDATE products SET stock = stock - $2
                 WHERE id = $1 AND is_on_sale AND stock >= $2",
            )
            .bind(id.get())
            .bind(quantity)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("reserve stock", e))?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn release_stock(&mut self, id: ProductId, quantity: u32) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(async move {
            let quantity = quantity_param(quantity).ok_or_else(|| {
                StoreError::Database(format!("Release quantity {quantity} out of range"))
            })?;
            let result = sqlx::query("UPDATE products SET stock = stock + $2 WHERE id = $1")
                .bind(id.get())
                .bind(quantity)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| db_error("release stock", e))?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn insert_order(&mut self, order: Order) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO orders
                    (id, order_number, user_id, status, total_cents, address_id, remark,
                     expires_at, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(order.id.as_uuid())
            .bind(&order.order_number)
            .bind(order.owner.get())
            .bind(order.status.as_str())
            .bind(cents(order.total_amount)?)
            .bind(order.address_id.get())
            .bind(&order.remark)
            .bind(order.expires_at)
            .bind(order.created_at)
            .bind(order.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("insert order", e))?;
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
            let position = i32::try_from(position)
                .map_err(|_| StoreError::Database(format!("Item position {position} out of range")))?;
            let quantity = quantity_param(item.quantity).ok_or_else(|| {
                StoreError::Database(format!("Item quantity {} out of range", item.quantity))
            })?;
            sqlx::query(
                "INSERT INTO order_items
                    (order_id, position, product_id, product_name, product_image, price_cents, quantity)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(order_id.as_uuid())
            .bind(position)
            .bind(item.product_id.get())
            .bind(&item.product_name)
            .bind(&item.product_image)
            .bind(cents(item.price)?)
            .bind(quantity)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("insert order item", e))?;
            Ok(())
        })
    }

    fn set_order_total(&mut self, id: OrderId, total: Money) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            sqlx::query("UPDATE orders SET total_cents = $2 WHERE id = $1 AND status = 'pending'")
                .bind(id.as_uuid())
                .bind(cents(total)?)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| db_error("set order total", e))?;
            Ok(())
        })
    }

    fn lock_order(&mut self, id: OrderId) -> BoxFuture<'_, StoreResult<Option<Order>>> {
        Box::pin(self.locked_order(id))
    }

    fn transition_order(
        &mut self,
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE orders SET status = $3, updated_at = $4
                 WHERE id = $1 AND status = $2",
            )
            .bind(id.as_uuid())
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("transition order", e))?;
            Ok(result.rows_affected() == 1)
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
            let result = sqlx::query(
                "UPDATE orders
                 SET address_id = COALESCE($2, address_id),
                     remark = COALESCE($3, remark),
                     updated_at = $4
                 WHERE id = $1 AND status = 'pending'",
            )
            .bind(id.as_uuid())
            .bind(address_id.map(|a| a.get()))
            .bind(remark)
            .bind(at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("update order", e))?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn latest_payment_for_order(
        &mut self,
        order_id: OrderId,
    ) -> BoxFuture<'_, StoreResult<Option<Payment>>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments
                 WHERE order_id = $1
                 ORDER BY created_at DESC
                 LIMIT 1
                 FOR UPDATE"
            );
            sqlx::query(&sql)
                .bind(order_id.as_uuid())
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| db_error("load latest payment", e))?
                .as_ref()
                .map(rows::payment)
                .transpose()
        })
    }

    fn lock_payment_by_number(
        &mut self,
        payment_number: String,
    ) -> BoxFuture<'_, StoreResult<Option<Payment>>> {
        Box::pin(self.locked_payment("payment_number = $1", PaymentKey::Number(payment_number)))
    }

    fn lock_payment(&mut self, id: PaymentId) -> BoxFuture<'_, StoreResult<Option<Payment>>> {
        Box::pin(self.locked_payment("id = $1", PaymentKey::Id(*id.as_uuid())))
    }

    fn insert_payment(&mut self, payment: Payment) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO payments
                    (id, payment_number, order_id, user_id, amount_cents, method, status,
                     paid_at, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(payment.id.as_uuid())
            .bind(&payment.payment_number)
            .bind(payment.order_id.as_uuid())
            .bind(payment.owner.get())
            .bind(cents(payment.amount)?)
            .bind(payment.method.as_str())
            .bind(payment.status.as_str())
            .bind(payment.paid_at)
            .bind(payment.created_at)
            .bind(payment.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("insert payment", e))?;
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
            let paid_at = (to == PaymentStatus::Paid).then_some(at);
            let result = sqlx::query(
                "UPDATE payments
                 SET status = $3, updated_at = $4, paid_at = COALESCE($5, paid_at)
                 WHERE id = $1 AND status = $2",
            )
            .bind(id.as_uuid())
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(at)
            .bind(paid_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("transition payment", e))?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn switch_payment_method(
        &mut self,
        id: PaymentId,
        method: PaymentMethod,
        at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<bool>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE payments SET method = $2, updated_at = $3
                 WHERE id = $1 AND status = 'pending'",
            )
            .bind(id.as_uuid())
            .bind(method.as_str())
            .bind(at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| db_error("switch payment method", e))?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn schedule_task(
        &mut self,
        kind: TaskKind,
        subject_id: Uuid,
        due_at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<i64>> {
        Box::pin(async move {
            let (id,): (i64,) = sqlx::query_as(
                "INSERT INTO scheduled_tasks (kind, subject_id, due_at)
                 VALUES ($1, $2, $3)
                 RETURNING id",
            )
            .bind(kind.as_str())
            .bind(subject_id)
            .bind(due_at)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| db_error("schedule task", e))?;
            tracing::debug!(task_id = id, kind = %kind, %subject_id, %due_at, "Task scheduled");
            Ok(id)
        })
    }

    fn claim_task(&mut self, id: i64) -> BoxFuture<'_, StoreResult<Option<ScheduledTask>>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                 WHERE id = $1 AND completed_at IS NULL
                 FOR UPDATE SKIP LOCKED"
            );
            sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(|e| db_error("claim task", e))?
                .as_ref()
                .map(rows::task)
                .transpose()
        })
    }

    fn complete_task(&mut self, id: i64, at: DateTime<Utc>) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            sqlx::query("UPDATE scheduled_tasks SET completed_at = $2 WHERE id = $1")
                .bind(id)
                .bind(at)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| db_error("complete task", e))?;
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, StoreResult<()>> {
        Box::pin(async move {
            self.tx
                .commit()
                .await
                .map_err(|e| db_error("commit transaction", e))
        })
    }
}
