//! Row mapping between PostgreSQL and the domain types.
//!
//! Amounts live in `BIGINT` cents, quantities and stock in `INTEGER`,
//! statuses in `TEXT`. Every conversion is checked: a row that does not fit
//! the domain is reported as a [`StoreError::Database`] instead of panicking.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use std::collections::HashMap;
use storefront_core::order::{Order, OrderItem, OrderStatus};
use storefront_core::payment::{Payment, PaymentMethod, PaymentStatus};
use storefront_core::store::{ProductRecord, StoreResult};
use storefront_core::task::{ScheduledTask, TaskKind};
use storefront_core::{AddressId, Money, OrderId, PaymentId, ProductId, StoreError, UserId};
use uuid::Uuid;

pub(crate) const ORDER_COLUMNS: &str = "id, order_number, user_id, status, total_cents, \
     address_id, remark, expires_at, created_at, updated_at";

pub(crate) const PAYMENT_COLUMNS: &str = "id, payment_number, order_id, user_id, amount_cents, \
     method, status, paid_at, created_at, updated_at";

pub(crate) const PRODUCT_COLUMNS: &str = "id, name, image_url, price_cents, stock, is_on_sale";

pub(crate) const TASK_COLUMNS: &str = "id, kind, subject_id, due_at, attempts";

/// Map a sqlx error, keeping unique violations distinguishable.
pub(crate) fn db_error(operation: &'static str, e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            metrics::counter!("storefront_store_unique_violations_total", "operation" => operation)
                .increment(1);
            return StoreError::UniqueViolation(format!(
                "{operation}: {}",
                db_err.constraint().unwrap_or(db_err.message())
            ));
        }
    }
    metrics::counter!("storefront_store_errors_total", "operation" => operation).increment(1);
    StoreError::Database(format!("Failed to {operation}: {e}"))
}

fn decode(e: sqlx::Error) -> StoreError {
    StoreError::Database(format!("Failed to decode row: {e}"))
}

fn corrupt(what: &str, value: impl std::fmt::Display) -> StoreError {
    StoreError::Database(format!("Invalid {what} in database: {value}"))
}

/// Money to its `BIGINT` column value.
pub(crate) fn cents(amount: Money) -> StoreResult<i64> {
    i64::try_from(amount.cents()).map_err(|_| corrupt("amount", amount))
}

fn money(row: &PgRow, column: &str) -> StoreResult<Money> {
    let raw: i64 = row.try_get(column).map_err(decode)?;
    u64::try_from(raw)
        .map(Money::from_cents)
        .map_err(|_| corrupt(column, raw))
}

fn count(row: &PgRow, column: &str) -> StoreResult<u32> {
    let raw: i32 = row.try_get(column).map_err(decode)?;
    u32::try_from(raw).map_err(|_| corrupt(column, raw))
}

pub(crate) fn product(row: &PgRow) -> StoreResult<ProductRecord> {
    Ok(ProductRecord {
        id: ProductId::new(row.try_get("id").map_err(decode)?),
        name: row.try_get("name").map_err(decode)?,
        image_url: row.try_get("image_url").map_err(decode)?,
        price: money(row, "price_cents")?,
        stock: count(row, "stock")?,
        on_sale: row.try_get("is_on_sale").map_err(decode)?,
    })
}

/// Order header; items are attached by [`attach_items`].
pub(crate) fn order_header(row: &PgRow) -> StoreResult<Order> {
    let status: String = row.try_get("status").map_err(decode)?;
    Ok(Order {
        id: OrderId::from_uuid(row.try_get("id").map_err(decode)?),
        order_number: row.try_get("order_number").map_err(decode)?,
        owner: UserId::new(row.try_get("user_id").map_err(decode)?),
        status: status
            .parse::<OrderStatus>()
            .map_err(StoreError::Database)?,
        total_amount: money(row, "total_cents")?,
        address_id: AddressId::new(row.try_get("address_id").map_err(decode)?),
        remark: row.try_get("remark").map_err(decode)?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        items: Vec::new(),
    })
}

fn order_item(row: &PgRow) -> StoreResult<(Uuid, OrderItem)> {
    let order_id: Uuid = row.try_get("order_id").map_err(decode)?;
    Ok((
        order_id,
        OrderItem {
            product_id: ProductId::new(row.try_get("product_id").map_err(decode)?),
            product_name: row.try_get("product_name").map_err(decode)?,
            product_image: row.try_get("product_image").map_err(decode)?,
            price: money(row, "price_cents")?,
            quantity: count(row, "quantity")?,
        },
    ))
}

pub(crate) fn payment(row: &PgRow) -> StoreResult<Payment> {
    let method: String = row.try_get("method").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let paid_at: Option<DateTime<Utc>> = row.try_get("paid_at").map_err(decode)?;
    Ok(Payment {
        id: PaymentId::from_uuid(row.try_get("id").map_err(decode)?),
        payment_number: row.try_get("payment_number").map_err(decode)?,
        order_id: OrderId::from_uuid(row.try_get("order_id").map_err(decode)?),
        owner: UserId::new(row.try_get("user_id").map_err(decode)?),
        amount: money(row, "amount_cents")?,
        method: method
            .parse::<PaymentMethod>()
            .map_err(|other| corrupt("payment method", other))?,
        status: status
            .parse::<PaymentStatus>()
            .map_err(StoreError::Database)?,
        paid_at,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

pub(crate) fn task(row: &PgRow) -> StoreResult<ScheduledTask> {
    let kind: String = row.try_get("kind").map_err(decode)?;
    Ok(ScheduledTask {
        id: row.try_get("id").map_err(decode)?,
        kind: kind.parse::<TaskKind>().map_err(StoreError::Database)?,
        subject_id: row.try_get("subject_id").map_err(decode)?,
        due_at: row.try_get("due_at").map_err(decode)?,
        attempts: count(row, "attempts")?,
    })
}

/// Load the items of `orders` (in position order) and attach them.
pub(crate) async fn attach_items(
    conn: &mut PgConnection,
    mut orders: Vec<Order>,
) -> StoreResult<Vec<Order>> {
    if orders.is_empty() {
        return Ok(orders);
    }
    let ids: Vec<Uuid> = orders.iter().map(|o| *o.id.as_uuid()).collect();
    let rows = sqlx::query(
        "SELECT order_id, product_id, product_name, product_image, price_cents, quantity
         FROM order_items
         WHERE order_id = ANY($1)
         ORDER BY order_id, position",
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| db_error("load order items", e))?;

    let mut items: HashMap<Uuid, Vec<OrderItem>> = HashMap::with_capacity(orders.len());
    for row in &rows {
        let (order_id, item) = order_item(row)?;
        items.entry(order_id).or_default().push(item);
    }
    for order in &mut orders {
        order.items = items.remove(order.id.as_uuid()).unwrap_or_default();
    }
    Ok(orders)
}

/// `usize` batch limits as a SQL `LIMIT`.
pub(crate) fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
