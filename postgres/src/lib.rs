//! PostgreSQL persistence for the storefront core.
//!
//! [`PgDatabase`] implements [`Database`] and [`AddressDirectory`] on a
//! `sqlx` pool; every unit of work is one database transaction
//! ([`PgUnitOfWork`]).
//!
//! # Concurrency
//!
//! - Stock reservation is a single conditional `UPDATE ... WHERE stock >= $n`,
//!   so concurrent buyers can never drive stock negative.
//! - Orders, payments and tasks are read with `SELECT ... FOR UPDATE` inside
//!   a unit of work; status changes are compare-and-set on the current status.
//! - A partial unique index allows at most one `pending` payment per order.
//! - Due tasks are claimed with `FOR UPDATE SKIP LOCKED`, so several reaper
//!   instances never fire the same timeout.
//!
//! # Example
//!
//! ```no_run
//! use storefront_postgres::{PgDatabase, PoolSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = PgDatabase::connect("postgres://localhost/storefront", &PoolSettings::default()).await?;
//! db.migrate().await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use storefront_core::order::{Order, OrderStatus};
use storefront_core::payment::{Payment, PaymentStatus};
use storefront_core::store::{AddressDirectory, BoxFuture, Database, StoreResult, UnitOfWork};
use storefront_core::task::TaskKind;
use storefront_core::{AddressId, OrderId, StoreError, UserId};
use uuid::Uuid;

mod rows;
mod unit_of_work;

pub use unit_of_work::PgUnitOfWork;

use rows::{ORDER_COLUMNS, PAYMENT_COLUMNS, db_error, limit};

/// Connection pool sizing.
#[derive(Clone, Debug)]
pub struct PoolSettings {
    /// Upper bound of open connections
    pub max_connections: u32,
    /// Connections kept warm
    pub min_connections: u32,
    /// How long to wait for a connection
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// PostgreSQL-backed [`Database`].
#[derive(Clone, Debug)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if no connection can be established.
    pub async fn connect(database_url: &str, settings: &PoolSettings) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.connect_timeout)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect: {e}")))?;
        tracing::info!(
            max_connections = settings.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    /// Apply the embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin_unit(&self) -> StoreResult<PgUnitOfWork> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;
        Ok(PgUnitOfWork::new(tx))
    }
}

impl Database for PgDatabase {
    fn begin(&self) -> BoxFuture<'_, StoreResult<Box<dyn UnitOfWork>>> {
        Box::pin(async move {
            let uow = self.begin_unit().await?;
            Ok(Box::new(uow) as Box<dyn UnitOfWork>)
        })
    }

    fn find_order(&self, id: OrderId) -> BoxFuture<'_, StoreResult<Option<Order>>> {
        Box::pin(async move {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| db_error("acquire connection", e))?;
            let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
            let Some(row) = sqlx::query(&sql)
                .bind(id.as_uuid())
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| db_error("load order", e))?
            else {
                return Ok(None);
            };
            let order = rows::order_header(&row)?;
            Ok(rows::attach_items(&mut conn, vec![order]).await?.pop())
        })
    }

    fn list_orders(
        &self,
        owner: UserId,
        status: Option<OrderStatus>,
    ) -> BoxFuture<'_, StoreResult<Vec<Order>>> {
        Box::pin(async move {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| db_error("acquire connection", e))?;
            let sql = format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2)
                 ORDER BY created_at DESC, id"
            );
            let found = sqlx::query(&sql)
                .bind(owner.get())
                .bind(status.map(|s| s.as_str()))
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| db_error("list orders", e))?;
            let orders = found
                .iter()
                .map(rows::order_header)
                .collect::<StoreResult<Vec<_>>>()?;
            rows::attach_items(&mut conn, orders).await
        })
    }

    fn list_payments(
        &self,
        owner: UserId,
        status: Option<PaymentStatus>,
    ) -> BoxFuture<'_, StoreResult<Vec<Payment>>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {PAYMENT_COLUMNS} FROM payments
                 WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2)
                 ORDER BY created_at DESC, id"
            );
            let found = sqlx::query(&sql)
                .bind(owner.get())
                .bind(status.map(|s| s.as_str()))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_error("list payments", e))?;
            found.iter().map(rows::payment).collect()
        })
    }

    fn expired_orders(
        &self,
        now: DateTime<Utc>,
        skip: Vec<OrderId>,
        batch: usize,
    ) -> BoxFuture<'_, StoreResult<Vec<OrderId>>> {
        Box::pin(async move {
            let skip: Vec<Uuid> = skip.iter().map(|id| *id.as_uuid()).collect();
            let ids: Vec<(Uuid,)> = sqlx::query_as(
                "SELECT id FROM orders
                 WHERE status = 'pending' AND expires_at < $1 AND NOT (id = ANY($2))
                 ORDER BY expires_at, id
                 LIMIT $3",
            )
            .bind(now)
            .bind(skip)
            .bind(limit(batch))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("find expired orders", e))?;
            Ok(ids.into_iter().map(|(id,)| OrderId::from_uuid(id)).collect())
        })
    }

    fn due_tasks(
        &self,
        kind: TaskKind,
        now: DateTime<Utc>,
        batch: usize,
    ) -> BoxFuture<'_, StoreResult<Vec<i64>>> {
        Box::pin(async move {
            let ids: Vec<(i64,)> = sqlx::query_as(
                "SELECT id FROM scheduled_tasks
                 WHERE kind = $1 AND completed_at IS NULL AND due_at <= $2
                 ORDER BY due_at, id
                 LIMIT $3",
            )
            .bind(kind.as_str())
            .bind(now)
            .bind(limit(batch))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("find due tasks", e))?;
            Ok(ids.into_iter().map(|(id,)| id).collect())
        })
    }

    fn record_task_failure(
        &self,
        task_id: i64,
        error: String,
        retry_at: DateTime<Utc>,
    ) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            sqlx::query(
                "UPDATE scheduled_tasks
                 SET attempts = attempts + 1, last_error = $2, due_at = $3
                 WHERE id = $1",
            )
            .bind(task_id)
            .bind(error)
            .bind(retry_at)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("record task failure", e))?;
            Ok(())
        })
    }

    fn ping(&self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("ping database", e))?;
            Ok(())
        })
    }
}

impl AddressDirectory for PgDatabase {
    fn address_owner(&self, id: AddressId) -> BoxFuture<'_, StoreResult<Option<UserId>>> {
        Box::pin(async move {
            let owner: Option<(i64,)> = sqlx::query_as("SELECT user_id FROM addresses WHERE id = $1")
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error("load address", e))?;
            Ok(owner.map(|(user_id,)| UserId::new(user_id)))
        })
    }
}
