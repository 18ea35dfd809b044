//! Background jobs: reservation expiry sweeper and payment timeout reaper.
//!
//! Both jobs are stateless between ticks; everything they act on is read from
//! the store at fire time, so a restart or a run of missed ticks only delays
//! work. Each order or task is handled in its own unit of work and a failure
//! is logged and skipped, never aborting the rest of the tick.

use crate::metrics::{CancelReason, JobMetrics, OrderMetrics, PaymentMetrics};
use crate::orders::cancel_in;
use crate::retry::RetryPolicy;
use crate::transitions::transition_payment;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storefront_core::environment::Clock;
use storefront_core::error::CommerceResult;
use storefront_core::payment::PaymentStatus;
use storefront_core::store::{BoxFuture, Database, UnitOfWork};
use storefront_core::task::{ScheduledTask, TaskKind};
use storefront_core::{OrderId, PaymentId};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Default number of rows handled per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Counts from one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Rows examined
    pub examined: usize,
    /// Rows whose status this tick changed
    pub changed: usize,
    /// Rows that failed and will be retried on a later tick
    pub failed: usize,
}

/// A job the [`JobRunner`] can tick.
pub trait BackgroundJob: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Process everything due now.
    fn tick(&self) -> BoxFuture<'_, CommerceResult<TickReport>>;
}

// ============================================================================
// Expiry sweeper
// ============================================================================

/// Cancels `pending` orders past their reservation deadline and restores stock.
#[derive(Clone)]
pub struct ExpirySweeper {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

impl ExpirySweeper {
    /// Sweeper over `db`.
    #[must_use]
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Override the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Cancel every order expired at the current instant.
    ///
    /// Works through batches until a batch comes back short, so a backlog
    /// from missed ticks is cleared in one run. Orders that fail or are left
    /// unchanged are excluded from later batches of the same run; they are
    /// retried on the next tick.
    ///
    /// # Errors
    ///
    /// Only if the expired orders cannot be listed.
    pub async fn run_once(&self) -> CommerceResult<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();
        let mut skipped: Vec<OrderId> = Vec::new();

        loop {
            let expired = self
                .db
                .expired_orders(now, skipped.clone(), self.batch_size)
                .await?;
            let fetched = expired.len();
            for order_id in expired {
                report.examined += 1;
                match self.expire(order_id, now).await {
                    Ok(true) => report.changed += 1,
                    Ok(false) => skipped.push(order_id),
                    Err(err) => {
                        report.failed += 1;
                        skipped.push(order_id);
                        error!(%order_id, error = %err, "Failed to expire order");
                    }
                }
            }
            if fetched < self.batch_size {
                break;
            }
        }

        if report.examined > 0 {
            info!(
                expired = report.changed,
                failed = report.failed,
                "Reservation sweep finished"
            );
        }
        Ok(report)
    }

    async fn expire(&self, order_id: OrderId, now: DateTime<Utc>) -> CommerceResult<bool> {
        let mut uow = self.db.begin().await?;
        let Some(order) = uow.lock_order(order_id).await? else {
            return Ok(false);
        };
        // Paid or cancelled between listing and locking.
        if !order.is_expired(now) || !cancel_in(uow.as_mut(), &order, now).await? {
            return Ok(false);
        }
        uow.commit().await?;

        OrderMetrics::record_cancelled(CancelReason::Expired);
        info!(
            order_id = %order_id,
            order_number = %order.order_number,
            expired_at = %order.expires_at,
            "Expired order cancelled"
        );
        Ok(true)
    }
}

impl BackgroundJob for ExpirySweeper {
    fn name(&self) -> &'static str {
        "expiry_sweeper"
    }

    fn tick(&self) -> BoxFuture<'_, CommerceResult<TickReport>> {
        Box::pin(self.run_once())
    }
}

// ============================================================================
// Payment timeout reaper
// ============================================================================

/// Cancels payments still `pending` when their scheduled timeout comes due.
///
/// Never touches inventory; the order keeps its reservation until it is paid,
/// cancelled or swept.
#[derive(Clone)]
pub struct PaymentTimeoutReaper {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    backoff: RetryPolicy,
}

impl PaymentTimeoutReaper {
    /// Reaper over `db`. Failed tasks are retried after 30s, doubling up to 15 minutes.
    #[must_use]
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            batch_size: DEFAULT_BATCH_SIZE,
            backoff: RetryPolicy::builder()
                .initial_delay(Duration::from_secs(30))
                .max_delay(Duration::from_secs(15 * 60))
                .build(),
        }
    }

    /// Override the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Fire every due `payment_timeout` task.
    ///
    /// # Errors
    ///
    /// Only if the due tasks cannot be listed.
    pub async fn run_once(&self) -> CommerceResult<TickReport> {
        let now = self.clock.now();
        let due = self
            .db
            .due_tasks(TaskKind::PaymentTimeout, now, self.batch_size)
            .await?;
        let mut report = TickReport::default();

        for task_id in due {
            let mut uow = match self.db.begin().await {
                Ok(uow) => uow,
                Err(err) => {
                    report.failed += 1;
                    error!(task_id, error = %err, "Failed to open unit of work");
                    continue;
                }
            };
            let task = match uow.claim_task(task_id).await {
                Ok(Some(task)) => task,
                // Completed or held by another worker.
                Ok(None) => continue,
                Err(err) => {
                    report.failed += 1;
                    error!(task_id, error = %err, "Failed to claim task");
                    continue;
                }
            };
            report.examined += 1;

            let attempts = task.attempts;
            match self.fire(uow, &task, now).await {
                Ok(cancelled) => report.changed += usize::from(cancelled),
                Err(err) => {
                    report.failed += 1;
                    let retry_at = now
                        + chrono::Duration::from_std(
                            self.backoff
                                .delay_for_attempt(usize::try_from(attempts).unwrap_or(usize::MAX)),
                        )
                        .unwrap_or_else(|_| chrono::Duration::minutes(15));
                    warn!(
                        task_id,
                        payment_id = %task.subject_id,
                        attempts = attempts + 1,
                        %retry_at,
                        error = %err,
                        "Payment timeout failed, rescheduled"
                    );
                    if let Err(record_err) = self
                        .db
                        .record_task_failure(task_id, err.to_string(), retry_at)
                        .await
                    {
                        error!(task_id, error = %record_err, "Failed to record task failure");
                    }
                }
            }
        }

        if report.examined > 0 {
            info!(
                timed_out = report.changed,
                failed = report.failed,
                "Payment timeout sweep finished"
            );
        }
        Ok(report)
    }

    async fn fire(
        &self,
        mut uow: Box<dyn UnitOfWork>,
        task: &ScheduledTask,
        now: DateTime<Utc>,
    ) -> CommerceResult<bool> {
        let payment_id = PaymentId::from_uuid(task.subject_id);
        let cancelled = match uow.lock_payment(payment_id).await? {
            Some(payment) if payment.status == PaymentStatus::Pending => {
                transition_payment(
                    uow.as_mut(),
                    payment_id,
                    PaymentStatus::Pending,
                    PaymentStatus::Cancelled,
                    now,
                )
                .await?
            }
            Some(_) => false,
            None => {
                warn!(%payment_id, task_id = task.id, "Timeout for unknown payment");
                false
            }
        };
        uow.complete_task(task.id, now).await?;
        uow.commit().await?;

        if cancelled {
            PaymentMetrics::record_timed_out();
            info!(%payment_id, "Pending payment timed out");
        }
        Ok(cancelled)
    }
}

impl BackgroundJob for PaymentTimeoutReaper {
    fn name(&self) -> &'static str {
        "payment_timeout_reaper"
    }

    fn tick(&self) -> BoxFuture<'_, CommerceResult<TickReport>> {
        Box::pin(self.run_once())
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Ticks a [`BackgroundJob`] on a fixed interval until shutdown.
pub struct JobRunner {
    job: Arc<dyn BackgroundJob>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl JobRunner {
    /// Runner for `job`, stopping when `shutdown` fires.
    #[must_use]
    pub fn new(
        job: Arc<dyn BackgroundJob>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            job,
            interval: interval.max(Duration::from_millis(1)),
            shutdown,
        }
    }

    /// Spawn the loop onto the runtime.
    #[must_use]
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        let name = self.job.name();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(job = name, interval_secs = self.interval.as_secs(), "Background job started");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(job = name, "Background job received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let started = Instant::now();
                    if let Err(err) = self.job.tick().await {
                        error!(job = name, error = %err, "Background job tick failed");
                    }
                    JobMetrics::record_tick(name, started.elapsed());
                }
            }
        }

        info!(job = name, "Background job stopped");
    }
}
