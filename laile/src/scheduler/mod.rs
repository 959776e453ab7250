//! Scheduler/worker loop.
//!
//! ```text
//! scheduler.run()
//!   ├─ ticker (every ticker_interval, gated by ticker_enabled) ──┐
//!   ├─ notify stream (listener.rs) ──────────────────────────────┤
//!   │                                                            ▼
//!   │                                                     process_due()
//!   │                                                       ├─ reclaim_abandoned()   // behind the task lock
//!   │                                                       └─ for each owned range:
//!   │                                                            ├─ acquire permit (caps concurrency)
//!   │                                                            ├─ DB: claim one due attempt (SKIP LOCKED)
//!   │                                                            └─ spawn dispatch(attempt)
//!   │                                                                 ├─ look up service + forwarder config
//!   │                                                                 ├─ forward with a 30 s deadline
//!   │                                                                 ├─ Success → mark success + webhook success
//!   │                                                                 └─ Failure → mark failed + reschedule with backoff
//!   └─ shutdown → drain AMQP sessions and exit
//! ```
//!
//! Both wake sources run the same body; the per-row claim query is the
//! serialisation point, so overlapping passes never double-deliver.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RetryDelay};
use crate::db::handlers::{Attempts, TaskLocks, Webhooks};
use crate::db::models::{DeliveryAttempt, DeliveryStatus, DispatchContext};
use crate::db::Database;
use crate::forwarders::{DeliveryRequest, DeliveryResult, ForwarderRegistry, FORWARD_TIMEOUT};
use crate::membership::Membership;

const RECLAIMER_TASK: &str = "reclaimer";

/// Concurrent dispatches per worker process.
const DISPATCH_CONCURRENCY: usize = 16;

/// Responses that fail the attempt and reschedule it: server errors, rate
/// limits, and upstream timeouts. Everything else completes the attempt with
/// the status recorded.
pub fn should_retry(status_code: u16) -> bool {
    status_code >= 500 || status_code == 429 || status_code == 408
}

/// Delay before the next try for a target that already has `attempt_count`
/// recorded attempts.
pub fn backoff_delay(retry_delay: RetryDelay, attempt_count: i64) -> chrono::Duration {
    match retry_delay {
        RetryDelay::Exponential => {
            // 2^n seconds, exponent saturated so the shift never overflows.
            let exponent = attempt_count.clamp(0, 30) as u32;
            chrono::Duration::seconds(1i64 << exponent)
        }
        RetryDelay::Fixed => chrono::Duration::seconds(2),
    }
}

pub struct Scheduler {
    db: Database,
    config: Arc<Config>,
    membership: Membership,
    registry: ForwarderRegistry,
    in_flight: AtomicUsize,
}

impl Scheduler {
    pub fn new(db: Database, config: Arc<Config>, membership: Membership) -> anyhow::Result<Self> {
        Ok(Self {
            db,
            config,
            membership,
            registry: ForwarderRegistry::new()?,
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn worker_name(&self) -> &str {
        self.membership.node_name()
    }

    /// Run until shutdown, waking on the ticker and on notify events.
    #[tracing::instrument(skip_all, fields(worker = %self.worker_name()))]
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<String>,
        shutdown: CancellationToken,
    ) {
        let interval = Duration::from_secs(self.config.settings.ticker_interval.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!("Event processor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.config.settings.ticker_enabled {
                        continue;
                    }
                    tracing::debug!("Processing scheduled events");
                    if let Err(e) = self.process_due().await {
                        tracing::error!(error = %e, "Failed to process scheduled events");
                    }
                }
                event = events.recv() => match event {
                    Some(webhook_id) => {
                        tracing::debug!(webhook_id = %webhook_id, "Processing event from channel");
                        if let Err(e) = self.process_due().await {
                            tracing::error!(error = %e, "Failed to process events from channel");
                        }
                    }
                    None => break,
                }
            }
        }

        self.registry.drain().await;
        tracing::info!("Event processor stopped");
    }

    /// One pass: reclaim abandoned work, then claim and dispatch every due
    /// attempt inside this node's ranges.
    pub async fn process_due(self: &Arc<Self>) -> anyhow::Result<()> {
        self.reclaim_abandoned().await;

        let due = {
            let mut conn = self.db.pool().acquire().await?;
            Attempts::new(&mut conn).count_due(Utc::now()).await?
        };
        if due > 0 {
            tracing::info!(count = due, "Found events to deliver");
        }

        let ranges = self.membership.ranges(&self.db).await?;
        let semaphore = Arc::new(Semaphore::new(DISPATCH_CONCURRENCY));
        let mut join_set: JoinSet<()> = JoinSet::new();
        let mut claimed_total = 0usize;

        for range in ranges {
            loop {
                // Hold a permit before claiming so no attempt sits in
                // `processing` waiting for dispatch capacity.
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };

                let claimed = {
                    let mut conn = self.db.pool().acquire().await?;
                    let mut attempts = Attempts::new(&mut conn);
                    if range.wraps {
                        attempts
                            .claim_wrapping(self.worker_name(), range.start, range.end)
                            .await?
                    } else {
                        attempts
                            .claim_in_range(self.worker_name(), range.start, range.end)
                            .await?
                    }
                };

                let Some(attempt) = claimed else {
                    break;
                };

                claimed_total += 1;
                self.in_flight.fetch_add(1, Ordering::Relaxed);

                let scheduler = Arc::clone(self);
                join_set.spawn(async move {
                    let _permit = permit;
                    let _guard = scopeguard::guard((), |_| {
                        scheduler.in_flight.fetch_sub(1, Ordering::Relaxed);
                    });

                    let attempt_id = attempt.id;
                    if let Err(e) = scheduler.dispatch(attempt).await {
                        tracing::error!(attempt_id, error = %e, "Failed to deliver event");
                    }
                });
            }
        }

        if claimed_total > 0 {
            tracing::info!(
                count = claimed_total,
                in_flight = self.in_flight.load(Ordering::Relaxed),
                "Claimed due delivery attempts"
            );
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(join_error) = result {
                tracing::error!(error = %join_error, "Dispatch task panicked");
            }
        }

        Ok(())
    }

    /// Return abandoned `processing` rows to the queue. Guarded by the task
    /// lock so only one node in the fleet runs it at a time.
    async fn reclaim_abandoned(&self) {
        let mut conn = match self.db.pool().acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to acquire connection for reclaimer");
                return;
            }
        };

        let lock = match TaskLocks::new(&mut conn).acquire(RECLAIMER_TASK, self.worker_name()).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                tracing::debug!("Reclaimer lock held elsewhere, skipping");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to acquire reclaimer lock");
                return;
            }
        };

        let reclaimed = Attempts::new(&mut conn).reclaim_abandoned().await;
        if let Err(e) = TaskLocks::new(&mut conn).touch(&lock.task_name).await {
            tracing::warn!(error = %e, "Failed to touch reclaimer lock");
        }
        if let Err(e) = TaskLocks::new(&mut conn).release(&lock.task_name).await {
            tracing::warn!(error = %e, "Failed to release reclaimer lock");
        }

        match reclaimed {
            Ok(0) => {}
            Ok(count) => {
                tracing::warn!(count, "Returned abandoned delivery attempts to the queue");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to reclaim abandoned delivery attempts");
            }
        }
    }

    /// Deliver one claimed attempt and record the outcome.
    #[tracing::instrument(skip_all, fields(attempt_id = attempt.id))]
    async fn dispatch(&self, attempt: DeliveryAttempt) -> anyhow::Result<()> {
        let context = {
            let mut conn = self.db.pool().acquire().await?;
            Attempts::new(&mut conn).dispatch_context(attempt.id).await?
        };
        let Some(context) = context else {
            anyhow::bail!("claimed attempt {} no longer exists", attempt.id);
        };

        let Some(service) = self.config.service_by_id(&context.webhook_service_id) else {
            tracing::error!(
                service_id = %context.webhook_service_id,
                "Webhook service not found in configuration, marking attempt not needed"
            );
            return self.record_not_needed(context.attempt_id).await;
        };
        let Some(forwarder_config) = service.forwarders.get(&context.forwarder_id) else {
            tracing::error!(
                service_id = %context.webhook_service_id,
                forwarder_id = %context.forwarder_id,
                "Forwarder not found in configuration, marking attempt not needed"
            );
            return self.record_not_needed(context.attempt_id).await;
        };

        let request =
            match DeliveryRequest::from_context(&context, forwarder_config, Utc::now().timestamp()) {
                Ok(request) => request,
                Err(e) => {
                    return self
                        .record_failure(&context, forwarder_config.retry_count, forwarder_config.retry_delay, &e.to_string())
                        .await;
                }
            };

        let forwarder = self
            .registry
            .forwarder_for(&context.webhook_service_id, &context.forwarder_id, forwarder_config)
            .await;

        match tokio::time::timeout(FORWARD_TIMEOUT, forwarder.forward(&request)).await {
            Ok(Ok(result)) if !should_retry(result.status_code) => {
                self.record_success(&context, &result).await
            }
            Ok(Ok(result)) => {
                let message = format!("upstream returned retriable status {}", result.status_code);
                self.record_failure(&context, forwarder_config.retry_count, forwarder_config.retry_delay, &message)
                    .await
            }
            Ok(Err(e)) => {
                self.record_failure(&context, forwarder_config.retry_count, forwarder_config.retry_delay, &e.to_string())
                    .await
            }
            Err(_) => {
                let message = format!("delivery timed out after {}s", FORWARD_TIMEOUT.as_secs());
                self.record_failure(&context, forwarder_config.retry_count, forwarder_config.retry_delay, &message)
                    .await
            }
        }
    }

    async fn record_not_needed(&self, attempt_id: i64) -> anyhow::Result<()> {
        let mut conn = self.db.pool().acquire().await?;
        Attempts::new(&mut conn).mark_not_needed(attempt_id).await?;
        Ok(())
    }

    async fn record_success(
        &self,
        context: &DispatchContext,
        result: &DeliveryResult,
    ) -> anyhow::Result<()> {
        let headers_json = serde_json::to_value(&result.headers)?;

        let mut tx = self.db.pool().begin().await?;
        Attempts::new(&mut tx)
            .mark_success(
                context.attempt_id,
                i32::from(result.status_code),
                result.body.as_deref(),
                &headers_json,
            )
            .await?;
        Webhooks::new(&mut tx)
            .update_delivery_status(context.webhook_id, DeliveryStatus::Success)
            .await?;
        tx.commit().await?;

        tracing::info!(
            webhook_id = context.webhook_id,
            forwarder_id = %context.forwarder_id,
            status_code = result.status_code,
            "Delivered webhook"
        );
        Ok(())
    }

    /// Record the failure and either queue a replacement attempt with
    /// backoff or, once the configured retries are spent, mark the webhook
    /// failed. One transaction keeps the single-open-attempt invariant.
    async fn record_failure(
        &self,
        context: &DispatchContext,
        retry_count: u32,
        retry_delay: RetryDelay,
        error_message: &str,
    ) -> anyhow::Result<()> {
        let mut tx = self.db.pool().begin().await?;

        let attempt_count = Attempts::new(&mut tx).count_for_target(context.target_id).await?;
        Attempts::new(&mut tx)
            .mark_failed(context.attempt_id, error_message)
            .await?;

        if attempt_count > i64::from(retry_count) {
            Webhooks::new(&mut tx)
                .update_delivery_status(context.webhook_id, DeliveryStatus::Failed)
                .await?;
            tx.commit().await?;

            tracing::warn!(
                webhook_id = context.webhook_id,
                forwarder_id = %context.forwarder_id,
                attempt_count,
                error = %error_message,
                "Retries exhausted, webhook marked failed"
            );
            return Ok(());
        }

        let next_attempt_at = Utc::now() + backoff_delay(retry_delay, attempt_count);
        Attempts::new(&mut tx)
            .schedule(context.target_id, next_attempt_at, DeliveryStatus::Scheduled)
            .await?;
        tx.commit().await?;

        tracing::warn!(
            webhook_id = context.webhook_id,
            forwarder_id = %context.forwarder_id,
            attempt_count,
            next_attempt_at = %next_attempt_at,
            error = %error_message,
            "Delivery failed, rescheduled with backoff"
        );
        Ok(())
    }
}
