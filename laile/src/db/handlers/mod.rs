//! Database repositories for the relay's tables.
//!
//! Each repository borrows a `PgConnection`, so the same code runs against a
//! pooled connection or inside a transaction (`&mut *tx`).

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::{
    AttemptSummary, DeliveryAttempt, DeliveryStatus, DispatchContext, HashRingMember, TargetDetails,
    TargetSummary, TaskLock, Webhook, WebhookTarget,
};

/// Attempts stuck in `processing` longer than this are considered abandoned
/// by a dead worker and returned to `scheduled`.
pub const ABANDONMENT_THRESHOLD_MINUTES: i32 = 10;

/// Repository for webhook and target rows.
pub struct Webhooks<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Webhooks<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Persist a freshly accepted inbound request. The row starts in
    /// `future` until its targets and first attempts exist.
    #[instrument(skip(self, body, headers, query_params), fields(service_id = %webhook_service_id), err)]
    pub async fn insert_event(
        &mut self,
        name: &str,
        url: &str,
        method: &str,
        body: &str,
        headers: &serde_json::Value,
        query_params: &serde_json::Value,
        webhook_service_id: &str,
    ) -> Result<Webhook> {
        let webhook = sqlx::query_as::<_, Webhook>(
            r#"
            INSERT INTO webhooks (name, url, method, body, headers, query_params, webhook_service_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(url)
        .bind(method)
        .bind(body)
        .bind(headers)
        .bind(query_params)
        .bind(webhook_service_id)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(webhook)
    }

    pub async fn set_idempotency_key(&mut self, id: i64, key: &str) -> Result<()> {
        sqlx::query("UPDATE webhooks SET idempotency_key = $2 WHERE id = $1")
            .bind(id)
            .bind(key)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    pub async fn mark_scheduled(&mut self, id: i64) -> Result<()> {
        sqlx::query("UPDATE webhooks SET delivery_status = 'scheduled' WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    pub async fn update_delivery_status(&mut self, id: i64, status: DeliveryStatus) -> Result<()> {
        sqlx::query("UPDATE webhooks SET delivery_status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    pub async fn get(&mut self, id: i64) -> Result<Option<Webhook>> {
        let webhook = sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(webhook)
    }

    /// Create the (webhook, forwarder) pairing carrying the ring key that
    /// both the target and all of its attempts are claimed by.
    #[instrument(skip(self), err)]
    pub async fn insert_target(
        &mut self,
        webhook_id: i64,
        forwarder_id: &str,
        hash_value: i64,
    ) -> Result<WebhookTarget> {
        let target = sqlx::query_as::<_, WebhookTarget>(
            r#"
            INSERT INTO webhook_targets (webhook_id, forwarder_id, hash_value)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(webhook_id)
        .bind(forwarder_id)
        .bind(hash_value)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(target)
    }

    /// Cursor-paginated target listing for the admin surface. Empty filter
    /// strings match everything; `cursor = 0` starts from the newest row.
    pub async fn list_targets(
        &mut self,
        service_id: &str,
        forwarder_id: &str,
        status: &str,
        cursor: i64,
        page_size: i64,
    ) -> Result<Vec<TargetSummary>> {
        let targets = sqlx::query_as::<_, TargetSummary>(
            r#"
            WITH latest_attempts AS (
                SELECT DISTINCT ON (target_id) target_id, status, response_code
                FROM delivery_attempts
                ORDER BY target_id, created_at DESC
            ),
            attempt_counts AS (
                SELECT target_id, COUNT(*) AS attempt_count
                FROM delivery_attempts
                GROUP BY target_id
            )
            SELECT
                wt.id,
                wt.forwarder_id,
                wt.created_at,
                w.webhook_service_id,
                COALESCE(la.status, 'future'::delivery_status) AS status,
                la.response_code,
                COALESCE(ac.attempt_count, 0) AS attempt_count
            FROM webhook_targets wt
                JOIN webhooks w ON wt.webhook_id = w.id
                LEFT JOIN latest_attempts la ON la.target_id = wt.id
                LEFT JOIN attempt_counts ac ON ac.target_id = wt.id
            WHERE
                ($1 = '' OR w.webhook_service_id = $1) AND
                ($2 = '' OR wt.forwarder_id = $2) AND
                ($3 = '' OR la.status::text = $3) AND
                ($4 = 0 OR wt.id < $4)
            ORDER BY wt.id DESC
            LIMIT $5
            "#,
        )
        .bind(service_id)
        .bind(forwarder_id)
        .bind(status)
        .bind(cursor)
        .bind(page_size)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(targets)
    }

    pub async fn target_details(&mut self, id: i64) -> Result<Option<TargetDetails>> {
        let details = sqlx::query_as::<_, TargetDetails>(
            r#"
            SELECT
                wt.id, wt.webhook_id, wt.forwarder_id, wt.created_at, wt.hash_value,
                w.webhook_service_id,
                w.url,
                COUNT(da.id) AS attempt_count
            FROM webhook_targets wt
                JOIN webhooks w ON wt.webhook_id = w.id
                LEFT JOIN delivery_attempts da ON da.target_id = wt.id
            WHERE wt.id = $1
            GROUP BY wt.id, wt.webhook_id, w.webhook_service_id, w.url
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(details)
    }
}

/// Repository for delivery attempt rows.
pub struct Attempts<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Attempts<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Insert a new attempt for a target. The target's ring key is copied
    /// onto the row so range claims never need a join.
    #[instrument(skip(self), err)]
    pub async fn schedule(
        &mut self,
        target_id: i64,
        scheduled_for: DateTime<Utc>,
        status: DeliveryStatus,
    ) -> Result<DeliveryAttempt> {
        let attempt = sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            INSERT INTO delivery_attempts (target_id, scheduled_for, status, hash_value)
            SELECT wt.id, $2, $3, wt.hash_value
            FROM webhook_targets wt
            WHERE wt.id = $1
            RETURNING *
            "#,
        )
        .bind(target_id)
        .bind(scheduled_for)
        .bind(status)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(attempt)
    }

    pub async fn count_for_target(&mut self, target_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM delivery_attempts WHERE target_id = $1")
                .bind(target_id)
                .fetch_one(&mut *self.db)
                .await?;
        Ok(count)
    }

    pub async fn count_due(&mut self, now: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM delivery_attempts
            WHERE status = 'scheduled' AND (scheduled_for <= $1 OR scheduled_for IS NULL)
            "#,
        )
        .bind(now)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }

    /// Atomically claim one due attempt whose ring key falls in
    /// `[hash_start, hash_end)`. Skip-locked keeps concurrent claimants from
    /// ever observing the same row.
    #[instrument(skip(self), fields(worker = %worker_name), err)]
    pub async fn claim_in_range(
        &mut self,
        worker_name: &str,
        hash_start: i64,
        hash_end: i64,
    ) -> Result<Option<DeliveryAttempt>> {
        let attempt = sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            UPDATE delivery_attempts
            SET status = 'processing', worker_name = $1, executed_at = NOW()
            WHERE id = (
                SELECT id FROM delivery_attempts
                WHERE status = 'scheduled'
                  AND scheduled_for <= NOW()
                  AND hash_value >= $2
                  AND hash_value < $3
                ORDER BY scheduled_for, hash_value
                    FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_name)
        .bind(hash_start)
        .bind(hash_end)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(attempt)
    }

    /// Claim variant for the one range that crosses the seam of the sorted
    /// key space: it owns everything at or above its start plus everything
    /// below the ring's first key.
    #[instrument(skip(self), fields(worker = %worker_name), err)]
    pub async fn claim_wrapping(
        &mut self,
        worker_name: &str,
        hash_start: i64,
        hash_end: i64,
    ) -> Result<Option<DeliveryAttempt>> {
        let attempt = sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            UPDATE delivery_attempts
            SET status = 'processing', worker_name = $1, executed_at = NOW()
            WHERE id = (
                SELECT id FROM delivery_attempts
                WHERE status = 'scheduled'
                  AND scheduled_for <= NOW()
                  AND (hash_value >= $2 OR hash_value < $3)
                ORDER BY scheduled_for, hash_value
                    FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_name)
        .bind(hash_start)
        .bind(hash_end)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(attempt)
    }

    pub async fn mark_success(
        &mut self,
        id: i64,
        response_code: i32,
        response_body: Option<&str>,
        response_headers: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_attempts SET
                status = 'success', executed_at = NOW(),
                response_code = $2, response_body = $3, response_headers = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(response_code)
        .bind(response_body)
        .bind(response_headers)
        .execute(&mut *self.db)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&mut self, id: i64, error_message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET status = 'failed', executed_at = NOW(), error_message = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_message)
        .execute(&mut *self.db)
        .await?;
        Ok(())
    }

    /// Terminal state for attempts whose service or forwarder no longer
    /// exists in configuration.
    pub async fn mark_not_needed(&mut self, id: i64) -> Result<()> {
        sqlx::query("UPDATE delivery_attempts SET status = 'not_needed' WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    /// Return attempts stuck in `processing` past the abandonment threshold
    /// to `scheduled` so another worker can pick them up.
    #[instrument(skip(self), err)]
    pub async fn reclaim_abandoned(&mut self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET status = 'scheduled', worker_name = NULL, executed_at = NULL
            WHERE status = 'processing'
              AND executed_at < NOW() - make_interval(mins => $1)
            "#,
        )
        .bind(ABANDONMENT_THRESHOLD_MINUTES)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Join a claimed attempt with its target and webhook for dispatch.
    pub async fn dispatch_context(&mut self, attempt_id: i64) -> Result<Option<DispatchContext>> {
        let context = sqlx::query_as::<_, DispatchContext>(
            r#"
            SELECT
                da.id AS attempt_id,
                wt.id AS target_id,
                w.id AS webhook_id,
                wt.forwarder_id,
                w.webhook_service_id,
                w.method,
                w.url,
                w.body,
                w.headers,
                w.query_params,
                w.idempotency_key
            FROM delivery_attempts da
                JOIN webhook_targets wt ON da.target_id = wt.id
                JOIN webhooks w ON wt.webhook_id = w.id
            WHERE da.id = $1
            "#,
        )
        .bind(attempt_id)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(context)
    }

    pub async fn list_for_target(&mut self, target_id: i64) -> Result<Vec<AttemptSummary>> {
        let attempts = sqlx::query_as::<_, AttemptSummary>(
            r#"
            SELECT id, scheduled_for, executed_at, created_at, response_body, status
            FROM delivery_attempts
            WHERE target_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(target_id)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(attempts)
    }
}

/// Repository for hash-ring membership.
pub struct HashRing<'c> {
    db: &'c mut PgConnection,
}

impl<'c> HashRing<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Idempotently register one virtual node. Conflicts on the composite
    /// `(node_name, virtual_id)` so every virtual of a restarting node is a
    /// clean no-op.
    pub async fn register(
        &mut self,
        node_name: &str,
        virtual_id: i32,
        hash_key: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hash_ring (node_name, virtual_id, hash_key)
            VALUES ($1, $2, $3)
            ON CONFLICT (node_name, virtual_id) DO NOTHING
            "#,
        )
        .bind(node_name)
        .bind(virtual_id)
        .bind(hash_key)
        .execute(&mut *self.db)
        .await?;
        Ok(())
    }

    pub async fn sorted_ring(&mut self) -> Result<Vec<HashRingMember>> {
        let members = sqlx::query_as::<_, HashRingMember>(
            "SELECT id, node_name, virtual_id, hash_key FROM hash_ring ORDER BY hash_key",
        )
        .fetch_all(&mut *self.db)
        .await?;
        Ok(members)
    }
}

/// Repository for singleton task locks.
pub struct TaskLocks<'c> {
    db: &'c mut PgConnection,
}

impl<'c> TaskLocks<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Try to take the named lock. Returns `None` when another worker holds
    /// it.
    pub async fn acquire(&mut self, task_name: &str, worker_name: &str) -> Result<Option<TaskLock>> {
        let lock = sqlx::query_as::<_, TaskLock>(
            r#"
            INSERT INTO task_locks (task_name, worker_name, acquired_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (task_name) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(task_name)
        .bind(worker_name)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(lock)
    }

    pub async fn touch(&mut self, task_name: &str) -> Result<()> {
        sqlx::query("UPDATE task_locks SET touched_at = NOW() WHERE task_name = $1")
            .bind(task_name)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    pub async fn release(&mut self, task_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM task_locks WHERE task_name = $1")
            .bind(task_name)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing;
    use sqlx::PgPool;

    async fn seed_attempt(pool: &PgPool, service: &str, forwarder: &str) -> (i64, i64, i64) {
        let mut conn = pool.acquire().await.unwrap();
        let webhook = Webhooks::new(&mut conn)
            .insert_event(
                "evt",
                "/listener/svc",
                "POST",
                r#"{"x":1}"#,
                &serde_json::json!({}),
                &serde_json::json!({}),
                service,
            )
            .await
            .unwrap();

        let hash = hashing::target_hash(webhook.id, forwarder);
        let target = Webhooks::new(&mut conn)
            .insert_target(webhook.id, forwarder, hash)
            .await
            .unwrap();

        let attempt = Attempts::new(&mut conn)
            .schedule(target.id, Utc::now(), DeliveryStatus::Scheduled)
            .await
            .unwrap();

        (webhook.id, target.id, attempt.id)
    }

    #[sqlx::test]
    async fn scheduled_attempt_copies_target_hash(pool: PgPool) {
        let (_, target_id, _) = seed_attempt(&pool, "svc", "fwd").await;

        let mut conn = pool.acquire().await.unwrap();
        let attempt = Attempts::new(&mut conn)
            .schedule(target_id, Utc::now(), DeliveryStatus::Scheduled)
            .await
            .unwrap();

        let target_hash: i64 =
            sqlx::query_scalar("SELECT hash_value FROM webhook_targets WHERE id = $1")
                .bind(target_id)
                .fetch_one(&mut *conn)
                .await
                .unwrap();

        assert_eq!(attempt.hash_value, target_hash);
        assert_eq!(attempt.status, DeliveryStatus::Scheduled);
    }

    #[sqlx::test]
    async fn claim_takes_due_rows_in_range_only(pool: PgPool) {
        let (_, _, attempt_id) = seed_attempt(&pool, "svc", "fwd").await;

        let mut conn = pool.acquire().await.unwrap();
        let hash: i64 = sqlx::query_scalar("SELECT hash_value FROM delivery_attempts WHERE id = $1")
            .bind(attempt_id)
            .fetch_one(&mut *conn)
            .await
            .unwrap();

        // A range that excludes the row claims nothing.
        let miss = Attempts::new(&mut conn)
            .claim_in_range("worker-a", hash + 1, hash + 2)
            .await
            .unwrap();
        assert!(miss.is_none());

        // A range containing the row claims it exactly once.
        let claimed = Attempts::new(&mut conn)
            .claim_in_range("worker-a", hash, hash + 1)
            .await
            .unwrap()
            .expect("row in range must be claimed");
        assert_eq!(claimed.id, attempt_id);
        assert_eq!(claimed.status, DeliveryStatus::Processing);
        assert_eq!(claimed.worker_name.as_deref(), Some("worker-a"));
        assert!(claimed.executed_at.is_some());

        // A second claim over the same range comes back empty.
        let second = Attempts::new(&mut conn)
            .claim_in_range("worker-b", hash, hash + 1)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[sqlx::test]
    async fn wrapping_claim_covers_both_halves(pool: PgPool) {
        let (_, _, attempt_id) = seed_attempt(&pool, "svc", "fwd").await;

        let mut conn = pool.acquire().await.unwrap();
        let hash: i64 = sqlx::query_scalar("SELECT hash_value FROM delivery_attempts WHERE id = $1")
            .bind(attempt_id)
            .fetch_one(&mut *conn)
            .await
            .unwrap();

        // Wrap range starting above the row and ending above it: the row is
        // caught by the low half.
        let claimed = Attempts::new(&mut conn)
            .claim_wrapping("worker-a", hash + 1, hash + 1)
            .await
            .unwrap();
        assert_eq!(claimed.map(|a| a.id), Some(attempt_id));
    }

    #[sqlx::test]
    async fn future_attempts_are_not_due(pool: PgPool) {
        let (_, target_id, attempt_id) = seed_attempt(&pool, "svc", "fwd").await;

        let mut conn = pool.acquire().await.unwrap();
        // Push the only attempt into the future.
        sqlx::query("UPDATE delivery_attempts SET scheduled_for = NOW() + INTERVAL '1 hour' WHERE id = $1")
            .bind(attempt_id)
            .execute(&mut *conn)
            .await
            .unwrap();

        let claimed = Attempts::new(&mut conn)
            .claim_wrapping("worker-a", 0, 0)
            .await
            .unwrap();
        assert!(claimed.is_none());

        let count = Attempts::new(&mut conn).count_for_target(target_id).await.unwrap();
        assert_eq!(count, 1);
        let due = Attempts::new(&mut conn).count_due(Utc::now()).await.unwrap();
        assert_eq!(due, 0);
    }

    #[sqlx::test]
    async fn reclaim_returns_abandoned_processing_rows(pool: PgPool) {
        let (_, _, attempt_id) = seed_attempt(&pool, "svc", "fwd").await;

        let mut conn = pool.acquire().await.unwrap();
        sqlx::query(
            r#"
            UPDATE delivery_attempts
            SET status = 'processing', worker_name = 'dead-worker',
                executed_at = NOW() - INTERVAL '11 minutes'
            WHERE id = $1
            "#,
        )
        .bind(attempt_id)
        .execute(&mut *conn)
        .await
        .unwrap();

        let reclaimed = Attempts::new(&mut conn).reclaim_abandoned().await.unwrap();
        assert_eq!(reclaimed, 1);

        let attempt = sqlx::query_as::<_, DeliveryAttempt>(
            "SELECT * FROM delivery_attempts WHERE id = $1",
        )
        .bind(attempt_id)
        .fetch_one(&mut *conn)
        .await
        .unwrap();
        assert_eq!(attempt.status, DeliveryStatus::Scheduled);
        assert!(attempt.worker_name.is_none());
        assert!(attempt.executed_at.is_none());

        // A fresh claim can now take it again.
        let claimed = Attempts::new(&mut conn)
            .claim_wrapping("worker-b", 0, 0)
            .await
            .unwrap();
        assert_eq!(claimed.map(|a| a.id), Some(attempt_id));
    }

    #[sqlx::test]
    async fn recent_processing_rows_are_left_alone(pool: PgPool) {
        let (_, _, attempt_id) = seed_attempt(&pool, "svc", "fwd").await;

        let mut conn = pool.acquire().await.unwrap();
        sqlx::query(
            "UPDATE delivery_attempts SET status = 'processing', executed_at = NOW() WHERE id = $1",
        )
        .bind(attempt_id)
        .execute(&mut *conn)
        .await
        .unwrap();

        let reclaimed = Attempts::new(&mut conn).reclaim_abandoned().await.unwrap();
        assert_eq!(reclaimed, 0);
    }

    #[sqlx::test]
    async fn dispatch_context_joins_webhook_fields(pool: PgPool) {
        let (webhook_id, target_id, attempt_id) = seed_attempt(&pool, "svc", "fwd").await;

        let mut conn = pool.acquire().await.unwrap();
        Webhooks::new(&mut conn)
            .set_idempotency_key(webhook_id, "event:v1-1-svc")
            .await
            .unwrap();

        let context = Attempts::new(&mut conn)
            .dispatch_context(attempt_id)
            .await
            .unwrap()
            .expect("context must exist");

        assert_eq!(context.attempt_id, attempt_id);
        assert_eq!(context.target_id, target_id);
        assert_eq!(context.webhook_id, webhook_id);
        assert_eq!(context.forwarder_id, "fwd");
        assert_eq!(context.webhook_service_id, "svc");
        assert_eq!(context.method, "POST");
        assert_eq!(context.body, r#"{"x":1}"#);
        assert_eq!(context.idempotency_key.as_deref(), Some("event:v1-1-svc"));
    }

    #[sqlx::test]
    async fn ring_registration_is_idempotent_per_virtual(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut ring = HashRing::new(&mut conn);

        for virtual_id in 0..4 {
            let key = hashing::virtual_node_hash("node-a", virtual_id as u32);
            ring.register("node-a", virtual_id, key).await.unwrap();
            // Re-registering the same virtual is a no-op, not an error.
            ring.register("node-a", virtual_id, key).await.unwrap();
        }

        let members = ring.sorted_ring().await.unwrap();
        assert_eq!(members.len(), 4);
        assert!(members.windows(2).all(|w| w[0].hash_key <= w[1].hash_key));
    }

    #[sqlx::test]
    async fn task_lock_is_exclusive_until_released(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut locks = TaskLocks::new(&mut conn);

        let held = locks.acquire("reclaimer", "worker-a").await.unwrap();
        assert!(held.is_some());

        let contended = locks.acquire("reclaimer", "worker-b").await.unwrap();
        assert!(contended.is_none());

        locks.touch("reclaimer").await.unwrap();
        locks.release("reclaimer").await.unwrap();

        let reacquired = locks.acquire("reclaimer", "worker-b").await.unwrap();
        assert_eq!(reacquired.unwrap().worker_name, "worker-b");
    }

    #[sqlx::test]
    async fn empty_headers_and_params_round_trip(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let webhook = Webhooks::new(&mut conn)
            .insert_event(
                "evt",
                "/listener/svc",
                "PUT",
                "",
                &serde_json::json!({}),
                &serde_json::json!({}),
                "svc",
            )
            .await
            .unwrap();

        let fetched = Webhooks::new(&mut conn).get(webhook.id).await.unwrap().unwrap();
        assert_eq!(fetched.headers, serde_json::json!({}));
        assert_eq!(fetched.query_params, serde_json::json!({}));
        assert_eq!(fetched.delivery_status, DeliveryStatus::Future);
        assert!(fetched.idempotency_key.is_none());
    }
}
