//! Row types for the relay's tables.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Shared status domain for webhooks and delivery attempts.
///
/// Webhooks move `future → scheduled → success | failed`; attempts move
/// `scheduled → processing → success | failed`, with `not_needed` reserved
/// for attempts whose forwarder disappeared from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "delivery_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Future,
    Scheduled,
    Processing,
    Success,
    Failed,
    NotNeeded,
}

/// One accepted inbound request, durably persisted.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Webhook {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub method: String,
    pub body: String,
    pub headers: serde_json::Value,
    pub query_params: serde_json::Value,
    pub webhook_service_id: String,
    pub delivery_status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
}

/// The pairing of one webhook with one configured forwarder — the unit that
/// retries are scoped to.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WebhookTarget {
    pub id: i64,
    pub webhook_id: i64,
    pub forwarder_id: String,
    pub created_at: DateTime<Utc>,
    pub hash_value: i64,
}

/// A single delivery try against a target. Rows are immutable history: a
/// failure inserts a fresh `scheduled` row rather than rewinding this one.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeliveryAttempt {
    pub id: i64,
    pub target_id: i64,
    pub status: DeliveryStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub response_headers: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub hash_value: i64,
    pub worker_name: Option<String>,
}

/// One virtual node's position on the hash ring.
#[derive(Debug, Clone, FromRow)]
pub struct HashRingMember {
    pub id: i32,
    pub node_name: String,
    pub virtual_id: i32,
    pub hash_key: i64,
}

/// Row backing singleton background tasks (e.g. the reclaimer).
#[derive(Debug, Clone, FromRow)]
pub struct TaskLock {
    pub id: i32,
    pub task_name: String,
    pub worker_name: String,
    pub acquired_at: DateTime<Utc>,
    pub touched_at: Option<DateTime<Utc>>,
}

/// Everything the worker needs to forward one claimed attempt: the attempt
/// joined with its target and originating webhook.
#[derive(Debug, Clone, FromRow)]
pub struct DispatchContext {
    pub attempt_id: i64,
    pub target_id: i64,
    pub webhook_id: i64,
    pub forwarder_id: String,
    pub webhook_service_id: String,
    pub method: String,
    pub url: String,
    pub body: String,
    pub headers: serde_json::Value,
    pub query_params: serde_json::Value,
    pub idempotency_key: Option<String>,
}

/// Per-target rollup for the admin listing: the latest attempt's outcome
/// plus how many attempts have accumulated.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TargetSummary {
    pub id: i64,
    pub forwarder_id: String,
    pub created_at: DateTime<Utc>,
    pub webhook_service_id: String,
    pub status: DeliveryStatus,
    pub response_code: Option<i32>,
    pub attempt_count: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TargetDetails {
    pub id: i64,
    pub webhook_id: i64,
    pub forwarder_id: String,
    pub created_at: DateTime<Utc>,
    pub hash_value: i64,
    pub webhook_service_id: String,
    pub url: String,
    pub attempt_count: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AttemptSummary {
    pub id: i64,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub response_body: Option<String>,
    pub status: DeliveryStatus,
}
