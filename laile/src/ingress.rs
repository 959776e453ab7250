//! Ingress HTTP surface.
//!
//! `/listener/{listener}` accepts any method, resolves the webhook service,
//! and records the request durably: webhook row, idempotency key, one target
//! and one first attempt per configured forwarder, all in one transaction.
//! Workers are notified after commit on a best-effort basis — a lost notify
//! only delays delivery until the next ticker pass.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::config::{AuthenticationType, WebhookService};
use crate::db::errors::DbError;
use crate::db::handlers::{Attempts, Webhooks};
use crate::db::models::DeliveryStatus;
use crate::errors::{Error, Result};
use crate::hashing;
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(hello_world_handler))
        .route("/health", get(health_handler))
        .route("/listener/{listener}", any(webhook_listener_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

/// Recovered-panic response shared by both HTTP surfaces.
pub(crate) fn handle_panic(
    err: Box<dyn std::any::Any + Send + 'static>,
) -> axum::response::Response {
    let detail = err
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| err.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(panic = %detail, "Panic recovered in HTTP handler");

    let body = json!({"status": "error", "message": "Internal server error"});
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

async fn hello_world_handler() -> Json<serde_json::Value> {
    Json(json!({"message": "Hello World"}))
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.db.health().await)
}

async fn webhook_listener_handler(
    State(state): State<AppState>,
    Path(listener): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    handle_event(&state, &listener, &method, &uri, &headers, &body).await?;
    Ok(Json(json!({"status": "ok"})))
}

/// The webhook idempotency key, set exactly once inside the ingress
/// transaction.
pub fn webhook_idempotency_key(webhook_id: i64, listener: &str) -> String {
    format!("event:v1-{webhook_id}-{listener}")
}

async fn handle_event(
    state: &AppState,
    listener: &str,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<()> {
    let Some((service_name, service)) = state.config.resolve_service(listener) else {
        return Err(Error::NotFound {
            resource: "webhook service",
            id: listener.to_string(),
        });
    };

    authenticate(service, headers)?;

    let payload = String::from_utf8_lossy(body).into_owned();
    let headers_json =
        serde_json::to_value(headers_to_map(headers)).map_err(anyhow::Error::from)?;
    let query_params_json =
        serde_json::to_value(query_params_to_map(uri)).map_err(anyhow::Error::from)?;

    let mut tx = state.db.pool().begin().await.map_err(DbError::from)?;

    let event_name = uuid::Uuid::new_v4().simple().to_string();
    let webhook = Webhooks::new(&mut tx)
        .insert_event(
            &event_name,
            &uri.to_string(),
            method.as_str(),
            &payload,
            &headers_json,
            &query_params_json,
            service_name,
        )
        .await?;

    Webhooks::new(&mut tx)
        .set_idempotency_key(webhook.id, &webhook_idempotency_key(webhook.id, listener))
        .await?;

    let now = Utc::now();
    for forwarder_name in service.forwarders.keys() {
        let hash_value = hashing::target_hash(webhook.id, forwarder_name);
        let target = Webhooks::new(&mut tx)
            .insert_target(webhook.id, forwarder_name, hash_value)
            .await?;
        Attempts::new(&mut tx)
            .schedule(target.id, now, DeliveryStatus::Scheduled)
            .await?;
    }

    Webhooks::new(&mut tx).mark_scheduled(webhook.id).await?;
    tx.commit().await.map_err(DbError::from)?;

    tracing::info!(
        event_id = webhook.id,
        service_id = %service_name,
        "Webhook event recorded"
    );

    // The attempts are already durable; a lost notify just means the ticker
    // picks them up instead.
    if let Err(e) = state.db.notify_webhook(webhook.id).await {
        tracing::warn!(error = %e, event_id = webhook.id, "Failed to notify workers after commit");
    }

    Ok(())
}

fn authenticate(service: &WebhookService, headers: &HeaderMap) -> Result<()> {
    match service.authentication_type {
        AuthenticationType::None => Ok(()),
        AuthenticationType::Header => {
            let presented = headers
                .get(&service.authentication_header)
                .and_then(|v| v.to_str().ok());
            if presented == Some(service.authentication_secret.as_str()) {
                Ok(())
            } else {
                Err(Error::Unauthenticated)
            }
        }
    }
}

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        map.insert(name.to_string(), values);
    }
    map
}

fn query_params_to_map(uri: &Uri) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes()) {
        map.entry(name.into_owned()).or_default().push(value.into_owned());
    }
    map
}
