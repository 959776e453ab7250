//! Read-only admin surface, served on its own port.
//!
//! JSON views over the delivery tables: a cursor-paginated target listing
//! and per-target attempt history.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::db::handlers::Webhooks;
use crate::db::models::{AttemptSummary, TargetDetails, TargetSummary};
use crate::errors::{Error, Result};
use crate::ingress::handle_panic;
use crate::AppState;

const PAGE_SIZE: i64 = 20;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/admin/status", get(status_handler))
        .route("/admin/delivery-attempts", get(delivery_attempts_handler))
        .route("/admin/targets/{id}", get(target_details_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

async fn status_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "running"}))
}

#[derive(Debug, Deserialize, Default)]
struct ListParams {
    #[serde(default)]
    service: String,
    #[serde(default)]
    forwarder: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    cursor: i64,
}

#[derive(Debug, Serialize)]
struct DeliveryAttemptsResponse {
    items: Vec<TargetSummary>,
    has_more: bool,
    last_id: i64,
}

async fn delivery_attempts_handler(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<DeliveryAttemptsResponse>> {
    let mut conn = state.db.pool().acquire().await.map_err(crate::db::errors::DbError::from)?;

    // Fetch one extra row to learn whether another page exists.
    let mut items = Webhooks::new(&mut conn)
        .list_targets(
            &params.service,
            &params.forwarder,
            &params.status,
            params.cursor,
            PAGE_SIZE + 1,
        )
        .await?;

    let has_more = items.len() as i64 > PAGE_SIZE;
    if has_more {
        items.truncate(PAGE_SIZE as usize);
    }
    let last_id = items.last().map(|t| t.id).unwrap_or(0);

    Ok(Json(DeliveryAttemptsResponse { items, has_more, last_id }))
}

#[derive(Debug, Serialize)]
struct TargetDetailsResponse {
    target: TargetDetails,
    attempts: Vec<AttemptSummary>,
}

async fn target_details_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TargetDetailsResponse>> {
    let mut conn = state.db.pool().acquire().await.map_err(crate::db::errors::DbError::from)?;

    let Some(target) = Webhooks::new(&mut conn).target_details(id).await? else {
        return Err(Error::NotFound {
            resource: "webhook target",
            id: id.to_string(),
        });
    };
    let attempts = crate::db::handlers::Attempts::new(&mut conn).list_for_target(id).await?;

    Ok(Json(TargetDetailsResponse { target, attempts }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::handlers::Attempts;
    use crate::db::models::DeliveryStatus;
    use crate::db::Database;
    use crate::hashing;
    use axum_test::TestServer;
    use chrono::Utc;
    use sqlx::PgPool;
    use std::sync::Arc;

    fn test_server(pool: &PgPool) -> TestServer {
        let state = AppState {
            db: Database::new(pool.clone()),
            config: Arc::new(Config::default()),
        };
        TestServer::new(router(state)).unwrap()
    }

    async fn seed_target(pool: &PgPool, service: &str, forwarder: &str) -> i64 {
        let mut conn = pool.acquire().await.unwrap();
        let webhook = Webhooks::new(&mut conn)
            .insert_event(
                "evt",
                "/listener/svc",
                "POST",
                "{}",
                &serde_json::json!({}),
                &serde_json::json!({}),
                service,
            )
            .await
            .unwrap();
        let target = Webhooks::new(&mut conn)
            .insert_target(webhook.id, forwarder, hashing::target_hash(webhook.id, forwarder))
            .await
            .unwrap();
        Attempts::new(&mut conn)
            .schedule(target.id, Utc::now(), DeliveryStatus::Scheduled)
            .await
            .unwrap();
        target.id
    }

    #[sqlx::test]
    async fn status_reports_running(pool: PgPool) {
        let server = test_server(&pool);
        let response = server.get("/admin/status").await;
        response.assert_status_ok();
        response.assert_json(&serde_json::json!({"status": "running"}));
    }

    #[sqlx::test]
    async fn listing_rolls_up_latest_attempt_state(pool: PgPool) {
        let target_id = seed_target(&pool, "svc", "crm").await;
        seed_target(&pool, "other", "audit").await;

        let server = test_server(&pool);
        let response = server.get("/admin/delivery-attempts").await;
        response.assert_status_ok();

        let body: serde_json::Value = response.json();
        assert_eq!(body["items"].as_array().unwrap().len(), 2);
        assert_eq!(body["has_more"], false);

        // Filtered by service, only the matching target remains.
        let filtered: serde_json::Value = server
            .get("/admin/delivery-attempts")
            .add_query_param("service", "svc")
            .await
            .json();
        let items = filtered["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], target_id);
        assert_eq!(items[0]["status"], "scheduled");
        assert_eq!(items[0]["attempt_count"], 1);
    }

    #[sqlx::test]
    async fn target_details_include_attempt_history(pool: PgPool) {
        let target_id = seed_target(&pool, "svc", "crm").await;

        let server = test_server(&pool);
        let response = server.get(&format!("/admin/targets/{target_id}")).await;
        response.assert_status_ok();

        let body: serde_json::Value = response.json();
        assert_eq!(body["target"]["id"], target_id);
        assert_eq!(body["target"]["webhook_service_id"], "svc");
        assert_eq!(body["attempts"].as_array().unwrap().len(), 1);
    }

    #[sqlx::test]
    async fn missing_target_is_not_found(pool: PgPool) {
        let server = test_server(&pool);
        let response = server.get("/admin/targets/999").await;
        response.assert_status(axum::http::StatusCode::NOT_FOUND);
    }
}
