//! Database service: pool construction, migrations, health, and notify.

use std::time::Duration;

use serde_json::json;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::instrument;

pub mod errors;
pub mod handlers;
pub mod models;

use crate::config::WEBHOOK_TASKS_CHANNEL;
use errors::Result;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Handle to the shared relational store. Cloning shares the pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build the pool from the `DB_*` environment variables.
    pub async fn connect_from_env() -> anyhow::Result<Self> {
        let host = std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
        let username = std::env::var("DB_USERNAME").unwrap_or_else(|_| "postgres".to_string());
        let password = std::env::var("DB_PASSWORD").unwrap_or_default();
        let database = std::env::var("DB_DATABASE").unwrap_or_else(|_| "laile".to_string());

        let url = format!("postgres://{username}:{password}@{host}:{port}/{database}?sslmode=disable");

        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Ping the store with a short deadline.
    pub async fn health(&self) -> serde_json::Value {
        let ping = tokio::time::timeout(
            Duration::from_secs(5),
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await;

        match ping {
            Ok(Ok(_)) => json!({"message": "It's healthy"}),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Database ping failed");
                json!({"message": "It's not healthy"})
            }
            Err(_) => {
                tracing::warn!("Database ping timed out");
                json!({"message": "It's not healthy"})
            }
        }
    }

    /// Publish a webhook id on the task channel. Runs on a freshly acquired
    /// pool connection, after the ingress transaction has committed.
    #[instrument(skip(self), err)]
    pub async fn notify_webhook(&self, webhook_id: i64) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(WEBHOOK_TASKS_CHANNEL)
            .bind(webhook_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
