//! The notify listener.
//!
//! Holds one connection out of the pool for its whole lifetime, subscribed
//! to the webhook task channel, and republishes every payload onto the
//! scheduler's internal event stream. On any listener error the connection
//! is abandoned and a fresh one is dialed after a fixed delay.

use std::time::Duration;

use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WEBHOOK_TASKS_CHANNEL;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

pub async fn run_listener(pool: PgPool, events: mpsc::Sender<String>, shutdown: CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match subscribe(&pool).await {
            Ok(mut listener) => {
                tracing::info!(channel = WEBHOOK_TASKS_CHANNEL, "Listening for webhook notifications");

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        notification = listener.recv() => match notification {
                            Ok(notification) => {
                                if events.send(notification.payload().to_string()).await.is_err() {
                                    tracing::debug!("Event stream closed, stopping listener");
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Notify listener lost its connection");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to subscribe to webhook notifications");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn subscribe(pool: &PgPool) -> sqlx::Result<PgListener> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(WEBHOOK_TASKS_CHANNEL).await?;
    Ok(listener)
}
