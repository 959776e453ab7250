//! Delivery transports.
//!
//! A forwarder takes one prepared [`DeliveryRequest`] and pushes it to its
//! downstream — an HTTP endpoint or an AMQP exchange. Both variants sit
//! behind the [`Forwarder`] sum type so the worker dispatches on the
//! configured kind. AMQP connection state is cached per configured forwarder
//! in a [`ForwarderRegistry`] owned by the scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::{self, ForwarderKind};
use crate::db::models::DispatchContext;

pub mod amqp;
pub mod http;

pub use amqp::AmqpForwarder;
pub use http::HttpForwarder;

/// Header carrying the per-attempt idempotency key on HTTP deliveries.
pub const IDEMPOTENCY_HEADER: &str = "laile-idempotency-key";

/// Upper bound on one delivery attempt, transport round-trip included.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// One prepared delivery: the persisted request plus the forwarder's
/// destination and a fresh per-attempt idempotency key.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub headers: HashMap<String, Vec<String>>,
    pub body: String,
    pub query_params: HashMap<String, Vec<String>>,
    pub method: String,
    pub url: String,
    pub idempotency_key: String,
}

impl DeliveryRequest {
    /// Build the request for one claimed attempt.
    ///
    /// The idempotency key is minted per attempt — `{forwarder}-{unix}-{attempt}`
    /// — distinct from the webhook's own key, so receivers can deduplicate
    /// individual retries.
    pub fn from_context(
        context: &DispatchContext,
        forwarder: &config::Forwarder,
        now_unix: i64,
    ) -> Result<Self, ForwardError> {
        let headers: HashMap<String, Vec<String>> =
            serde_json::from_value(context.headers.clone())?;
        let query_params: HashMap<String, Vec<String>> =
            serde_json::from_value(context.query_params.clone())?;

        Ok(Self {
            headers,
            body: context.body.clone(),
            query_params,
            method: context.method.clone(),
            url: forwarder.url.clone(),
            idempotency_key: format!(
                "{}-{}-{}",
                context.forwarder_id, now_unix, context.attempt_id
            ),
        })
    }
}

/// What came back from a completed transport round-trip. A confirmed AMQP
/// publish reports status 200 with no headers or body.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub status_code: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Option<String>,
}

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("forwarder request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("AMQP operation failed: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("publish was not confirmed within the timeout")]
    PublishTimeout,

    #[error("broker did not confirm the publish")]
    NotConfirmed,

    #[error("message was nacked by the broker")]
    Nacked,

    #[error("invalid delivery data: {message}")]
    Invalid { message: String },

    #[error("failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// The two transports, dispatched by configured forwarder type.
#[derive(Clone)]
pub enum Forwarder {
    Http(HttpForwarder),
    Amqp(Arc<AmqpForwarder>),
}

impl Forwarder {
    pub async fn forward(&self, request: &DeliveryRequest) -> Result<DeliveryResult, ForwardError> {
        match self {
            Forwarder::Http(http) => http.forward(request).await,
            Forwarder::Amqp(amqp) => amqp.forward(request).await,
        }
    }
}

/// Per-process cache of transport state, keyed by `{service}-{forwarder}`.
///
/// HTTP is stateless per call and shares one client; AMQP sessions are
/// created lazily, reused across publishes, and dropped by the forwarder
/// itself on connection-class errors. The registry is owned by the worker
/// and drained at shutdown.
pub struct ForwarderRegistry {
    http_client: reqwest::Client,
    sessions: RwLock<HashMap<String, Arc<AmqpForwarder>>>,
}

impl ForwarderRegistry {
    pub fn new() -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()?;

        Ok(Self {
            http_client,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve the transport for one configured forwarder.
    pub async fn forwarder_for(
        &self,
        service_name: &str,
        forwarder_name: &str,
        forwarder: &config::Forwarder,
    ) -> Forwarder {
        match forwarder.kind {
            ForwarderKind::Http => {
                Forwarder::Http(HttpForwarder::new(self.http_client.clone(), forwarder.clone()))
            }
            ForwarderKind::Amqp => {
                let key = config::Forwarder::session_key(service_name, forwarder_name);

                if let Some(existing) = self.sessions.read().await.get(&key) {
                    return Forwarder::Amqp(existing.clone());
                }

                let mut sessions = self.sessions.write().await;
                let entry = sessions
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(AmqpForwarder::new(key, forwarder.clone())))
                    .clone();
                Forwarder::Amqp(entry)
            }
        }
    }

    /// Close every cached AMQP session. Called once at worker shutdown.
    pub async fn drain(&self) {
        let mut sessions = self.sessions.write().await;
        for (key, forwarder) in sessions.drain() {
            tracing::debug!(forwarder = %key, "Closing AMQP session");
            forwarder.dispose().await;
        }
    }
}
