//! AMQP transport.
//!
//! One session (connection + channel) per configured forwarder, created
//! lazily and reused across publishes. The session lock doubles as the
//! publish mutex so publisher-confirm correlation on the shared channel is
//! never interleaved. Sessions are disposed only on connection-class errors
//! (AMQP reply code >= 300); everything else, a confirm timeout included,
//! keeps the session for the next attempt.

use std::time::Duration;

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::sync::Mutex;

use crate::config::{self, ExchangeType};

use super::{DeliveryRequest, DeliveryResult, ForwardError};

/// Publisher-confirm deadline for a single publish.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// `app-id` stamped on every published message.
pub const AMQP_APP_ID: &str = "laile-webhook-forwarder";

const HELP_TEXT: &str =
    "body is a raw JSON message, headers and query parameters are key-value maps";

struct Session {
    connection: Connection,
    channel: Channel,
}

impl Session {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }
}

pub struct AmqpForwarder {
    session_key: String,
    config: config::Forwarder,
    session: Mutex<Option<Session>>,
}

impl AmqpForwarder {
    pub fn new(session_key: String, config: config::Forwarder) -> Self {
        Self {
            session_key,
            config,
            session: Mutex::new(None),
        }
    }

    pub async fn forward(&self, request: &DeliveryRequest) -> Result<DeliveryResult, ForwardError> {
        let payload = encode_payload(request)?;

        let mut guard = self.session.lock().await;
        let stale = !matches!(guard.as_ref(), Some(session) if session.is_open());
        if stale {
            *guard = Some(self.create_session().await?);
        }
        let session = guard.as_ref().expect("session present after refresh");

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(if self.config.persistent { 2 } else { 1 })
            .with_app_id(AMQP_APP_ID.into());

        let publish = async {
            let confirm = session
                .channel
                .basic_publish(
                    &self.config.exchange,
                    &self.config.routing_key,
                    BasicPublishOptions {
                        mandatory: self.config.mandatory,
                        immediate: self.config.immediate,
                    },
                    &payload,
                    properties,
                )
                .await?;
            confirm.await
        };

        match tokio::time::timeout(PUBLISH_TIMEOUT, publish).await {
            Err(_) => {
                tracing::warn!(forwarder = %self.session_key, "Publish confirm timed out");
                Err(ForwardError::PublishTimeout)
            }
            Ok(Err(e)) => {
                if is_connection_error(&e) {
                    tracing::warn!(
                        forwarder = %self.session_key,
                        error = %e,
                        "Disposing AMQP session after connection-class error"
                    );
                    *guard = None;
                }
                Err(ForwardError::Amqp(e))
            }
            Ok(Ok(Confirmation::Ack(_))) => Ok(DeliveryResult {
                status_code: 200,
                headers: Default::default(),
                body: None,
            }),
            Ok(Ok(Confirmation::Nack(_))) => Err(ForwardError::Nacked),
            Ok(Ok(Confirmation::NotRequested)) => Err(ForwardError::NotConfirmed),
        }
    }

    async fn create_session(&self) -> Result<Session, ForwardError> {
        tracing::info!(forwarder = %self.session_key, "Dialing AMQP broker");

        let connection = Connection::connect(
            &self.config.connection_url,
            ConnectionProperties::default(),
        )
        .await?;
        let channel = connection.create_channel().await?;

        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        channel
            .exchange_declare(
                &self.config.exchange,
                exchange_kind(self.config.exchange_type),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: self.config.durable,
                    auto_delete: self.config.auto_delete,
                    internal: self.config.internal,
                    nowait: self.config.no_wait,
                },
                FieldTable::default(),
            )
            .await?;

        Ok(Session { connection, channel })
    }

    /// Tear down the cached session, if any.
    pub async fn dispose(&self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            if let Err(e) = session.connection.close(200, "shutting down").await {
                tracing::warn!(forwarder = %self.session_key, error = %e, "Failed to close AMQP connection");
            }
        }
    }
}

fn exchange_kind(exchange_type: ExchangeType) -> ExchangeKind {
    match exchange_type {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

fn is_connection_error(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(e) => e.get_id() >= 300,
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_) => true,
        _ => false,
    }
}

#[derive(Serialize)]
struct AmqpBody<'a> {
    headers: &'a std::collections::HashMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<PayloadBody<'a>>,
    query_params: &'a std::collections::HashMap<String, Vec<String>>,
    method: &'a str,
    url: &'a str,
    idempotency_key: &'a str,
    help_text: &'a str,
}

/// The stored body is embedded verbatim when it parses as JSON, otherwise as
/// a plain string.
#[derive(Serialize)]
#[serde(untagged)]
enum PayloadBody<'a> {
    Raw(&'a RawValue),
    Text(&'a str),
}

fn encode_payload(request: &DeliveryRequest) -> Result<Vec<u8>, ForwardError> {
    let body = if request.body.is_empty() {
        None
    } else {
        match serde_json::from_str::<&RawValue>(&request.body) {
            Ok(raw) => Some(PayloadBody::Raw(raw)),
            Err(_) => Some(PayloadBody::Text(&request.body)),
        }
    };

    let payload = AmqpBody {
        headers: &request.headers,
        body,
        query_params: &request.query_params,
        method: &request.method,
        url: &request.url,
        idempotency_key: &request.idempotency_key,
        help_text: HELP_TEXT,
    };

    Ok(serde_json::to_vec(&payload)?)
}
