//! HTTP transport.
//!
//! Replays the persisted request against the forwarder's configured URL.
//! Header composition order matters: persisted request headers first, then
//! the injected idempotency key, then forwarder-configured headers — later
//! entries override earlier ones. Persisted query parameters are merged onto
//! the destination URL additively, preserving multi-values.

use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;

use crate::config;

use super::{DeliveryRequest, DeliveryResult, ForwardError, IDEMPOTENCY_HEADER};

#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    config: config::Forwarder,
}

impl HttpForwarder {
    pub fn new(client: reqwest::Client, config: config::Forwarder) -> Self {
        Self { client, config }
    }

    pub async fn forward(&self, request: &DeliveryRequest) -> Result<DeliveryResult, ForwardError> {
        tracing::debug!(
            url = %self.config.url,
            method = %request.method,
            body_length = request.body.len(),
            "Preparing to forward request"
        );

        let method = Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            ForwardError::Invalid {
                message: format!("invalid method {:?}: {e}", request.method),
            }
        })?;

        let headers = self.compose_headers(request)?;

        let query_pairs: Vec<(&str, &str)> = request
            .query_params
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v.as_str())))
            .collect();

        let response = self
            .client
            .request(method, &self.config.url)
            .headers(headers)
            .query(&query_pairs)
            .body(request.body.clone())
            .send()
            .await?;

        let status_code = response.status().as_u16();
        let mut response_headers: HashMap<String, Vec<String>> = HashMap::new();
        for key in response.headers().keys() {
            let values = response
                .headers()
                .get_all(key)
                .iter()
                .filter_map(|v| v.to_str().ok().map(str::to_string))
                .collect();
            response_headers.insert(key.to_string(), values);
        }

        let body = response.text().await?;

        tracing::info!(
            status_code,
            body_length = body.len(),
            url = %self.config.url,
            "Request completed"
        );

        Ok(DeliveryResult {
            status_code,
            headers: response_headers,
            body: Some(body),
        })
    }

    /// Persisted headers → idempotency key → configured headers, later wins.
    fn compose_headers(&self, request: &DeliveryRequest) -> Result<HeaderMap, ForwardError> {
        let mut merged: HashMap<String, Vec<String>> = request.headers.clone();

        merged.insert(
            IDEMPOTENCY_HEADER.to_string(),
            vec![request.idempotency_key.clone()],
        );

        for (name, value) in &self.config.headers {
            merged.insert(name.clone(), vec![value.clone()]);
        }

        let mut headers = HeaderMap::new();
        for (name, values) in &merged {
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| ForwardError::Invalid {
                    message: format!("invalid header name {name:?}: {e}"),
                })?;
            for value in values {
                let header_value =
                    HeaderValue::from_str(value).map_err(|e| ForwardError::Invalid {
                        message: format!("invalid value for header {name:?}: {e}"),
                    })?;
                headers.append(header_name.clone(), header_value);
            }
        }

        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExchangeType, ForwarderKind, RetryDelay};
    use wiremock::matchers::{header, method, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn forwarder_config(url: &str, headers: HashMap<String, String>) -> config::Forwarder {
        config::Forwarder {
            kind: ForwarderKind::Http,
            url: url.to_string(),
            headers,
            retry_count: 3,
            retry_delay: RetryDelay::Exponential,
            connection_url: String::new(),
            exchange: String::new(),
            routing_key: String::new(),
            queue: String::new(),
            exchange_type: ExchangeType::Direct,
            durable: true,
            persistent: true,
            auto_delete: false,
            exclusive: false,
            no_wait: false,
            internal: false,
            mandatory: false,
            immediate: false,
        }
    }

    fn delivery_request() -> DeliveryRequest {
        let mut headers = HashMap::new();
        headers.insert("x-origin".to_string(), vec!["github".to_string()]);
        let mut query_params = HashMap::new();
        query_params.insert("tag".to_string(), vec!["a".to_string(), "b".to_string()]);

        DeliveryRequest {
            headers,
            body: r#"{"x":1}"#.to_string(),
            query_params,
            method: "POST".to_string(),
            url: String::new(),
            idempotency_key: "crm-1700000000-7".to_string(),
        }
    }

    #[tokio::test]
    async fn forwards_body_headers_and_query_params() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-origin", "github"))
            .and(header(IDEMPOTENCY_HEADER, "crm-1700000000-7"))
            .and(query_param("tag", "a"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = HttpForwarder::new(
            reqwest::Client::new(),
            forwarder_config(&server.uri(), HashMap::new()),
        );

        let result = forwarder.forward(&delivery_request()).await.unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(result.body.as_deref(), Some(r#"{"ok":true}"#));

        // Both values of the repeated parameter must survive the merge.
        let requests = server.received_requests().await.unwrap();
        let url = &requests[0].url;
        let tags: Vec<String> = url
            .query_pairs()
            .filter(|(k, _)| k == "tag")
            .map(|(_, v)| v.to_string())
            .collect();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn configured_headers_override_persisted_ones() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut configured = HashMap::new();
        configured.insert("x-origin".to_string(), "relay".to_string());

        let forwarder = HttpForwarder::new(
            reqwest::Client::new(),
            forwarder_config(&server.uri(), configured),
        );
        forwarder.forward(&delivery_request()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let sent: Vec<_> = collect_header(&requests[0], "x-origin");
        assert_eq!(sent, vec!["relay"]);
    }

    #[tokio::test]
    async fn non_2xx_response_still_completes_the_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
            .mount(&server)
            .await;

        let forwarder = HttpForwarder::new(
            reqwest::Client::new(),
            forwarder_config(&server.uri(), HashMap::new()),
        );

        let result = forwarder.forward(&delivery_request()).await.unwrap();
        assert_eq!(result.status_code, 404);
        assert_eq!(result.body.as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn transport_failure_surfaces_as_error() {
        // Nothing is listening on this port.
        let forwarder = HttpForwarder::new(
            reqwest::Client::new(),
            forwarder_config("http://127.0.0.1:1", HashMap::new()),
        );

        let err = forwarder.forward(&delivery_request()).await.unwrap_err();
        assert!(matches!(err, ForwardError::Request(_)));
    }

    fn collect_header<'r>(request: &'r Request, name: &str) -> Vec<&'r str> {
        request
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }
}
