// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Posts batches as a json array to an HTTP endpoint.
//!
//! ```yaml
//! output:
//!   type: http
//!   params:
//!     endpoint: https://logs.example.com/v1/input
//!     compression_level: 3
//!     timeout_ms: 5000
//!     headers:
//!       Authorization: Bearer abc
//! ```
//!
//! Responses are classified for the retry loop: 2xx is delivered, 408, 429
//! and 5xx are retried as are network errors, any other status is permanent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::batcher::Batch;
use crate::errors::{ConfigError, OutputError};
use crate::output::Output;
use crate::plugins::parse_params;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HttpParams {
    pub endpoint: String,
    /// zstd level; no compression when absent.
    #[serde(default)]
    pub compression_level: Option<i32>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn invalid(reason: impl ToString) -> ConfigError {
    ConfigError::InvalidParams {
        plugin: "http".to_string(),
        reason: reason.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct HttpOutput {
    client: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
    compression_level: Option<i32>,
}

impl HttpOutput {
    pub fn new(params: &HttpParams) -> Result<Self, ConfigError> {
        if params.endpoint.is_empty() {
            return Err(invalid("endpoint must not be empty"));
        }
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if params.compression_level.is_some() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        }
        for (name, value) in &params.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(invalid)?;
            let value = HeaderValue::from_str(value).map_err(invalid)?;
            headers.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(params.timeout_ms))
            .build()
            .map_err(invalid)?;
        Ok(Self {
            client,
            endpoint: params.endpoint.clone(),
            headers,
            compression_level: params.compression_level,
        })
    }

    fn body(&self, batch: &Batch) -> Result<Vec<u8>, OutputError> {
        let documents: Vec<&Value> = batch.iter().map(|event| &event.root).collect();
        let body =
            serde_json::to_vec(&documents).map_err(|e| OutputError::Permanent(e.to_string()))?;
        match self.compression_level {
            Some(level) => zstd::encode_all(body.as_slice(), level)
                .map_err(|e| OutputError::Permanent(format!("zstd compression failed: {e}"))),
            None => Ok(body),
        }
    }
}

fn classify(status: StatusCode) -> Result<(), OutputError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("endpoint answered {status}");
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Err(OutputError::Retryable(message))
    } else {
        Err(OutputError::Permanent(message))
    }
}

#[async_trait]
impl Output for HttpOutput {
    async fn send(&self, batch: &Batch) -> Result<(), OutputError> {
        let body = self.body(batch)?;
        let size = body.len();
        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| OutputError::Retryable(e.to_string()))?;
        let status = response.status();
        if let Err(e) = classify(status) {
            if status == StatusCode::FORBIDDEN {
                error!("HTTP | request was denied by {}: access denied", self.endpoint);
            }
            return Err(e);
        }
        debug!(
            "HTTP | sent batch {} ({} events, {size} bytes)",
            batch.seq(),
            batch.len()
        );
        Ok(())
    }
}

pub fn factory(params: &Value) -> Result<Arc<dyn Output>, ConfigError> {
    Ok(Arc::new(HttpOutput::new(&parse_params("http", params)?)?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::Event;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn batch() -> Batch {
        let mut batch = Batch::with_capacity(2);
        batch.push(Event::synthetic(json!({"message": "a"})));
        batch.push(Event::synthetic(json!({"message": "b"})));
        batch
    }

    fn output(endpoint: String, extra: Value) -> HttpOutput {
        let mut params = json!({ "endpoint": endpoint });
        if let (Some(params), Value::Object(extra)) = (params.as_object_mut(), extra) {
            params.extend(extra);
        }
        HttpOutput::new(&parse_params("http", &params).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_posts_json_array() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/input")
            .match_header("content-type", "application/json")
            .match_header("x-api-key", "secret")
            .match_body(Matcher::Json(json!([{"message": "a"}, {"message": "b"}])))
            .with_status(202)
            .create_async()
            .await;

        let output = output(
            format!("{}/v1/input", server.url()),
            json!({"headers": {"x-api-key": "secret"}}),
        );
        output.send(&batch()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_compressed_body() {
        let mut server = Server::new_async().await;
        let expected = zstd::encode_all(
            serde_json::to_vec(&json!([{"message": "a"}, {"message": "b"}]))
                .unwrap()
                .as_slice(),
            3,
        )
        .unwrap();
        let mock = server
            .mock("POST", "/")
            .match_header("content-encoding", "zstd")
            .match_body(expected)
            .with_status(200)
            .create_async()
            .await;

        let output = output(server.url(), json!({"compression_level": 3}));
        output.send(&batch()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_status_classification() {
        let mut server = Server::new_async().await;
        let _bad = server
            .mock("POST", "/bad")
            .with_status(400)
            .create_async()
            .await;
        let _down = server
            .mock("POST", "/down")
            .with_status(503)
            .create_async()
            .await;

        let bad = output(format!("{}/bad", server.url()), Value::Null);
        assert!(matches!(
            bad.send(&batch()).await,
            Err(OutputError::Permanent(_))
        ));
        let down = output(format!("{}/down", server.url()), Value::Null);
        assert!(matches!(
            down.send(&batch()).await,
            Err(OutputError::Retryable(_))
        ));
    }

    #[test]
    fn test_invalid_params() {
        assert!(factory(&json!({})).is_err());
        assert!(factory(&json!({"endpoint": ""})).is_err());
        assert!(factory(&json!({"endpoint": "http://x", "headers": {"bad header": "v"}})).is_err());
    }
}
