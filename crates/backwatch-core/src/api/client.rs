//! One-shot Backrest API calls
//!
//! Forwards a single request/response call to the server, validated against
//! the endpoint registry first so typos and streaming endpoints fail before
//! any network I/O.

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::registry::{self, PayloadKind};
use crate::config::ServerConfig;

/// Errors from the one-shot query path
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown API endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("endpoint {0} streams its response; use a streaming session instead")]
    StreamingEndpoint(String),

    #[error("request failed - status: {status}, response: {body}")]
    Failed { status: u16, body: String },

    #[error("request error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Client for the server's request/response endpoints
pub struct QueryClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<(String, String)>,
}

impl QueryClient {
    pub fn new(config: &ServerConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().build()?;
        let credentials = if !config.username.is_empty() && !config.password.is_empty() {
            Some((config.username.clone(), config.password.clone()))
        } else {
            None
        };
        Ok(Self {
            http,
            base_url: config.http_base_url(),
            credentials,
        })
    }

    /// Call `endpoint` with `body` and return the decoded response.
    /// Endpoints that take no input ignore `body`; endpoints that return no
    /// body yield `Value::Null`.
    pub async fn call(&self, endpoint: &str, body: Value) -> Result<Value, ApiError> {
        let descriptor = registry::lookup(endpoint)
            .ok_or_else(|| ApiError::UnknownEndpoint(endpoint.to_string()))?;
        if descriptor.is_streaming() {
            return Err(ApiError::StreamingEndpoint(endpoint.to_string()));
        }

        let payload = if descriptor.input == PayloadKind::None {
            Value::Object(Default::default())
        } else {
            body
        };

        let url = format!("{}{}", self.base_url, endpoint);
        debug!("Calling {}", url);
        let mut builder = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&payload);
        if let Some((username, password)) = &self.credentials {
            builder = builder.basic_auth(username, Some(password));
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Failed {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> QueryClient {
        QueryClient::new(&ServerConfig::new("http://localhost:9898")).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_endpoint_rejected_before_io() {
        let err = client()
            .call("/v1.Backrest/Bogus", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::UnknownEndpoint(_)));
    }

    #[tokio::test]
    async fn test_streaming_endpoint_rejected() {
        let err = client()
            .call("/v1.Backrest/GetLogs", json!({"ref": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::StreamingEndpoint(_)));
    }
}
