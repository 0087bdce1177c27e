//! Response Generators
//!
//! Two ways of getting a reply for recognized text:
//!
//! - [`ClientRelay`] hands the prompt back to the connected client as an
//!   `llm_request` and waits for its `llm_response`. This is the default and
//!   keeps model selection on the client side.
//! - [`HttpGenerator`] posts the prompt to an HTTP endpoint and reads the
//!   reply from the JSON body.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::traits::{BackendError, Generation, GenerationRequest, ResponseGenerator};

const MAX_ERROR_BODY_CHARS: usize = 256;

/// Defers generation to the client
#[derive(Clone, Copy, Debug, Default)]
pub struct ClientRelay;

#[async_trait]
impl ResponseGenerator for ClientRelay {
    fn name(&self) -> &str {
        "client-relay"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<Generation, BackendError> {
        Ok(Generation::Deferred)
    }
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    prompt: &'a str,
    callback_id: &'a str,
    avatar_id: &'a str,
    session_id: &'a str,
}

/// Generates replies through an HTTP endpoint
#[derive(Clone, Debug)]
pub struct HttpGenerator {
    endpoint: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl HttpGenerator {
    /// Create a generator posting to `endpoint`
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Http`] if the HTTP client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Http(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
            http_client,
        })
    }

    /// Endpoint URL
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ResponseGenerator for HttpGenerator {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, BackendError> {
        let body = GenerateBody {
            prompt: &request.prompt,
            callback_id: &request.callback_id,
            avatar_id: &request.avatar_id,
            session_id: &request.session_id,
        };

        let mut builder = self.http_client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(MAX_ERROR_BODY_CHARS)
                .collect();
            return Err(BackendError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidOutput(e.to_string()))?;

        let reply = extract_reply(&json).ok_or_else(|| {
            BackendError::InvalidOutput("reply has no `text` or `response` field".into())
        })?;

        tracing::debug!(
            endpoint = %self.endpoint,
            callback_id = %request.callback_id,
            chars = reply.len(),
            "Generated reply"
        );
        Ok(Generation::Answered(reply))
    }
}

fn extract_reply(json: &serde_json::Value) -> Option<String> {
    ["text", "response"]
        .iter()
        .find_map(|key| json.get(key).and_then(serde_json::Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}
