// Hosted chat-completion client (OpenAI-compatible REST, bearer token).
//
// `complete` issues a single non-streaming request. `stream` sends the same
// request with `stream: true` and forwards Server-Sent Event deltas as
// `LlmEvent`s over an mpsc channel.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest_eventsource::{Event, RequestBuilderExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use companion_core::config::Config;

use crate::prompt::CompletionRequest;

/// Longest slice of an error body kept in `LlmError::Status`.
const MAX_ERROR_BODY: usize = 512;

const STREAM_DONE: &str = "[DONE]";

// ---------------------------------------------------------------------------
// Errors and events
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM not configured (no api_key in config/credentials.toml)")]
    NotConfigured,

    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("could not connect to model endpoint: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout(e)
        } else if e.is_connect() {
            LlmError::Connect(e)
        } else if e.is_decode() {
            LlmError::MalformedResponse(e.to_string())
        } else {
            LlmError::Transport(e)
        }
    }
}

/// Streaming progress reported to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmEvent {
    Token(String),
    Complete { full_text: String },
    Error { message: String },
}

// ---------------------------------------------------------------------------
// ChatClient
// ---------------------------------------------------------------------------

pub struct ChatClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl ChatClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(LlmError::Transport)?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn post(&self, request: &CompletionRequest) -> reqwest::RequestBuilder {
        self.http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(request)
    }

    /// Send a non-streaming request and return the first choice's content.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        debug!(model = %request.model, temperature = request.temperature, "sending completion request");
        let response = self.post(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "model endpoint returned an error");
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            });
        }

        let body: Value = response.json().await?;
        parse_completion_content(&body).ok_or_else(|| {
            LlmError::MalformedResponse("missing choices[0].message.content".to_string())
        })
    }

    /// Stream a request, forwarding tokens over `tx`. Always finishes with
    /// either `Complete` or `Error` unless the receiver is dropped first.
    pub async fn stream(&self, request: &CompletionRequest, tx: mpsc::Sender<LlmEvent>) {
        let mut request = request.clone();
        request.stream = true;

        let mut es = match self.post(&request).eventsource() {
            Ok(es) => es,
            Err(e) => {
                let _ = tx
                    .send(LlmEvent::Error {
                        message: format!("Failed to create event source: {e}"),
                    })
                    .await;
                return;
            }
        };

        let mut full_text = String::new();

        while let Some(event) = es.next().await {
            match event {
                Ok(Event::Open) => {
                    debug!("SSE connection opened");
                }
                Ok(Event::Message(msg)) => {
                    if msg.data.trim() == STREAM_DONE {
                        break;
                    }
                    let Some(text) = parse_stream_delta(&msg.data) else {
                        continue;
                    };
                    if text.is_empty() {
                        continue;
                    }
                    full_text.push_str(&text);
                    if tx.send(LlmEvent::Token(text)).await.is_err() {
                        es.close();
                        return;
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => {
                    break;
                }
                Err(err) => {
                    warn!(?err, "SSE stream error");
                    let _ = tx
                        .send(LlmEvent::Error {
                            message: extract_error_message(&err),
                        })
                        .await;
                    es.close();
                    return;
                }
            }
        }
        es.close();

        let event = if full_text.is_empty() {
            LlmEvent::Error {
                message: "Stream ended without any content".to_string(),
            }
        } else {
            LlmEvent::Complete { full_text }
        };
        let _ = tx.send(event).await;
    }
}

// ---------------------------------------------------------------------------
// LlmClient wrapper
// ---------------------------------------------------------------------------

/// Either a configured client or a placeholder that fails every call.
pub enum LlmClient {
    Active(ChatClient),
    Disabled,
}

impl LlmClient {
    /// `Active` when an API key is present in credentials, otherwise
    /// `Disabled`.
    pub fn from_config(config: &Config) -> Result<Self, LlmError> {
        match &config.credentials.api_key {
            Some(key) if !key.is_empty() => {
                let client = ChatClient::new(
                    config.llm.endpoint.clone(),
                    key.clone(),
                    config.llm.model.clone(),
                    Duration::from_secs(config.llm.timeout_secs),
                )?;
                info!(endpoint = %config.llm.endpoint, model = %config.llm.model, "LLM client ready");
                Ok(LlmClient::Active(client))
            }
            _ => Ok(LlmClient::Disabled),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, LlmClient::Active(_))
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        match self {
            LlmClient::Active(client) => client.complete(request).await,
            LlmClient::Disabled => Err(LlmError::NotConfigured),
        }
    }

    pub async fn stream(&self, request: &CompletionRequest, tx: mpsc::Sender<LlmEvent>) {
        match self {
            LlmClient::Active(client) => client.stream(request, tx).await,
            LlmClient::Disabled => {
                let _ = tx
                    .send(LlmEvent::Error {
                        message: LlmError::NotConfigured.to_string(),
                    })
                    .await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// JSON parsing helpers
// ---------------------------------------------------------------------------

/// `choices[0].message.content` of a non-streaming response.
pub(crate) fn parse_completion_content(body: &Value) -> Option<String> {
    body.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

/// `choices[0].delta.content` of a streaming chunk. Chunks that carry only
/// reasoning or role information yield `None`.
pub(crate) fn parse_stream_delta(data: &str) -> Option<String> {
    let v: Value = serde_json::from_str(data).ok()?;
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

fn extract_error_message(err: &reqwest_eventsource::Error) -> String {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, _response) => {
            format!("API returned status {status}")
        }
        reqwest_eventsource::Error::Transport(e) => {
            format!("Network error: {e}")
        }
        other => format!("Stream error: {other}"),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
