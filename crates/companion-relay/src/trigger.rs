// HTTP client for the relay's trigger endpoint.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use companion_core::protocol::{MotionPriority, TriggerAck, TriggerCommand};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("relay rejected command with status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("could not connect to relay: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("relay request timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("relay request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("unexpected relay response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TriggerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TriggerError::Timeout(e)
        } else if e.is_connect() {
            TriggerError::Connect(e)
        } else if e.is_decode() {
            TriggerError::Decode(e.to_string())
        } else {
            TriggerError::Request(e)
        }
    }
}

/// Posts `TriggerCommand`s to a running relay.
#[derive(Clone)]
pub struct TriggerClient {
    http: reqwest::Client,
    url: String,
}

impl TriggerClient {
    pub fn new(url: impl Into<String>) -> Result<Self, TriggerError> {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, TriggerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TriggerError::Request)?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn send(&self, command: &TriggerCommand) -> Result<TriggerAck, TriggerError> {
        debug!(command_type = %command.command_type, url = %self.url, "sending trigger");
        let response = self.http.post(&self.url).json(command).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "relay returned an error");
            return Err(TriggerError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<TriggerAck>().await?)
    }

    pub async fn expression(&self, name: &str) -> Result<TriggerAck, TriggerError> {
        self.send(&TriggerCommand::expression(name)).await
    }

    pub async fn motion(
        &self,
        group: &str,
        index: u32,
        priority: MotionPriority,
    ) -> Result<TriggerAck, TriggerError> {
        self.send(&TriggerCommand::motion(group, index, priority)).await
    }

    pub async fn speak(&self, audio_url: &str) -> Result<TriggerAck, TriggerError> {
        self.send(&TriggerCommand::speak(audio_url)).await
    }
}
