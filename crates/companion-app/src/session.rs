// One user's conversation with the hosted model.
//
// Each exchange: profile from recent history → prompt with that profile and
// the last few turns → model call → cleaned reply → appended to the chat log.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use companion_core::config::{Config, LlmConfig};
use companion_core::personality::{PersonalityAnalyzer, PersonalityProfile};
use companion_core::store::{ChatRecord, ChatStore, ChatTurn};
use companion_llm::{build_request, clean_reply, CompletionRequest, LlmClient, LlmError, LlmEvent};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("message is empty")]
    EmptyInput,

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("streaming failed: {0}")]
    Stream(String),
}

pub struct ChatSession {
    client: LlmClient,
    store: Arc<dyn ChatStore>,
    analyzer: PersonalityAnalyzer,
    llm: LlmConfig,
    user_id: String,
}

impl ChatSession {
    pub fn new(
        client: LlmClient,
        store: Arc<dyn ChatStore>,
        analyzer: PersonalityAnalyzer,
        llm: LlmConfig,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            analyzer,
            llm,
            user_id: user_id.into(),
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn ChatStore>,
        user_id: impl Into<String>,
    ) -> Result<Self, LlmError> {
        Ok(Self::new(
            LlmClient::from_config(config)?,
            store,
            PersonalityAnalyzer::new(&config.personality),
            config.llm.clone(),
            user_id,
        ))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_online(&self) -> bool {
        self.client.is_active()
    }

    pub async fn profile(&self) -> PersonalityProfile {
        self.analyzer
            .generate_profile(self.store.as_ref(), &self.user_id, self.llm.profile_window)
            .await
    }

    /// Send `input` and return the cleaned reply.
    pub async fn respond(&self, input: &str) -> Result<String, SessionError> {
        let request = self.prepare(input, false).await?;
        let raw = self.client.complete(&request).await?;
        Ok(self.finish(input, &raw).await)
    }

    /// Like [`respond`](Self::respond), but calls `on_token` with each raw
    /// fragment as it arrives. The returned reply is cleaned.
    pub async fn respond_streaming<F>(&self, input: &str, mut on_token: F) -> Result<String, SessionError>
    where
        F: FnMut(&str),
    {
        let request = self.prepare(input, true).await?;

        let (tx, mut rx) = mpsc::channel(64);
        let producer = self.client.stream(&request, tx);
        let consumer = async {
            let mut outcome = None;
            while let Some(event) = rx.recv().await {
                match event {
                    LlmEvent::Token(text) => on_token(&text),
                    LlmEvent::Complete { full_text } => outcome = Some(Ok(full_text)),
                    LlmEvent::Error { message } => outcome = Some(Err(message)),
                }
            }
            outcome
        };
        let ((), outcome) = tokio::join!(producer, consumer);

        match outcome {
            Some(Ok(raw)) => Ok(self.finish(input, &raw).await),
            Some(Err(message)) => Err(SessionError::Stream(message)),
            None => Err(SessionError::Stream("stream closed without a result".into())),
        }
    }

    async fn prepare(&self, input: &str, stream: bool) -> Result<CompletionRequest, SessionError> {
        if input.trim().is_empty() {
            return Err(SessionError::EmptyInput);
        }

        let profile = self.profile().await;
        let history = self.history().await;
        let request = build_request(&self.llm.model, &profile, &history, input, stream);
        debug!(
            user_id = %self.user_id,
            history = history.len(),
            temperature = request.temperature,
            "prepared completion request"
        );
        Ok(request)
    }

    async fn history(&self) -> Vec<ChatTurn> {
        match self.store.latest(&self.user_id, self.llm.history_turns).await {
            Ok(turns) => turns,
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "history unavailable, sending none");
                Vec::new()
            }
        }
    }

    async fn finish(&self, input: &str, raw: &str) -> String {
        let reply = clean_reply(raw);
        let record = ChatRecord::now(&self.user_id, input, &reply);
        match self.store.append(&record).await {
            Ok(()) => info!(user_id = %self.user_id, backend = %self.store.backend(), "exchange saved"),
            Err(e) => warn!(user_id = %self.user_id, error = %e, "failed to save exchange"),
        }
        reply
    }
}
