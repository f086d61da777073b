//! OpenAI-compatible chat-completions client
//!
//! One request per prompt: a single user message, authenticated with the
//! credential's API key. Every failure comes back as a classified
//! `CallError` so the dispatcher can decide between waiting and rotating.

use std::time::Duration;

use credential_pool::Credential;
use serde::{Deserialize, Serialize};
use tracing::debug;
use upstream::CallError;

use crate::config::UpstreamConfig;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions endpoint bound to one model and sampling setup.
#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
}

impl ChatClient {
    /// Build a client with the configured request timeout.
    pub fn new(config: &UpstreamConfig) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self::with_http(http, config))
    }

    pub fn with_http(http: reqwest::Client, config: &UpstreamConfig) -> Self {
        Self {
            http,
            endpoint: format!(
                "{}/chat/completions",
                config.base_url.trim_end_matches('/')
            ),
            model: config.model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
        }
    }

    /// Send `prompt` as a single user message and return the first choice's text.
    pub async fn complete(&self, credential: &Credential, prompt: &str) -> Result<String, CallError> {
        let request = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(credential.api_key())
            .json(&request)
            .send()
            .await
            .map_err(|e| CallError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::from_status(status.as_u16(), &body));
        }

        let reply: ChatReply = response
            .json()
            .await
            .map_err(|e| CallError::from_transport(&e))?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| CallError::api("completion reply without message content"))?;

        debug!(credential = %credential, chars = content.len(), "completion received");
        Ok(content)
    }
}
