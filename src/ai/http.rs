//! HTTP generator speaking the OpenAI-compatible chat completions API.
//!
//! Google (via its OpenAI compatibility endpoint), OpenAI and Ollama all
//! accept the same request shape, so one client covers every provider.
//! Failures are classified here; the dispatcher only looks at [`ErrorKind`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{GeneratedQuestion, GenerationRequest, ProviderKind, QuestionGenerator};
use crate::error::{ErrorKind, GenerationError};

/// Generator backed by `reqwest`.
pub struct HttpGenerator {
    client: reqwest::Client,
    base_urls: HashMap<ProviderKind, String>,
}

impl HttpGenerator {
    /// Build a client whose requests give up after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        let base_urls = ProviderKind::ALL
            .iter()
            .map(|k| (*k, k.default_base_url().to_string()))
            .collect();
        Ok(Self { client, base_urls })
    }

    /// Point a provider at a different endpoint (self-hosted Ollama, proxies).
    pub fn with_base_url(mut self, kind: ProviderKind, url: impl Into<String>) -> Self {
        let url: String = url.into();
        self.base_urls
            .insert(kind, url.trim_end_matches('/').to_string());
        self
    }

    fn endpoint(&self, kind: ProviderKind) -> String {
        let base = self
            .base_urls
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.default_base_url());
        format!("{base}/chat/completions")
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

fn build_prompt(request: &GenerationRequest) -> String {
    format!(
        "Write one {language} quiz question for a learner at level {level} about \"{topic}\": \
         {shape}. Respond with a JSON object with keys \"question\", \"options\" (4 strings), \
         \"correct_answer\" (index) and \"explanation\".",
        language = request.language,
        level = request.level,
        topic = request.topic,
        shape = request.question_type.prompt_shape(),
    )
}

/// Map an HTTP failure status to an error kind.
pub fn classify_status(status: StatusCode, body: &str) -> ErrorKind {
    let body = body.to_ascii_lowercase();
    match status.as_u16() {
        401 | 403 => ErrorKind::InvalidCredentials,
        429 if body.contains("quota") || body.contains("resource_exhausted") => {
            ErrorKind::QuotaExceeded
        }
        429 => ErrorKind::RateLimited,
        408 | 504 => ErrorKind::Timeout,
        500..=599 => ErrorKind::ProviderUnavailable,
        400 if body.contains("api key") || body.contains("api_key") => {
            ErrorKind::InvalidCredentials
        }
        _ => ErrorKind::InvalidRequest,
    }
}

fn classify_transport(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_decode() {
        ErrorKind::MalformedResponse
    } else {
        ErrorKind::Network
    }
}

/// Extract the question object from a chat completion body.
pub fn parse_question(
    provider: ProviderKind,
    request: &GenerationRequest,
    body: &str,
) -> Result<GeneratedQuestion, GenerationError> {
    let malformed = |msg: String| GenerationError::new(provider, ErrorKind::MalformedResponse, msg);

    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| malformed(format!("response body: {e}")))?;
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| malformed("no choices in response".to_string()))?;

    // Some models wrap JSON in a fenced block.
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let value: serde_json::Value =
        serde_json::from_str(trimmed).map_err(|e| malformed(format!("question json: {e}")))?;
    if value.get("question").and_then(|q| q.as_str()).is_none() {
        return Err(malformed("missing \"question\" field".to_string()));
    }

    Ok(GeneratedQuestion {
        language: request.language.clone(),
        level: request.level.clone(),
        topic: request.topic.clone(),
        question_type: request.question_type,
        content: value,
    })
}

#[async_trait]
impl QuestionGenerator for HttpGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GeneratedQuestion, GenerationError> {
        let provider = request.provider.kind;
        let body = json!({
            "model": request.provider.model,
            "messages": [
                {"role": "system", "content": "You write language-learning quiz questions as strict JSON."},
                {"role": "user", "content": build_prompt(request)},
            ],
            "response_format": {"type": "json_object"},
        });

        let mut builder = self.client.post(self.endpoint(provider)).json(&body);
        if let Some(key) = &request.provider.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await.map_err(|e| {
            GenerationError::new(provider, classify_transport(&e), e.to_string())
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            GenerationError::new(provider, classify_transport(&e), e.to_string())
        })?;

        if !status.is_success() {
            let kind = classify_status(status, &text);
            debug!(%provider, status = status.as_u16(), %kind, "Provider returned error status");
            let snippet: String = text.chars().take(200).collect();
            return Err(GenerationError::new(
                provider,
                kind,
                format!("HTTP {}: {snippet}", status.as_u16()),
            ));
        }

        parse_question(provider, request, &text)
    }
}
