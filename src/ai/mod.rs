//! AI provider integration for question generation.
//!
//! Provider settings arrive from the user store as loose strings. They are
//! parsed into a [`ProviderConfig`] at the boundary so nothing past the
//! coordinator ever sees an unknown provider or a missing credential.

pub mod http;

pub use http::HttpGenerator;

use std::str::FromStr;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, GenerationError};

/// Supported AI providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    OpenAi,
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::Google, Self::OpenAi, Self::Ollama];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }

    /// Model used when the user left the model field blank.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::Google => "gemini-2.0-flash",
            Self::OpenAi => "gpt-4o-mini",
            Self::Ollama => "llama3.1",
        }
    }

    /// Base URL of the provider's OpenAI-compatible API.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Google => "https://generativelanguage.googleapis.com/v1beta/openai",
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }

    /// Local models run without a key.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Self::Ollama)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" | "gemini" => Ok(Self::Google),
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::InvalidValue {
                key: "ai_provider".to_string(),
                message: format!("unknown provider '{other}'"),
            }),
        }
    }
}

/// Kinds of quiz question the worker can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QuestionType {
    #[serde(rename = "vocabulary")]
    Vocabulary,
    #[serde(rename = "fill_blank")]
    FillInBlank,
    #[serde(rename = "qa")]
    QuestionAnswer,
    #[serde(rename = "reading_comprehension")]
    ReadingComprehension,
}

impl QuestionType {
    /// Default planning order when a user has no generation hints.
    pub const ALL: [QuestionType; 4] = [
        Self::Vocabulary,
        Self::FillInBlank,
        Self::QuestionAnswer,
        Self::ReadingComprehension,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vocabulary => "vocabulary",
            Self::FillInBlank => "fill_blank",
            Self::QuestionAnswer => "qa",
            Self::ReadingComprehension => "reading_comprehension",
        }
    }

    /// Planning order with hinted types first, each type once, the rest in
    /// default order.
    pub fn ordered_with_hints(hints: &[QuestionType]) -> Vec<QuestionType> {
        let mut order: Vec<QuestionType> = Vec::with_capacity(Self::ALL.len());
        for qt in hints.iter().chain(Self::ALL.iter()) {
            if !order.contains(qt) {
                order.push(*qt);
            }
        }
        order
    }

    fn prompt_shape(&self) -> &'static str {
        match self {
            Self::Vocabulary => "a vocabulary question asking for the meaning of one word",
            Self::FillInBlank => "a sentence with one blank (\"___\") to fill in",
            Self::QuestionAnswer => "a short question answered from general knowledge of the language",
            Self::ReadingComprehension => "a short passage followed by one question about it",
        }
    }
}

impl std::fmt::Display for QuestionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestionType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vocabulary" => Ok(Self::Vocabulary),
            "fill_blank" | "fill_in_blank" => Ok(Self::FillInBlank),
            "qa" | "question_answer" => Ok(Self::QuestionAnswer),
            "reading_comprehension" => Ok(Self::ReadingComprehension),
            other => Err(ConfigError::InvalidValue {
                key: "question_type".to_string(),
                message: format!("unknown question type '{other}'"),
            }),
        }
    }
}

/// A validated provider selection: known provider, concrete model, opaque credential.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub model: String,
    pub api_key: Option<SecretString>,
}

impl ProviderConfig {
    /// Validate the loosely-typed fields stored with a user's preferences.
    pub fn parse(provider: &str, model: &str, api_key: Option<&str>) -> Result<Self, ConfigError> {
        let kind: ProviderKind = provider.parse()?;

        let model = match model.trim() {
            "" => kind.default_model().to_string(),
            m => m.to_string(),
        };

        let api_key = api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(|k| SecretString::from(k.to_string()));

        if kind.requires_api_key() && api_key.is_none() {
            return Err(ConfigError::MissingRequired {
                key: format!("{kind} api key"),
                hint: "Set an API key in the user's AI settings".to_string(),
            });
        }

        Ok(Self {
            kind,
            model,
            api_key,
        })
    }
}

/// One question to generate.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub user_id: i64,
    pub provider: ProviderConfig,
    pub language: String,
    pub level: String,
    pub topic: String,
    pub question_type: QuestionType,
}

/// A question returned by a provider, not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedQuestion {
    pub language: String,
    pub level: String,
    pub topic: String,
    pub question_type: QuestionType,
    pub content: serde_json::Value,
}

impl GeneratedQuestion {
    /// Size used for character-based quota accounting.
    pub fn char_count(&self) -> u64 {
        self.content.to_string().chars().count() as u64
    }
}

/// Generates quiz questions through an AI provider.
#[async_trait]
pub trait QuestionGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GeneratedQuestion, GenerationError>;
}
