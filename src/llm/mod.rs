//! Chat model backends and the classifier adapter the moderation pipeline uses.
//!
//! Both backends speak plain JSON over HTTP through a shared `reqwest::Client`.
//! Which one serves a process is picked once from configuration.

pub mod groq;
pub mod ollama;

use crate::error::{ClassifierError, ProviderError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use groq::GroqProvider;
pub use ollama::OllamaProvider;

/// One system + user exchange, optionally carrying an image.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    /// Base64 payload, with or without a `data:` prefix
    pub image: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub elapsed: Duration,
}

/// A chat backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Model used for generation when the caller does not pick one
    fn default_model(&self) -> &str;

    async fn chat(&self, request: &ChatRequest) -> Result<Completion, ProviderError>;

    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;
}

/// Run a chat call under a deadline.
pub async fn chat_with_timeout(
    provider: &dyn LlmProvider,
    request: &ChatRequest,
    timeout: Duration,
) -> Result<Completion, ProviderError> {
    match tokio::time::timeout(timeout, provider.chat(request)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout {
            provider: provider.name(),
            timeout,
        }),
    }
}

/// Raw answer of a binary classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub label: String,
    pub tokens_used: u64,
}

/// Closed-vocabulary text/image classifier.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        instruction: &str,
        text: &str,
        image: Option<&str>,
    ) -> Result<Classification, ClassifierError>;
}

/// Classifier backed by a chat model at temperature 0.
pub struct ProviderClassifier {
    provider: Arc<dyn LlmProvider>,
    model: String,
    max_tokens: u32,
    timeout: Duration,
}

impl ProviderClassifier {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>, max_tokens: u32, timeout: Duration) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens,
            timeout,
        }
    }
}

#[async_trait]
impl Classifier for ProviderClassifier {
    async fn classify(
        &self,
        instruction: &str,
        text: &str,
        image: Option<&str>,
    ) -> Result<Classification, ClassifierError> {
        let request = ChatRequest {
            model: self.model.clone(),
            system: instruction.to_string(),
            user: text.to_string(),
            image: image.map(str::to_string),
            max_tokens: self.max_tokens,
            temperature: 0.0,
        };

        let started = Instant::now();
        let completion = tokio::time::timeout(self.timeout, self.provider.chat(&request))
            .await
            .map_err(|_| ClassifierError::Timeout(self.timeout))??;

        let label = completion.content.trim().to_string();
        if label.is_empty() {
            return Err(ClassifierError::EmptyLabel);
        }

        tracing::debug!(
            model = %self.model,
            label = %label,
            tokens = completion.usage.total_tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "classification finished"
        );

        Ok(Classification {
            label,
            tokens_used: completion.usage.total_tokens,
        })
    }
}

/// Payload without any `data:...;base64,` prefix.
pub(crate) fn raw_base64(image: &str) -> &str {
    match image.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => image,
    }
}

/// Payload as a data URL, assuming JPEG when no prefix was given.
pub(crate) fn data_url(image: &str) -> String {
    if image.starts_with("data:") {
        image.to_string()
    } else {
        format!("data:image/jpeg;base64,{}", image)
    }
}

/// Read a non-2xx response into a `ProviderError::Status`.
pub(crate) async fn check_status(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        provider,
        status: status.as_u16(),
        body,
    })
}
