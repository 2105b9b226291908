use super::{check_status, data_url, ChatRequest, Completion, LlmProvider, TokenUsage};
use crate::config::GroqSettings;
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Instant;

const PROVIDER: &str = "groq";

/// Hosted OpenAI-compatible chat completions
pub struct GroqProvider {
    client: reqwest::Client,
    settings: GroqSettings,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl GroqProvider {
    pub fn new(client: reqwest::Client, settings: GroqSettings) -> Self {
        Self { client, settings }
    }

    fn request_body(request: &ChatRequest) -> Value {
        // Vision models take a content array; text-only ones a plain string
        let user_content = match &request.image {
            Some(image) => json!([
                { "type": "text", "text": request.user },
                { "type": "image_url", "image_url": { "url": data_url(image) } }
            ]),
            None => json!(request.user),
        };

        json!({
            "model": request.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": user_content }
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        })
    }

    fn parse_completion(body: CompletionResponse, requested_model: &str) -> Result<(String, String, TokenUsage), ProviderError> {
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::Malformed {
                provider: PROVIDER,
                reason: "response has no message content".to_string(),
            })?;

        let usage = body
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok((
            content,
            body.model.unwrap_or_else(|| requested_model.to_string()),
            usage,
        ))
    }
}

#[async_trait]
impl LlmProvider for GroqProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn default_model(&self) -> &str {
        &self.settings.model
    }

    async fn chat(&self, request: &ChatRequest) -> Result<Completion, ProviderError> {
        let started = Instant::now();
        let url = format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.settings.api_key))
            .json(&Self::request_body(request))
            .send()
            .await
            .map_err(|source| ProviderError::Transport { provider: PROVIDER, source })?;

        let body = check_status(PROVIDER, response)
            .await?
            .json::<CompletionResponse>()
            .await
            .map_err(|e| ProviderError::Malformed {
                provider: PROVIDER,
                reason: e.to_string(),
            })?;

        let (content, model, usage) = Self::parse_completion(body, &request.model)?;
        Ok(Completion {
            content,
            model,
            usage,
            elapsed: started.elapsed(),
        })
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/models", self.settings.base_url.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.settings.api_key))
            .send()
            .await
            .map_err(|source| ProviderError::Transport { provider: PROVIDER, source })?;

        let list = check_status(PROVIDER, response)
            .await?
            .json::<ModelList>()
            .await
            .map_err(|e| ProviderError::Malformed {
                provider: PROVIDER,
                reason: e.to_string(),
            })?;

        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}
