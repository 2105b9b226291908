use super::{check_status, raw_base64, ChatRequest, Completion, LlmProvider, TokenUsage};
use crate::config::OllamaSettings;
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Instant;

const PROVIDER: &str = "ollama";

/// Local Ollama server
pub struct OllamaProvider {
    client: reqwest::Client,
    settings: OllamaSettings,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    message: Option<ResponseMessage>,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
}

impl OllamaProvider {
    pub fn new(client: reqwest::Client, settings: OllamaSettings) -> Self {
        Self { client, settings }
    }

    fn request_body(request: &ChatRequest) -> Value {
        let mut user = json!({ "role": "user", "content": request.user });
        if let Some(image) = &request.image {
            user["images"] = json!([raw_base64(image)]);
        }

        json!({
            "model": request.model,
            "messages": [
                { "role": "system", "content": request.system },
                user
            ],
            "stream": false,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            }
        })
    }

    fn into_completion(body: ChatResponse, requested_model: &str, started: Instant) -> Result<Completion, ProviderError> {
        let message = body.message.ok_or_else(|| ProviderError::Malformed {
            provider: PROVIDER,
            reason: "response has no message".to_string(),
        })?;

        Ok(Completion {
            content: message.content,
            model: body.model.unwrap_or_else(|| requested_model.to_string()),
            usage: TokenUsage::new(body.prompt_eval_count, body.eval_count),
            elapsed: started.elapsed(),
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn default_model(&self) -> &str {
        &self.settings.model
    }

    async fn chat(&self, request: &ChatRequest) -> Result<Completion, ProviderError> {
        let started = Instant::now();
        let url = format!("{}/api/chat", self.settings.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .json(&Self::request_body(request))
            .send()
            .await
            .map_err(|source| ProviderError::Transport { provider: PROVIDER, source })?;

        let body = check_status(PROVIDER, response)
            .await?
            .json::<ChatResponse>()
            .await
            .map_err(|e| ProviderError::Malformed {
                provider: PROVIDER,
                reason: e.to_string(),
            })?;

        Self::into_completion(body, &request.model, started)
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/api/tags", self.settings.base_url.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| ProviderError::Transport { provider: PROVIDER, source })?;

        let tags = check_status(PROVIDER, response)
            .await?
            .json::<TagList>()
            .await
            .map_err(|e| ProviderError::Malformed {
                provider: PROVIDER,
                reason: e.to_string(),
            })?;

        Ok(tags.models.into_iter().map(|t| t.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_strips_data_prefix() {
        let request = ChatRequest {
            model: "minicpm-v:latest".to_string(),
            system: "You are a tutor".to_string(),
            user: "what is this hand?".to_string(),
            image: Some("data:image/png;base64,QUJD".to_string()),
            max_tokens: 1000,
            temperature: 0.7,
        };

        let body = OllamaProvider::request_body(&request);
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][1]["images"][0], "QUJD");
        assert_eq!(body["options"]["num_predict"], 1000);
    }

    #[test]
    fn test_text_only_request_has_no_images() {
        let request = ChatRequest {
            model: "m".to_string(),
            system: String::new(),
            user: "hi".to_string(),
            image: None,
            max_tokens: 10,
            temperature: 0.0,
        };

        let body = OllamaProvider::request_body(&request);
        assert!(body["messages"][1].get("images").is_none());
    }

    #[test]
    fn test_completion_sums_eval_counts() {
        let body: ChatResponse = serde_json::from_str(
            r#"{
                "model": "minicpm-v:latest",
                "created_at": "2025-01-01T00:00:00Z",
                "message": {"role": "assistant", "content": "SAFE"},
                "done": true,
                "prompt_eval_count": 120,
                "eval_count": 3
            }"#,
        )
        .unwrap();

        let completion = OllamaProvider::into_completion(body, "fallback", Instant::now()).unwrap();
        assert_eq!(completion.content, "SAFE");
        assert_eq!(completion.model, "minicpm-v:latest");
        assert_eq!(completion.usage.total_tokens, 123);
    }

    #[test]
    fn test_completion_without_message_is_malformed() {
        let body: ChatResponse = serde_json::from_str(r#"{"done": true}"#).unwrap();
        assert!(OllamaProvider::into_completion(body, "m", Instant::now()).is_err());
    }

    #[test]
    fn test_parse_tags() {
        let tags: TagList = serde_json::from_str(
            r#"{"models": [{"name": "minicpm-v:latest", "size": 5500000000}, {"name": "llama3.2:3b"}]}"#,
        )
        .unwrap();
        let names: Vec<String> = tags.models.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["minicpm-v:latest", "llama3.2:3b"]);
    }
}
