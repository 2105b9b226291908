use crate::security::image_quality::QualitySummary;
use crate::security::reputation::ClientStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    /// Base64 image, optionally as a `data:image/...;base64,` URL
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub id: String,
    pub response: String,
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub tokens_used: u64,
    pub moderation_tokens: u64,
    pub has_image: bool,
    pub performance: Performance,
}

/// Wall-clock timings in milliseconds
#[derive(Debug, Serialize)]
pub struct Performance {
    pub moderation_ms: u64,
    pub generation_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub provider: &'static str,
    pub models: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RateLimitError {
    pub error: String,
    pub message: String,
    pub retry_after: u64,
}

impl RateLimitError {
    pub fn new(retry_after: u64) -> Self {
        Self {
            error: "Rate limit exceeded".to_string(),
            message: format!("Please wait {} seconds before trying again", retry_after),
            retry_after,
        }
    }
}

/// Body of a 403 from the safety or relevance stage
#[derive(Debug, Serialize)]
pub struct ContentFilterError {
    pub error: String,
    pub reason: String,
    pub filter_stage: &'static str,
}

impl ContentFilterError {
    pub fn new(reason: String, filter_stage: &'static str) -> Self {
        Self {
            error: "Content not allowed".to_string(),
            reason,
            filter_stage,
        }
    }
}

/// Body of a 422 from the image quality stage
#[derive(Debug, Serialize)]
pub struct ImageQualityError {
    pub error: String,
    pub filter_stage: &'static str,
    pub quality: QualitySummary,
}

impl ImageQualityError {
    pub fn new(quality: QualitySummary) -> Self {
        Self {
            error: "Image quality too low".to_string(),
            filter_stage: "image_quality",
            quality,
        }
    }
}

/// Optional reason for manual blacklist changes
#[derive(Debug, Default, Deserialize)]
pub struct ReasonRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Admin view of one client: reputation plus current rate-limit headroom
#[derive(Debug, Serialize)]
pub struct ClientDetail {
    #[serde(flatten)]
    pub reputation: ClientStats,
    pub rate_limit: RateLimitStatus,
}

#[derive(Debug, Serialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub remaining: usize,
    pub retry_after: u64,
}

#[derive(Debug, Serialize)]
pub struct BlacklistChange {
    pub client: String,
    pub blacklisted: bool,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_defaults() {
        let request: ChatRequest = serde_json::from_str("{}").unwrap();
        assert!(request.message.is_empty());
        assert!(request.image.is_none());

        let request: ChatRequest =
            serde_json::from_str(r#"{"message": "which tile?", "image": "QUJD"}"#).unwrap();
        assert_eq!(request.message, "which tile?");
        assert_eq!(request.image.as_deref(), Some("QUJD"));
    }

    #[test]
    fn test_rate_limit_error_message() {
        let err = RateLimitError::new(42);
        assert_eq!(err.retry_after, 42);
        assert!(err.message.contains("42 seconds"));
    }

    #[test]
    fn test_content_filter_error_shape() {
        let json = serde_json::to_value(ContentFilterError::new("Not Mahjong-related".to_string(), "relevance")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "error": "Content not allowed",
                "reason": "Not Mahjong-related",
                "filter_stage": "relevance"
            })
        );
    }
}
