use super::image_quality::{ImageQualityGate, ImageQualityReport};
use super::reputation::ReputationStore;
use crate::clock::Clock;
use crate::llm::Classifier;
use crate::metrics::record_classifier_error;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Confidence assigned when the classifier answered with a recognised token
const RECOGNISED_CONFIDENCE: f64 = 0.9;
/// Confidence assigned when it answered with neither token
const AMBIGUOUS_CONFIDENCE: f64 = 0.5;

const SAFETY_INSTRUCTION: &str =
    "Is the following message safe and appropriate? Answer with just \"SAFE\" or \"UNSAFE\".";

/// Where a request's moderation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Blacklist,
    ImageQuality,
    Safety,
    Relevance,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Blacklist => "blacklist",
            Stage::ImageQuality => "image_quality",
            Stage::Safety => "safety",
            Stage::Relevance => "relevance",
            Stage::Complete => "complete",
        }
    }
}

/// Moderation result for one request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModerationVerdict {
    pub allowed: bool,
    pub reason: String,
    pub confidence: f64,
    pub stage: Stage,
    pub tokens_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_report: Option<ImageQualityReport>,
}

impl ModerationVerdict {
    fn rejected(stage: Stage, reason: impl Into<String>, confidence: f64, tokens_used: u64) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            confidence,
            stage,
            tokens_used,
            image_report: None,
        }
    }
}

/// Subject the service answers questions about.
#[derive(Debug, Clone)]
pub struct TopicProfile {
    pub name: String,
    pub description: String,
}

impl TopicProfile {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    fn relevance_instruction(&self) -> String {
        format!(
            "You are a content moderator for a {name} tutoring website. Determine if this message is related to {description} or requesting help with it.\n\n\
             Answer with just \"RELEVANT\" if the message is about {name}, or \"IRRELEVANT\" if it's about something else.",
            name = self.name,
            description = self.description,
        )
    }
}

/// Reading of a closed-vocabulary answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Positive,
    Negative,
    Ambiguous,
}

impl Label {
    /// Case-insensitive substring match. The negative token contains the
    /// positive one, so it is checked first.
    fn parse(raw: &str, positive: &str, negative: &str) -> Self {
        let upper = raw.to_uppercase();
        if upper.contains(negative) {
            Label::Negative
        } else if upper.contains(positive) {
            Label::Positive
        } else {
            Label::Ambiguous
        }
    }

    fn confidence(self) -> f64 {
        match self {
            Label::Ambiguous => AMBIGUOUS_CONFIDENCE,
            _ => RECOGNISED_CONFIDENCE,
        }
    }
}

/// Outcome of one classifier stage that did not error.
struct StageResult {
    passed: bool,
    confidence: f64,
    tokens_used: u64,
}

/// Per-request moderation: blacklist, image quality, safety, relevance, then
/// the reputation update.
///
/// Stateless apart from the shared reputation store; safe to call
/// concurrently for the same client.
pub struct ModerationPipeline {
    reputation: Arc<ReputationStore>,
    image_gate: ImageQualityGate,
    safety: Arc<dyn Classifier>,
    relevance: Arc<dyn Classifier>,
    topic: TopicProfile,
    clock: Arc<dyn Clock>,
    image_check_timeout: Duration,
}

impl ModerationPipeline {
    pub fn new(
        reputation: Arc<ReputationStore>,
        image_gate: ImageQualityGate,
        safety: Arc<dyn Classifier>,
        relevance: Arc<dyn Classifier>,
        topic: TopicProfile,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            reputation,
            image_gate,
            safety,
            relevance,
            topic,
            clock,
            image_check_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_image_check_timeout(mut self, timeout: Duration) -> Self {
        self.image_check_timeout = timeout;
        self
    }

    /// Run every stage for one message and return the terminal verdict.
    ///
    /// Never fails: classifier and image errors are folded into the verdict
    /// according to each stage's policy.
    pub async fn moderate(&self, client_id: &str, message: &str, image: Option<&str>) -> ModerationVerdict {
        if self.reputation.is_blacklisted(client_id) {
            let reason = self.reputation.blacklist_reason(client_id).unwrap_or_default();
            tracing::info!(client = %client_id, reason = %reason, "blocked request from blacklisted client");
            return ModerationVerdict::rejected(Stage::Blacklist, "Client blacklisted", 1.0, 0);
        }

        if let Some(image) = image {
            if let Some(report) = self.check_image(client_id, image).await {
                if !report.acceptable {
                    tracing::info!(client = %client_id, issues = ?report.issues, "image rejected");
                    let mut verdict = ModerationVerdict::rejected(
                        Stage::ImageQuality,
                        "Image quality too low for analysis",
                        1.0,
                        0,
                    );
                    verdict.image_report = Some(report);
                    return verdict;
                }
            }
        }

        let safety = match self.check_safety(message, image).await {
            Some(result) => result,
            None => {
                // Fail closed
                self.record_violation(client_id);
                return ModerationVerdict::rejected(Stage::Safety, "Safety check unavailable", 0.0, 0);
            }
        };
        if !safety.passed {
            self.record_violation(client_id);
            tracing::warn!(client = %client_id, confidence = safety.confidence, "safety violation");
            return ModerationVerdict::rejected(
                Stage::Safety,
                "Safety check failed",
                safety.confidence,
                safety.tokens_used,
            );
        }

        let relevance = match self.check_relevance(message).await {
            Some(result) => result,
            // Fail open
            None => StageResult {
                passed: true,
                confidence: 0.0,
                tokens_used: 0,
            },
        };
        let tokens_used = safety.tokens_used + relevance.tokens_used;
        if !relevance.passed {
            self.record_violation(client_id);
            tracing::info!(
                client = %client_id,
                preview = %message.chars().take(50).collect::<String>(),
                "off-topic message"
            );
            return ModerationVerdict::rejected(
                Stage::Relevance,
                format!("Not {}-related", self.topic.name),
                relevance.confidence,
                tokens_used,
            );
        }

        if !self.reputation.admit_clean_request(client_id, self.clock.now()) {
            tracing::info!(client = %client_id, "client blacklisted while request was in flight");
            return ModerationVerdict::rejected(Stage::Blacklist, "Client blacklisted", 1.0, tokens_used);
        }

        ModerationVerdict {
            allowed: true,
            reason: "Passed all content filters".to_string(),
            confidence: safety.confidence.min(relevance.confidence),
            stage: Stage::Complete,
            tokens_used,
            image_report: None,
        }
    }

    /// `None` when the check itself broke; the image is then let through.
    async fn check_image(&self, client_id: &str, image: &str) -> Option<ImageQualityReport> {
        let gate = self.image_gate.clone();
        let payload = image.to_string();
        let task = tokio::task::spawn_blocking(move || gate.assess(&payload));

        match tokio::time::timeout(self.image_check_timeout, task).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                tracing::warn!(client = %client_id, error = %e, "image quality check failed, allowing image");
                None
            }
            Err(_) => {
                tracing::warn!(
                    client = %client_id,
                    timeout_secs = self.image_check_timeout.as_secs_f64(),
                    "image quality check timed out, allowing image"
                );
                None
            }
        }
    }

    async fn check_safety(&self, message: &str, image: Option<&str>) -> Option<StageResult> {
        let text = format!("Message: {}", message);
        match self.safety.classify(SAFETY_INSTRUCTION, &text, image).await {
            Ok(answer) => {
                let label = Label::parse(&answer.label, "SAFE", "UNSAFE");
                Some(StageResult {
                    passed: label == Label::Positive,
                    confidence: label.confidence(),
                    tokens_used: answer.tokens_used,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "safety check failed, rejecting");
                record_classifier_error(Stage::Safety);
                None
            }
        }
    }

    async fn check_relevance(&self, message: &str) -> Option<StageResult> {
        let text = format!("Message: {}", message);
        match self
            .relevance
            .classify(&self.topic.relevance_instruction(), &text, None)
            .await
        {
            Ok(answer) => {
                let label = Label::parse(&answer.label, "RELEVANT", "IRRELEVANT");
                Some(StageResult {
                    passed: label == Label::Positive,
                    confidence: label.confidence(),
                    tokens_used: answer.tokens_used,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "relevance check failed, allowing");
                record_classifier_error(Stage::Relevance);
                None
            }
        }
    }

    fn record_violation(&self, client_id: &str) {
        let outcome = self.reputation.record_request(client_id, self.clock.now(), true);
        if outcome.blacklisted && !outcome.newly_blacklisted {
            tracing::debug!(client = %client_id, "violation from already blacklisted client");
        }
    }
}
