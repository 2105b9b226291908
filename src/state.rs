use crate::clock::Clock;
use crate::config::{Config, ProviderKind};
use crate::llm::{Classifier, GroqProvider, LlmProvider, OllamaProvider, ProviderClassifier};
use crate::metrics::MetricsTracker;
use crate::security::{
    ImageQualityGate, ModerationPipeline, PatternGate, RateLimitPolicy, RateLimiter, ReputationStore, TopicProfile,
};
use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Output budget for the safety classifier
const SAFETY_MAX_TOKENS: u32 = 10;
/// Output budget for the relevance classifier
const RELEVANCE_MAX_TOKENS: u32 = 20;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pattern_gate: PatternGate,
    pub rate_limiter: Arc<RateLimiter>,
    pub reputation: Arc<ReputationStore>,
    pub moderation: Arc<ModerationPipeline>,
    pub provider: Arc<dyn LlmProvider>,
    pub clock: Arc<dyn Clock>,
    pub metrics: MetricsTracker,
    pub tutor_prompt: Arc<str>,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// Assemble the state from configuration, classifying with `provider`.
    pub fn new(config: Config, provider: Arc<dyn LlmProvider>, clock: Arc<dyn Clock>) -> Result<Self> {
        let reference_doc = config
            .load_reference_doc()
            .context("failed to load reference document")?;

        let safety: Arc<dyn Classifier> = Arc::new(ProviderClassifier::new(
            provider.clone(),
            config.safety_model.clone(),
            SAFETY_MAX_TOKENS,
            config.classifier_timeout,
        ));
        let relevance: Arc<dyn Classifier> = Arc::new(ProviderClassifier::new(
            provider.clone(),
            config.relevance_model.clone(),
            RELEVANCE_MAX_TOKENS,
            config.classifier_timeout,
        ));

        Ok(Self::with_classifiers(
            config,
            provider,
            safety,
            relevance,
            clock,
            reference_doc.as_deref(),
        ))
    }

    /// Assemble the state around explicit classifiers.
    pub fn with_classifiers(
        config: Config,
        provider: Arc<dyn LlmProvider>,
        safety: Arc<dyn Classifier>,
        relevance: Arc<dyn Classifier>,
        clock: Arc<dyn Clock>,
        reference_doc: Option<&str>,
    ) -> Self {
        let topic = TopicProfile::new(config.topic_name.clone(), config.topic_description.clone());
        let reputation = Arc::new(ReputationStore::new(config.blacklist_threshold));
        let rate_limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(
            config.max_requests_per_window,
            config.rate_limit_window,
        )));
        let tutor_prompt: Arc<str> = tutor_prompt(&topic, reference_doc).into();

        let moderation = ModerationPipeline::new(
            reputation.clone(),
            ImageQualityGate::default(),
            safety,
            relevance,
            topic,
            clock.clone(),
        )
        .with_image_check_timeout(config.image_check_timeout);

        Self {
            config: Arc::new(config),
            pattern_gate: PatternGate::new(),
            rate_limiter,
            reputation,
            moderation: Arc::new(moderation),
            provider,
            clock,
            metrics: MetricsTracker::new(),
            tutor_prompt,
            prometheus: None,
        }
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}

/// Chat backend selected by `LLM_PROVIDER`.
pub fn build_provider(config: &Config) -> Result<Arc<dyn LlmProvider>> {
    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    Ok(match config.provider {
        ProviderKind::Groq => {
            let settings = config
                .groq
                .clone()
                .context("groq provider selected without GROQ_API_KEY")?;
            Arc::new(GroqProvider::new(client, settings))
        }
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(client, config.ollama.clone())),
    })
}

/// System prompt for generation, with the reference document appended.
pub fn tutor_prompt(topic: &TopicProfile, reference_doc: Option<&str>) -> String {
    let mut prompt = format!(
        "You are an expert {name} tutor with deep knowledge of strategy, tile reading, and game theory. \
         Your role is to analyze game states and provide strategic advice to help players improve.\n\n\
         When analyzing images:\n\
         1. Identify all visible tiles and their suits\n\
         2. Assess the current hand composition and potential winning patterns\n\
         3. Evaluate discarded tiles and what they reveal about opponents\n\
         4. Suggest optimal moves with clear reasoning\n\
         5. Explain strategic concepts to help the player learn\n\n\
         Always be encouraging and educational. Focus on the 'why' behind your recommendations. \
         If you cannot clearly see the tiles, ask for a clearer image. \
         Only discuss {description}.",
        name = topic.name,
        description = topic.description,
    );

    if let Some(doc) = reference_doc.map(str::trim).filter(|d| !d.is_empty()) {
        prompt.push_str("\n\nReference material:\n");
        prompt.push_str(doc);
    }
    prompt
}
