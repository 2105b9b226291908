use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::json;
use std::time::Instant;

use crate::{
    error::ProviderError,
    llm,
    metrics::HealthStatus,
    models::{
        BlacklistChange, ChatRequest, ChatResponse, ClientDetail, ContentFilterError, ImageQualityError, ModelsResponse,
        Performance, RateLimitStatus, ReasonRequest,
    },
    security::{
        middleware::SecurityContext,
        moderation::{ModerationVerdict, Stage},
        reputation::{ClientReputation, ClientStats, SystemStats},
    },
    state::AppState,
};

type ApiError = (StatusCode, Json<serde_json::Value>);

const GENERATION_MAX_TOKENS: u32 = 1000;
const GENERATION_TEMPERATURE: f32 = 0.7;

fn error(status: StatusCode, message: &str) -> ApiError {
    (status, Json(json!({ "error": message })))
}

pub async fn chat(
    State(state): State<AppState>,
    Extension(security_ctx): Extension<SecurityContext>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let started = Instant::now();
    let Json(request) = payload.map_err(|e| {
        tracing::debug!(error = %e, "rejected chat body");
        error(StatusCode::BAD_REQUEST, "Invalid JSON body")
    })?;

    let message = request.message.trim();
    if message.is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "Message is required"));
    }
    let image = request.image.as_deref().map(str::trim).filter(|i| !i.is_empty());
    let client_id = security_ctx.client_id.as_str();

    let verdict = state.moderation.moderate(client_id, message, image).await;
    state.metrics.record_verdict(&verdict);
    let moderation_ms = started.elapsed().as_millis() as u64;

    if !verdict.allowed {
        tracing::warn!(
            client = %client_id,
            stage = verdict.stage.as_str(),
            reason = %verdict.reason,
            "content blocked"
        );
        return Err(rejection_response(verdict));
    }

    let generation = llm::ChatRequest {
        model: state.provider.default_model().to_string(),
        system: state.tutor_prompt.to_string(),
        user: message.to_string(),
        image: image.map(str::to_string),
        max_tokens: GENERATION_MAX_TOKENS,
        temperature: GENERATION_TEMPERATURE,
    };

    let completion = llm::chat_with_timeout(state.provider.as_ref(), &generation, state.config.generation_timeout)
        .await
        .map_err(|e| {
            tracing::error!(client = %client_id, error = %e, "generation failed");
            match e {
                ProviderError::Timeout { .. } => {
                    error(StatusCode::GATEWAY_TIMEOUT, "The model took too long to respond")
                }
                _ => error(StatusCode::BAD_GATEWAY, "The model service is unavailable"),
            }
        })?;

    state.metrics.record_completion(state.provider.name());
    tracing::info!(
        client = %client_id,
        prompt_tokens = completion.usage.prompt_tokens,
        completion_tokens = completion.usage.completion_tokens,
        moderation_tokens = verdict.tokens_used,
        "chat answered"
    );

    Ok(Json(ChatResponse {
        id: uuid::Uuid::new_v4().to_string(),
        response: completion.content,
        model: completion.model,
        timestamp: state.clock.now(),
        tokens_used: completion.usage.total_tokens,
        moderation_tokens: verdict.tokens_used,
        has_image: image.is_some(),
        performance: Performance {
            moderation_ms,
            generation_ms: completion.elapsed.as_millis() as u64,
            total_ms: started.elapsed().as_millis() as u64,
        },
    }))
}

/// Status and body for a rejected verdict. Blacklisting reads as a generic outage.
fn rejection_response(verdict: ModerationVerdict) -> ApiError {
    match verdict.stage {
        Stage::Blacklist => error(StatusCode::SERVICE_UNAVAILABLE, "Service temporarily unavailable"),
        Stage::ImageQuality => match verdict.image_report {
            Some(report) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!(ImageQualityError::new(report.summary()))),
            ),
            None => error(StatusCode::UNPROCESSABLE_ENTITY, "Image quality too low"),
        },
        stage => (
            StatusCode::FORBIDDEN,
            Json(json!(ContentFilterError::new(verdict.reason, stage.as_str()))),
        ),
    }
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus::check(
        state.provider.name(),
        &state.reputation,
        state.clock.now(),
    ))
}

pub async fn list_models(State(state): State<AppState>) -> Result<Json<ModelsResponse>, ApiError> {
    let models = state.provider.list_models().await.map_err(|e| {
        tracing::error!(provider = state.provider.name(), error = %e, "failed to list models");
        error(StatusCode::BAD_GATEWAY, "Unable to list models")
    })?;

    Ok(Json(ModelsResponse {
        provider: state.provider.name(),
        models,
    }))
}

pub async fn system_stats(State(state): State<AppState>) -> Json<SystemStats> {
    Json(state.reputation.system_stats())
}

pub async fn client_stats(State(state): State<AppState>, Path(client): Path<String>) -> Json<ClientStats> {
    Json(state.reputation.stats_for(&client))
}

pub async fn client_detail(State(state): State<AppState>, Path(client): Path<String>) -> Json<ClientDetail> {
    let now = state.clock.now();
    let window = state.rate_limiter.status(&client, now);

    Json(ClientDetail {
        reputation: state.reputation.stats_for(&client),
        rate_limit: RateLimitStatus {
            allowed: window.allowed,
            remaining: window.remaining,
            retry_after: if window.allowed { 0 } else { window.retry_after_seconds(now) },
        },
    })
}

pub async fn export_blacklist(
    State(state): State<AppState>,
) -> Json<std::collections::BTreeMap<String, ClientReputation>> {
    Json(state.reputation.export_blacklist())
}

pub async fn blacklist_client(
    State(state): State<AppState>,
    Path(client): Path<String>,
    body: Option<Json<ReasonRequest>>,
) -> Json<BlacklistChange> {
    let reason = reason_or(body, "Manual admin action");
    state.reputation.manual_blacklist(&client, &reason, state.clock.now());

    Json(BlacklistChange {
        client,
        blacklisted: true,
        reason,
    })
}

pub async fn unblacklist_client(
    State(state): State<AppState>,
    Path(client): Path<String>,
    body: Option<Json<ReasonRequest>>,
) -> Result<Json<BlacklistChange>, ApiError> {
    let reason = reason_or(body, "Manual admin removal");
    if !state.reputation.manual_unblacklist(&client, &reason) {
        return Err(error(StatusCode::NOT_FOUND, "Client not found"));
    }

    Ok(Json(BlacklistChange {
        client,
        blacklisted: false,
        reason,
    }))
}

fn reason_or(body: Option<Json<ReasonRequest>>, default: &str) -> String {
    body.and_then(|Json(request)| request.reason)
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => error(StatusCode::NOT_FOUND, "Metrics are not enabled").into_response(),
    }
}

pub async fn not_found() -> ApiError {
    error(StatusCode::NOT_FOUND, "Endpoint not found")
}
