use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer};

use crate::{
    handlers,
    security::middleware::{client_identity_middleware, pattern_gate_middleware, rate_limit_middleware},
    state::AppState,
};

pub fn create_router(state: AppState) -> Router {
    let config = state.config.clone();

    let mut router = Router::new()
        .route("/api/chat", post(handlers::chat))
        .route("/api/health", get(handlers::health_check))
        .route("/api/models", get(handlers::list_models))
        .route("/api/stats", get(handlers::system_stats))
        .route("/metrics", get(handlers::prometheus_metrics));

    if config.admin_api_enabled {
        router = router.merge(moderation_routes());
    }

    // Worst case for one chat: image check, both classifiers, generation
    let request_timeout = config.image_check_timeout
        + config.classifier_timeout * 2
        + config.generation_timeout
        + Duration::from_secs(5);

    router
        .fallback(handlers::not_found)
        // Middleware runs bottom-up: identity, pattern gate, rate limit
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), pattern_gate_middleware))
        .layer(middleware::from_fn(client_identity_middleware))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(cors_layer(&config.allowed_origins))
        .with_state(state)
}

/// Blacklist administration and per-client records, mounted only when
/// enabled in configuration. Client records carry blacklist reasons.
fn moderation_routes() -> Router<AppState> {
    Router::new()
        .route("/api/ip-stats/:client", get(handlers::client_stats))
        .route("/api/moderation/blacklist", get(handlers::export_blacklist))
        .route("/api/moderation/stats", get(handlers::system_stats))
        .route("/api/moderation/clients/:client", get(handlers::client_detail))
        .route("/api/moderation/clients/:client/blacklist", post(handlers::blacklist_client))
        .route("/api/moderation/clients/:client/unblacklist", post(handlers::unblacklist_client))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
