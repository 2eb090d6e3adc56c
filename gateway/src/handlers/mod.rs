pub mod admin;
pub mod media;
pub mod models;
pub mod openai;
pub mod realtime;

use axum::{
    body::Body,
    extract::State,
    http::StatusCode,
    middleware,
    response::Response,
    routing::{delete, get, post},
    Router,
};
use tracing::warn;

use crate::app_state::AppState;
use crate::pipeline;
use crate::usage::PROCESSING_QUEUE;

async fn health() -> &'static str {
    "ok"
}

/// Readiness: the DB answers and the usage queue is reachable.
async fn ready(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    if sqlx::query("SELECT 1").execute(&state.db).await.is_err() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    if state.usage_queue.queue_len(PROCESSING_QUEUE).await.is_err() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok("ready")
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    if let Ok(depth) = state.usage_queue.queue_len(PROCESSING_QUEUE).await {
        state.metrics.set_usage_queue_depth(depth);
    }
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(?err, "Failed to render metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("metrics unavailable"))
                .expect("failed to build metrics error response")
        }
    }
}

/// Assemble the full application: operational endpoints outside the
/// guarded pipeline, the OpenAI-compatible surface and admin API inside
/// it. Middleware order, outer to inner: request info, recoverer, request
/// logger, CORS, rate limit, response cache, auth, budget, handler.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/completions", post(openai::completions))
        .route("/v1/embeddings", post(openai::embeddings))
        .route("/v1/messages", post(openai::messages))
        .route("/v1/moderations", post(openai::moderations))
        .route("/v1/models", get(models::list_models))
        .route("/v1/models/:id", get(models::get_model))
        .route("/v1/images/generations", post(media::images_generations))
        .route("/v1/images/edits", post(media::images_edits))
        .route("/v1/images/variations", post(media::images_variations))
        .route("/v1/audio/transcriptions", post(media::audio_transcriptions))
        .route("/v1/audio/translations", post(media::audio_translations))
        .route("/v1/audio/speech", post(media::audio_speech))
        .route("/v1/realtime", get(realtime::realtime_upgrade))
        .route("/api/keys", post(admin::create_key).get(admin::list_keys))
        .route("/api/keys/:id", delete(admin::revoke_key))
        .route("/api/auth/token", post(admin::issue_token))
        .route("/api/admin/router", get(admin::router_health))
        .route("/api/admin/cache/flush", post(admin::flush_caches))
        .route("/api/admin/audit", get(admin::query_audit))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            pipeline::budget_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            pipeline::auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            pipeline::response_cache_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            pipeline::rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::catch_panic::CatchPanicLayer::custom(
            pipeline::panic_response(state.clone()),
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            pipeline::request_info_middleware,
        ))
        .with_state(state)
}
