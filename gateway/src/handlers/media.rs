use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{Extension, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::app_state::{AppState, AuthContext, RequestInfo};
use crate::handlers::openai::{dispatch_json, emit_usage};
use crate::providers::{invoke, ProviderBody, ProviderOp, ProviderRequest, TokenUsage};
use crate::registry::FailureClass;

pub async fn images_generations(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    dispatch_json(
        state,
        ctx,
        info,
        ProviderOp::ImagesGenerations,
        "/v1/images/generations",
        body,
    )
    .await
}

pub async fn images_edits(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(info): Extension<RequestInfo>,
    Query(params): Query<RawDispatchParams>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    dispatch_raw(
        state,
        ctx,
        info,
        ProviderOp::ImagesEdits,
        "/v1/images/edits",
        params,
        headers,
        body,
    )
    .await
}

pub async fn images_variations(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(info): Extension<RequestInfo>,
    Query(params): Query<RawDispatchParams>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    dispatch_raw(
        state,
        ctx,
        info,
        ProviderOp::ImagesVariations,
        "/v1/images/variations",
        params,
        headers,
        body,
    )
    .await
}

pub async fn audio_transcriptions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(info): Extension<RequestInfo>,
    Query(params): Query<RawDispatchParams>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    dispatch_raw(
        state,
        ctx,
        info,
        ProviderOp::AudioTranscriptions,
        "/v1/audio/transcriptions",
        params,
        headers,
        body,
    )
    .await
}

pub async fn audio_translations(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(info): Extension<RequestInfo>,
    Query(params): Query<RawDispatchParams>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    dispatch_raw(
        state,
        ctx,
        info,
        ProviderOp::AudioTranslations,
        "/v1/audio/translations",
        params,
        headers,
        body,
    )
    .await
}

pub async fn audio_speech(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    dispatch_json(
        state,
        ctx,
        info,
        ProviderOp::AudioSpeech,
        "/v1/audio/speech",
        body,
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct RawDispatchParams {
    /// Multipart bodies are passed through opaque; the logical model rides
    /// the query string instead.
    model: Option<String>,
}

/// Pass-through dispatch for multipart/binary endpoints: the body is
/// forwarded byte-for-byte with its original content type.
#[allow(clippy::too_many_arguments)]
async fn dispatch_raw(
    state: AppState,
    ctx: AuthContext,
    info: RequestInfo,
    op: ProviderOp,
    path: &str,
    params: RawDispatchParams,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let model = params
        .model
        .ok_or_else(|| ApiError::invalid_request("'model' query parameter is required"))?;

    if let Some(key) = ctx.key() {
        if !key.model_permitted(&model) {
            return Err(ApiError::Access {
                message: format!("model '{model}' is not permitted for this key"),
            });
        }
    }
    let scopes = ctx.budget_scopes();
    if let Some(scope) = state.budgets.check_all(&scopes, 0.0).await {
        state.metrics.record_budget_denial(&scope.to_string());
        return Err(ApiError::BudgetExceeded {
            message: format!("budget exhausted for scope {scope}"),
        });
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let routed = state
        .registry
        .select(&model, ctx.key())
        .map_err(|err| match err {
            crate::registry::RouteError::UnknownModel(model) => {
                ApiError::not_found(format!("model '{model}' does not exist"))
            }
            crate::registry::RouteError::NoHealthyInstance(model) => ApiError::Unavailable {
                message: format!("no healthy instance for '{model}' or any fallback"),
            },
        })?;
    let instance = routed.guard.instance().clone();

    let request = ProviderRequest {
        op,
        body: ProviderBody::Raw {
            bytes: body.to_vec(),
            content_type,
        },
        stream: false,
        timeout: instance.timeout(),
    };

    let started = Instant::now();
    let result = invoke(&instance.provider, request).await;
    let latency = started.elapsed();
    state.metrics.observe_provider_latency(
        &instance.config.provider,
        &routed.resolved_model,
        latency.as_secs_f64(),
    );

    match result {
        Ok(crate::providers::ProviderResponse::Json(payload)) => {
            instance.record_success(latency);
            let usage = crate::providers::extract_usage(&payload).unwrap_or_default();
            let cost = instance.cost_for(usage.input_tokens, usage.output_tokens);
            emit_usage(
                &state,
                &ctx,
                &info,
                path,
                &routed.resolved_model,
                &instance,
                200,
                usage,
                cost,
                latency,
            );
            Ok((StatusCode::OK, Json(payload)).into_response())
        }
        Ok(crate::providers::ProviderResponse::Stream(upstream)) => {
            instance.record_success(latency);
            emit_usage(
                &state,
                &ctx,
                &info,
                path,
                &routed.resolved_model,
                &instance,
                200,
                TokenUsage::default(),
                0.0,
                latency,
            );
            let content_type = upstream
                .headers()
                .get(header::CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .body(Body::from_stream(upstream.bytes_stream()))
                .map_err(ApiError::internal)
        }
        Err(err) if err.is_caller_fault() => {
            instance.record_failure(FailureClass::ClientError);
            Err(ApiError::invalid_request(err.to_string()))
        }
        Err(err) => {
            instance.record_failure(FailureClass::from(&err));
            warn!(error = %err, instance = %instance.config.id, "Upstream media call failed");
            Err(ApiError::Unavailable {
                message: format!("upstream call for '{model}' failed"),
            })
        }
    }
}
