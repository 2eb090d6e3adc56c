use std::time::Instant;

use axum::{
    body::Body,
    extract::{Extension, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use common_http_errors::{ApiError, ApiResult};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app_state::{AppState, AuthContext, RequestInfo};
use crate::providers::{
    estimate_tokens, extract_usage, invoke, ProviderBody, ProviderError, ProviderOp,
    ProviderRequest, TokenUsage,
};
use crate::registry::{FailureClass, RouteError};
use crate::usage::UsageRecord;

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    dispatch_json(state, ctx, info, ProviderOp::Chat, "/v1/chat/completions", body).await
}

pub async fn completions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    dispatch_json(state, ctx, info, ProviderOp::Completions, "/v1/completions", body).await
}

pub async fn embeddings(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    dispatch_json(state, ctx, info, ProviderOp::Embeddings, "/v1/embeddings", body).await
}

/// Anthropic-style messages; dispatched through the same chat capability.
pub async fn messages(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    dispatch_json(state, ctx, info, ProviderOp::Chat, "/v1/messages", body).await
}

pub async fn moderations(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<Value>,
) -> ApiResult<Response> {
    dispatch_json(state, ctx, info, ProviderOp::Moderations, "/v1/moderations", body).await
}

/// The shared inner pipeline for JSON operations: model permission check,
/// budget would-exceed with the cost estimate, route (with retries and
/// fallback), upstream call, usage emission.
pub async fn dispatch_json(
    state: AppState,
    ctx: AuthContext,
    info: RequestInfo,
    op: ProviderOp,
    path: &str,
    body: Value,
) -> ApiResult<Response> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::invalid_request("'model' is required"))?
        .to_string();
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    if let Some(key) = ctx.key() {
        if !key.model_permitted(&model) {
            return Err(ApiError::Access {
                message: format!("model '{model}' is not permitted for this key"),
            });
        }
    }

    // Pre-flight budget gate with the request's cost estimate.
    let estimated_input = estimate_tokens(&body);
    let expected_output = body
        .get("max_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(256) as u32;
    let estimated_cost = state
        .registry
        .pricing_for(&model)
        .map(|(input_cost, output_cost)| {
            estimated_input as f64 * input_cost + expected_output as f64 * output_cost
        })
        .unwrap_or(0.0);
    let scopes = ctx.budget_scopes();
    if let Some(scope) = state.budgets.check_all(&scopes, estimated_cost).await {
        state.metrics.record_budget_denial(&scope.to_string());
        audit_budget_denial(&state, &ctx, path, &scope);
        return Err(ApiError::BudgetExceeded {
            message: format!("estimated cost {estimated_cost:.6} exceeds budget for {scope}"),
        });
    }

    call_with_retries(
        state,
        ctx,
        info,
        op,
        path,
        body,
        model,
        stream,
        estimated_input,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn call_with_retries(
    state: AppState,
    ctx: AuthContext,
    info: RequestInfo,
    op: ProviderOp,
    path: &str,
    body: Value,
    model: String,
    stream: bool,
    estimated_input: u32,
) -> ApiResult<Response> {
    let max_retries = state.config.max_retries;
    let mut attempts = 0u32;

    loop {
        let routed = state
            .registry
            .select(&model, ctx.key())
            .map_err(route_error_to_api)?;
        let instance = routed.guard.instance().clone();

        let mut upstream_body = body.clone();
        upstream_body["model"] = Value::String(routed.resolved_model.clone());

        let request = ProviderRequest {
            op,
            body: ProviderBody::Json(upstream_body),
            stream,
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
            Ok(response) => {
                instance.record_success(latency);
                return finish_success(
                    &state,
                    &ctx,
                    &info,
                    path,
                    &routed.resolved_model,
                    &instance,
                    response,
                    latency,
                    estimated_input,
                )
                .await;
            }
            Err(err) if err.is_caller_fault() => {
                instance.record_failure(FailureClass::ClientError);
                return Ok(pass_through_upstream_error(err));
            }
            Err(err) => {
                instance.record_failure(FailureClass::from(&err));
                attempts += 1;
                warn!(
                    error = %err,
                    instance = %instance.config.id,
                    attempts,
                    "Upstream call failed"
                );
                if attempts > max_retries {
                    return Err(ApiError::Unavailable {
                        message: format!("no upstream could serve '{model}'"),
                    });
                }
                // Guard drops here, releasing the reservation before the
                // retry re-enters selection.
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn finish_success(
    state: &AppState,
    ctx: &AuthContext,
    info: &RequestInfo,
    path: &str,
    resolved_model: &str,
    instance: &std::sync::Arc<crate::registry::ModelInstance>,
    response: crate::providers::ProviderResponse,
    latency: std::time::Duration,
    estimated_input: u32,
) -> ApiResult<Response> {
    match response {
        crate::providers::ProviderResponse::Json(payload) => {
            let usage = extract_usage(&payload).unwrap_or_default();
            let cost = instance.cost_for(usage.input_tokens, usage.output_tokens);
            emit_usage(
                state, ctx, info, path, resolved_model, instance, 200, usage, cost, latency,
            );
            Ok((StatusCode::OK, Json(payload)).into_response())
        }
        crate::providers::ProviderResponse::Stream(upstream) => {
            // Streaming bodies never report exact counts; the input side is
            // estimated and the output side is unknown at header time.
            let usage = TokenUsage {
                input_tokens: estimated_input,
                output_tokens: 0,
            };
            let cost = instance.cost_for(usage.input_tokens, usage.output_tokens);
            emit_usage(
                state, ctx, info, path, resolved_model, instance, 200, usage, cost, latency,
            );
            let content_type = upstream
                .headers()
                .get(header::CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| HeaderValue::from_static("text/event-stream"));
            let body = Body::from_stream(upstream.bytes_stream());
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .body(body)
                .map_err(ApiError::internal)
        }
    }
}

/// Upstream 4xx bodies pass through with their original status.
fn pass_through_upstream_error(err: ProviderError) -> Response {
    match err {
        ProviderError::Upstream { status, body } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
            Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap_or_else(|_| status.into_response())
        }
        ProviderError::Unsupported(provider) => ApiError::invalid_request(format!(
            "operation not supported by provider '{provider}'"
        ))
        .into_response(),
        other => ApiError::internal(other).into_response(),
    }
}

fn audit_budget_denial(
    state: &AppState,
    ctx: &AuthContext,
    path: &str,
    scope: &crate::budget::BudgetScope,
) {
    let mut event = common_audit::AuditEvent::new(
        "budget",
        "budget.denied",
        common_audit::AuditOutcome::Failure,
    )
    .with_metadata(serde_json::json!({ "scope": scope.to_string(), "path": path }));
    if let Some(user_id) = ctx.user_id() {
        event = event.with_user(user_id);
    }
    if let Some(key_id) = ctx.key_id() {
        event = event.with_key(key_id);
    }
    let audit = state.audit.clone();
    tokio::spawn(async move { audit.record(event).await });
}

fn route_error_to_api(err: RouteError) -> ApiError {
    match err {
        RouteError::UnknownModel(model) => {
            ApiError::not_found(format!("model '{model}' does not exist"))
        }
        RouteError::NoHealthyInstance(model) => ApiError::Unavailable {
            message: format!("no healthy instance for '{model}' or any fallback"),
        },
    }
}

/// Build the usage record and enqueue it off the hot path.
#[allow(clippy::too_many_arguments)]
pub fn emit_usage(
    state: &AppState,
    ctx: &AuthContext,
    info: &RequestInfo,
    path: &str,
    model: &str,
    instance: &crate::registry::ModelInstance,
    status: u16,
    usage: TokenUsage,
    cost: f64,
    latency: std::time::Duration,
) {
    let record = UsageRecord {
        request_id: info.request_id,
        timestamp: Utc::now(),
        model: model.to_string(),
        provider: instance.config.provider.clone(),
        path: path.to_string(),
        status,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        total_cost: cost,
        latency_ms: latency.as_millis() as u64,
        key_id: ctx.key_id().unwrap_or(Uuid::nil()),
        user_id: ctx.user_id().unwrap_or(Uuid::nil()),
        team_id: ctx.team_id(),
        actual_user_id: ctx.actual_user_id(),
    };
    debug!(request_id = %record.request_id, model, cost, "Emitting usage record");
    state.metrics.record_usage_event("emitted");
    state.usage.emit(record);
}
