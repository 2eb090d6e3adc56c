use std::time::Instant;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use common_audit::{AuditEvent, AuditOutcome};
use common_http_errors::ApiError;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::app_state::{AppState, AuthContext, RequestInfo};
use crate::rate_limiter::{is_exempt_path, EndpointClass};
use crate::response_cache::{fingerprint, is_cacheable_body};

/// Request bodies buffered for caching or inspection are capped here.
const MAX_BUFFERED_BODY: usize = 2 * 1024 * 1024;

// ---------------- Request metadata ----------------

/// Outermost application middleware: request id, client ip, user agent,
/// and the request counter/latency metrics.
pub async fn request_info_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4();
    let client_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(|ip| ip.trim().to_string());
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(|ua| ua.to_string());
    let path = request.uri().path().to_string();

    request.extensions_mut().insert(RequestInfo {
        request_id,
        client_ip,
        user_agent,
    });

    let started = Instant::now();
    let mut response = next.run(request).await;
    state.metrics.record_request(
        &path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert("X-Request-Id", value);
    }
    response
}

// ---------------- Rate limiting ----------------

/// Fixed-window limiting keyed by `(scope, endpoint class)`. Runs before
/// auth, so the scope is the presented API key's digest when one exists,
/// else the client IP.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();
    if !state.config.rate_limit_enabled || is_exempt_path(&path) {
        return Ok(next.run(request).await);
    }

    let class = EndpointClass::from_path(&path);
    let limit = state.config.rpm_for_class(class);
    let scope = match presented_credential(&request) {
        Some((raw, _)) => {
            let digest = Sha256::digest(raw.as_bytes());
            format!("key:{}", hex::encode(&digest[..8]))
        }
        None => {
            let ip = request
                .extensions()
                .get::<RequestInfo>()
                .and_then(|info| info.client_ip.clone())
                .unwrap_or_else(|| "unknown".to_string());
            format!("ip:{ip}")
        }
    };
    let window_key = format!("{scope}:{}", class.as_str());

    let decision = match state.rate_limiter.check(&window_key, limit).await {
        Ok(decision) => decision,
        Err(err) => {
            // Counter backend trouble never blocks traffic.
            warn!(error = %err, "Rate limiter failure; allowing request");
            return Ok(next.run(request).await);
        }
    };
    state.metrics.record_rate_check(class.as_str(), decision.allowed);

    if !decision.allowed {
        let mut response = ApiError::RateLimit {
            message: format!("rate limit exceeded for {}", class.as_str()),
            retry_after_secs: Some(decision.reset_secs),
        }
        .into_response();
        apply_rate_headers(&mut response, decision.limit, decision.remaining(), decision.reset_secs);
        return Ok(response);
    }

    let mut response = next.run(request).await;
    apply_rate_headers(&mut response, decision.limit, decision.remaining(), decision.reset_secs);
    Ok(response)
}

fn apply_rate_headers(response: &mut Response, limit: u32, remaining: i64, reset_secs: u64) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&reset_secs.to_string()) {
        headers.insert("X-RateLimit-Reset", value);
    }
}

// ---------------- Response cache ----------------

fn cacheable_path(method: &axum::http::Method, path: &str) -> bool {
    (method == axum::http::Method::POST
        && matches!(
            path,
            "/v1/chat/completions" | "/v1/completions" | "/v1/embeddings"
        ))
        || (method == axum::http::Method::GET && path == "/v1/models")
}

/// Response-cache middleware: serve deterministic repeats from cache; capture
/// qualifying responses on the way out. Streaming responses pass through
/// unbuffered.
pub async fn response_cache_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    if !state.response_cache.enabled() || !cacheable_path(&method, &path) {
        return Ok(next.run(request).await);
    }

    let auth_digest = presented_credential(&request)
        .map(|(raw, _)| hex::encode(Sha256::digest(raw.as_bytes())))
        .unwrap_or_default();

    let (request, key) = if method == axum::http::Method::GET {
        (
            request,
            Some(fingerprint("GET", &path, &serde_json::Value::Null, &auth_digest)),
        )
    } else {
        // Buffer the body to fingerprint it, then rebuild the request.
        let (parts, body) = request.into_parts();
        let bytes = to_bytes(body, MAX_BUFFERED_BODY)
            .await
            .map_err(|_| ApiError::invalid_request("request body too large"))?;
        let key = serde_json::from_slice::<serde_json::Value>(&bytes)
            .ok()
            .filter(is_cacheable_body)
            .map(|body| fingerprint(parts.method.as_str(), &path, &body, &auth_digest));
        (
            Request::from_parts(parts, Body::from(bytes)),
            key,
        )
    };

    let Some(key) = key else {
        return Ok(next.run(request).await);
    };

    if let Some(hit) = state.response_cache.lookup(&key).await {
        state.metrics.record_cache_lookup(true);
        let response = Response::builder()
            .status(StatusCode::from_u16(hit.status).unwrap_or(StatusCode::OK))
            .header(header::CONTENT_TYPE, hit.content_type.clone())
            .header("X-Cache", "HIT")
            .header("Age", hit.age_secs().to_string())
            .body(Body::from(hit.body.clone()))
            .map_err(ApiError::internal)?;
        return Ok(response);
    }
    state.metrics.record_cache_lookup(false);

    let response = next.run(request).await;
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    // Event streams keep their incremental writer; nothing to capture.
    if content_type.starts_with("text/event-stream") || status != StatusCode::OK {
        return Ok(response);
    }

    let (mut parts, body) = response.into_parts();
    let bytes = to_bytes(body, MAX_BUFFERED_BODY)
        .await
        .map_err(ApiError::internal)?;
    state
        .response_cache
        .store(&key, status.as_u16(), &content_type, &bytes)
        .await;
    parts
        .headers
        .insert("X-Cache", HeaderValue::from_static("MISS"));
    Ok(Response::from_parts(parts, Body::from(bytes)))
}

// ---------------- Authentication ----------------

/// Pull the raw credential off a request. Carriers, in order: the
/// `Authorization` header (`Bearer` or `Basic`), `X-API-Key`, and the
/// `api_key` query parameter (for SSE clients that cannot set headers).
/// The boolean marks the Basic scheme, which only ever carries the master
/// secret.
pub fn presented_credential(request: &Request) -> Option<(String, bool)> {
    if let Some(raw) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        if let Some(bearer) = raw.strip_prefix("Bearer ") {
            return Some((bearer.trim().to_string(), false));
        }
        if let Some(basic) = raw.strip_prefix("Basic ") {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(basic.trim())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .map(|creds| match creds.split_once(':') {
                    Some((_, secret)) if !secret.is_empty() => secret.to_string(),
                    _ => creds,
                })
                .unwrap_or_else(|| basic.trim().to_string());
            return Some((decoded, true));
        }
    }
    if let Some(raw) = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
    {
        return Some((raw.trim().to_string(), false));
    }
    if let Some(query) = request.uri().query() {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("api_key=") {
                return Some((value.to_string(), false));
            }
        }
    }
    None
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let info = request.extensions().get::<RequestInfo>().cloned();
    let path = request.uri().path().to_string();
    let method = request.method().to_string();

    let Some((raw, via_basic)) = presented_credential(&request) else {
        state.metrics.record_auth_failure("missing");
        audit_auth_failure(&state, &method, &path, info.as_ref(), "missing credential");
        return Err(ApiError::authentication("missing credential"));
    };

    let result = if via_basic {
        state.auth.validator().validate_master(&raw)
    } else {
        state.auth.authenticate(&raw).await
    };

    match result {
        Ok(credential) => {
            let ctx = AuthContext { credential };
            audit_auth_success(&state, &method, &path, info.as_ref(), &ctx);
            request.extensions_mut().insert(ctx);
            Ok(next.run(request).await)
        }
        Err(err) => {
            state.metrics.record_auth_failure(failure_kind(&err));
            audit_auth_failure(&state, &method, &path, info.as_ref(), failure_kind(&err));
            Err(err.into())
        }
    }
}

fn audit_auth_success(
    state: &AppState,
    method: &str,
    path: &str,
    info: Option<&RequestInfo>,
    ctx: &AuthContext,
) {
    let mut event = AuditEvent::new("auth", "credential.validate", AuditOutcome::Success)
        .with_request(
            method,
            path,
            info.and_then(|i| i.client_ip.clone()),
            info.and_then(|i| i.user_agent.clone()),
        );
    if let Some(user_id) = ctx.user_id() {
        event = event.with_user(user_id);
    }
    if let Some(key_id) = ctx.key_id() {
        event = event.with_key(key_id);
    }
    if let Some(team_id) = ctx.team_id() {
        event = event.with_team(team_id);
    }
    let audit = state.audit.clone();
    tokio::spawn(async move { audit.record(event).await });
}

fn failure_kind(err: &crate::validator::ValidationError) -> &'static str {
    use crate::validator::ValidationError::*;
    match err {
        InvalidCredential => "invalid",
        Expired => "expired",
        KeyInactive => "inactive",
        BudgetExceeded => "budget",
        ModelForbidden => "model_forbidden",
        IssuerUntrusted => "issuer",
        Tampered => "tampered",
        Backend(_) => "backend",
    }
}

fn audit_auth_failure(
    state: &AppState,
    method: &str,
    path: &str,
    info: Option<&RequestInfo>,
    reason: &'static str,
) {
    let event = AuditEvent::new("auth", "credential.validate", AuditOutcome::Failure)
        .with_request(
            method,
            path,
            info.and_then(|i| i.client_ip.clone()),
            info.and_then(|i| i.user_agent.clone()),
        )
        .with_metadata(serde_json::json!({ "reason": reason }));
    let audit = state.audit.clone();
    tokio::spawn(async move { audit.record(event).await });
}

// ---------------- Budget pre-check ----------------

/// Coarse admission check: deny outright when any applicable scope is
/// already exhausted. The fine-grained would-exceed check with the real
/// cost estimate runs in the handler once the body is parsed.
pub async fn budget_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(ctx) = request.extensions().get::<AuthContext>().cloned() else {
        return Ok(next.run(request).await);
    };

    let scopes = ctx.budget_scopes();
    if scopes.is_empty() {
        return Ok(next.run(request).await);
    }

    let started = Instant::now();
    let denied = state.budgets.check_all(&scopes, 0.0).await;
    state
        .metrics
        .observe_budget_check_latency(started.elapsed().as_secs_f64());

    if let Some(scope) = denied {
        state.metrics.record_budget_denial(&scope.to_string());
        let info = request.extensions().get::<RequestInfo>();
        let mut event = AuditEvent::new("budget", "budget.denied", AuditOutcome::Failure)
            .with_request(
                request.method().as_str(),
                request.uri().path(),
                info.and_then(|i| i.client_ip.clone()),
                info.and_then(|i| i.user_agent.clone()),
            )
            .with_metadata(serde_json::json!({ "scope": scope.to_string() }));
        if let Some(user_id) = ctx.user_id() {
            event = event.with_user(user_id);
        }
        if let Some(key_id) = ctx.key_id() {
            event = event.with_key(key_id);
        }
        let audit = state.audit.clone();
        tokio::spawn(async move { audit.record(event).await });
        return Err(ApiError::BudgetExceeded {
            message: format!("budget exhausted for scope {scope}"),
        });
    }

    Ok(next.run(request).await)
}

// ---------------- Panic recovery ----------------

/// tower-http catch-panic handler: uniform envelope plus an audit row.
pub fn panic_response(state: AppState) -> impl Fn(Box<dyn std::any::Any + Send + 'static>) -> Response + Clone {
    move |panic| {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string());
        warn!(%detail, "Recovered from handler panic");
        let audit = state.audit.clone();
        tokio::spawn(async move {
            audit
                .record(
                    AuditEvent::new("pipeline", "handler.panic", AuditOutcome::Failure)
                        .with_metadata(serde_json::json!({ "detail": detail })),
                )
                .await;
        });
        ApiError::Internal {
            message: "internal server error".to_string(),
        }
        .into_response()
    }
}
