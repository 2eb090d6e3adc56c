use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use common_audit::{AuditEvent, AuditFilter, AuditOutcome};
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::app_state::{AppState, AuthContext, RequestInfo};
use crate::keys::{generate_secret, hash_api_key, KeyRecord, KeyType};
use crate::permissions::Permission;

// ---------------- Key management ----------------

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    #[serde(default)]
    pub team_id: Option<Uuid>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_budget: Option<f64>,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub blocked_models: Vec<String>,
    #[serde(default)]
    pub rpm_limit: Option<i64>,
    #[serde(default)]
    pub tpm_limit: Option<i64>,
    #[serde(default)]
    pub max_parallel: Option<i32>,
}

pub async fn create_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(info): Extension<RequestInfo>,
    Json(request): Json<CreateKeyRequest>,
) -> ApiResult<Response> {
    ensure_key_permission(&state, &ctx, request.team_id, Permission::KeysCreate)?;

    let secret = generate_secret(&state.config.key_prefix);
    let record = KeyRecord {
        id: Uuid::new_v4(),
        key_hash: hash_api_key(&secret),
        key_type: KeyType::Api,
        user_id: ctx.user_id(),
        team_id: request.team_id,
        active: true,
        expires_at: request.expires_at,
        max_budget: request.max_budget,
        current_spend: 0.0,
        allowed_models: request.allowed_models,
        blocked_models: request.blocked_models,
        tpm_limit: request.tpm_limit,
        rpm_limit: request.rpm_limit,
        max_parallel: request.max_parallel,
        last_used_at: None,
        usage_count: 0,
        scopes: Vec::new(),
    };
    state.keys.insert(&record).await.map_err(ApiError::internal)?;

    let mut event = AuditEvent::new("keys", "key.create", AuditOutcome::Success)
        .with_key(record.id)
        .with_request("POST", "/api/keys", info.client_ip.clone(), info.user_agent.clone());
    if let Some(user_id) = ctx.user_id() {
        event = event.with_user(user_id);
    }
    if let Some(team_id) = request.team_id {
        event = event.with_team(team_id);
    }
    state.audit.record(event).await;

    // The secret is returned exactly once; only its digest persists.
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": record.id,
            "key": secret,
            "key_type": record.key_type,
            "team_id": record.team_id,
            "expires_at": record.expires_at,
            "max_budget": record.max_budget,
        })),
    )
        .into_response())
}

pub async fn list_keys(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    if !ctx.permits(&state.permissions, Permission::KeysRead) {
        return Err(ApiError::Access { message: "keys:read denied".into() });
    }
    // Masters see everything; everyone else sees their own keys.
    let (user_filter, team_filter) = if ctx.is_master() {
        (None, None)
    } else {
        (ctx.user_id(), None)
    };
    let keys = state
        .keys
        .list_for_scope(user_filter, team_filter)
        .await
        .map_err(ApiError::internal)?;
    let data: Vec<serde_json::Value> = keys
        .into_iter()
        .map(|key| {
            json!({
                "id": key.id,
                "key_type": key.key_type,
                "user_id": key.user_id,
                "team_id": key.team_id,
                "active": key.active,
                "expires_at": key.expires_at,
                "max_budget": key.max_budget,
                "current_spend": key.current_spend,
                "last_used_at": key.last_used_at,
                "usage_count": key.usage_count,
            })
        })
        .collect();
    Ok(Json(json!({ "data": data })))
}

pub async fn revoke_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Extension(info): Extension<RequestInfo>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    ensure_key_permission(&state, &ctx, None, Permission::KeysRevoke)?;

    let revoked = state.keys.revoke(id).await.map_err(ApiError::internal)?;
    if !revoked {
        return Err(ApiError::not_found(format!("key '{id}' does not exist")));
    }
    // The cache copy must die with the row.
    state.auth.invalidate_key_id(id).await;

    let mut event = AuditEvent::new("keys", "key.revoke", AuditOutcome::Success)
        .with_key(id)
        .with_request("DELETE", "/api/keys", info.client_ip.clone(), info.user_agent.clone());
    if let Some(user_id) = ctx.user_id() {
        event = event.with_user(user_id);
    }
    state.audit.record(event).await;
    Ok(StatusCode::NO_CONTENT)
}

fn ensure_key_permission(
    state: &AppState,
    ctx: &AuthContext,
    team_id: Option<Uuid>,
    permission: Permission,
) -> ApiResult<()> {
    let allowed = match (&ctx.credential, team_id) {
        (crate::validator::Credential::Jwt(identity), Some(team_id)) => {
            state.permissions.has_team_permission(
                identity.user.role,
                &identity.memberships,
                team_id,
                permission,
            )
        }
        _ => ctx.permits(&state.permissions, permission),
    };
    if allowed {
        Ok(())
    } else {
        Err(ApiError::Access { message: "insufficient permissions".into() })
    }
}

// ---------------- Internal token issuance ----------------

#[derive(Debug, Deserialize, Default)]
pub struct IssueTokenRequest {
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Exchange any validated credential for a short-lived internal HS256
/// token. Keeps SSE/browser clients off long-lived key secrets.
pub async fn issue_token(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<IssueTokenRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let secret = state
        .config
        .jwt_secret
        .as_deref()
        .ok_or_else(|| ApiError::invalid_request("internal token issuance is not configured"))?;

    let ttl = request
        .ttl_secs
        .unwrap_or(state.config.access_token_duration_secs)
        .min(24 * 3600);
    let now = Utc::now().timestamp();
    let subject = ctx
        .user_id()
        .map(|id| id.to_string())
        .unwrap_or_else(|| "master".to_string());

    let claims = json!({
        "sub": subject,
        "iss": internal_issuer(&state),
        "aud": state.config.jwt_audience,
        "iat": now,
        "exp": now + ttl as i64,
    });
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(ApiError::internal)?;

    Ok(Json(json!({
        "access_token": token,
        "token_type": "Bearer",
        "expires_in": ttl,
    })))
}

pub fn internal_issuer(state: &AppState) -> String {
    state
        .config
        .dex
        .as_ref()
        .map(|dex| dex.issuer.clone())
        .unwrap_or_else(|| "llm-gateway".to_string())
}

// ---------------- Router health (live registry view) ----------------

pub async fn router_health(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    if !ctx.permits(&state.permissions, Permission::UsageRead) {
        return Err(ApiError::Access { message: "usage:read denied".into() });
    }
    let instances = state.registry.snapshot();
    Ok(Json(json!({ "instances": instances })))
}

// ---------------- Cache invalidation ----------------

#[derive(Debug, Deserialize)]
pub struct FlushRequest {
    /// "auth", "response" or "all".
    pub target: String,
}

pub async fn flush_caches(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<FlushRequest>,
) -> ApiResult<StatusCode> {
    if !ctx.permits(&state.permissions, Permission::CacheFlush) {
        return Err(ApiError::Access { message: "cache:flush denied".into() });
    }
    match request.target.as_str() {
        "auth" => state.auth.clear().await,
        "response" => state.response_cache.clear().await,
        "all" => {
            state.auth.clear().await;
            state.response_cache.clear().await;
        }
        other => {
            return Err(ApiError::invalid_request(format!(
                "unknown flush target '{other}'"
            )))
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---------------- Audit reads ----------------

#[derive(Debug, Deserialize, Default)]
pub struct AuditQuery {
    pub user_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub key_id: Option<Uuid>,
    pub event_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn query_audit(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    if !ctx.permits(&state.permissions, Permission::AuditRead) {
        return Err(ApiError::Access { message: "audit:read denied".into() });
    }
    let mut filter = AuditFilter::new();
    filter.user_id = query.user_id;
    filter.team_id = query.team_id;
    filter.key_id = query.key_id;
    filter.event_type = query.event_type;
    filter.since = query.since;
    filter.until = query.until;
    if let Some(limit) = query.limit {
        filter.limit = limit;
    }
    if let Some(offset) = query.offset {
        filter.offset = offset;
    }
    let events = state.audit.query(&filter).await.map_err(ApiError::internal)?;
    Ok(Json(json!({ "data": events })))
}
