use axum::{
    extract::{
        ws::{Message, WebSocket},
        Extension, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use base64::Engine;
use chrono::Utc;
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app_state::{AppState, AuthContext};
use crate::providers::{invoke, extract_usage, ProviderBody, ProviderOp, ProviderRequest};
use crate::realtime::{RealtimeClientEvent, RealtimeSession, SessionError};
use crate::usage::UsageRecord;

/// Committed audio is billed by size until the upstream reports counts.
const AUDIO_BYTES_PER_TOKEN: usize = 100;

#[derive(Debug, Deserialize)]
pub struct RealtimeParams {
    pub model: Option<String>,
}

pub async fn realtime_upgrade(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(params): Query<RealtimeParams>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let model = params
        .model
        .unwrap_or_else(|| "gpt-4o-realtime-preview".to_string());

    if let Some(key) = ctx.key() {
        if !key.model_permitted(&model) {
            return Err(ApiError::Access {
                message: format!("model '{model}' is not permitted for this key"),
            });
        }
    }

    let session = state
        .realtime
        .open(
            ctx.user_id().unwrap_or(Uuid::nil()),
            ctx.team_id(),
            ctx.key_id().unwrap_or(Uuid::nil()),
            model,
        )
        .await
        .map_err(|err| match err {
            SessionError::TenantLimitReached => ApiError::RateLimit {
                message: err.to_string(),
                retry_after_secs: None,
            },
            SessionError::NotActive => ApiError::internal(err),
        })?;
    state
        .metrics
        .set_realtime_sessions(state.realtime.active_count().await);

    Ok(ws.on_upgrade(move |socket| run_session(state, ctx, session, socket)))
}

async fn run_session(
    state: AppState,
    ctx: AuthContext,
    session: RealtimeSession,
    mut socket: WebSocket,
) {
    let created = json!({
        "type": "session.created",
        "session": {
            "id": session.id,
            "model": session.model,
            "expires_at": session.expires_at.timestamp(),
        },
    });
    // A write failure on a fresh socket means the client is already gone.
    if send_event(&mut socket, created).await.is_err() {
        state.realtime.close(session.id).await;
        return;
    }

    while let Some(message) = socket.recv().await {
        // Session TTL is enforced mid-conversation, not only by the sweep.
        if state.realtime.get(session.id).await.is_none() {
            let _ = send_event(
                &mut socket,
                json!({"type": "session.expired", "session_id": session.id}),
            )
            .await;
            break;
        }

        let outcome = match message {
            Ok(Message::Text(text)) => {
                handle_event(&state, &ctx, &session, &mut socket, &text).await
            }
            Ok(Message::Binary(bytes)) => {
                // Binary frames are raw audio appends.
                state
                    .realtime
                    .append_audio(session.id, bytes.len())
                    .await
                    .map_err(|err| err.to_string())
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => Ok(()),
        };

        if let Err(reason) = outcome {
            let failed = send_event(
                &mut socket,
                json!({"type": "error", "error": {"message": reason}}),
            )
            .await
            .is_err();
            if failed {
                break;
            }
        }
    }

    state.realtime.close(session.id).await;
    state
        .metrics
        .set_realtime_sessions(state.realtime.active_count().await);
    debug!(session_id = %session.id, "Realtime session closed");
}

async fn handle_event(
    state: &AppState,
    ctx: &AuthContext,
    session: &RealtimeSession,
    socket: &mut WebSocket,
    text: &str,
) -> Result<(), String> {
    let event: RealtimeClientEvent =
        serde_json::from_str(text).map_err(|err| format!("unrecognized event: {err}"))?;

    match event {
        RealtimeClientEvent::SessionUpdate { session: update } => {
            send_event(
                socket,
                json!({"type": "session.updated", "session": update}),
            )
            .await
            .map_err(|_| "client gone".to_string())
        }
        RealtimeClientEvent::InputAudioAppend { audio } => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(audio.as_bytes())
                .map_err(|_| "audio payload is not valid base64".to_string())?;
            state
                .realtime
                .append_audio(session.id, bytes.len())
                .await
                .map_err(|err| err.to_string())
        }
        RealtimeClientEvent::InputAudioCommit => {
            let bytes = state
                .realtime
                .commit_audio(session.id)
                .await
                .map_err(|err| err.to_string())?;
            emit_audio_usage(state, ctx, session, bytes);
            send_event(
                socket,
                json!({"type": "input_audio_buffer.committed", "bytes": bytes}),
            )
            .await
            .map_err(|_| "client gone".to_string())
        }
        RealtimeClientEvent::ResponseCreate { response } => {
            let reply = generate_response(state, ctx, session, response).await?;
            send_event(socket, reply)
                .await
                .map_err(|_| "client gone".to_string())
        }
    }
}

/// Each committed buffer is an accounting event.
fn emit_audio_usage(
    state: &AppState,
    ctx: &AuthContext,
    session: &RealtimeSession,
    bytes: usize,
) {
    if bytes == 0 {
        return;
    }
    let tokens = (bytes / AUDIO_BYTES_PER_TOKEN).max(1) as u32;
    let (provider, cost) = match state.registry.primary_instance(&session.model) {
        Some(instance) => (
            instance.config.provider.clone(),
            instance.cost_for(tokens, 0),
        ),
        None => ("realtime".to_string(), 0.0),
    };
    let record = UsageRecord {
        request_id: Uuid::new_v4(),
        timestamp: Utc::now(),
        model: session.model.clone(),
        provider,
        path: "/v1/realtime".to_string(),
        status: 200,
        input_tokens: tokens,
        output_tokens: 0,
        total_cost: cost,
        latency_ms: 0,
        key_id: session.key_id,
        user_id: session.user_id,
        team_id: session.team_id,
        actual_user_id: ctx.actual_user_id(),
    };
    state.metrics.record_usage_event("emitted");
    state.usage.emit(record);
}

/// `response.create`: route to the session's model and run one generation
/// turn with the event's instructions.
async fn generate_response(
    state: &AppState,
    ctx: &AuthContext,
    session: &RealtimeSession,
    response: Value,
) -> Result<Value, String> {
    let instructions = response
        .get("instructions")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let routed = state
        .registry
        .select(&session.model, ctx.key())
        .map_err(|err| err.to_string())?;
    let instance = routed.guard.instance().clone();

    let body = json!({
        "model": routed.resolved_model,
        "messages": [{"role": "user", "content": instructions}],
    });
    let request = ProviderRequest {
        op: ProviderOp::Chat,
        body: ProviderBody::Json(body),
        stream: false,
        timeout: instance.timeout(),
    };

    let started = std::time::Instant::now();
    match invoke(&instance.provider, request).await {
        Ok(crate::providers::ProviderResponse::Json(payload)) => {
            let latency = started.elapsed();
            instance.record_success(latency);
            let usage = extract_usage(&payload).unwrap_or_default();
            let cost = instance.cost_for(usage.input_tokens, usage.output_tokens);
            let record = UsageRecord {
                request_id: Uuid::new_v4(),
                timestamp: Utc::now(),
                model: routed.resolved_model.clone(),
                provider: instance.config.provider.clone(),
                path: "/v1/realtime".to_string(),
                status: 200,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                total_cost: cost,
                latency_ms: latency.as_millis() as u64,
                key_id: session.key_id,
                user_id: session.user_id,
                team_id: session.team_id,
                actual_user_id: ctx.actual_user_id(),
            };
            state.metrics.record_usage_event("emitted");
            state.usage.emit(record);
            Ok(json!({
                "type": "response.done",
                "response": {
                    "model": routed.resolved_model,
                    "output": payload,
                },
            }))
        }
        Ok(crate::providers::ProviderResponse::Stream(_)) => {
            instance.record_success(started.elapsed());
            Err("streaming responses are not supported on this socket".to_string())
        }
        Err(err) => {
            instance.record_failure(crate::registry::FailureClass::from(&err));
            warn!(error = %err, session_id = %session.id, "Realtime generation failed");
            Err("upstream generation failed".to_string())
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(event.to_string())).await
}
