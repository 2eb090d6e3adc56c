use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub team_id: Option<Uuid>,
    pub key_id: Uuid,
    pub model: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Inbound audio bytes appended since the last commit.
    #[serde(skip)]
    pub pending_audio_bytes: usize,
}

impl RealtimeSession {
    fn tenant(&self) -> Uuid {
        self.team_id.unwrap_or(self.user_id)
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("concurrent session limit reached for tenant")]
    TenantLimitReached,
    #[error("session not found or no longer active")]
    NotActive,
}

/// Inbound JSON events on the realtime socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum RealtimeClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate {
        #[serde(default)]
        session: serde_json::Value,
    },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioCommit,
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(default)]
        response: serde_json::Value,
    },
}

/// Stateful WebSocket session allocation with TTL and per-tenant caps.
pub struct RealtimeManager {
    sessions: RwLock<HashMap<Uuid, RealtimeSession>>,
    ttl: chrono::Duration,
    max_per_tenant: usize,
}

impl RealtimeManager {
    pub fn new(ttl_secs: u64, max_per_tenant: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl: chrono::Duration::seconds(ttl_secs as i64),
            max_per_tenant: max_per_tenant.max(1),
        }
    }

    pub async fn open(
        &self,
        user_id: Uuid,
        team_id: Option<Uuid>,
        key_id: Uuid,
        model: String,
    ) -> Result<RealtimeSession, SessionError> {
        let now = Utc::now();
        let mut guard = self.sessions.write().await;
        let tenant = team_id.unwrap_or(user_id);
        let active = guard
            .values()
            .filter(|session| {
                session.status == SessionStatus::Active
                    && session.tenant() == tenant
                    && !session.expired(now)
            })
            .count();
        if active >= self.max_per_tenant {
            return Err(SessionError::TenantLimitReached);
        }

        let session = RealtimeSession {
            id: Uuid::new_v4(),
            user_id,
            team_id,
            key_id,
            model,
            status: SessionStatus::Active,
            created_at: now,
            expires_at: now + self.ttl,
            pending_audio_bytes: 0,
        };
        guard.insert(session.id, session.clone());
        debug!(session_id = %session.id, "Realtime session opened");
        Ok(session)
    }

    pub async fn get(&self, id: Uuid) -> Option<RealtimeSession> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn append_audio(&self, id: Uuid, bytes: usize) -> Result<(), SessionError> {
        let now = Utc::now();
        let mut guard = self.sessions.write().await;
        let session = guard.get_mut(&id).ok_or(SessionError::NotActive)?;
        if session.status != SessionStatus::Active || session.expired(now) {
            return Err(SessionError::NotActive);
        }
        session.pending_audio_bytes += bytes;
        Ok(())
    }

    /// Commit the pending buffer; returns its size so the caller can emit
    /// a usage record for it.
    pub async fn commit_audio(&self, id: Uuid) -> Result<usize, SessionError> {
        let now = Utc::now();
        let mut guard = self.sessions.write().await;
        let session = guard.get_mut(&id).ok_or(SessionError::NotActive)?;
        if session.status != SessionStatus::Active || session.expired(now) {
            return Err(SessionError::NotActive);
        }
        Ok(std::mem::take(&mut session.pending_audio_bytes))
    }

    pub async fn close(&self, id: Uuid) {
        let mut guard = self.sessions.write().await;
        if let Some(session) = guard.get_mut(&id) {
            session.status = SessionStatus::Closed;
        }
    }

    pub async fn active_count(&self) -> usize {
        let now = Utc::now();
        self.sessions
            .read()
            .await
            .values()
            .filter(|session| session.status == SessionStatus::Active && !session.expired(now))
            .count()
    }

    /// Mark expired sessions and drop terminated ones from the map.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut guard = self.sessions.write().await;
        let mut expired = 0;
        for session in guard.values_mut() {
            if session.status == SessionStatus::Active && session.expired(now) {
                session.status = SessionStatus::Expired;
                expired += 1;
            }
        }
        guard.retain(|_, session| session.status == SessionStatus::Active);
        if expired > 0 {
            debug!(expired, "Closed expired realtime sessions");
        }
        expired
    }

    pub fn spawn_sweep(self: &Arc<Self>, interval_secs: u64) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_secs.max(5)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep().await;
            }
        });
    }
}
