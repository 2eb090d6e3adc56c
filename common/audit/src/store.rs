use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::model::{AuditEvent, AuditFilter, AuditOutcome, AuditResult};

/// Append-only store over the `audit` table.
#[derive(Clone)]
pub struct AuditStore {
    pool: PgPool,
}

impl AuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Best-effort append. A failed write is logged and swallowed so audit
    /// persistence never blocks or fails the caller's request.
    pub async fn record(&self, event: AuditEvent) {
        if let Err(err) = self.insert(&event).await {
            warn!(
                error = %err,
                event_type = %event.event_type,
                action = %event.action,
                "Failed to persist audit event"
            );
        }
    }

    async fn insert(&self, event: &AuditEvent) -> AuditResult<()> {
        sqlx::query(
            "INSERT INTO audit (id, event_type, action, result, user_id, team_id, key_id, \
             method, path, ip, user_agent, occurred_at, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(event.id)
        .bind(&event.event_type)
        .bind(&event.action)
        .bind(event.result.as_str())
        .bind(event.user_id)
        .bind(event.team_id)
        .bind(event.key_id)
        .bind(&event.method)
        .bind(&event.path)
        .bind(&event.ip)
        .bind(&event.user_agent)
        .bind(event.occurred_at)
        .bind(&event.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Filtered, paginated read in reverse chronological order.
    pub async fn query(&self, filter: &AuditFilter) -> AuditResult<Vec<AuditEvent>> {
        let mut builder = sqlx::QueryBuilder::new(
            "SELECT id, event_type, action, result, user_id, team_id, key_id, method, path, \
             ip, user_agent, occurred_at, metadata FROM audit WHERE 1=1",
        );
        if let Some(user_id) = filter.user_id {
            builder.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(team_id) = filter.team_id {
            builder.push(" AND team_id = ").push_bind(team_id);
        }
        if let Some(key_id) = filter.key_id {
            builder.push(" AND key_id = ").push_bind(key_id);
        }
        if let Some(event_type) = &filter.event_type {
            builder.push(" AND event_type = ").push_bind(event_type.clone());
        }
        if let Some(since) = filter.since {
            builder.push(" AND occurred_at >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            builder.push(" AND occurred_at < ").push_bind(until);
        }
        builder
            .push(" ORDER BY occurred_at DESC LIMIT ")
            .push_bind(filter.limit.clamp(1, 1000))
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(row_to_event).collect())
    }
}

fn row_to_event(row: sqlx::postgres::PgRow) -> AuditEvent {
    let result: String = row.get("result");
    AuditEvent {
        id: row.get::<Uuid, _>("id"),
        event_type: row.get("event_type"),
        action: row.get("action"),
        result: if result == "success" {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        },
        user_id: row.get("user_id"),
        team_id: row.get("team_id"),
        key_id: row.get("key_id"),
        method: row.get("method"),
        path: row.get("path"),
        ip: row.get("ip"),
        user_agent: row.get("user_agent"),
        occurred_at: row.get("occurred_at"),
        metadata: row.get("metadata"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_event_carries_subjects() {
        let user = Uuid::new_v4();
        let key = Uuid::new_v4();
        let event = AuditEvent::new("auth", "api_key.validate", AuditOutcome::Failure)
            .with_user(user)
            .with_key(key)
            .with_request("POST", "/v1/chat/completions", Some("10.0.0.9".into()), None);
        assert_eq!(event.user_id, Some(user));
        assert_eq!(event.key_id, Some(key));
        assert_eq!(event.result, AuditOutcome::Failure);
        assert_eq!(event.path.as_deref(), Some("/v1/chat/completions"));
    }
}
