use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Api,
    Virtual,
    System,
    Master,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Api => "api",
            KeyType::Virtual => "virtual",
            KeyType::System => "system",
            KeyType::Master => "master",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "virtual" => KeyType::Virtual,
            "system" => KeyType::System,
            "master" => KeyType::Master,
            _ => KeyType::Api,
        }
    }
}

/// A bearer credential row. The secret itself never exists in storage,
/// only its SHA-256 digest.
#[derive(Debug, Clone, Serialize)]
pub struct KeyRecord {
    pub id: Uuid,
    pub key_hash: String,
    pub key_type: KeyType,
    pub user_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_budget: Option<f64>,
    pub current_spend: f64,
    pub allowed_models: Vec<String>,
    pub blocked_models: Vec<String>,
    pub tpm_limit: Option<i64>,
    pub rpm_limit: Option<i64>,
    pub max_parallel: Option<i32>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
    pub scopes: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyRejection {
    #[error("key is inactive")]
    Inactive,
    #[error("key is expired")]
    Expired,
    #[error("key budget exceeded")]
    BudgetExceeded,
    #[error("model not permitted for this key")]
    ModelForbidden,
}

impl KeyRecord {
    /// Synthetic record for the configured master secret; it has no DB row.
    pub fn master() -> Self {
        Self {
            id: Uuid::nil(),
            key_hash: String::new(),
            key_type: KeyType::Master,
            user_id: None,
            team_id: None,
            active: true,
            expires_at: None,
            max_budget: None,
            current_spend: 0.0,
            allowed_models: Vec::new(),
            blocked_models: Vec::new(),
            tpm_limit: None,
            rpm_limit: None,
            max_parallel: None,
            last_used_at: None,
            usage_count: 0,
            scopes: vec!["*".to_string()],
        }
    }

    /// A key is valid iff it is active, unexpired, and under its budget
    /// ceiling (when one is set).
    pub fn check_valid(&self, now: DateTime<Utc>) -> Result<(), KeyRejection> {
        if !self.active {
            return Err(KeyRejection::Inactive);
        }
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return Err(KeyRejection::Expired);
            }
        }
        if let Some(max_budget) = self.max_budget {
            if self.current_spend >= max_budget {
                return Err(KeyRejection::BudgetExceeded);
            }
        }
        Ok(())
    }

    /// Model restriction check: a blocklist entry always wins; an empty
    /// allowlist permits everything.
    pub fn model_permitted(&self, model: &str) -> bool {
        if self.blocked_models.iter().any(|m| m == model) {
            return false;
        }
        if self.allowed_models.is_empty() {
            return true;
        }
        self.allowed_models.iter().any(|m| m == model || m == "*")
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "*")
    }
}

/// SHA-256 hex digest of a raw key secret.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a fresh secret with the configured prefix. Returned to the
/// caller exactly once, at creation.
pub fn generate_secret(prefix: &str) -> String {
    format!(
        "{}{}{}",
        prefix,
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Data access for the `keys` table.
#[derive(Clone)]
pub struct KeyStore {
    pool: PgPool,
}

impl KeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Unique lookup by secret digest. Inactive rows are not filtered here;
    /// the caller applies `check_valid` so rejections can be distinguished.
    pub async fn find_by_hash(&self, key_hash: &str) -> Result<Option<KeyRecord>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, key_hash, key_type, user_id, team_id, active, expires_at, max_budget, \
             current_spend, allowed_models, blocked_models, tpm_limit, rpm_limit, max_parallel, \
             last_used_at, usage_count, scopes \
             FROM keys WHERE key_hash = $1",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_key))
    }

    /// Touch last-use accounting. The SQL expression is the authority for
    /// `usage_count`; nothing in memory writes this value back.
    pub async fn record_use(&self, key_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE keys SET last_used_at = NOW(), usage_count = usage_count + 1 WHERE id = $1",
        )
        .bind(key_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert(&self, record: &KeyRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO keys (id, key_hash, key_type, user_id, team_id, active, expires_at, \
             max_budget, current_spend, allowed_models, blocked_models, tpm_limit, rpm_limit, \
             max_parallel, usage_count, scopes) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(record.id)
        .bind(&record.key_hash)
        .bind(record.key_type.as_str())
        .bind(record.user_id)
        .bind(record.team_id)
        .bind(record.active)
        .bind(record.expires_at)
        .bind(record.max_budget)
        .bind(record.current_spend)
        .bind(&record.allowed_models)
        .bind(&record.blocked_models)
        .bind(record.tpm_limit)
        .bind(record.rpm_limit)
        .bind(record.max_parallel)
        .bind(record.usage_count)
        .bind(&record.scopes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke(&self, key_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE keys SET active = FALSE WHERE id = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_for_scope(
        &self,
        user_id: Option<Uuid>,
        team_id: Option<Uuid>,
    ) -> Result<Vec<KeyRecord>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, key_hash, key_type, user_id, team_id, active, expires_at, max_budget, \
             current_spend, allowed_models, blocked_models, tpm_limit, rpm_limit, max_parallel, \
             last_used_at, usage_count, scopes \
             FROM keys \
             WHERE ($1::uuid IS NULL OR user_id = $1) AND ($2::uuid IS NULL OR team_id = $2) \
             ORDER BY id",
        )
        .bind(user_id)
        .bind(team_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(row_to_key).collect())
    }
}

fn row_to_key(row: sqlx::postgres::PgRow) -> KeyRecord {
    let key_type: String = row.get("key_type");
    KeyRecord {
        id: row.get("id"),
        key_hash: row.get("key_hash"),
        key_type: KeyType::parse(&key_type),
        user_id: row.get("user_id"),
        team_id: row.get("team_id"),
        active: row.get("active"),
        expires_at: row.get("expires_at"),
        max_budget: row.get("max_budget"),
        current_spend: row.get("current_spend"),
        allowed_models: row.get("allowed_models"),
        blocked_models: row.get("blocked_models"),
        tpm_limit: row.get("tpm_limit"),
        rpm_limit: row.get("rpm_limit"),
        max_parallel: row.get("max_parallel"),
        last_used_at: row.get("last_used_at"),
        usage_count: row.get("usage_count"),
        scopes: row.get("scopes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base_key() -> KeyRecord {
        KeyRecord {
            id: Uuid::new_v4(),
            key_hash: hash_api_key("sk-test"),
            key_type: KeyType::Api,
            user_id: Some(Uuid::new_v4()),
            team_id: None,
            active: true,
            expires_at: None,
            max_budget: None,
            current_spend: 0.0,
            allowed_models: Vec::new(),
            blocked_models: Vec::new(),
            tpm_limit: None,
            rpm_limit: None,
            max_parallel: None,
            last_used_at: None,
            usage_count: 0,
            scopes: Vec::new(),
        }
    }

    #[test]
    fn active_unexpired_key_is_valid() {
        assert_eq!(base_key().check_valid(Utc::now()), Ok(()));
    }

    #[test]
    fn expired_key_is_rejected_even_when_active() {
        let mut key = base_key();
        key.expires_at = Some(Utc::now() - Duration::hours(1));
        assert_eq!(key.check_valid(Utc::now()), Err(KeyRejection::Expired));
    }

    #[test]
    fn inactive_key_is_rejected() {
        let mut key = base_key();
        key.active = false;
        assert_eq!(key.check_valid(Utc::now()), Err(KeyRejection::Inactive));
    }

    #[test]
    fn spent_budget_rejects_key() {
        let mut key = base_key();
        key.max_budget = Some(10.0);
        key.current_spend = 10.0;
        assert_eq!(key.check_valid(Utc::now()), Err(KeyRejection::BudgetExceeded));
        key.current_spend = 9.99;
        assert_eq!(key.check_valid(Utc::now()), Ok(()));
    }

    #[test]
    fn blocklist_beats_allowlist() {
        let mut key = base_key();
        key.allowed_models = vec!["gpt-4".into()];
        key.blocked_models = vec!["gpt-4".into()];
        assert!(!key.model_permitted("gpt-4"));
    }

    #[test]
    fn empty_allowlist_permits_all() {
        let key = base_key();
        assert!(key.model_permitted("claude-3-sonnet"));
    }

    #[test]
    fn allowlist_restricts() {
        let mut key = base_key();
        key.allowed_models = vec!["gpt-4".into()];
        assert!(key.model_permitted("gpt-4"));
        assert!(!key.model_permitted("claude-3-sonnet"));
    }

    #[test]
    fn master_key_has_wildcard_scope() {
        let key = KeyRecord::master();
        assert_eq!(key.key_type, KeyType::Master);
        assert!(key.has_scope("keys:write"));
        assert!(key.check_valid(Utc::now()).is_ok());
    }

    #[test]
    fn digest_is_stable_hex() {
        let digest = hash_api_key("sk-abc");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, hash_api_key("sk-abc"));
        assert_ne!(digest, hash_api_key("sk-abd"));
    }

    #[test]
    fn generated_secret_carries_prefix() {
        let secret = generate_secret("sk-");
        assert!(secret.starts_with("sk-"));
        assert!(secret.len() > 40);
    }
}
