use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

/// The subject of a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetScope {
    User(Uuid),
    Team(Uuid),
    Key(Uuid),
    Global,
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetScope::User(id) => write!(f, "user:{id}"),
            BudgetScope::Team(id) => write!(f, "team:{id}"),
            BudgetScope::Key(id) => write!(f, "key:{id}"),
            BudgetScope::Global => write!(f, "global"),
        }
    }
}

impl BudgetScope {
    pub fn cache_key(&self) -> String {
        format!("budget:{self}")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetSnapshot {
    /// None means no limit is known for the scope.
    pub amount: Option<f64>,
    pub spent: f64,
}

impl BudgetSnapshot {
    pub fn remaining(&self) -> Option<f64> {
        self.amount.map(|amount| amount - self.spent)
    }

    /// Would spending `estimated_cost` overdraw this budget?
    pub fn would_exceed(&self, estimated_cost: f64) -> bool {
        match self.remaining() {
            Some(remaining) => remaining - estimated_cost < 0.0,
            None => false,
        }
    }

    pub fn exceeded(&self) -> bool {
        matches!(self.remaining(), Some(remaining) if remaining <= 0.0)
    }
}

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("budget backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for BudgetError {
    fn from(value: redis::RedisError) -> Self {
        Self::Backend(value.to_string())
    }
}

/// Narrow capability so the Redis and in-process engines are
/// interchangeable; callers never branch on backend type.
#[async_trait]
pub trait BudgetBackend: Send + Sync {
    async fn snapshot(&self, scope: &BudgetScope) -> Result<BudgetSnapshot, BudgetError>;
    /// Atomic spend increment, at-least-once by contract.
    async fn increment(&self, scope: &BudgetScope, actual_cost: f64) -> Result<(), BudgetError>;
    /// Recompute from an authoritative row (budget create/reset/worker commit).
    async fn refresh(
        &self,
        scope: &BudgetScope,
        amount: Option<f64>,
        spent: f64,
    ) -> Result<(), BudgetError>;
}

// ---------------- Redis Implementation ----------------

/// Budget state lives in a Redis hash per scope (`budget:{scope}`), with
/// `HINCRBYFLOAT` providing the atomic spend add.
#[derive(Clone)]
pub struct RedisBudgetBackend {
    manager: ConnectionManager,
    ttl_secs: i64,
}

impl RedisBudgetBackend {
    pub fn new(manager: ConnectionManager, ttl_secs: i64) -> Self {
        Self { manager, ttl_secs }
    }
}

#[async_trait]
impl BudgetBackend for RedisBudgetBackend {
    async fn snapshot(&self, scope: &BudgetScope) -> Result<BudgetSnapshot, BudgetError> {
        let mut conn = self.manager.clone();
        let (amount, spent): (Option<f64>, Option<f64>) = redis::cmd("HMGET")
            .arg(scope.cache_key())
            .arg("amount")
            .arg("spent")
            .query_async(&mut conn)
            .await?;
        Ok(BudgetSnapshot {
            amount,
            spent: spent.unwrap_or(0.0),
        })
    }

    async fn increment(&self, scope: &BudgetScope, actual_cost: f64) -> Result<(), BudgetError> {
        let mut conn = self.manager.clone();
        let key = scope.cache_key();
        let _: f64 = redis::cmd("HINCRBYFLOAT")
            .arg(&key)
            .arg("spent")
            .arg(actual_cost)
            .query_async(&mut conn)
            .await?;
        let _: () = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn refresh(
        &self,
        scope: &BudgetScope,
        amount: Option<f64>,
        spent: f64,
    ) -> Result<(), BudgetError> {
        let mut conn = self.manager.clone();
        let key = scope.cache_key();
        match amount {
            Some(amount) => {
                let _: () = redis::cmd("HSET")
                    .arg(&key)
                    .arg("amount")
                    .arg(amount)
                    .arg("spent")
                    .arg(spent)
                    .query_async(&mut conn)
                    .await?;
            }
            None => {
                let _: () = redis::cmd("HSET")
                    .arg(&key)
                    .arg("spent")
                    .arg(spent)
                    .query_async(&mut conn)
                    .await?;
                let _: () = redis::cmd("HDEL")
                    .arg(&key)
                    .arg("amount")
                    .query_async(&mut conn)
                    .await?;
            }
        }
        let _: () = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

// ---------------- In-Memory Implementation (Tests / single node) ----------------

#[derive(Default)]
pub struct InMemoryBudgetBackend {
    inner: Mutex<HashMap<String, BudgetSnapshot>>,
}

impl InMemoryBudgetBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BudgetBackend for InMemoryBudgetBackend {
    async fn snapshot(&self, scope: &BudgetScope) -> Result<BudgetSnapshot, BudgetError> {
        let guard = self.inner.lock().await;
        Ok(guard.get(&scope.cache_key()).copied().unwrap_or_default())
    }

    async fn increment(&self, scope: &BudgetScope, actual_cost: f64) -> Result<(), BudgetError> {
        let mut guard = self.inner.lock().await;
        guard.entry(scope.cache_key()).or_default().spent += actual_cost;
        Ok(())
    }

    async fn refresh(
        &self,
        scope: &BudgetScope,
        amount: Option<f64>,
        spent: f64,
    ) -> Result<(), BudgetError> {
        let mut guard = self.inner.lock().await;
        guard.insert(scope.cache_key(), BudgetSnapshot { amount, spent });
        Ok(())
    }
}

// ---------------- Enforcement wrapper ----------------

/// Sub-millisecond "would this call exceed budget?" answers.
///
/// Enforcement is fail-open: a backend error or timeout allows the call and
/// logs, because budget accounting is eventually consistent by design.
#[derive(Clone)]
pub struct BudgetCache {
    backend: Arc<dyn BudgetBackend>,
    check_timeout: Duration,
}

impl BudgetCache {
    pub fn new(backend: Arc<dyn BudgetBackend>, check_timeout: Duration) -> Self {
        Self {
            backend,
            check_timeout,
        }
    }

    pub fn backend(&self) -> &Arc<dyn BudgetBackend> {
        &self.backend
    }

    /// `allow = (remaining - estimated_cost) >= 0`, or allow on error.
    pub async fn check(&self, scope: &BudgetScope, estimated_cost: f64) -> bool {
        match timeout(self.check_timeout, self.backend.snapshot(scope)).await {
            Ok(Ok(snapshot)) => !snapshot.would_exceed(estimated_cost),
            Ok(Err(err)) => {
                warn!(%scope, error = %err, "Budget check failed; allowing");
                true
            }
            Err(_) => {
                warn!(%scope, "Budget check timed out; allowing");
                true
            }
        }
    }

    /// Check every scope that applies to one request; the first overdrawn
    /// scope denies.
    pub async fn check_all(&self, scopes: &[BudgetScope], estimated_cost: f64) -> Option<BudgetScope> {
        for scope in scopes {
            if !self.check(scope, estimated_cost).await {
                return Some(*scope);
            }
        }
        None
    }

    pub async fn increment(&self, scope: &BudgetScope, actual_cost: f64) {
        if let Err(err) = self.backend.increment(scope, actual_cost).await {
            warn!(%scope, error = %err, "Budget increment failed");
        }
    }

    pub async fn refresh(&self, scope: &BudgetScope, amount: Option<f64>, spent: f64) {
        if let Err(err) = self.backend.refresh(scope, amount, spent).await {
            warn!(%scope, error = %err, "Budget refresh failed");
        }
    }
}

// ---------------- Authoritative rows ----------------

/// One row of the `budgets` table. A budget is exceeded when it is active
/// and `spent >= amount`.
#[derive(Debug, Clone)]
pub struct BudgetRow {
    pub id: Uuid,
    pub scope: BudgetScope,
    pub amount: f64,
    pub spent: f64,
    pub ends_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl BudgetRow {
    pub fn is_exceeded(&self) -> bool {
        self.active && self.spent >= self.amount
    }
}

#[derive(Clone)]
pub struct BudgetStore {
    pool: PgPool,
}

impl BudgetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn load_active(&self) -> Result<Vec<BudgetRow>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, scope, scope_id, amount, spent, ends_at, active FROM budgets \
             WHERE active = TRUE",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(row_to_budget).collect())
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<BudgetRow>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, scope, scope_id, amount, spent, ends_at, active FROM budgets \
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(row_to_budget))
    }
}

fn row_to_budget(row: sqlx::postgres::PgRow) -> Option<BudgetRow> {
    let scope_kind: String = row.get("scope");
    let scope_id: Option<Uuid> = row.get("scope_id");
    let scope = match (scope_kind.as_str(), scope_id) {
        ("user", Some(id)) => BudgetScope::User(id),
        ("team", Some(id)) => BudgetScope::Team(id),
        ("key", Some(id)) => BudgetScope::Key(id),
        ("global", _) => BudgetScope::Global,
        _ => return None,
    };
    Some(BudgetRow {
        id: row.get("id"),
        scope,
        amount: row.get("amount"),
        spent: row.get("spent"),
        ends_at: row.get("ends_at"),
        active: row.get("active"),
    })
}
