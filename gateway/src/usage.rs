use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::budget::{BudgetCache, BudgetScope};

pub const PROCESSING_QUEUE: &str = "usage_processing_queue";
pub const RETRY_QUEUE: &str = "usage_retry_queue";
pub const DEAD_LETTER_QUEUE: &str = "usage_dead_letter_queue";
const LOCK_KEY: &str = "usage_processor_lock";

/// The durable unit of accounting for one upstream call. Immutable once
/// committed; `request_id` deduplicates replays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub provider: String,
    pub path: String,
    pub status: u16,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_cost: f64,
    pub latency_ms: u64,
    pub key_id: Uuid,
    pub user_id: Uuid,
    pub team_id: Option<Uuid>,
    /// For team-owned keys, the caller behind the key.
    pub actual_user_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedUsage {
    pub record: UsageRecord,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(value: redis::RedisError) -> Self {
        Self::Backend(value.to_string())
    }
}

/// Queue capability behind the usage pipeline; Redis in production, an
/// in-process double in tests.
#[async_trait]
pub trait UsageQueue: Send + Sync {
    async fn push(&self, queue: &str, raw: String) -> Result<(), QueueError>;
    async fn pop_batch(&self, queue: &str, max: usize) -> Result<Vec<String>, QueueError>;
    async fn queue_len(&self, queue: &str) -> Result<usize, QueueError>;
    /// Bound queue growth during downstream outages.
    async fn set_queue_ttl(&self, queue: &str, ttl_secs: i64) -> Result<(), QueueError>;
    /// Distributed worker election; true means this process owns the round.
    async fn acquire_lock(&self, ttl: Duration) -> Result<bool, QueueError>;
    async fn release_lock(&self) -> Result<(), QueueError>;
    async fn publish(&self, channel: &str, payload: String) -> Result<(), QueueError>;
}

// ---------------- Redis Implementation ----------------

#[derive(Clone)]
pub struct RedisUsageQueue {
    manager: ConnectionManager,
}

impl RedisUsageQueue {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl UsageQueue for RedisUsageQueue {
    async fn push(&self, queue: &str, raw: String) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("LPUSH")
            .arg(queue)
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop_batch(&self, queue: &str, max: usize) -> Result<Vec<String>, QueueError> {
        let mut conn = self.manager.clone();
        let mut out = Vec::with_capacity(max);
        for _ in 0..max {
            let item: Option<String> = redis::cmd("RPOP")
                .arg(queue)
                .query_async(&mut conn)
                .await?;
            match item {
                Some(raw) => out.push(raw),
                None => break,
            }
        }
        Ok(out)
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.manager.clone();
        let len: usize = redis::cmd("LLEN")
            .arg(queue)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn set_queue_ttl(&self, queue: &str, ttl_secs: i64) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("EXPIRE")
            .arg(queue)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn acquire_lock(&self, ttl: Duration) -> Result<bool, QueueError> {
        let mut conn = self.manager.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(LOCK_KEY)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn release_lock(&self) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("DEL")
            .arg(LOCK_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

// ---------------- In-Memory Implementation (Tests / single node) ----------------

#[derive(Default)]
pub struct InMemoryUsageQueue {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    published: Mutex<Vec<(String, String)>>,
    locked: Mutex<bool>,
}

impl InMemoryUsageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<(String, String)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl UsageQueue for InMemoryUsageQueue {
    async fn push(&self, queue: &str, raw: String) -> Result<(), QueueError> {
        let mut guard = self.queues.lock().await;
        guard.entry(queue.to_string()).or_default().push_front(raw);
        Ok(())
    }

    async fn pop_batch(&self, queue: &str, max: usize) -> Result<Vec<String>, QueueError> {
        let mut guard = self.queues.lock().await;
        let Some(list) = guard.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(max);
        for _ in 0..max {
            match list.pop_back() {
                Some(raw) => out.push(raw),
                None => break,
            }
        }
        Ok(out)
    }

    async fn queue_len(&self, queue: &str) -> Result<usize, QueueError> {
        let guard = self.queues.lock().await;
        Ok(guard.get(queue).map(|q| q.len()).unwrap_or(0))
    }

    async fn set_queue_ttl(&self, _queue: &str, _ttl_secs: i64) -> Result<(), QueueError> {
        Ok(())
    }

    async fn acquire_lock(&self, _ttl: Duration) -> Result<bool, QueueError> {
        let mut guard = self.locked.lock().await;
        if *guard {
            return Ok(false);
        }
        *guard = true;
        Ok(true)
    }

    async fn release_lock(&self) -> Result<(), QueueError> {
        *self.locked.lock().await = false;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), QueueError> {
        self.published
            .lock()
            .await
            .push((channel.to_string(), payload));
        Ok(())
    }
}

// ---------------- Emitter ----------------

/// Fire-and-forget enqueue. Failures are logged, never surfaced to the
/// caller's response.
#[derive(Clone)]
pub struct UsageEmitter {
    queue: Arc<dyn UsageQueue>,
    queue_ttl_secs: i64,
}

impl UsageEmitter {
    pub fn new(queue: Arc<dyn UsageQueue>, queue_ttl_secs: i64) -> Self {
        Self {
            queue,
            queue_ttl_secs,
        }
    }

    pub fn emit(&self, record: UsageRecord) {
        let queue = Arc::clone(&self.queue);
        let ttl = self.queue_ttl_secs;
        tokio::spawn(async move {
            let queued = QueuedUsage {
                record,
                attempts: 0,
                last_error: None,
            };
            let raw = match serde_json::to_string(&queued) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(error = %err, "Failed to serialize usage record");
                    return;
                }
            };
            if let Err(err) = queue.push(PROCESSING_QUEUE, raw).await {
                warn!(error = %err, "Failed to enqueue usage record");
                return;
            }
            if let Err(err) = queue.set_queue_ttl(PROCESSING_QUEUE, ttl).await {
                debug!(error = %err, "Failed to refresh usage queue TTL");
            }
        });
    }
}

// ---------------- Batch grouping ----------------

/// Per-scope cost sums for one accepted batch.
#[derive(Debug, Default, PartialEq)]
pub struct BatchIncrements {
    pub per_key: HashMap<Uuid, f64>,
    pub per_user: HashMap<Uuid, f64>,
    pub per_team: HashMap<Uuid, f64>,
    pub global: f64,
}

/// Collate spend increments per target entity. Only records accepted by
/// the insert (non-duplicates) may be fed in, keeping reconciliation
/// idempotent.
pub fn collate_increments<'a, I>(records: I) -> BatchIncrements
where
    I: IntoIterator<Item = &'a UsageRecord>,
{
    let mut out = BatchIncrements::default();
    for record in records {
        let cost = record.total_cost;
        *out.per_key.entry(record.key_id).or_default() += cost;
        *out.per_user.entry(record.user_id).or_default() += cost;
        if let Some(team_id) = record.team_id {
            *out.per_team.entry(team_id).or_default() += cost;
        }
        out.global += cost;
    }
    out
}

/// Where a failed record goes next: the retry list until `max_retries`,
/// then dead-letter.
pub fn route_failed(mut queued: QueuedUsage, error: &str, max_retries: u32) -> (&'static str, QueuedUsage) {
    queued.attempts += 1;
    queued.last_error = Some(error.to_string());
    if queued.attempts > max_retries {
        (DEAD_LETTER_QUEUE, queued)
    } else {
        (RETRY_QUEUE, queued)
    }
}

// ---------------- Batch worker ----------------

pub struct UsageWorker {
    queue: Arc<dyn UsageQueue>,
    pool: PgPool,
    budget_cache: BudgetCache,
    batch_size: usize,
    max_retries: u32,
    lock_ttl: Duration,
    events_channel: String,
}

impl UsageWorker {
    pub fn new(
        queue: Arc<dyn UsageQueue>,
        pool: PgPool,
        budget_cache: BudgetCache,
        batch_size: usize,
        max_retries: u32,
        lock_ttl: Duration,
        events_channel: String,
    ) -> Self {
        Self {
            queue,
            pool,
            budget_cache,
            batch_size,
            max_retries,
            lock_ttl,
            events_channel,
        }
    }

    /// One tick: elect, drain, commit, fan out. Lock acquisition failure is
    /// not an error; another instance owns the round.
    pub async fn run_once(&self) -> Result<usize, QueueError> {
        if !self.queue.acquire_lock(self.lock_ttl).await? {
            return Ok(0);
        }
        let result = self.drain_and_commit().await;
        if let Err(err) = self.queue.release_lock().await {
            warn!(error = %err, "Failed to release usage processor lock");
        }
        result
    }

    async fn drain_and_commit(&self) -> Result<usize, QueueError> {
        let mut raw_batch = self.queue.pop_batch(PROCESSING_QUEUE, self.batch_size).await?;
        if raw_batch.len() < self.batch_size {
            let remaining = self.batch_size - raw_batch.len();
            raw_batch.extend(self.queue.pop_batch(RETRY_QUEUE, remaining).await?);
        }
        if raw_batch.is_empty() {
            return Ok(0);
        }

        let mut batch: Vec<QueuedUsage> = Vec::with_capacity(raw_batch.len());
        for raw in raw_batch {
            match serde_json::from_str::<QueuedUsage>(&raw) {
                Ok(queued) => batch.push(queued),
                Err(err) => {
                    warn!(error = %err, "Unparseable usage record; dead-lettering");
                    self.queue.push(DEAD_LETTER_QUEUE, raw).await?;
                }
            }
        }
        if batch.is_empty() {
            return Ok(0);
        }

        match self.commit_batch(&batch).await {
            Ok(accepted) => {
                let count = accepted.len();
                self.fan_out(&accepted).await;
                debug!(count, "Usage batch committed");
                Ok(count)
            }
            Err(err) => {
                warn!(error = %err, size = batch.len(), "Usage batch commit failed; re-queueing");
                let message = err.to_string();
                for queued in batch {
                    let (target, queued) = route_failed(queued, &message, self.max_retries);
                    if target == DEAD_LETTER_QUEUE {
                        info!(request_id = %queued.record.request_id, "Usage record dead-lettered");
                    }
                    match serde_json::to_string(&queued) {
                        Ok(raw) => self.queue.push(target, raw).await?,
                        Err(err) => warn!(error = %err, "Failed to re-serialize usage record"),
                    }
                }
                Ok(0)
            }
        }
    }

    /// One transaction: bulk insert with duplicate rejection, then one CASE
    /// update per spend-bearing table. Returns the records actually
    /// accepted by the insert.
    async fn commit_batch(&self, batch: &[QueuedUsage]) -> Result<Vec<UsageRecord>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let mut builder = sqlx::QueryBuilder::new(
            "INSERT INTO usage_logs (request_id, timestamp, model, provider, path, status, \
             input_tokens, output_tokens, total_cost, latency_ms, key_id, user_id, team_id, \
             actual_user_id) ",
        );
        builder.push_values(batch, |mut row, queued| {
            let record = &queued.record;
            row.push_bind(record.request_id)
                .push_bind(record.timestamp)
                .push_bind(&record.model)
                .push_bind(&record.provider)
                .push_bind(&record.path)
                .push_bind(record.status as i32)
                .push_bind(record.input_tokens as i64)
                .push_bind(record.output_tokens as i64)
                .push_bind(record.total_cost)
                .push_bind(record.latency_ms as i64)
                .push_bind(record.key_id)
                .push_bind(record.user_id)
                .push_bind(record.team_id)
                .push_bind(record.actual_user_id);
        });
        builder.push(" ON CONFLICT (request_id) DO NOTHING RETURNING request_id");

        let accepted_ids: Vec<Uuid> = builder
            .build()
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|row| row.get::<Uuid, _>("request_id"))
            .collect();

        let accepted: Vec<UsageRecord> = batch
            .iter()
            .filter(|queued| accepted_ids.contains(&queued.record.request_id))
            .map(|queued| queued.record.clone())
            .collect();
        if accepted.is_empty() {
            tx.commit().await?;
            return Ok(accepted);
        }

        let increments = collate_increments(accepted.iter());
        apply_case_update(&mut tx, "keys", "current_spend", &increments.per_key).await?;
        apply_case_update(&mut tx, "teams", "current_spend", &increments.per_team).await?;
        apply_budget_case_update(&mut tx, &increments).await?;

        tx.commit().await?;
        Ok(accepted)
    }

    /// Post-commit: refresh the hot budget view from authoritative rows and
    /// publish per-record events for listeners.
    async fn fan_out(&self, accepted: &[UsageRecord]) {
        let increments = collate_increments(accepted.iter());

        for key_id in increments.per_key.keys() {
            if let Some((amount, spent)) = self.authoritative_spend("keys", "max_budget", *key_id).await {
                self.budget_cache
                    .refresh(&BudgetScope::Key(*key_id), amount, spent)
                    .await;
            }
        }
        for team_id in increments.per_team.keys() {
            if let Some((amount, spent)) = self.authoritative_spend("teams", "max_budget", *team_id).await {
                self.budget_cache
                    .refresh(&BudgetScope::Team(*team_id), amount, spent)
                    .await;
            }
        }

        for record in accepted {
            match serde_json::to_string(record) {
                Ok(payload) => {
                    if let Err(err) = self.queue.publish(&self.events_channel, payload).await {
                        warn!(error = %err, "Failed to publish usage event");
                    }
                }
                Err(err) => warn!(error = %err, "Failed to serialize usage event"),
            }
        }
    }

    async fn authoritative_spend(
        &self,
        table: &str,
        amount_column: &str,
        id: Uuid,
    ) -> Option<(Option<f64>, f64)> {
        let query = format!(
            "SELECT {amount_column} AS amount, current_spend FROM {table} WHERE id = $1"
        );
        match sqlx::query(&query).bind(id).fetch_optional(&self.pool).await {
            Ok(Some(row)) => Some((row.get("amount"), row.get("current_spend"))),
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, table, %id, "Failed to read authoritative spend");
                None
            }
        }
    }

    pub fn spawn(self: Arc<Self>, interval_secs: u64) {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.run_once().await {
                    warn!(error = %err, "Usage worker tick failed");
                }
            }
        });
    }
}

/// `UPDATE {table} SET {column} = {column} + CASE id WHEN ... END WHERE id IN (...)`.
async fn apply_case_update(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: &str,
    column: &str,
    increments: &HashMap<Uuid, f64>,
) -> Result<(), sqlx::Error> {
    if increments.is_empty() {
        return Ok(());
    }
    let mut builder = sqlx::QueryBuilder::new(format!(
        "UPDATE {table} SET {column} = {column} + CASE id "
    ));
    for (id, cost) in increments {
        builder
            .push("WHEN ")
            .push_bind(*id)
            .push(" THEN ")
            .push_bind(*cost)
            .push(" ");
    }
    builder.push("ELSE 0 END WHERE id IN (");
    let mut separated = builder.separated(", ");
    for id in increments.keys() {
        separated.push_bind(*id);
    }
    builder.push(")");
    builder.build().execute(&mut **tx).await?;
    Ok(())
}

/// Budgets key on (scope, scope_id) rather than entity id.
async fn apply_budget_case_update(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    increments: &BatchIncrements,
) -> Result<(), sqlx::Error> {
    let mut pairs: Vec<(&'static str, Option<Uuid>, f64)> = Vec::new();
    for (id, cost) in &increments.per_key {
        pairs.push(("key", Some(*id), *cost));
    }
    for (id, cost) in &increments.per_user {
        pairs.push(("user", Some(*id), *cost));
    }
    for (id, cost) in &increments.per_team {
        pairs.push(("team", Some(*id), *cost));
    }
    if increments.global > 0.0 {
        pairs.push(("global", None, increments.global));
    }
    if pairs.is_empty() {
        return Ok(());
    }

    let mut builder = sqlx::QueryBuilder::new("UPDATE budgets SET spent = spent + CASE ");
    for (scope, scope_id, cost) in &pairs {
        builder.push("WHEN scope = ").push_bind(*scope);
        match scope_id {
            Some(id) => {
                builder.push(" AND scope_id = ").push_bind(*id);
            }
            None => {
                builder.push(" AND scope_id IS NULL");
            }
        }
        builder.push(" THEN ").push_bind(*cost).push(" ");
    }
    builder.push("ELSE 0 END WHERE active = TRUE AND (");
    for (index, (scope, scope_id, _)) in pairs.iter().enumerate() {
        if index > 0 {
            builder.push(" OR ");
        }
        builder.push("(scope = ").push_bind(*scope);
        match scope_id {
            Some(id) => {
                builder.push(" AND scope_id = ").push_bind(*id);
            }
            None => {
                builder.push(" AND scope_id IS NULL");
            }
        }
        builder.push(")");
    }
    builder.push(")");
    builder.build().execute(&mut **tx).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cost: f64, key: Uuid, user: Uuid, team: Option<Uuid>) -> UsageRecord {
        UsageRecord {
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            model: "gpt-4".into(),
            provider: "openai".into(),
            path: "/v1/chat/completions".into(),
            status: 200,
            input_tokens: 100,
            output_tokens: 50,
            total_cost: cost,
            latency_ms: 420,
            key_id: key,
            user_id: user,
            team_id: team,
            actual_user_id: None,
        }
    }

    #[test]
    fn collation_groups_by_entity() {
        let key_a = Uuid::new_v4();
        let key_b = Uuid::new_v4();
        let user = Uuid::new_v4();
        let team = Uuid::new_v4();
        let records = vec![
            record(1.0, key_a, user, Some(team)),
            record(2.0, key_a, user, None),
            record(0.5, key_b, user, Some(team)),
        ];
        let increments = collate_increments(records.iter());
        assert_eq!(increments.per_key[&key_a], 3.0);
        assert_eq!(increments.per_key[&key_b], 0.5);
        assert_eq!(increments.per_user[&user], 3.5);
        assert_eq!(increments.per_team[&team], 1.5);
        assert_eq!(increments.global, 3.5);
    }

    #[test]
    fn failed_records_retry_then_dead_letter() {
        let queued = QueuedUsage {
            record: record(1.0, Uuid::new_v4(), Uuid::new_v4(), None),
            attempts: 0,
            last_error: None,
        };
        let (target, queued) = route_failed(queued, "db down", 3);
        assert_eq!(target, RETRY_QUEUE);
        assert_eq!(queued.attempts, 1);
        assert_eq!(queued.last_error.as_deref(), Some("db down"));

        let mut exhausted = queued;
        exhausted.attempts = 3;
        let (target, exhausted) = route_failed(exhausted, "db still down", 3);
        assert_eq!(target, DEAD_LETTER_QUEUE);
        assert_eq!(exhausted.attempts, 4);
    }

    #[tokio::test]
    async fn emitter_enqueues_without_blocking() {
        let queue = Arc::new(InMemoryUsageQueue::new());
        let emitter = UsageEmitter::new(queue.clone(), 3600);
        emitter.emit(record(0.25, Uuid::new_v4(), Uuid::new_v4(), None));

        // The emit is fire-and-forget; give the spawned task a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.queue_len(PROCESSING_QUEUE).await.unwrap(), 1);

        let raw = queue.pop_batch(PROCESSING_QUEUE, 10).await.unwrap();
        let queued: QueuedUsage = serde_json::from_str(&raw[0]).unwrap();
        assert_eq!(queued.attempts, 0);
        assert!((queued.record.total_cost - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn queue_is_fifo_per_list() {
        let queue = InMemoryUsageQueue::new();
        queue.push(PROCESSING_QUEUE, "a".into()).await.unwrap();
        queue.push(PROCESSING_QUEUE, "b".into()).await.unwrap();
        queue.push(PROCESSING_QUEUE, "c".into()).await.unwrap();
        let batch = queue.pop_batch(PROCESSING_QUEUE, 2).await.unwrap();
        assert_eq!(batch, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let queue = InMemoryUsageQueue::new();
        assert!(queue.acquire_lock(Duration::from_secs(120)).await.unwrap());
        assert!(!queue.acquire_lock(Duration::from_secs(120)).await.unwrap());
        queue.release_lock().await.unwrap();
        assert!(queue.acquire_lock(Duration::from_secs(120)).await.unwrap());
    }
}
