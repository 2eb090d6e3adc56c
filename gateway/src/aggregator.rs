use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics::GatewayMetrics;
use crate::registry::ModelRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Minute,
    Hour,
    Day,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }

    fn span(&self) -> chrono::Duration {
        match self {
            Granularity::Minute => chrono::Duration::minutes(1),
            Granularity::Hour => chrono::Duration::hours(1),
            Granularity::Day => chrono::Duration::days(1),
        }
    }
}

/// The just-closed bucket for a granularity: `[start, end)` ending at the
/// truncation of `now`.
pub fn closed_bucket(granularity: Granularity, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let span = granularity.span();
    let end = now.duration_trunc(span).unwrap_or(now);
    (end - span, end)
}

/// Scope dimensions an aggregate row is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AggregateScope {
    System,
    Model(String),
    User(Uuid),
    Team(Uuid),
}

impl AggregateScope {
    fn scope_type(&self) -> &'static str {
        match self {
            AggregateScope::System => "system",
            AggregateScope::Model(_) => "model",
            AggregateScope::User(_) => "user",
            AggregateScope::Team(_) => "team",
        }
    }

    fn scope_id(&self) -> String {
        match self {
            AggregateScope::System => String::new(),
            AggregateScope::Model(name) => name.clone(),
            AggregateScope::User(id) => id.to_string(),
            AggregateScope::Team(id) => id.to_string(),
        }
    }
}

/// One usage row projected for aggregation.
#[derive(Debug, Clone)]
pub struct UsageSample {
    pub model: String,
    pub user_id: Uuid,
    pub team_id: Option<Uuid>,
    pub status: i32,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost: f64,
    pub latency_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    pub request_count: i64,
    pub success_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost: f64,
    latencies: Vec<i64>,
}

impl Aggregate {
    fn absorb(&mut self, sample: &UsageSample) {
        self.request_count += 1;
        if (200..400).contains(&sample.status) {
            self.success_count += 1;
        }
        self.input_tokens += sample.input_tokens;
        self.output_tokens += sample.output_tokens;
        self.total_cost += sample.total_cost;
        self.latencies.push(sample.latency_ms);
    }

    pub fn success_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.request_count as f64
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies.iter().sum::<i64>() as f64 / self.latencies.len() as f64
    }

    /// Percentile by sort on the bucket; nearest-rank.
    pub fn percentile_latency_ms(&self, percentile: f64) -> i64 {
        if self.latencies.is_empty() {
            return 0;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();
        let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }
}

/// Group samples into per-scope aggregates (system, model, user, team).
pub fn aggregate_samples(samples: &[UsageSample]) -> HashMap<AggregateScope, Aggregate> {
    let mut out: HashMap<AggregateScope, Aggregate> = HashMap::new();
    for sample in samples {
        out.entry(AggregateScope::System).or_default().absorb(sample);
        out.entry(AggregateScope::Model(sample.model.clone()))
            .or_default()
            .absorb(sample);
        out.entry(AggregateScope::User(sample.user_id))
            .or_default()
            .absorb(sample);
        if let Some(team_id) = sample.team_id {
            out.entry(AggregateScope::Team(team_id))
                .or_default()
                .absorb(sample);
        }
    }
    out
}

/// Rolls recent usage into per-interval aggregate rows the dashboards
/// query directly, and mirrors live router health into process metrics.
pub struct MetricsAggregator {
    pool: PgPool,
    registry: Arc<ModelRegistry>,
    metrics: Arc<GatewayMetrics>,
}

impl MetricsAggregator {
    pub fn new(pool: PgPool, registry: Arc<ModelRegistry>, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            pool,
            registry,
            metrics,
        }
    }

    pub async fn aggregate_bucket(
        &self,
        granularity: Granularity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT model, user_id, team_id, status, input_tokens, output_tokens, total_cost, \
             latency_ms FROM usage_logs WHERE timestamp >= $1 AND timestamp < $2",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let samples: Vec<UsageSample> = rows
            .into_iter()
            .map(|row| UsageSample {
                model: row.get("model"),
                user_id: row.get("user_id"),
                team_id: row.get("team_id"),
                status: row.get("status"),
                input_tokens: row.get("input_tokens"),
                output_tokens: row.get("output_tokens"),
                total_cost: row.get("total_cost"),
                latency_ms: row.get("latency_ms"),
            })
            .collect();
        if samples.is_empty() {
            return Ok(0);
        }

        let aggregates = aggregate_samples(&samples);
        let count = aggregates.len();
        for (scope, aggregate) in &aggregates {
            sqlx::query(
                "INSERT INTO usage_metrics (granularity, bucket_start, scope_type, scope_id, \
                 request_count, success_count, input_tokens, output_tokens, total_cost, \
                 avg_latency_ms, p95_latency_ms, p99_latency_ms) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                 ON CONFLICT (granularity, bucket_start, scope_type, scope_id) \
                 DO UPDATE SET request_count = EXCLUDED.request_count, \
                               success_count = EXCLUDED.success_count, \
                               input_tokens = EXCLUDED.input_tokens, \
                               output_tokens = EXCLUDED.output_tokens, \
                               total_cost = EXCLUDED.total_cost, \
                               avg_latency_ms = EXCLUDED.avg_latency_ms, \
                               p95_latency_ms = EXCLUDED.p95_latency_ms, \
                               p99_latency_ms = EXCLUDED.p99_latency_ms",
            )
            .bind(granularity.as_str())
            .bind(start)
            .bind(scope.scope_type())
            .bind(scope.scope_id())
            .bind(aggregate.request_count)
            .bind(aggregate.success_count)
            .bind(aggregate.input_tokens)
            .bind(aggregate.output_tokens)
            .bind(aggregate.total_cost)
            .bind(aggregate.avg_latency_ms())
            .bind(aggregate.percentile_latency_ms(95.0))
            .bind(aggregate.percentile_latency_ms(99.0))
            .execute(&self.pool)
            .await?;
        }
        Ok(count)
    }

    /// Mirror per-instance health into gauges so operators see circuit
    /// state without querying the admin endpoint.
    fn publish_registry_health(&self) {
        for health in self.registry.snapshot() {
            self.metrics.set_instance_health(
                &health.id,
                health.health_score,
                health.circuit_open,
                health.in_flight,
            );
        }
    }

    async fn tick(&self, now: DateTime<Utc>) {
        self.publish_registry_health();

        let (start, end) = closed_bucket(Granularity::Minute, now);
        if let Err(err) = self.aggregate_bucket(Granularity::Minute, start, end).await {
            warn!(error = %err, "Minute aggregation failed");
        }

        // Hour and day rollups run when their bucket just closed.
        let (hour_start, hour_end) = closed_bucket(Granularity::Hour, now);
        if now - hour_end < chrono::Duration::minutes(2) {
            if let Err(err) = self
                .aggregate_bucket(Granularity::Hour, hour_start, hour_end)
                .await
            {
                warn!(error = %err, "Hour aggregation failed");
            }
        }
        let (day_start, day_end) = closed_bucket(Granularity::Day, now);
        if now - day_end < chrono::Duration::minutes(2) {
            if let Err(err) = self
                .aggregate_bucket(Granularity::Day, day_start, day_end)
                .await
            {
                warn!(error = %err, "Day aggregation failed");
            }
        }
        debug!("Aggregation tick complete");
    }

    pub fn spawn(self: Arc<Self>, interval_secs: u64) {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_secs.max(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick(Utc::now()).await;
            }
        });
    }
}
