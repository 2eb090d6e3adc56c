use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use common_audit::AuditStore;
use common_auth::{JwtConfig, JwtVerifier};
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use llm_gateway::app_state::AppState;
use llm_gateway::auth_cache::AuthCache;
use llm_gateway::budget::{BudgetCache, BudgetStore, RedisBudgetBackend};
use llm_gateway::config::GatewayConfig;
use llm_gateway::handlers;
use llm_gateway::keys::KeyStore;
use llm_gateway::metrics::GatewayMetrics;
use llm_gateway::permissions::PermissionEngine;
use llm_gateway::rate_limiter::RedisRateLimiter;
use llm_gateway::realtime::RealtimeManager;
use llm_gateway::registry::ModelRegistry;
use llm_gateway::response_cache::{RedisCacheStore, ResponseCache};
use llm_gateway::usage::{RedisUsageQueue, UsageEmitter, UsageQueue, UsageWorker};
use llm_gateway::users::UserStore;
use llm_gateway::validator::CredentialValidator;
use llm_gateway::aggregator::MetricsAggregator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    common_observability::init_tracing("llm_gateway");

    let config = Arc::new(GatewayConfig::from_env()?);

    let database_url =
        env::var("DATABASE_URL").context("DATABASE_URL must be set for llm-gateway")?;
    let db_pool = PgPoolOptions::new()
        .max_connections(
            env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(16),
        )
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await
        .context("Failed to connect to Postgres")?;

    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("Failed to create Redis client")?;
    let redis = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("Failed to create Redis connection manager")?;
    {
        // Ping on start so a bad Redis URL fails loudly, not on first request.
        let mut conn = redis.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis ping failed")?;
    }

    let verifier = build_jwt_verifier(&config).await?;
    if let Some(verifier) = &verifier {
        spawn_jwks_refresh(verifier.clone());
    }

    let validator = CredentialValidator::new(
        config.master_key.clone(),
        config.key_prefix.clone(),
        KeyStore::new(db_pool.clone()),
        UserStore::new(db_pool.clone()),
        verifier,
    );
    let auth = Arc::new(AuthCache::new(
        validator,
        Duration::from_secs(config.auth_key_cache_ttl_secs),
        Duration::from_secs(config.auth_token_cache_ttl_secs),
    ));
    auth.spawn_sweep(60);

    let budgets = BudgetCache::new(
        Arc::new(RedisBudgetBackend::new(redis.clone(), 3600)),
        Duration::from_millis(config.budget_check_timeout_ms),
    );
    let budget_store = BudgetStore::new(db_pool.clone());
    seed_budget_cache(&budget_store, &budgets).await;

    let rate_limiter = Arc::new(RedisRateLimiter::new(
        redis.clone(),
        config.rate_limit_window_secs,
        "ratelimit".to_string(),
    ));

    let response_cache = ResponseCache::new(
        Arc::new(RedisCacheStore::new(redis.clone())),
        config.cache_enabled,
        Duration::from_secs(config.cache_ttl_secs),
    );

    let registry = Arc::new(ModelRegistry::from_config(
        &config.models,
        config.routing_strategy,
        config.allowed_failures,
        Duration::from_secs(config.cooldown_secs),
        Duration::from_secs(config.default_timeout_secs),
    ));
    registry.spawn_health_checks(config.health_check_interval_secs);
    info!(
        models = registry.model_names().len(),
        strategy = ?config.routing_strategy,
        "Model registry initialised"
    );

    let usage_queue: Arc<dyn UsageQueue> = Arc::new(RedisUsageQueue::new(redis.clone()));
    let usage = UsageEmitter::new(usage_queue.clone(), config.usage_queue_ttl_secs);

    let metrics = Arc::new(GatewayMetrics::new()?);

    let worker = Arc::new(UsageWorker::new(
        usage_queue.clone(),
        db_pool.clone(),
        budgets.clone(),
        config.usage_batch_size,
        config.usage_max_retries,
        Duration::from_secs(config.usage_lock_ttl_secs),
        config.usage_events_channel.clone(),
    ));
    worker.spawn(config.usage_worker_interval_secs);

    let aggregator = Arc::new(MetricsAggregator::new(
        db_pool.clone(),
        registry.clone(),
        metrics.clone(),
    ));
    aggregator.spawn(config.aggregation_interval_secs);

    let realtime = Arc::new(RealtimeManager::new(
        config.realtime_session_ttl_secs,
        config.realtime_max_sessions_per_tenant,
    ));
    realtime.spawn_sweep(30);

    let state = AppState {
        config: config.clone(),
        db: db_pool.clone(),
        auth,
        permissions: PermissionEngine::new(),
        budgets,
        budget_store,
        rate_limiter,
        response_cache,
        registry,
        usage,
        usage_queue,
        audit: AuditStore::new(db_pool.clone()),
        metrics,
        realtime,
        keys: KeyStore::new(db_pool),
    };

    let app = handlers::router(state);

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    info!(%addr, "Starting llm-gateway");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// OIDC verification against the configured issuer's JWKS, with the HS256
/// internal-token path when a shared secret is set. Returns None when
/// neither is configured (API-key / master-key only deployment).
async fn build_jwt_verifier(config: &GatewayConfig) -> anyhow::Result<Option<Arc<JwtVerifier>>> {
    let issuer = config
        .dex
        .as_ref()
        .map(|dex| dex.issuer.clone())
        .unwrap_or_else(|| "llm-gateway".to_string());
    if config.dex.is_none() && config.jwt_secret.is_none() {
        warn!("No OIDC issuer or JWT secret configured; JWT authentication disabled");
        return Ok(None);
    }

    let mut jwt_config = JwtConfig::new(issuer, config.jwt_audience.clone());
    if let Some(secret) = &config.jwt_secret {
        jwt_config = jwt_config.with_hs256_secret(secret.clone());
    }

    let mut builder = JwtVerifier::builder(jwt_config);
    if let Some(dex) = &config.dex {
        let jwks_url = format!("{}/keys", dex.issuer.trim_end_matches('/'));
        info!(%jwks_url, "Configuring JWKS fetcher");
        builder = builder.with_jwks_url(jwks_url);
    }

    let verifier = builder.build().await.map_err(anyhow::Error::from)?;
    info!("JWT verifier initialised");
    Ok(Some(Arc::new(verifier)))
}

fn spawn_jwks_refresh(verifier: Arc<JwtVerifier>) {
    let Some(fetcher) = verifier.jwks_fetcher() else {
        return;
    };
    let refresh_secs = env::var("JWKS_REFRESH_SECONDS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(300)
        .max(60);
    let url = fetcher.url().to_owned();
    let handle = verifier.clone();

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(refresh_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match handle.refresh_jwks().await {
                Ok(count) => {
                    debug!(count, jwks_url = %url, "Refreshed JWKS keys");
                }
                Err(err) => {
                    warn!(error = %err, jwks_url = %url, "Failed to refresh JWKS keys");
                }
            }
        }
    });
}

/// Prime the hot budget view from the authoritative rows so enforcement
/// works from the first request.
async fn seed_budget_cache(store: &BudgetStore, cache: &BudgetCache) {
    match store.load_active().await {
        Ok(rows) => {
            let count = rows.len();
            for row in rows {
                cache.refresh(&row.scope, Some(row.amount), row.spent).await;
            }
            info!(count, "Seeded budget cache");
        }
        Err(err) => {
            warn!(error = %err, "Failed to seed budget cache");
        }
    }
}
