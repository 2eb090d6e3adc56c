use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;

/// Routing strategy across instances of one logical model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    Priority,
    LeastBusy,
    LatencyBased,
    Weighted,
}

impl RoutingStrategy {
    fn parse(value: &str) -> Self {
        match value {
            "least-busy" | "least_busy" => RoutingStrategy::LeastBusy,
            "latency" | "latency-based" => RoutingStrategy::LatencyBased,
            "weighted" => RoutingStrategy::Weighted,
            _ => RoutingStrategy::Priority,
        }
    }
}

/// One provider-credentialed instance backing a logical model name.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelInstanceConfig {
    pub id: String,
    /// User-facing logical model name; several instances may share it.
    pub model: String,
    pub provider: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub rpm: Option<u32>,
    #[serde(default)]
    pub tpm: Option<u32>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub input_cost_per_token: f64,
    #[serde(default)]
    pub output_cost_per_token: f64,
    /// Falls back to `Router.DefaultTimeout` when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_priority() -> u32 {
    1
}
fn default_weight() -> u32 {
    1
}
fn default_enabled() -> bool {
    true
}

/// Document loaded from the `MODELS_CONFIG` JSON file.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ModelsConfig {
    #[serde(default)]
    pub models: Vec<ModelInstanceConfig>,
    /// Ordered fallback chain per logical model name.
    #[serde(default)]
    pub fallbacks: std::collections::HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct DexConfig {
    pub issuer: String,
    pub public_issuer: Option<String>,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_url: Option<String>,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // Auth
    pub master_key: Option<String>,
    pub key_prefix: String,
    pub dex: Option<DexConfig>,
    pub jwt_secret: Option<String>,
    pub jwt_audience: String,
    pub access_token_duration_secs: u64,
    pub auth_key_cache_ttl_secs: u64,
    pub auth_token_cache_ttl_secs: u64,

    // Backends
    pub redis_url: String,

    // Response cache
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_window_secs: u64,
    pub global_rpm: u32,
    pub chat_completions_rpm: u32,
    pub completions_rpm: u32,
    pub embeddings_rpm: u32,

    // Routing
    pub routing_strategy: RoutingStrategy,
    pub allowed_failures: u32,
    pub cooldown_secs: u64,
    pub health_check_interval_secs: u64,
    pub max_retries: u32,
    pub default_timeout_secs: u64,

    // Budgets
    pub budget_check_timeout_ms: u64,

    // Usage pipeline
    pub usage_batch_size: usize,
    pub usage_worker_interval_secs: u64,
    pub usage_max_retries: u32,
    pub usage_queue_ttl_secs: i64,
    pub usage_lock_ttl_secs: u64,
    pub usage_events_channel: String,

    // Aggregation
    pub aggregation_interval_secs: u64,

    // Realtime
    pub realtime_session_ttl_secs: u64,
    pub realtime_max_sessions_per_tenant: usize,

    // Model catalog
    pub models: ModelsConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let redis_url = env::var("REDIS_URL").context("REDIS_URL must be set")?;

        let dex = match env::var("DEX_ISSUER") {
            Ok(issuer) => Some(DexConfig {
                issuer,
                public_issuer: env::var("DEX_PUBLIC_ISSUER").ok(),
                client_id: env::var("DEX_CLIENT_ID").unwrap_or_else(|_| "llm-gateway".into()),
                client_secret: env::var("DEX_CLIENT_SECRET").ok(),
                redirect_url: env::var("DEX_REDIRECT_URL").ok(),
                scopes: env::var("DEX_SCOPES")
                    .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_else(|_| {
                        vec!["openid".into(), "email".into(), "groups".into()]
                    }),
            }),
            Err(_) => None,
        };

        let models = match env::var("MODELS_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read models config at {path}"))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse models config at {path}"))?
            }
            Err(_) => ModelsConfig::default(),
        };

        Ok(Self {
            master_key: env::var("AUTH_MASTER_KEY").ok(),
            key_prefix: env::var("AUTH_KEY_PREFIX").unwrap_or_else(|_| "sk-".into()),
            dex,
            jwt_secret: env::var("JWT_SECRET_KEY").ok(),
            jwt_audience: env::var("JWT_AUDIENCE").unwrap_or_else(|_| "llm-gateway".into()),
            access_token_duration_secs: env_u64("JWT_ACCESS_TOKEN_DURATION", 3600),
            auth_key_cache_ttl_secs: env_u64("AUTH_KEY_CACHE_TTL_SECONDS", 300),
            auth_token_cache_ttl_secs: env_u64("AUTH_TOKEN_CACHE_TTL_SECONDS", 600),
            redis_url,
            cache_enabled: env_bool("CACHE_ENABLED", true),
            cache_ttl_secs: env_u64("CACHE_TTL_SECONDS", 300),
            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED", true),
            rate_limit_window_secs: env_u64("RATE_LIMIT_WINDOW_SECONDS", 60).max(1),
            global_rpm: env_u32("RATE_LIMIT_GLOBAL_RPM", 600),
            chat_completions_rpm: env_u32("RATE_LIMIT_CHAT_COMPLETIONS_RPM", 300),
            completions_rpm: env_u32("RATE_LIMIT_COMPLETIONS_RPM", 300),
            embeddings_rpm: env_u32("RATE_LIMIT_EMBEDDINGS_RPM", 600),
            routing_strategy: RoutingStrategy::parse(
                &env::var("ROUTER_ROUTING_STRATEGY").unwrap_or_else(|_| "priority".into()),
            ),
            allowed_failures: env_u32("ROUTER_ALLOWED_FAILURES", 3),
            cooldown_secs: env_u64("ROUTER_COOLDOWN_SECONDS", 30),
            health_check_interval_secs: env_u64("ROUTER_HEALTH_CHECK_INTERVAL_SECONDS", 60),
            max_retries: env_u32("ROUTER_MAX_RETRIES", 2),
            default_timeout_secs: env_u64("ROUTER_DEFAULT_TIMEOUT_SECONDS", 30),
            budget_check_timeout_ms: env_u64("BUDGET_CHECK_TIMEOUT_MS", 100),
            usage_batch_size: env_u64("USAGE_BATCH_SIZE", 50) as usize,
            usage_worker_interval_secs: env_u64("USAGE_WORKER_INTERVAL_SECONDS", 5).max(1),
            usage_max_retries: env_u32("USAGE_MAX_RETRIES", 3),
            usage_queue_ttl_secs: env_u64("USAGE_QUEUE_TTL_SECONDS", 7 * 24 * 3600) as i64,
            usage_lock_ttl_secs: env_u64("USAGE_LOCK_TTL_SECONDS", 120),
            usage_events_channel: env::var("USAGE_EVENTS_CHANNEL")
                .unwrap_or_else(|_| "pllm:metrics:events".into()),
            aggregation_interval_secs: env_u64("AGGREGATION_INTERVAL_SECONDS", 60),
            realtime_session_ttl_secs: env_u64("REALTIME_SESSION_TTL_SECONDS", 1800),
            realtime_max_sessions_per_tenant: env_u64("REALTIME_MAX_SESSIONS_PER_TENANT", 8)
                as usize,
            models,
        })
    }

    /// Per-endpoint-class request-per-window limit.
    pub fn rpm_for_class(&self, class: crate::rate_limiter::EndpointClass) -> u32 {
        use crate::rate_limiter::EndpointClass::*;
        match class {
            Chat => self.chat_completions_rpm,
            Completions => self.completions_rpm,
            Embeddings => self.embeddings_rpm,
            Global => self.global_rpm,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(default)
}
