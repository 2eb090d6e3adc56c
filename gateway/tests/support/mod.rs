// Not every test binary uses every helper here.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::to_bytes;
use axum::response::Response;
use serde_json::{json, Value};

use llm_gateway::app_state::AppState;
use llm_gateway::config::{GatewayConfig, ModelInstanceConfig, ModelsConfig, RoutingStrategy};
use llm_gateway::providers::{Provider, ProviderError, ProviderRequest, ProviderResponse};
use llm_gateway::registry::ModelRegistry;

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        master_key: Some("test-master-key".into()),
        key_prefix: "sk-".into(),
        dex: None,
        jwt_secret: Some("test-jwt-secret".into()),
        jwt_audience: "llm-gateway".into(),
        access_token_duration_secs: 3600,
        auth_key_cache_ttl_secs: 300,
        auth_token_cache_ttl_secs: 600,
        redis_url: "redis://ignored".into(),
        cache_enabled: true,
        cache_ttl_secs: 300,
        rate_limit_enabled: true,
        rate_limit_window_secs: 60,
        global_rpm: 1000,
        chat_completions_rpm: 1000,
        completions_rpm: 1000,
        embeddings_rpm: 1000,
        routing_strategy: RoutingStrategy::Priority,
        allowed_failures: 3,
        cooldown_secs: 30,
        health_check_interval_secs: 3600,
        max_retries: 2,
        default_timeout_secs: 5,
        budget_check_timeout_ms: 100,
        usage_batch_size: 50,
        usage_worker_interval_secs: 5,
        usage_max_retries: 3,
        usage_queue_ttl_secs: 7 * 24 * 3600,
        usage_lock_ttl_secs: 120,
        usage_events_channel: "pllm:metrics:events".into(),
        aggregation_interval_secs: 3600,
        realtime_session_ttl_secs: 1800,
        realtime_max_sessions_per_tenant: 8,
        models: ModelsConfig::default(),
    }
}

pub fn test_state() -> AppState {
    AppState::test_with_in_memory(test_config(), None)
}

pub fn instance_config(id: &str, model: &str) -> ModelInstanceConfig {
    serde_json::from_value(json!({
        "id": id,
        "model": model,
        "provider": "openai",
        "input_cost_per_token": 0.0,
        "output_cost_per_token": 0.0,
    }))
    .unwrap()
}

/// Deterministic upstream double: answers every JSON op with a canned body
/// or a configured upstream failure.
pub struct FakeProvider {
    pub response: Value,
    pub fail_with_status: Option<u16>,
    pub calls: AtomicU32,
}

impl FakeProvider {
    pub fn ok(response: Value) -> Arc<Self> {
        Arc::new(Self {
            response,
            fail_with_status: None,
            calls: AtomicU32::new(0),
        })
    }

    pub fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self {
            response: Value::Null,
            fail_with_status: Some(status),
            calls: AtomicU32::new(0),
        })
    }

    fn answer(&self) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fail_with_status {
            Some(status) => Err(ProviderError::Upstream {
                status,
                body: json!({"error": {"message": "upstream failure"}}).to_string(),
            }),
            None => Ok(ProviderResponse::Json(self.response.clone())),
        }
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }
    async fn chat(&self, _: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.answer()
    }
    async fn embeddings(&self, _: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.answer()
    }
    async fn images(&self, _: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.answer()
    }
    async fn audio(&self, _: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.answer()
    }
    async fn moderations(&self, _: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.answer()
    }
    async fn health_probe(&self) -> Result<(), ProviderError> {
        match self.fail_with_status {
            Some(status) => Err(ProviderError::Upstream {
                status,
                body: String::new(),
            }),
            None => Ok(()),
        }
    }
}

/// Registry pre-loaded with fake instances; pair with
/// `state.registry = registry` before building the router.
pub fn registry_with_instances(
    strategy: RoutingStrategy,
    fallbacks: HashMap<String, Vec<String>>,
    instances: Vec<(ModelInstanceConfig, Arc<FakeProvider>)>,
    allowed_failures: u32,
    cooldown: Duration,
) -> Arc<ModelRegistry> {
    let registry = Arc::new(ModelRegistry::new(strategy, fallbacks));
    for (config, provider) in instances {
        registry.register(config, provider, allowed_failures, cooldown);
    }
    registry
}

pub async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
