use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ModelInstanceConfig, ModelsConfig, RoutingStrategy};
use crate::keys::KeyRecord;
use crate::providers::{build_provider, Provider, ProviderError};

/// Instances below this health score have their circuit opened even before
/// the consecutive-failure limit trips.
const HEALTH_OPEN_THRESHOLD: f64 = 30.0;

/// How far one outcome moves the score.
const SUCCESS_RECOVERY_FACTOR: f64 = 0.2;
const PENALTY_TIMEOUT: f64 = 30.0;
const PENALTY_SERVER_ERROR: f64 = 20.0;

/// EWMA smoothing for latency-based routing.
const LATENCY_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Timeout,
    ServerError,
    /// Upstream 4xx: the caller's fault, never a health signal.
    ClientError,
}

impl From<&ProviderError> for FailureClass {
    fn from(value: &ProviderError) -> Self {
        match value {
            ProviderError::Timeout => FailureClass::Timeout,
            ProviderError::Transport(_) => FailureClass::ServerError,
            ProviderError::Upstream { status, .. } if *status >= 500 => FailureClass::ServerError,
            _ => FailureClass::ClientError,
        }
    }
}

#[derive(Debug)]
struct RuntimeState {
    health_score: f64,
    failed_in_a_row: u32,
    circuit_open: bool,
    cooldown_until: Option<Instant>,
    last_latency_ms: u64,
    ewma_latency_ms: f64,
    /// Half-open: one in-flight probe at a time.
    probing: bool,
}

impl RuntimeState {
    fn fresh() -> Self {
        Self {
            health_score: 100.0,
            failed_in_a_row: 0,
            circuit_open: false,
            cooldown_until: None,
            last_latency_ms: 0,
            ewma_latency_ms: 0.0,
            probing: false,
        }
    }
}

/// One provider-credentialed endpoint backing a logical model name.
/// Runtime state is process-local and resets on start.
pub struct ModelInstance {
    pub config: ModelInstanceConfig,
    pub provider: Arc<dyn Provider>,
    runtime: RwLock<RuntimeState>,
    in_flight: AtomicU32,
    allowed_failures: u32,
    cooldown: Duration,
}

impl ModelInstance {
    fn new(
        config: ModelInstanceConfig,
        provider: Arc<dyn Provider>,
        allowed_failures: u32,
        cooldown: Duration,
    ) -> Self {
        Self {
            config,
            provider,
            runtime: RwLock::new(RuntimeState::fresh()),
            in_flight: AtomicU32::new(0),
            allowed_failures,
            cooldown,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs.unwrap_or(30))
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn cost_for(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        input_tokens as f64 * self.config.input_cost_per_token
            + output_tokens as f64 * self.config.output_cost_per_token
    }

    fn ewma_latency_ms(&self) -> f64 {
        self.runtime.read().expect("rwlock poisoned").ewma_latency_ms
    }

    pub fn circuit_open(&self) -> bool {
        self.runtime.read().expect("rwlock poisoned").circuit_open
    }

    /// Candidate filter from the selection algorithm: enabled, circuit
    /// closed or due a half-open probe.
    fn available(&self, now: Instant) -> bool {
        if !self.config.enabled {
            return false;
        }
        let state = self.runtime.read().expect("rwlock poisoned");
        if !state.circuit_open {
            return true;
        }
        match state.cooldown_until {
            Some(until) => now >= until && !state.probing,
            None => true,
        }
    }

    /// If the circuit is open but cooled down, claim the single half-open
    /// probe slot. Returns false when another task holds it.
    fn begin_probe_if_needed(&self, now: Instant) -> bool {
        let mut state = self.runtime.write().expect("rwlock poisoned");
        if !state.circuit_open {
            return true;
        }
        match state.cooldown_until {
            Some(until) if now < until => false,
            _ => {
                if state.probing {
                    return false;
                }
                state.probing = true;
                true
            }
        }
    }

    pub fn record_success(&self, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        let mut state = self.runtime.write().expect("rwlock poisoned");
        state.failed_in_a_row = 0;
        state.health_score += (100.0 - state.health_score) * SUCCESS_RECOVERY_FACTOR;
        state.last_latency_ms = latency_ms;
        state.ewma_latency_ms = if state.ewma_latency_ms == 0.0 {
            latency_ms as f64
        } else {
            LATENCY_ALPHA * latency_ms as f64 + (1.0 - LATENCY_ALPHA) * state.ewma_latency_ms
        };
        if state.circuit_open {
            info!(instance = %self.config.id, "Circuit closed after successful probe");
            state.circuit_open = false;
            state.cooldown_until = None;
        }
        state.probing = false;
    }

    pub fn record_failure(&self, class: FailureClass) {
        if class == FailureClass::ClientError {
            // Pass-through errors carry no health signal; just release a
            // probe slot if we held one.
            let mut state = self.runtime.write().expect("rwlock poisoned");
            state.probing = false;
            return;
        }
        let penalty = match class {
            FailureClass::Timeout => PENALTY_TIMEOUT,
            FailureClass::ServerError => PENALTY_SERVER_ERROR,
            FailureClass::ClientError => 0.0,
        };
        let mut state = self.runtime.write().expect("rwlock poisoned");
        state.failed_in_a_row += 1;
        state.health_score = (state.health_score - penalty).max(0.0);
        state.probing = false;

        let should_open = state.failed_in_a_row >= self.allowed_failures
            || state.health_score < HEALTH_OPEN_THRESHOLD;
        if should_open {
            if !state.circuit_open {
                warn!(
                    instance = %self.config.id,
                    failed_in_a_row = state.failed_in_a_row,
                    health_score = state.health_score,
                    "Circuit opened"
                );
            }
            state.circuit_open = true;
            state.cooldown_until = Some(Instant::now() + self.cooldown);
        }
    }

    pub fn health_snapshot(&self) -> InstanceHealth {
        let state = self.runtime.read().expect("rwlock poisoned");
        InstanceHealth {
            id: self.config.id.clone(),
            model: self.config.model.clone(),
            provider: self.config.provider.clone(),
            health_score: state.health_score,
            failed_in_a_row: state.failed_in_a_row,
            circuit_open: state.circuit_open,
            cooldown_remaining_ms: state
                .cooldown_until
                .map(|until| until.saturating_duration_since(Instant::now()).as_millis() as u64)
                .unwrap_or(0),
            last_latency_ms: state.last_latency_ms,
            ewma_latency_ms: state.ewma_latency_ms,
            in_flight: self.in_flight(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    pub id: String,
    pub model: String,
    pub provider: String,
    pub health_score: f64,
    pub failed_in_a_row: u32,
    pub circuit_open: bool,
    pub cooldown_remaining_ms: u64,
    pub last_latency_ms: u64,
    pub ewma_latency_ms: f64,
    pub in_flight: u32,
}

/// RAII reservation of an instance slot. Dropping the guard releases the
/// in-flight count, including when the request future is cancelled by a
/// client disconnect.
pub struct InFlightGuard {
    instance: Arc<ModelInstance>,
}

impl InFlightGuard {
    fn reserve(instance: Arc<ModelInstance>) -> Self {
        instance.in_flight.fetch_add(1, Ordering::Relaxed);
        Self { instance }
    }

    pub fn instance(&self) -> &Arc<ModelInstance> {
        &self.instance
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.instance.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A routing decision: the reserved instance plus the logical model name
/// it was reached under (differs from the requested name after fallback).
pub struct RoutedInstance {
    pub guard: InFlightGuard,
    pub resolved_model: String,
    /// True when the routed name differs from the requested one.
    pub fell_back: bool,
}

impl std::fmt::Debug for RoutedInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedInstance")
            .field("resolved_model", &self.resolved_model)
            .field("fell_back", &self.fell_back)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("model '{0}' is not served by this gateway")]
    UnknownModel(String),
    #[error("no healthy instance for '{0}' or any fallback")]
    NoHealthyInstance(String),
}

/// Logical-model registry, load balancer and fallback cascade.
pub struct ModelRegistry {
    by_name: RwLock<HashMap<String, Vec<Arc<ModelInstance>>>>,
    rr: Mutex<HashMap<String, u64>>,
    strategy: RoutingStrategy,
    fallbacks: HashMap<String, Vec<String>>,
}

impl ModelRegistry {
    pub fn new(strategy: RoutingStrategy, fallbacks: HashMap<String, Vec<String>>) -> Self {
        Self {
            by_name: RwLock::new(HashMap::new()),
            rr: Mutex::new(HashMap::new()),
            strategy,
            fallbacks,
        }
    }

    pub fn from_config(
        models: &ModelsConfig,
        strategy: RoutingStrategy,
        allowed_failures: u32,
        cooldown: Duration,
        default_timeout: Duration,
    ) -> Self {
        let registry = Self::new(strategy, models.fallbacks.clone());
        for config in &models.models {
            let provider = build_provider(config);
            let mut config = config.clone();
            config.timeout_secs.get_or_insert(default_timeout.as_secs());
            registry.register(config, provider, allowed_failures, cooldown);
        }
        registry
    }

    pub fn register(
        &self,
        config: ModelInstanceConfig,
        provider: Arc<dyn Provider>,
        allowed_failures: u32,
        cooldown: Duration,
    ) {
        let model = config.model.clone();
        let instance = Arc::new(ModelInstance::new(
            config,
            provider,
            allowed_failures,
            cooldown,
        ));
        let mut guard = self.by_name.write().expect("rwlock poisoned");
        let entry = guard.entry(model).or_default();
        entry.push(instance);
        entry.sort_by(|a, b| b.config.priority.cmp(&a.config.priority));
    }

    pub fn model_names(&self) -> Vec<String> {
        let guard = self.by_name.read().expect("rwlock poisoned");
        let mut names: Vec<String> = guard.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_model(&self, name: &str) -> bool {
        self.by_name.read().expect("rwlock poisoned").contains_key(name)
    }

    /// Highest-priority instance registered under a logical name.
    pub fn primary_instance(&self, name: &str) -> Option<Arc<ModelInstance>> {
        let guard = self.by_name.read().expect("rwlock poisoned");
        guard.get(name).and_then(|instances| instances.first().cloned())
    }

    /// Per-token pricing for a logical name (first registered instance);
    /// used for pre-flight cost estimates before an instance is chosen.
    pub fn pricing_for(&self, name: &str) -> Option<(f64, f64)> {
        self.primary_instance(name).map(|instance| {
            (
                instance.config.input_cost_per_token,
                instance.config.output_cost_per_token,
            )
        })
    }

    pub fn snapshot(&self) -> Vec<InstanceHealth> {
        let guard = self.by_name.read().expect("rwlock poisoned");
        let mut all: Vec<InstanceHealth> = guard
            .values()
            .flatten()
            .map(|instance| instance.health_snapshot())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn all_instances(&self) -> Vec<Arc<ModelInstance>> {
        let guard = self.by_name.read().expect("rwlock poisoned");
        guard.values().flatten().cloned().collect()
    }

    /// Selection with the fallback cascade: try the requested logical
    /// model, then each configured alternative, skipping names already
    /// tried and names the caller's key does not permit.
    pub fn select(
        &self,
        model: &str,
        key: Option<&KeyRecord>,
    ) -> Result<RoutedInstance, RouteError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = model.to_string();
        let mut known_any = false;

        loop {
            if !visited.insert(current.clone()) {
                break;
            }

            let permitted = key.map(|k| k.model_permitted(&current)).unwrap_or(true);
            if permitted {
                let candidates = {
                    let guard = self.by_name.read().expect("rwlock poisoned");
                    guard.get(&current).cloned()
                };
                if let Some(candidates) = candidates {
                    known_any = true;
                    if let Some(instance) = self.pick(&current, &candidates) {
                        let fell_back = current != model;
                        if fell_back {
                            debug!(requested = model, routed = %current, "Fallback route");
                        }
                        return Ok(RoutedInstance {
                            guard: InFlightGuard::reserve(instance),
                            resolved_model: current,
                            fell_back,
                        });
                    }
                }
            }

            // Cascade to the next untried alternative for this name.
            let next = self
                .fallbacks
                .get(&current)
                .and_then(|chain| chain.iter().find(|alt| !visited.contains(*alt)))
                .cloned();
            match next {
                Some(next) => current = next,
                None => break,
            }
        }

        if known_any {
            Err(RouteError::NoHealthyInstance(model.to_string()))
        } else {
            Err(RouteError::UnknownModel(model.to_string()))
        }
    }

    fn pick(
        &self,
        model: &str,
        candidates: &[Arc<ModelInstance>],
    ) -> Option<Arc<ModelInstance>> {
        let now = Instant::now();
        let available: Vec<&Arc<ModelInstance>> = candidates
            .iter()
            .filter(|instance| instance.available(now))
            .collect();
        if available.is_empty() {
            return None;
        }

        let chosen = match self.strategy {
            RoutingStrategy::Priority => {
                let top = available
                    .iter()
                    .map(|instance| instance.config.priority)
                    .max()?;
                let tied: Vec<&Arc<ModelInstance>> = available
                    .iter()
                    .filter(|instance| instance.config.priority == top)
                    .copied()
                    .collect();
                self.weighted_pick(model, &tied)
            }
            RoutingStrategy::LeastBusy => available
                .iter()
                .min_by_key(|instance| instance.in_flight())
                .copied(),
            RoutingStrategy::LatencyBased => available
                .iter()
                .min_by(|a, b| {
                    a.ewma_latency_ms()
                        .partial_cmp(&b.ewma_latency_ms())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied(),
            RoutingStrategy::Weighted => self.weighted_pick(model, &available),
        }?;

        // Half-open circuits admit exactly one probe; if another task holds
        // the probe slot, fall through to any other available candidate.
        if chosen.begin_probe_if_needed(now) {
            return Some(Arc::clone(chosen));
        }
        for instance in &available {
            if !std::ptr::eq(Arc::as_ptr(instance), Arc::as_ptr(chosen))
                && instance.begin_probe_if_needed(now)
            {
                return Some(Arc::clone(instance));
            }
        }
        None
    }

    /// Weighted round-robin via a rotating counter per logical name.
    fn weighted_pick<'a>(
        &self,
        model: &str,
        candidates: &[&'a Arc<ModelInstance>],
    ) -> Option<&'a Arc<ModelInstance>> {
        if candidates.is_empty() {
            return None;
        }
        let total_weight: u64 = candidates
            .iter()
            .map(|instance| instance.config.weight.max(1) as u64)
            .sum();
        let tick = {
            let mut counters = self.rr.lock().expect("mutex poisoned");
            let counter = counters.entry(model.to_string()).or_insert(0);
            let tick = *counter;
            *counter = counter.wrapping_add(1);
            tick
        };
        let mut slot = tick % total_weight;
        for instance in candidates {
            let weight = instance.config.weight.max(1) as u64;
            if slot < weight {
                return Some(instance);
            }
            slot -= weight;
        }
        candidates.first().copied()
    }

    /// Background probing: instances whose circuit is open and cooled down
    /// get a provider health probe, closing the breaker without waiting
    /// for live traffic.
    pub fn spawn_health_checks(self: &Arc<Self>, interval_secs: u64) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_secs.max(5)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for instance in registry.all_instances() {
                    if !instance.circuit_open() {
                        continue;
                    }
                    if !instance.begin_probe_if_needed(Instant::now()) {
                        continue;
                    }
                    let started = Instant::now();
                    match instance.provider.health_probe().await {
                        Ok(()) => instance.record_success(started.elapsed()),
                        Err(err) => {
                            debug!(instance = %instance.config.id, error = %err, "Health probe failed");
                            instance.record_failure(FailureClass::from(&err));
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderRequest, ProviderResponse};
    use async_trait::async_trait;

    struct NullProvider;

    #[async_trait]
    impl Provider for NullProvider {
        fn name(&self) -> &str {
            "null"
        }
        async fn chat(&self, _: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse::Json(serde_json::json!({})))
        }
        async fn embeddings(&self, _: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse::Json(serde_json::json!({})))
        }
        async fn images(&self, _: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse::Json(serde_json::json!({})))
        }
        async fn audio(&self, _: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse::Json(serde_json::json!({})))
        }
        async fn moderations(&self, _: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse::Json(serde_json::json!({})))
        }
        async fn health_probe(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn instance_config(id: &str, model: &str, priority: u32, weight: u32) -> ModelInstanceConfig {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "model": model,
            "provider": "openai",
            "priority": priority,
            "weight": weight,
        }))
        .unwrap()
    }

    fn registry_with(
        strategy: RoutingStrategy,
        fallbacks: HashMap<String, Vec<String>>,
        configs: Vec<ModelInstanceConfig>,
    ) -> Arc<ModelRegistry> {
        let registry = Arc::new(ModelRegistry::new(strategy, fallbacks));
        for config in configs {
            registry.register(config, Arc::new(NullProvider), 3, Duration::from_secs(30));
        }
        registry
    }

    #[test]
    fn unknown_model_is_distinguished_from_unhealthy() {
        let registry = registry_with(RoutingStrategy::Priority, HashMap::new(), vec![]);
        let err = registry.select("gpt-4", None).unwrap_err();
        assert!(matches!(err, RouteError::UnknownModel(_)));
    }

    #[test]
    fn priority_wins_over_weight() {
        let registry = registry_with(
            RoutingStrategy::Priority,
            HashMap::new(),
            vec![
                instance_config("low", "gpt-4", 1, 100),
                instance_config("high", "gpt-4", 5, 1),
            ],
        );
        for _ in 0..4 {
            let routed = registry.select("gpt-4", None).unwrap();
            assert_eq!(routed.guard.instance().id(), "high");
        }
    }

    #[test]
    fn priority_ties_rotate_by_weight() {
        let registry = registry_with(
            RoutingStrategy::Priority,
            HashMap::new(),
            vec![
                instance_config("a", "gpt-4", 1, 1),
                instance_config("b", "gpt-4", 1, 1),
            ],
        );
        let mut seen = HashSet::new();
        for _ in 0..4 {
            let routed = registry.select("gpt-4", None).unwrap();
            seen.insert(routed.guard.instance().id().to_string());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn least_busy_prefers_idle_instance() {
        let registry = registry_with(
            RoutingStrategy::LeastBusy,
            HashMap::new(),
            vec![
                instance_config("a", "gpt-4", 1, 1),
                instance_config("b", "gpt-4", 1, 1),
            ],
        );
        let first = registry.select("gpt-4", None).unwrap();
        let second = registry.select("gpt-4", None).unwrap();
        assert_ne!(
            first.guard.instance().id(),
            second.guard.instance().id()
        );
    }

    #[test]
    fn guard_releases_in_flight_on_drop() {
        let registry = registry_with(
            RoutingStrategy::LeastBusy,
            HashMap::new(),
            vec![instance_config("a", "gpt-4", 1, 1)],
        );
        {
            let routed = registry.select("gpt-4", None).unwrap();
            assert_eq!(routed.guard.instance().in_flight(), 1);
        }
        let routed = registry.select("gpt-4", None).unwrap();
        assert_eq!(routed.guard.instance().in_flight(), 1);
    }

    #[test]
    fn circuit_opens_after_allowed_failures_and_probes_after_cooldown() {
        let registry = Arc::new(ModelRegistry::new(RoutingStrategy::Priority, HashMap::new()));
        registry.register(
            instance_config("a", "gpt-4", 1, 1),
            Arc::new(NullProvider),
            2,
            Duration::from_millis(0),
        );

        let routed = registry.select("gpt-4", None).unwrap();
        let instance = Arc::clone(routed.guard.instance());
        drop(routed);

        instance.record_failure(FailureClass::ServerError);
        assert!(!instance.circuit_open());
        instance.record_failure(FailureClass::Timeout);
        assert!(instance.circuit_open());

        // Zero cooldown: the next selection is the half-open probe.
        let probe = registry.select("gpt-4", None).unwrap();
        probe.guard.instance().record_success(Duration::from_millis(10));
        assert!(!instance.circuit_open());
    }

    #[test]
    fn open_circuit_with_cooldown_blocks_selection() {
        let registry = Arc::new(ModelRegistry::new(RoutingStrategy::Priority, HashMap::new()));
        registry.register(
            instance_config("a", "gpt-4", 1, 1),
            Arc::new(NullProvider),
            1,
            Duration::from_secs(60),
        );
        let routed = registry.select("gpt-4", None).unwrap();
        routed.guard.instance().record_failure(FailureClass::Timeout);
        drop(routed);

        let err = registry.select("gpt-4", None).unwrap_err();
        assert!(matches!(err, RouteError::NoHealthyInstance(_)));
    }

    #[test]
    fn client_errors_do_not_open_circuits() {
        let registry = registry_with(
            RoutingStrategy::Priority,
            HashMap::new(),
            vec![instance_config("a", "gpt-4", 1, 1)],
        );
        let routed = registry.select("gpt-4", None).unwrap();
        let instance = Arc::clone(routed.guard.instance());
        for _ in 0..20 {
            instance.record_failure(FailureClass::ClientError);
        }
        assert!(!instance.circuit_open());
    }

    #[test]
    fn fallback_cascades_to_alternative_model() {
        let mut fallbacks = HashMap::new();
        fallbacks.insert("gpt-4".to_string(), vec!["claude-3-sonnet".to_string()]);
        let registry = Arc::new(ModelRegistry::new(RoutingStrategy::Priority, fallbacks));
        registry.register(
            instance_config("primary", "gpt-4", 1, 1),
            Arc::new(NullProvider),
            1,
            Duration::from_secs(300),
        );
        registry.register(
            instance_config("alt", "claude-3-sonnet", 1, 1),
            Arc::new(NullProvider),
            1,
            Duration::from_secs(300),
        );

        // Trip the primary's circuit.
        let routed = registry.select("gpt-4", None).unwrap();
        routed.guard.instance().record_failure(FailureClass::Timeout);
        drop(routed);

        let routed = registry.select("gpt-4", None).unwrap();
        assert_eq!(routed.resolved_model, "claude-3-sonnet");
        assert!(routed.fell_back);
        assert_eq!(routed.guard.instance().id(), "alt");
    }

    #[test]
    fn fallback_cycles_terminate() {
        let mut fallbacks = HashMap::new();
        fallbacks.insert("a".to_string(), vec!["b".to_string()]);
        fallbacks.insert("b".to_string(), vec!["a".to_string()]);
        let registry = Arc::new(ModelRegistry::new(RoutingStrategy::Priority, fallbacks));
        let err = registry.select("a", None).unwrap_err();
        assert!(matches!(err, RouteError::UnknownModel(_)));
    }

    #[test]
    fn key_restrictions_skip_forbidden_fallbacks() {
        let mut fallbacks = HashMap::new();
        fallbacks.insert(
            "gpt-4".to_string(),
            vec!["blocked-model".to_string(), "claude-3-sonnet".to_string()],
        );
        let registry = Arc::new(ModelRegistry::new(RoutingStrategy::Priority, fallbacks));
        registry.register(
            instance_config("blocked", "blocked-model", 1, 1),
            Arc::new(NullProvider),
            3,
            Duration::from_secs(30),
        );
        registry.register(
            instance_config("alt", "claude-3-sonnet", 1, 1),
            Arc::new(NullProvider),
            3,
            Duration::from_secs(30),
        );

        let mut key = KeyRecord::master();
        key.blocked_models = vec!["blocked-model".to_string()];

        let routed = registry.select("gpt-4", Some(&key)).unwrap();
        assert_eq!(routed.resolved_model, "claude-3-sonnet");
    }

    #[test]
    fn weighted_strategy_distributes_by_weight() {
        let registry = registry_with(
            RoutingStrategy::Weighted,
            HashMap::new(),
            vec![
                instance_config("heavy", "gpt-4", 1, 3),
                instance_config("light", "gpt-4", 1, 1),
            ],
        );
        let mut heavy = 0;
        for _ in 0..8 {
            let routed = registry.select("gpt-4", None).unwrap();
            if routed.guard.instance().id() == "heavy" {
                heavy += 1;
            }
        }
        assert_eq!(heavy, 6);
    }
}
