use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    requests: IntCounterVec,
    request_duration: HistogramVec,
    provider_latency: HistogramVec,
    auth_failures: IntCounterVec,
    rate_checks: IntCounterVec,
    rate_rejections: IntCounterVec,
    budget_denials: IntCounterVec,
    cache_lookups: IntCounterVec,
    usage_queue_depth: IntGauge,
    usage_events: IntCounterVec,
    instance_health: GaugeVec,
    instance_circuit_open: IntGaugeVec,
    instance_in_flight: IntGaugeVec,
    realtime_sessions: IntGauge,
    budget_check_latency: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("gateway_requests_total", "HTTP requests by path and status"),
            &["path", "status"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "End-to-end request latency",
            ),
            &["path"],
        )?;
        let provider_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_provider_latency_seconds",
                "Upstream provider call latency",
            ),
            &["provider", "model"],
        )?;
        let auth_failures = IntCounterVec::new(
            Opts::new("gateway_auth_failures_total", "Authentication failures by kind"),
            &["kind"],
        )?;
        let rate_checks = IntCounterVec::new(
            Opts::new("gateway_rate_limit_checks_total", "Total rate limit checks"),
            &["class"],
        )?;
        let rate_rejections = IntCounterVec::new(
            Opts::new(
                "gateway_rate_limit_rejections_total",
                "Total rate limit rejections",
            ),
            &["class"],
        )?;
        let budget_denials = IntCounterVec::new(
            Opts::new("gateway_budget_denials_total", "Budget pre-flight denials"),
            &["scope"],
        )?;
        let cache_lookups = IntCounterVec::new(
            Opts::new(
                "gateway_response_cache_lookups_total",
                "Response cache lookups grouped by result",
            ),
            &["result"],
        )?;
        let usage_queue_depth = IntGauge::with_opts(Opts::new(
            "gateway_usage_queue_depth",
            "Observed depth of the usage processing queue",
        ))?;
        let usage_events = IntCounterVec::new(
            Opts::new("gateway_usage_events_total", "Usage records by outcome"),
            &["outcome"],
        )?;
        let instance_health = GaugeVec::new(
            Opts::new(
                "gateway_instance_health_score",
                "Current health score per model instance",
            ),
            &["instance"],
        )?;
        let instance_circuit_open = IntGaugeVec::new(
            Opts::new(
                "gateway_instance_circuit_open",
                "Whether an instance circuit is open (1) or closed (0)",
            ),
            &["instance"],
        )?;
        let instance_in_flight = IntGaugeVec::new(
            Opts::new(
                "gateway_instance_in_flight",
                "In-flight upstream calls per instance",
            ),
            &["instance"],
        )?;
        let realtime_sessions = IntGauge::with_opts(Opts::new(
            "gateway_realtime_sessions",
            "Currently active realtime sessions",
        ))?;
        let budget_check_latency = Histogram::with_opts(HistogramOpts::new(
            "gateway_budget_check_seconds",
            "Time spent on pre-flight budget checks",
        ))?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(provider_latency.clone()))?;
        registry.register(Box::new(auth_failures.clone()))?;
        registry.register(Box::new(rate_checks.clone()))?;
        registry.register(Box::new(rate_rejections.clone()))?;
        registry.register(Box::new(budget_denials.clone()))?;
        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(usage_queue_depth.clone()))?;
        registry.register(Box::new(usage_events.clone()))?;
        registry.register(Box::new(instance_health.clone()))?;
        registry.register(Box::new(instance_circuit_open.clone()))?;
        registry.register(Box::new(instance_in_flight.clone()))?;
        registry.register(Box::new(realtime_sessions.clone()))?;
        registry.register(Box::new(budget_check_latency.clone()))?;

        Ok(Self {
            registry,
            requests,
            request_duration,
            provider_latency,
            auth_failures,
            rate_checks,
            rate_rejections,
            budget_denials,
            cache_lookups,
            usage_queue_depth,
            usage_events,
            instance_health,
            instance_circuit_open,
            instance_in_flight,
            realtime_sessions,
            budget_check_latency,
        })
    }

    pub fn record_request(&self, path: &str, status: u16, duration_secs: f64) {
        self.requests
            .with_label_values(&[path, &status.to_string()])
            .inc();
        self.request_duration
            .with_label_values(&[path])
            .observe(duration_secs);
    }

    pub fn observe_provider_latency(&self, provider: &str, model: &str, secs: f64) {
        self.provider_latency
            .with_label_values(&[provider, model])
            .observe(secs);
    }

    pub fn record_auth_failure(&self, kind: &str) {
        self.auth_failures.with_label_values(&[kind]).inc();
    }

    pub fn record_rate_check(&self, class: &str, allowed: bool) {
        self.rate_checks.with_label_values(&[class]).inc();
        if !allowed {
            self.rate_rejections.with_label_values(&[class]).inc();
        }
    }

    pub fn record_budget_denial(&self, scope: &str) {
        self.budget_denials.with_label_values(&[scope]).inc();
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups.with_label_values(&[result]).inc();
    }

    pub fn set_usage_queue_depth(&self, depth: usize) {
        self.usage_queue_depth.set(depth as i64);
    }

    pub fn record_usage_event(&self, outcome: &str) {
        self.usage_events.with_label_values(&[outcome]).inc();
    }

    pub fn set_instance_health(&self, instance: &str, score: f64, circuit_open: bool, in_flight: u32) {
        self.instance_health
            .with_label_values(&[instance])
            .set(score);
        self.instance_circuit_open
            .with_label_values(&[instance])
            .set(i64::from(circuit_open));
        self.instance_in_flight
            .with_label_values(&[instance])
            .set(in_flight as i64);
    }

    pub fn set_realtime_sessions(&self, count: usize) {
        self.realtime_sessions.set(count as i64);
    }

    pub fn observe_budget_check_latency(&self, secs: f64) {
        self.budget_check_latency.observe(secs);
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
