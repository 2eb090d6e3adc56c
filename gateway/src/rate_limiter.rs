use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Endpoint classes with independent fixed-window limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Chat,
    Completions,
    Embeddings,
    Global,
}

impl EndpointClass {
    pub fn from_path(path: &str) -> Self {
        match path {
            "/v1/chat/completions" | "/v1/messages" => EndpointClass::Chat,
            "/v1/completions" => EndpointClass::Completions,
            "/v1/embeddings" => EndpointClass::Embeddings,
            _ => EndpointClass::Global,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Chat => "chat",
            EndpointClass::Completions => "completions",
            EndpointClass::Embeddings => "embeddings",
            EndpointClass::Global => "global",
        }
    }
}

/// Paths that never count against a window.
pub fn is_exempt_path(path: &str) -> bool {
    matches!(path, "/health" | "/ready" | "/metrics")
        || path.starts_with("/docs")
        || path.starts_with("/static")
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub current: i64,
    pub limit: u32,
    /// Seconds until the current window resets.
    pub reset_secs: u64,
}

impl RateDecision {
    pub fn remaining(&self) -> i64 {
        (self.limit as i64 - self.current).max(0)
    }
}

#[async_trait]
pub trait RateLimiterEngine: Send + Sync {
    async fn check(&self, key: &str, limit: u32) -> Result<RateDecision>;
}

pub type RateLimiter = Arc<dyn RateLimiterEngine>;

// ---------------- Redis Implementation ----------------

#[derive(Clone)]
pub struct RedisRateLimiter {
    manager: ConnectionManager,
    window_secs: u64,
    prefix: String,
}

impl RedisRateLimiter {
    pub fn new(manager: ConnectionManager, window_secs: u64, prefix: String) -> Self {
        Self {
            manager,
            window_secs,
            prefix,
        }
    }

    pub async fn connect(redis_url: &str, window_secs: u64, prefix: String) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager")?;
        Ok(Self::new(manager, window_secs, prefix))
    }
}

#[async_trait]
impl RateLimiterEngine for RedisRateLimiter {
    async fn check(&self, key: &str, limit: u32) -> Result<RateDecision> {
        let redis_key = format!("{}:{}", self.prefix, key);
        let mut conn = self.manager.clone();
        let current: i64 = conn.incr(&redis_key, 1).await?;
        if current == 1 {
            let _: () = conn.expire(&redis_key, self.window_secs as i64).await?;
        }
        let ttl: i64 = conn.ttl(&redis_key).await?;
        Ok(RateDecision {
            allowed: current <= limit as i64,
            current,
            limit,
            reset_secs: if ttl > 0 { ttl as u64 } else { self.window_secs },
        })
    }
}

// ---------------- In-Memory Implementation ----------------

#[derive(Clone)]
pub struct InMemoryRateLimiter {
    inner: Arc<Mutex<HashMap<String, (i64, Instant)>>>,
    window_secs: u64,
}

impl InMemoryRateLimiter {
    pub fn new(window_secs: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window_secs,
        }
    }
}

#[async_trait]
impl RateLimiterEngine for InMemoryRateLimiter {
    async fn check(&self, key: &str, limit: u32) -> Result<RateDecision> {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        let window = std::time::Duration::from_secs(self.window_secs);
        let entry = guard.entry(key.to_string()).or_insert((0, now));
        if now.duration_since(entry.1) >= window {
            *entry = (0, now);
        }
        entry.0 += 1;
        let elapsed = now.duration_since(entry.1).as_secs();
        Ok(RateDecision {
            allowed: entry.0 <= limit as i64,
            current: entry.0,
            limit,
            reset_secs: self.window_secs.saturating_sub(elapsed).max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_selection_by_path() {
        assert_eq!(
            EndpointClass::from_path("/v1/chat/completions"),
            EndpointClass::Chat
        );
        assert_eq!(
            EndpointClass::from_path("/v1/messages"),
            EndpointClass::Chat
        );
        assert_eq!(
            EndpointClass::from_path("/v1/completions"),
            EndpointClass::Completions
        );
        assert_eq!(
            EndpointClass::from_path("/v1/embeddings"),
            EndpointClass::Embeddings
        );
        assert_eq!(EndpointClass::from_path("/v1/models"), EndpointClass::Global);
    }

    #[test]
    fn operational_paths_are_exempt() {
        assert!(is_exempt_path("/health"));
        assert!(is_exempt_path("/metrics"));
        assert!(is_exempt_path("/docs/index.html"));
        assert!(!is_exempt_path("/v1/chat/completions"));
    }

    #[tokio::test]
    async fn window_rolls_over_counts() {
        let limiter = InMemoryRateLimiter::new(60);
        for n in 1..=3 {
            let decision = limiter.check("key:abc:chat", 3).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.current, n);
        }
        let decision = limiter.check("key:abc:chat", 3).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_count_separately() {
        let limiter = InMemoryRateLimiter::new(60);
        limiter.check("key:a:chat", 5).await.unwrap();
        let decision = limiter.check("key:b:chat", 5).await.unwrap();
        assert_eq!(decision.current, 1);
    }
}
