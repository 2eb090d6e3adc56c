use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

/// Cacheability gate: only deterministic, non-streaming generations
/// qualify. `temperature=0` is the only regime where identical inputs
/// yield identical tokens across attempts.
pub fn is_cacheable_body(body: &Value) -> bool {
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if stream {
        return false;
    }
    match body.get("temperature") {
        Some(value) => value.as_f64() == Some(0.0),
        None => false,
    }
}

/// Fingerprint over method, path, the canonicalized body and the caller's
/// authorization digest. `user` and `timestamp` fields are stripped so
/// client-side request tagging does not defeat the cache.
pub fn fingerprint(method: &str, path: &str, body: &Value, auth_digest: &str) -> String {
    let mut canonical = body.clone();
    if let Some(map) = canonical.as_object_mut() {
        map.remove("user");
        map.remove("timestamp");
    }
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"|");
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(auth_digest.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
    /// Unix seconds at store time; drives the `Age` header.
    pub stored_at: i64,
}

impl CachedResponse {
    pub fn age_secs(&self) -> u64 {
        (Utc::now().timestamp() - self.stored_at).max(0) as u64
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(value: redis::RedisError) -> Self {
        Self::Backend(value.to_string())
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError>;
    async fn put(
        &self,
        key: &str,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<(), CacheError>;
    async fn clear(&self) -> Result<(), CacheError>;
}

// ---------------- Redis Implementation ----------------

const REDIS_PREFIX: &str = "llm:cache:";

#[derive(Clone)]
pub struct RedisCacheStore {
    manager: ConnectionManager,
}

impl RedisCacheStore {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(format!("{REDIS_PREFIX}{key}"))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &str,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let raw = serde_json::to_string(&response)
            .map_err(|err| CacheError::Backend(err.to_string()))?;
        let _: () = redis::cmd("SETEX")
            .arg(format!("{REDIS_PREFIX}{key}"))
            .arg(ttl.as_secs().max(1))
            .arg(raw)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{REDIS_PREFIX}*"))
            .query_async(&mut conn)
            .await?;
        if !keys.is_empty() {
            let _: () = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        }
        Ok(())
    }
}

// ---------------- In-Memory Implementation ----------------

#[derive(Default)]
pub struct InMemoryCacheStore {
    inner: Mutex<HashMap<String, (CachedResponse, std::time::Instant)>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError> {
        let guard = self.inner.lock().await;
        Ok(guard.get(key).and_then(|(response, deadline)| {
            if std::time::Instant::now() < *deadline {
                Some(response.clone())
            } else {
                None
            }
        }))
    }

    async fn put(
        &self,
        key: &str,
        response: CachedResponse,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut guard = self.inner.lock().await;
        guard.insert(key.to_string(), (response, std::time::Instant::now() + ttl));
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.inner.lock().await.clear();
        Ok(())
    }
}

// ---------------- Front ----------------

/// Fingerprint-keyed cache of responses to deterministic requests.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    enabled: bool,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, enabled: bool, ttl: Duration) -> Self {
        Self {
            store,
            enabled,
            ttl,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn lookup(&self, key: &str) -> Option<CachedResponse> {
        if !self.enabled {
            return None;
        }
        match self.store.get(key).await {
            Ok(hit) => hit,
            Err(err) => {
                warn!(error = %err, "Response cache lookup failed");
                None
            }
        }
    }

    /// Store a completed response if it qualifies: status 200, not an
    /// event stream, and the body carries no `error` field.
    pub async fn store(&self, key: &str, status: u16, content_type: &str, body: &[u8]) {
        if !self.enabled || status != 200 {
            return;
        }
        if content_type.starts_with("text/event-stream") {
            return;
        }
        let Ok(text) = std::str::from_utf8(body) else {
            return;
        };
        if let Ok(parsed) = serde_json::from_str::<Value>(text) {
            if parsed.get("error").is_some() {
                return;
            }
        }
        let response = CachedResponse {
            status,
            content_type: content_type.to_string(),
            body: text.to_string(),
            stored_at: Utc::now().timestamp(),
        };
        if let Err(err) = self.store.put(key, response, self.ttl).await {
            warn!(error = %err, "Response cache store failed");
        }
    }

    pub async fn clear(&self) {
        if let Err(err) = self.store.clear().await {
            warn!(error = %err, "Response cache clear failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn streaming_and_nonzero_temperature_are_uncacheable() {
        assert!(!is_cacheable_body(&json!({"stream": true, "temperature": 0})));
        assert!(!is_cacheable_body(&json!({"temperature": 0.7})));
        assert!(!is_cacheable_body(&json!({"model": "gpt-4"})));
        assert!(is_cacheable_body(&json!({"stream": false, "temperature": 0})));
        assert!(is_cacheable_body(&json!({"temperature": 0.0})));
    }

    #[test]
    fn fingerprint_ignores_user_and_timestamp() {
        let a = json!({"model": "gpt-4", "messages": [], "user": "alice", "timestamp": 1});
        let b = json!({"model": "gpt-4", "messages": [], "user": "bob"});
        let c = json!({"model": "gpt-4o", "messages": []});
        let fp_a = fingerprint("POST", "/v1/chat/completions", &a, "digest");
        let fp_b = fingerprint("POST", "/v1/chat/completions", &b, "digest");
        let fp_c = fingerprint("POST", "/v1/chat/completions", &c, "digest");
        assert_eq!(fp_a, fp_b);
        assert_ne!(fp_a, fp_c);
    }

    #[test]
    fn fingerprint_is_per_credential() {
        let body = json!({"model": "gpt-4"});
        let a = fingerprint("POST", "/v1/chat/completions", &body, "digest-a");
        let b = fingerprint("POST", "/v1/chat/completions", &body, "digest-b");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn error_bodies_are_not_stored() {
        let cache = ResponseCache::new(
            Arc::new(InMemoryCacheStore::new()),
            true,
            Duration::from_secs(300),
        );
        cache
            .store("fp", 200, "application/json", br#"{"error":{"message":"x"}}"#)
            .await;
        assert!(cache.lookup("fp").await.is_none());
    }

    #[tokio::test]
    async fn event_streams_are_never_stored() {
        let cache = ResponseCache::new(
            Arc::new(InMemoryCacheStore::new()),
            true,
            Duration::from_secs(300),
        );
        cache.store("fp", 200, "text/event-stream", b"data: {}").await;
        assert!(cache.lookup("fp").await.is_none());
    }

    #[tokio::test]
    async fn hit_round_trip() {
        let cache = ResponseCache::new(
            Arc::new(InMemoryCacheStore::new()),
            true,
            Duration::from_secs(300),
        );
        cache
            .store("fp", 200, "application/json", br#"{"id":"chatcmpl-1"}"#)
            .await;
        let hit = cache.lookup("fp").await.unwrap();
        assert_eq!(hit.status, 200);
        assert!(hit.body.contains("chatcmpl-1"));
    }

    #[tokio::test]
    async fn disabled_cache_never_hits() {
        let cache = ResponseCache::new(
            Arc::new(InMemoryCacheStore::new()),
            false,
            Duration::from_secs(300),
        );
        cache
            .store("fp", 200, "application/json", br#"{"id":"x"}"#)
            .await;
        assert!(cache.lookup("fp").await.is_none());
    }
}
