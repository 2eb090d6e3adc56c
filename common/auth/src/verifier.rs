use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use tracing::{debug, warn};

use crate::claims::Claims;
use crate::config::JwtConfig;
use crate::error::{AuthError, AuthResult};
use crate::jwks::JwksFetcher;

/// A full JWKS refetch is forced when the last one is older than this,
/// even if the requested kid is present.
const MAX_KEY_AGE: Duration = Duration::from_secs(3600);

/// Thread-safe store for decoding keys loaded from JWKS sources.
#[derive(Clone, Default)]
pub struct InMemoryKeyStore {
    inner: Arc<RwLock<KeyStoreInner>>,
}

#[derive(Default)]
struct KeyStoreInner {
    keys: HashMap<String, DecodingKey>,
    last_refresh: Option<Instant>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_key(&self, kid: impl Into<String>, key: DecodingKey) {
        let mut guard = self.inner.write().expect("rwlock poisoned");
        guard.keys.insert(kid.into(), key);
    }

    pub fn get(&self, kid: &str) -> Option<DecodingKey> {
        let guard = self.inner.read().expect("rwlock poisoned");
        guard.keys.get(kid).cloned()
    }

    pub fn contains(&self, kid: &str) -> bool {
        let guard = self.inner.read().expect("rwlock poisoned");
        guard.keys.contains_key(kid)
    }

    pub fn is_stale(&self) -> bool {
        let guard = self.inner.read().expect("rwlock poisoned");
        match guard.last_refresh {
            Some(at) => at.elapsed() > MAX_KEY_AGE,
            None => true,
        }
    }

    /// Replace the key set. An empty replacement is ignored so the store
    /// never goes empty after its first successful fetch.
    pub fn replace_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, DecodingKey)>,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        let mut guard = self.inner.write().expect("rwlock poisoned");
        guard.last_refresh = Some(Instant::now());
        if entries.is_empty() && !guard.keys.is_empty() {
            return;
        }
        guard.keys.clear();
        for (kid, key) in entries {
            guard.keys.insert(kid, key);
        }
    }
}

#[derive(Clone)]
pub struct JwtVerifier {
    config: JwtConfig,
    store: InMemoryKeyStore,
    jwks: Option<JwksFetcher>,
}

impl JwtVerifier {
    pub fn new(config: JwtConfig) -> Self {
        Self {
            config,
            store: InMemoryKeyStore::new(),
            jwks: None,
        }
    }

    pub fn builder(config: JwtConfig) -> JwtVerifierBuilder {
        JwtVerifierBuilder::new(config)
    }

    pub fn config(&self) -> &JwtConfig {
        &self.config
    }

    pub fn store(&self) -> &InMemoryKeyStore {
        &self.store
    }

    pub fn jwks_fetcher(&self) -> Option<&JwksFetcher> {
        self.jwks.as_ref()
    }

    /// Verify a token and return its claims.
    ///
    /// RS256 tokens resolve their key by `kid`; a miss (or a key set older
    /// than an hour) triggers one inline JWKS refetch before giving up.
    /// Short tokens signed with the configured shared secret take the HS256
    /// path and need no `kid`.
    pub async fn verify(&self, token: &str) -> AuthResult<Claims> {
        let header =
            decode_header(token).map_err(|err| AuthError::InvalidHeader(err.to_string()))?;

        match header.alg {
            Algorithm::HS256 => self.verify_hs256(token),
            Algorithm::RS256 => {
                let kid = header.kid.ok_or(AuthError::MissingKeyId)?;
                self.verify_rs256(token, &kid).await
            }
            other => Err(AuthError::UnsupportedAlgorithm(format!("{other:?}"))),
        }
    }

    fn verify_hs256(&self, token: &str) -> AuthResult<Claims> {
        let secret = self
            .config
            .hs256_secret
            .as_deref()
            .ok_or_else(|| AuthError::UnsupportedAlgorithm("HS256".into()))?;
        if token.len() > self.config.hs256_max_token_len {
            return Err(AuthError::Tampered("HS256 token too long".into()));
        }
        let key = DecodingKey::from_secret(secret.as_bytes());
        self.decode_with(token, &key, Algorithm::HS256)
    }

    async fn verify_rs256(&self, token: &str, kid: &str) -> AuthResult<Claims> {
        if self.store.get(kid).is_none() || self.store.is_stale() {
            self.refresh_jwks().await.unwrap_or_else(|err| {
                warn!(error = %err, kid, "JWKS refresh on key miss failed");
                0
            });
        }

        let key = self
            .store
            .get(kid)
            .ok_or_else(|| AuthError::UnknownKeyId(kid.to_string()))?;
        let claims = self.decode_with(token, &key, Algorithm::RS256)?;
        debug!(kid, "verified JWT successfully");
        Ok(claims)
    }

    fn decode_with(
        &self,
        token: &str,
        key: &DecodingKey,
        alg: Algorithm,
    ) -> AuthResult<Claims> {
        let mut validation = Validation::new(alg);
        validation.set_issuer(&[self.config.issuer.clone()]);
        validation.set_audience(&[self.config.audience.clone()]);
        validation.validate_nbf = true;
        validation.leeway = self.config.leeway_seconds.into();

        let token_data = decode::<Value>(token, key, &validation)?;
        Claims::try_from(token_data.claims)
    }

    pub async fn refresh_jwks(&self) -> AuthResult<usize> {
        let fetcher = match &self.jwks {
            Some(fetcher) => fetcher,
            None => return Ok(0),
        };

        let keys = fetcher.fetch().await?;
        let count = keys.len();
        self.store.replace_all(keys);
        Ok(count)
    }
}

pub struct JwtVerifierBuilder {
    config: JwtConfig,
    store: InMemoryKeyStore,
    jwks: Option<JwksFetcher>,
}

impl JwtVerifierBuilder {
    fn new(config: JwtConfig) -> Self {
        Self {
            config,
            store: InMemoryKeyStore::new(),
            jwks: None,
        }
    }

    pub fn with_store(mut self, store: InMemoryKeyStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_decoding_key(self, kid: impl Into<String>, key: DecodingKey) -> Self {
        self.store.insert_key(kid, key);
        self
    }

    pub fn with_jwks_url(mut self, url: impl Into<String>) -> Self {
        self.jwks = Some(JwksFetcher::new(url));
        self
    }

    pub fn with_jwks_fetcher(mut self, fetcher: JwksFetcher) -> Self {
        self.jwks = Some(fetcher);
        self
    }

    /// Build the verifier, priming the key store when a JWKS source is
    /// configured. A failed initial fetch is logged, not fatal: the
    /// verifier refetches inline on the first kid miss.
    pub async fn build(self) -> AuthResult<JwtVerifier> {
        let verifier = JwtVerifier {
            config: self.config,
            store: self.store,
            jwks: self.jwks,
        };

        if verifier.jwks.is_some() {
            if let Err(err) = verifier.refresh_jwks().await {
                warn!(error = %err, "Initial JWKS fetch failed");
            }
        }

        Ok(verifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn hs_config() -> JwtConfig {
        JwtConfig::new("https://issuer.test", "gateway").with_hs256_secret("unit-test-secret")
    }

    fn sign_hs256(claims: serde_json::Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 600
    }

    #[tokio::test]
    async fn hs256_round_trip() {
        let verifier = JwtVerifier::new(hs_config());
        let token = sign_hs256(
            json!({
                "sub": "user-1",
                "iss": "https://issuer.test",
                "aud": "gateway",
                "email": "a@b.test",
                "groups": ["team-a"],
                "exp": future_exp(),
            }),
            "unit-test-secret",
        );
        let claims = verifier.verify(&token).await.unwrap();
        assert_eq!(claims.subject, "user-1");
        assert_eq!(claims.email.as_deref(), Some("a@b.test"));
        assert!(claims.in_group("team-a"));
    }

    #[tokio::test]
    async fn hs256_rejects_wrong_issuer() {
        let verifier = JwtVerifier::new(hs_config());
        let token = sign_hs256(
            json!({
                "sub": "user-1",
                "iss": "https://evil.test",
                "aud": "gateway",
                "exp": future_exp(),
            }),
            "unit-test-secret",
        );
        let err = verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::IssuerUntrusted(_)));
    }

    #[tokio::test]
    async fn hs256_rejects_expired() {
        let verifier = JwtVerifier::new(hs_config());
        let token = sign_hs256(
            json!({
                "sub": "user-1",
                "iss": "https://issuer.test",
                "aud": "gateway",
                "exp": chrono::Utc::now().timestamp() - 3600,
            }),
            "unit-test-secret",
        );
        let err = verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[tokio::test]
    async fn hs256_rejects_tampered_signature() {
        let verifier = JwtVerifier::new(hs_config());
        let token = sign_hs256(
            json!({
                "sub": "user-1",
                "iss": "https://issuer.test",
                "aud": "gateway",
                "exp": future_exp(),
            }),
            "some-other-secret",
        );
        let err = verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::Tampered(_)));
    }

    #[tokio::test]
    async fn rs256_without_kid_is_rejected() {
        let verifier = JwtVerifier::new(hs_config());
        // Header advertises RS256 but carries no kid.
        let bogus = "eyJhbGciOiJSUzI1NiIsInR5cCI6IkpXVCJ9.e30.sig";
        let err = verifier.verify(bogus).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingKeyId));
    }

    #[test]
    fn empty_replace_keeps_existing_keys() {
        let store = InMemoryKeyStore::new();
        store.replace_all(vec![(
            "kid-1".to_string(),
            DecodingKey::from_secret(b"x"),
        )]);
        store.replace_all(Vec::new());
        assert!(store.contains("kid-1"));
    }
}
