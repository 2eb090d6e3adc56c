/// Runtime configuration for JWT verification.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Expected issuer claim (iss).
    pub issuer: String,
    /// Expected audience claim (aud). The token's audience set must contain it.
    pub audience: String,
    /// Allowable clock skew in seconds when validating exp/nbf.
    pub leeway_seconds: u32,
    /// Shared secret for short internal HS256 tokens, when issued.
    pub hs256_secret: Option<String>,
    /// Tokens at or below this length may take the HS256 path.
    pub hs256_max_token_len: usize,
}

impl JwtConfig {
    /// Construct config with sensible defaults (30 second leeway, no HS256).
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            leeway_seconds: 30,
            hs256_secret: None,
            hs256_max_token_len: 500,
        }
    }

    /// Adjust the allowed leeway.
    pub fn with_leeway(mut self, seconds: u32) -> Self {
        self.leeway_seconds = seconds;
        self
    }

    /// Enable the internal HS256 token path.
    pub fn with_hs256_secret(mut self, secret: impl Into<String>) -> Self {
        self.hs256_secret = Some(secret.into());
        self
    }
}
