use jsonwebtoken::DecodingKey;
use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

use crate::error::{AuthError, AuthResult};

#[derive(Clone)]
pub struct JwksFetcher {
    client: Client,
    url: String,
}

impl JwksFetcher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the full JWKS document and parse every usable RS256 key.
    ///
    /// Individual entries that are malformed or unsupported are logged and
    /// skipped; the fetch only fails when the document itself is unreachable
    /// or unparseable.
    pub async fn fetch(&self) -> AuthResult<Vec<(String, DecodingKey)>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| AuthError::JwksFetch(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::JwksFetch(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }

        let body: JwksResponse = response
            .json()
            .await
            .map_err(|err| AuthError::JwksDecode(err.to_string()))?;

        let mut keys = Vec::new();
        for entry in body.keys.into_iter() {
            match parse_entry(entry) {
                Ok(parsed) => keys.push(parsed),
                Err(err) => {
                    warn!(error = %err, jwks_url = %self.url, "Skipping unusable JWKS entry");
                }
            }
        }

        Ok(keys)
    }
}

fn parse_entry(entry: JwkEntry) -> AuthResult<(String, DecodingKey)> {
    let kid = entry
        .kid
        .ok_or_else(|| AuthError::JwksDecode("entry missing kid".into()))?;
    let kty = entry.kty.unwrap_or_else(|| "RSA".to_string());
    if kty != "RSA" {
        return Err(AuthError::KeyParse(kid, format!("unsupported kty '{kty}'")));
    }
    if let Some(alg) = entry.alg {
        if alg != "RS256" {
            return Err(AuthError::KeyParse(kid, format!("unsupported alg '{alg}'")));
        }
    }

    let modulus = entry
        .n
        .ok_or_else(|| AuthError::KeyParse(kid.clone(), "missing modulus".into()))?;
    let exponent = entry
        .e
        .ok_or_else(|| AuthError::KeyParse(kid.clone(), "missing exponent".into()))?;

    let decoding_key = DecodingKey::from_rsa_components(&modulus, &exponent)
        .map_err(|err| AuthError::KeyParse(kid.clone(), err.to_string()))?;
    Ok((kid, decoding_key))
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    kid: Option<String>,
    kty: Option<String>,
    alg: Option<String>,
    n: Option<String>,
    e: Option<String>,
}
