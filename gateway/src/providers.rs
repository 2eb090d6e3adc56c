use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

use crate::config::ModelInstanceConfig;

/// Operations the gateway can dispatch upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderOp {
    Chat,
    /// Legacy completions; OpenAI-compatible upstreams keep a separate path.
    Completions,
    Embeddings,
    ImagesGenerations,
    ImagesEdits,
    ImagesVariations,
    AudioTranscriptions,
    AudioTranslations,
    AudioSpeech,
    Moderations,
}

#[derive(Debug, Clone)]
pub enum ProviderBody {
    Json(Value),
    /// Raw pass-through for multipart/binary endpoints (audio, image edits).
    Raw { bytes: Vec<u8>, content_type: String },
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub op: ProviderOp,
    pub body: ProviderBody,
    pub stream: bool,
    pub timeout: Duration,
}

pub enum ProviderResponse {
    Json(Value),
    /// The upstream response is consumed as a byte stream (SSE or binary).
    Stream(reqwest::Response),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider call timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("operation not supported by provider '{0}'")]
    Unsupported(&'static str),
}

impl ProviderError {
    /// Upstream 4xx responses are the caller's fault and carry no health
    /// signal; everything else counts against the instance.
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            ProviderError::Upstream { status, .. } if (400..500).contains(status)
        ) || matches!(self, ProviderError::Unsupported(_))
    }
}

/// Token counts reported by an upstream response body. Streaming responses
/// usually omit them; those are estimated by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Pull usage out of an OpenAI- or Anthropic-shaped response body.
pub fn extract_usage(body: &Value) -> Option<TokenUsage> {
    let usage = body.get("usage")?;
    let input = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))?
        .as_u64()? as u32;
    let output = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    Some(TokenUsage {
        input_tokens: input,
        output_tokens: output,
    })
}

/// Rough prompt-size estimate for pre-flight budget checks: one token per
/// four characters of JSON payload.
pub fn estimate_tokens(body: &Value) -> u32 {
    (body.to_string().len() / 4) as u32
}

/// Minimal upstream capability. Everything vendor-specific stays inside
/// the adapter.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    async fn chat(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;
    async fn embeddings(&self, request: ProviderRequest)
        -> Result<ProviderResponse, ProviderError>;
    async fn images(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;
    async fn audio(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;
    async fn moderations(
        &self,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError>;
    async fn health_probe(&self) -> Result<(), ProviderError>;
}

/// Route an operation to the matching capability.
pub async fn invoke(
    provider: &Arc<dyn Provider>,
    request: ProviderRequest,
) -> Result<ProviderResponse, ProviderError> {
    match request.op {
        ProviderOp::Chat | ProviderOp::Completions => provider.chat(request).await,
        ProviderOp::Embeddings => provider.embeddings(request).await,
        ProviderOp::ImagesGenerations | ProviderOp::ImagesEdits | ProviderOp::ImagesVariations => {
            provider.images(request).await
        }
        ProviderOp::AudioTranscriptions
        | ProviderOp::AudioTranslations
        | ProviderOp::AudioSpeech => provider.audio(request).await,
        ProviderOp::Moderations => provider.moderations(request).await,
    }
}

// ---------------- OpenAI-compatible adapter ----------------

pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: Client::new(),
        }
    }

    fn path_for(op: ProviderOp) -> &'static str {
        match op {
            ProviderOp::Chat => "/chat/completions",
            ProviderOp::Completions => "/completions",
            ProviderOp::Embeddings => "/embeddings",
            ProviderOp::ImagesGenerations => "/images/generations",
            ProviderOp::ImagesEdits => "/images/edits",
            ProviderOp::ImagesVariations => "/images/variations",
            ProviderOp::AudioTranscriptions => "/audio/transcriptions",
            ProviderOp::AudioTranslations => "/audio/translations",
            ProviderOp::AudioSpeech => "/audio/speech",
            ProviderOp::Moderations => "/moderations",
        }
    }

    async fn post(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}{}", self.base_url, Self::path_for(request.op));
        let mut builder = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(request.timeout);

        builder = match request.body {
            ProviderBody::Json(body) => builder.json(&body),
            ProviderBody::Raw {
                bytes,
                content_type,
            } => builder
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes),
        };

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let is_stream = request.stream
            || response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.starts_with("text/event-stream"))
                .unwrap_or(false);
        if is_stream {
            return Ok(ProviderResponse::Stream(response));
        }
        if matches!(request.op, ProviderOp::AudioSpeech) {
            // Binary audio out; hand the stream through untouched.
            return Ok(ProviderResponse::Stream(response));
        }

        let body = response.json::<Value>().await.map_err(map_reqwest_error)?;
        Ok(ProviderResponse::Json(body))
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.post(request).await
    }

    async fn embeddings(
        &self,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        self.post(request).await
    }

    async fn images(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.post(request).await
    }

    async fn audio(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.post(request).await
    }

    async fn moderations(
        &self,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        self.post(request).await
    }

    async fn health_probe(&self) -> Result<(), ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if response.status().is_server_error() {
            return Err(ProviderError::Upstream {
                status: response.status().as_u16(),
                body: String::new(),
            });
        }
        Ok(())
    }
}

// ---------------- Anthropic adapter ----------------

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let url = format!("{}/messages", self.base_url);
        let ProviderBody::Json(body) = request.body else {
            return Err(ProviderError::Unsupported("anthropic"));
        };
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        if request.stream {
            return Ok(ProviderResponse::Stream(response));
        }
        let body = response.json::<Value>().await.map_err(map_reqwest_error)?;
        Ok(ProviderResponse::Json(body))
    }

    async fn embeddings(&self, _: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::Unsupported("anthropic"))
    }

    async fn images(&self, _: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::Unsupported("anthropic"))
    }

    async fn audio(&self, _: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::Unsupported("anthropic"))
    }

    async fn moderations(&self, _: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::Unsupported("anthropic"))
    }

    async fn health_probe(&self) -> Result<(), ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if response.status().is_server_error() {
            return Err(ProviderError::Upstream {
                status: response.status().as_u16(),
                body: String::new(),
            });
        }
        Ok(())
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(err.to_string())
    }
}

/// Build an adapter from one instance's configuration.
pub fn build_provider(config: &ModelInstanceConfig) -> Arc<dyn Provider> {
    let api_key = config.api_key.clone().unwrap_or_default();
    match config.provider.as_str() {
        "anthropic" => {
            let base = config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com/v1".into());
            Arc::new(AnthropicProvider::new(base, api_key))
        }
        name => {
            let base = config
                .api_base
                .clone()
                .unwrap_or_else(|| default_base_url(name));
            Arc::new(OpenAiCompatProvider::new(name, base, api_key))
        }
    }
}

fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openai" => "https://api.openai.com/v1".into(),
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "fireworks" => "https://api.fireworks.ai/inference/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        _ => format!("https://api.{provider_name}.com/v1"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn usage_extraction_handles_both_vendors() {
        let openai = json!({"usage": {"prompt_tokens": 12, "completion_tokens": 34}});
        let anthropic = json!({"usage": {"input_tokens": 5, "output_tokens": 7}});
        let usage = extract_usage(&openai).unwrap();
        assert_eq!((usage.input_tokens, usage.output_tokens), (12, 34));
        let usage = extract_usage(&anthropic).unwrap();
        assert_eq!((usage.input_tokens, usage.output_tokens), (5, 7));
        assert!(extract_usage(&json!({})).is_none());
    }

    #[test]
    fn upstream_4xx_is_caller_fault() {
        let err = ProviderError::Upstream { status: 403, body: String::new() };
        assert!(err.is_caller_fault());
        let err = ProviderError::Upstream { status: 502, body: String::new() };
        assert!(!err.is_caller_fault());
        assert!(!ProviderError::Timeout.is_caller_fault());
    }

    #[test]
    fn token_estimate_scales_with_payload() {
        let small = estimate_tokens(&json!({"messages": "hi"}));
        let large = estimate_tokens(&json!({"messages": "hi".repeat(400)}));
        assert!(large > small);
    }

    #[test]
    fn known_providers_get_default_bases() {
        assert_eq!(default_base_url("openai"), "https://api.openai.com/v1");
        assert!(default_base_url("groq").contains("groq"));
    }
}
