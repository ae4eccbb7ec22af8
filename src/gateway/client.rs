//! Remote multimodal model client.
//!
//! Grounded directly in `AnthropicClient::complete` (`llm/client.rs`): same
//! HTTP request/response shape, same error-mapping and cost-calculation
//! style, same sandboxed-proxy-detection fallback for building the HTTP
//! client, generalized to send `images: Vec<ImageRef>` as Anthropic
//! image content blocks alongside the text block and to classify HTTP
//! failures into the crate's `Error` taxonomy instead of a single `LLM`
//! variant.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::types::{GatewayRequest, GatewayResponse, ModelPricing, Provider, TokenUsage};

/// Single choke-point trait for the remote call. One implementation is
/// wired up per deployment; multi-provider load-balancing is out of
/// scope.
#[async_trait]
pub trait VlmClient: Send + Sync {
    async fn call_remote(&self, request: &GatewayRequest) -> Result<GatewayResponse>;
    fn provider(&self) -> Provider;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub model_id: String,
    pub timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            model_id: model_id.into(),
            timeout_secs: 120,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Client {
    let timeout = Duration::from_secs(timeout_secs);

    // Some sandboxed macOS environments can panic during proxy auto-detection
    // in reqwest's default client builder. Fall back to no-proxy in that case.
    match catch_unwind(AssertUnwindSafe(|| Client::builder().timeout(timeout).build())) {
        Ok(Ok(client)) => client,
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .expect("failed to construct HTTP client"),
    }
}

/// Anthropic Claude client, extended to attach page images as content
/// blocks alongside the text prompt.
pub struct AnthropicVlmClient {
    config: ClientConfig,
    pricing: ModelPricing,
    http: Client,
}

impl AnthropicVlmClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(config: ClientConfig, pricing: ModelPricing) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, pricing, http }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
    Image { source: AnthropicImageSource },
}

#[derive(Debug, Serialize)]
struct AnthropicImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseContent>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponseContent {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    content_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

/// Classify an HTTP status into the crate's terminal/transient taxonomy.
fn classify_http_error(status: reqwest::StatusCode, message: String) -> Error {
    if status.as_u16() == 429 || status.is_server_error() {
        Error::transient_remote("anthropic", message)
    } else {
        Error::gateway(format!("anthropic API error ({status}): {message}"))
    }
}

#[async_trait]
impl VlmClient for AnthropicVlmClient {
    async fn call_remote(&self, request: &GatewayRequest) -> Result<GatewayResponse> {
        let mut content = vec![AnthropicContentBlock::Text {
            text: request.prompt.clone(),
        }];
        for image in &request.images {
            content.push(AnthropicContentBlock::Image {
                source: AnthropicImageSource {
                    kind: "base64",
                    media_type: image.media_type.clone(),
                    data: image.data_ref.clone(),
                },
            });
        }

        let api_request = AnthropicRequest {
            model: self.config.model_id.clone(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content,
            }],
            max_tokens: request.max_tokens.unwrap_or(4096),
            system: request.system.clone(),
            temperature: request.temperature,
        };

        let url = format!("{}/v1/messages", self.base_url());

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::transient_remote("anthropic", format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::transient_remote("anthropic", format!("failed to read response: {e}")))?;

        if !status.is_success() {
            let message = serde_json::from_str::<AnthropicError>(&body)
                .map(|e| format!("{}: {}", e.error.error_type, e.error.message))
                .unwrap_or(body);
            return Err(classify_http_error(status, message));
        }

        let api_response: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| Error::schema(format!("unparseable model response: {e}")))?;

        let text = api_response
            .content
            .iter()
            .filter_map(|c| c.text.as_ref())
            .cloned()
            .collect::<Vec<_>>()
            .join("");

        let usage = TokenUsage {
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
        };
        let cost_usd = self.pricing.calculate_cost(&usage);

        Ok(GatewayResponse {
            content: text,
            usage,
            cost_usd,
            confidence: 1.0,
            from_cache: false,
            timestamp: Utc::now(),
        })
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_status_classifies_as_transient() {
        let err = classify_http_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down".into());
        assert!(err.is_retryable());
    }

    #[test]
    fn server_error_status_classifies_as_transient() {
        let err = classify_http_error(reqwest::StatusCode::BAD_GATEWAY, "oops".into());
        assert!(err.is_retryable());
    }

    #[test]
    fn bad_request_status_is_terminal() {
        let err = classify_http_error(reqwest::StatusCode::BAD_REQUEST, "bad payload".into());
        assert!(!err.is_retryable());
    }
}
