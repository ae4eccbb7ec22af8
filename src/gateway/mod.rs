//! Model Call Gateway: the single choke-point for all model requests.
//!
//! Grounded in `AnthropicClient::complete` composed with the Cache Layer,
//! Rate Limiter and Retry Envelope modules — the pattern `BatchExecutor`/
//! `TrackedClient` already hint at (cost tracking + rate limiting +
//! retries around a single client call), unified here into one path.
//! Cache consultation for `grade_batch` is performed by the caller (the
//! `grade_batch` stage), since only that stage holds the typed
//! `ScoringPointResult` artifact the semantic cache stores; the gateway
//! itself handles fingerprinting inputs, rate limiting, retrying and
//! event emission.

pub mod client;
pub mod types;

use std::sync::Arc;

use serde_json::json;

use crate::error::{Error, Result};
use crate::events::{EventLog, EventType};
use crate::ratelimit::{global_key, model_api_key, RateLimiter};
use crate::retry::{retry_with, RetryConfig};

pub use client::{AnthropicVlmClient, ClientConfig, VlmClient};
pub use types::{GatewayRequest, GatewayResponse, ImageRef, ModelPricing, Provider, RequestKind, TokenUsage};

/// Per-run cancellation check, injected by the orchestrator so the gateway
/// never has to know about run state directly.
pub type CancellationCheck = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct ModelGateway {
    client: Arc<dyn VlmClient>,
    rate_limiter: Arc<RateLimiter>,
    retry_config: RetryConfig,
    rate_limit_max: u64,
    rate_limit_window_secs: u64,
}

impl ModelGateway {
    pub fn new(
        client: Arc<dyn VlmClient>,
        rate_limiter: Arc<RateLimiter>,
        retry_config: RetryConfig,
        rate_limit_max: u64,
        rate_limit_window_secs: u64,
    ) -> Self {
        Self {
            client,
            rate_limiter,
            retry_config,
            rate_limit_max,
            rate_limit_window_secs,
        }
    }

    /// `call_model(request) -> response`: cancellation check, rate-limit
    /// acquire, retry-wrapped remote call (cache check is the caller's
    /// responsibility, see module docs). Cancellation is checked once
    /// before acquiring rate-limit tokens and once more before the
    /// remote call actually fires.
    pub async fn call_model(
        &self,
        request: GatewayRequest,
        events: &EventLog,
        is_cancelled: &CancellationCheck,
    ) -> Result<GatewayResponse> {
        if is_cancelled() {
            return Err(Error::internal("cancelled before gateway call"));
        }

        events.emit(
            EventType::StageStarted,
            json!({ "node_id": request.node_id, "kind": format!("{:?}", request.kind) }),
        );

        let client = self.client.clone();
        let limiter = self.rate_limiter.clone();
        let max = self.rate_limit_max;
        let window = self.rate_limit_window_secs;
        let req = request.clone();

        let result = retry_with(
            &self.retry_config,
            move || {
                let client = client.clone();
                let limiter = limiter.clone();
                let req = req.clone();
                async move {
                    if !limiter.acquire(model_api_key(), max, window)
                        || !limiter.acquire(global_key(), max, window)
                    {
                        return Err(Error::transient_remote(
                            "rate_limiter",
                            "token bucket exhausted, backing off via retry envelope",
                        ));
                    }
                    client.call_remote(&req).await
                }
            },
            |outcome| {
                events.emit(
                    EventType::LlmStreamChunk,
                    json!({
                        "node_id": request.node_id,
                        "attempt": outcome.attempt,
                        "succeeded": outcome.succeeded,
                        "error": outcome.error,
                    }),
                );
            },
            None::<fn() -> GatewayResponse>,
        )
        .await;

        if is_cancelled() {
            return Err(Error::internal("cancelled during gateway call"));
        }

        result
    }
}
