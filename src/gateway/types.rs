//! Gateway request/response types: the multimodal variant of a plain
//! text completion request/response (`llm/types.rs`), with an added
//! `images` field and a `kind` discriminant in place of provider/tier
//! routing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::RunId;

/// Which call site issued the request, used for cache-eligibility and
/// prompt selection. A plain enum in place of a multiple-inheritance
/// agent-class hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    RubricParse,
    PageDescribe,
    GradeBatch,
    CrossPageMerge,
    LogicReview,
    Confession,
}

impl RequestKind {
    /// Only `grade_batch` is cache-eligible, per the gateway flow contract.
    pub fn is_cache_eligible(self) -> bool {
        matches!(self, RequestKind::GradeBatch)
    }
}

/// Reference to a page image already decoded/fingerprinted by `preprocess`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    pub page_index: u32,
    pub fingerprint: String,
    /// Base64-encoded image bytes, or a content-addressed handle, depending
    /// on deployment; the core treats it as opaque.
    pub data_ref: String,
    pub media_type: String,
}

/// LLM provider backing the single multimodal reasoning model the gateway
/// is configured against. Kept as an enum (rather than a hardcoded single
/// value) because the HTTP client implementation differs per provider;
/// multi-provider load-balancing is out of scope, exactly one is
/// configured per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Anthropic,
    OpenAI,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenAI => write!(f, "openai"),
        }
    }
}

/// A request funnelled through the single gateway choke point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub run_id: RunId,
    pub node_id: String,
    pub kind: RequestKind,
    pub system: Option<String>,
    pub prompt: String,
    pub images: Vec<ImageRef>,
    pub cache_eligible: bool,
    pub rubric_fingerprint: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl GatewayRequest {
    pub fn new(run_id: RunId, node_id: impl Into<String>, kind: RequestKind, prompt: impl Into<String>) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            kind,
            system: None,
            prompt: prompt.into(),
            images: Vec::new(),
            cache_eligible: kind.is_cache_eligible(),
            rubric_fingerprint: None,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_images(mut self, images: Vec<ImageRef>) -> Self {
        self.images = images;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_rubric_fingerprint(mut self, fp: impl Into<String>) -> Self {
        self.rubric_fingerprint = Some(fp.into());
        self
    }
}

/// Input/output token counts for one model call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A response from the gateway, either synthesised from a cache hit or
/// from the remote model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub confidence: f64,
    pub from_cache: bool,
    pub timestamp: DateTime<Utc>,
}

/// Pricing for the single configured model, same shape as
/// `ModelSpec::calculate_cost`.
#[derive(Debug, Clone)]
pub struct ModelPricing {
    pub model_id: String,
    pub provider: Provider,
    pub input_cost_per_m: f64,
    pub output_cost_per_m: f64,
}

impl ModelPricing {
    pub fn calculate_cost(&self, usage: &TokenUsage) -> f64 {
        let input = (usage.input_tokens as f64 / 1_000_000.0) * self.input_cost_per_m;
        let output = (usage.output_tokens as f64 / 1_000_000.0) * self.output_cost_per_m;
        input + output
    }

    pub fn claude_sonnet_vision() -> Self {
        Self {
            model_id: "claude-3-5-sonnet-20241022".to_string(),
            provider: Provider::Anthropic,
            input_cost_per_m: 3.0,
            output_cost_per_m: 15.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_grade_batch_is_cache_eligible() {
        assert!(RequestKind::GradeBatch.is_cache_eligible());
        assert!(!RequestKind::RubricParse.is_cache_eligible());
        assert!(!RequestKind::Confession.is_cache_eligible());
    }

    #[test]
    fn pricing_matches_known_ratio() {
        let pricing = ModelPricing::claude_sonnet_vision();
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 500_000,
        };
        let cost = pricing.calculate_cost(&usage);
        assert!((cost - 10.5).abs() < 0.01);
    }
}
