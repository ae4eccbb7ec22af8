//! `rubric_parse`: invoke the gateway with `kind=rubric_parse`, expect a
//! structured `Rubric`, validate its invariants, retry once with a
//! stricter prompt on structural violation, and escalate to
//! `paused_rubric_review` on a second failure.

use serde_json::json;

use crate::error::Result;
use crate::events::{EventLog, EventType};
use crate::gateway::{CancellationCheck, GatewayRequest, ModelGateway, RequestKind};
use crate::run::{Rubric, RunId};

/// Outcome of a `rubric_parse` attempt: either a validated rubric, or a
/// signal that the run must pause for human review.
#[derive(Debug, Clone)]
pub enum RubricParseResult {
    Parsed { rubric: Rubric, confidence: f64 },
    NeedsReview { reason: String },
}

/// Parses the gateway's raw text response into a `Rubric`. Kept as an
/// injected function so the stage itself stays agnostic of the exact wire
/// format the model is prompted to emit (JSON, as enforced by `system`).
pub type RubricParser = fn(&str) -> std::result::Result<Rubric, String>;

pub fn parse_rubric_json(content: &str) -> std::result::Result<Rubric, String> {
    serde_json::from_str(content).map_err(|e| format!("unparseable rubric JSON: {e}"))
}

pub async fn rubric_parse(
    gateway: &ModelGateway,
    events: &EventLog,
    cancel: &CancellationCheck,
    run_id: RunId,
    prompt: &str,
    strict_prompt: &str,
    parser: RubricParser,
) -> Result<RubricParseResult> {
    for (attempt, prompt_text) in [prompt, strict_prompt].into_iter().enumerate() {
        let request = GatewayRequest::new(run_id, format!("rubric_parse:{attempt}"), RequestKind::RubricParse, prompt_text);
        let response = gateway.call_model(request, events, cancel).await?;

        match parser(&response.content) {
            Ok(rubric) => {
                if let Err(violation) = rubric.validate() {
                    events.emit(
                        EventType::Error,
                        json!({ "stage": "rubric_parse", "attempt": attempt, "violation": violation }),
                    );
                    continue;
                }
                events.emit(
                    EventType::RubricParseCompleted,
                    json!({ "attempt": attempt, "questions": rubric.questions.len() }),
                );
                return Ok(RubricParseResult::Parsed {
                    rubric,
                    confidence: response.confidence,
                });
            }
            Err(schema_error) => {
                events.emit(
                    EventType::Error,
                    json!({ "stage": "rubric_parse", "attempt": attempt, "schema_error": schema_error }),
                );
                continue;
            }
        }
    }

    events.emit(
        EventType::RubricReviewRequested,
        json!({ "reason": "rubric_parse failed twice" }),
    );
    Ok(RubricParseResult::NeedsReview {
        reason: "structural validation failed after a strict-schema retry".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::client::VlmClient;
    use crate::gateway::types::{GatewayResponse, Provider, TokenUsage};
    use crate::ratelimit::RateLimiter;
    use crate::retry::RetryConfig;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct StaticClient(String);

    #[async_trait]
    impl VlmClient for StaticClient {
        async fn call_remote(&self, _request: &GatewayRequest) -> Result<GatewayResponse> {
            Ok(GatewayResponse {
                content: self.0.clone(),
                usage: TokenUsage::default(),
                cost_usd: 0.0,
                confidence: 0.95,
                from_cache: false,
                timestamp: chrono::Utc::now(),
            })
        }

        fn provider(&self) -> Provider {
            Provider::Anthropic
        }
    }

    fn gateway_with(content: &str) -> ModelGateway {
        ModelGateway::new(
            Arc::new(StaticClient(content.to_string())),
            Arc::new(RateLimiter::in_process()),
            RetryConfig::default(),
            1000,
            60,
        )
    }

    #[tokio::test]
    async fn valid_rubric_json_parses_on_first_attempt() {
        let rubric = Rubric {
            total_questions: 1,
            total_score: 10.0,
            general_notes: String::new(),
            questions: vec![crate::run::Question {
                question_id: "Q1".into(),
                max_score: 10.0,
                standard_answer: String::new(),
                grading_notes: String::new(),
                scoring_points: vec![],
                alternative_solutions: vec![],
                source_pages: vec![0],
            }],
        };
        let json = serde_json::to_string(&rubric).unwrap();
        let gateway = gateway_with(&json);
        let events = EventLog::new(RunId::new());
        let cancel: CancellationCheck = Arc::new(|| false);
        let result = rubric_parse(&gateway, &events, &cancel, RunId::new(), "p", "strict p", parse_rubric_json)
            .await
            .unwrap();
        assert!(matches!(result, RubricParseResult::Parsed { .. }));
    }

    #[tokio::test]
    async fn unparseable_output_escalates_to_review_after_retry() {
        let gateway = gateway_with("not json");
        let events = EventLog::new(RunId::new());
        let cancel: CancellationCheck = Arc::new(|| false);
        let result = rubric_parse(&gateway, &events, &cancel, RunId::new(), "p", "strict p", parse_rubric_json)
            .await
            .unwrap();
        assert!(matches!(result, RubricParseResult::NeedsReview { .. }));
    }
}
