//! `confession`: a structured self-report the model produces about its own
//! grading run, covering the instructions it was given, how it complied
//! with them, and where it was uncertain. `overall_honesty_score` is
//! computed purely over how complete the three sections are; it never
//! reads, and can never influence, any student's score.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;
use crate::events::EventLog;
use crate::gateway::{CancellationCheck, GatewayRequest, ModelGateway, RequestKind};
use crate::run::RunId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Confession {
    pub instructions_and_constraints: String,
    pub compliance_analysis: String,
    pub uncertainties: String,
}

pub type ConfessionParser = fn(&str) -> std::result::Result<Confession, String>;

pub fn parse_confession_json(content: &str) -> std::result::Result<Confession, String> {
    serde_json::from_str(content).map_err(|e| format!("unparseable confession JSON: {e}"))
}

/// Completeness of one section: 0.0 if empty, 1.0 once it reaches
/// `MIN_WORDS_FOR_FULL_CREDIT` words, linear in between.
const MIN_WORDS_FOR_FULL_CREDIT: usize = 15;

fn section_completeness(section: &str) -> f64 {
    let words = section.split_whitespace().count();
    (words as f64 / MIN_WORDS_FOR_FULL_CREDIT as f64).min(1.0)
}

/// Mean completeness across the three sections; never a function of any
/// scoring-point award, so it cannot feed back into grading.
pub fn overall_honesty_score(confession: &Confession) -> f64 {
    let scores = [
        section_completeness(&confession.instructions_and_constraints),
        section_completeness(&confession.compliance_analysis),
        section_completeness(&confession.uncertainties),
    ];
    scores.iter().sum::<f64>() / scores.len() as f64
}

pub async fn confession(
    gateway: &ModelGateway,
    events: &EventLog,
    cancel: &CancellationCheck,
    run_id: RunId,
    prompt: &str,
    parser: ConfessionParser,
) -> Result<(Confession, f64)> {
    let request = GatewayRequest::new(run_id, "confession", RequestKind::Confession, prompt);
    let response = gateway.call_model(request, events, cancel).await?;

    let confession = match parser(&response.content) {
        Ok(c) => c,
        Err(_) => Confession::default(),
    };
    let score = overall_honesty_score(&confession);

    events.emit(
        crate::events::EventType::StageCompleted,
        json!({ "stage": "confession", "overall_honesty_score": score }),
    );

    Ok((confession, score))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sections_score_zero() {
        let confession = Confession::default();
        assert_eq!(overall_honesty_score(&confession), 0.0);
    }

    #[test]
    fn complete_sections_score_one() {
        let long = "word ".repeat(MIN_WORDS_FOR_FULL_CREDIT);
        let confession = Confession {
            instructions_and_constraints: long.clone(),
            compliance_analysis: long.clone(),
            uncertainties: long,
        };
        assert!((overall_honesty_score(&confession) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn partial_section_yields_partial_credit() {
        let half = "word ".repeat(MIN_WORDS_FOR_FULL_CREDIT / 2);
        let confession = Confession {
            instructions_and_constraints: half,
            compliance_analysis: String::new(),
            uncertainties: String::new(),
        };
        let score = overall_honesty_score(&confession);
        assert!(score > 0.0 && score < 0.5);
    }
}
