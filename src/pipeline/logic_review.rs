//! `logic_review`: a stateless post-check over a student's aggregated
//! results. Consults nothing but its own arguments — no cache, no prior
//! runs, no gateway call — so the same `(StudentResult, Rubric)` pair
//! always produces byte-equal flags.

use serde::{Deserialize, Serialize};

use crate::run::{Rubric, StudentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    ScoreExceedsMax,
    QuestionMissingFromRubric,
    LowConfidenceQuestion,
    InconsistentTotal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flag {
    pub kind: FlagKind,
    pub question_id: Option<String>,
    pub detail: String,
}

pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.4;

pub fn logic_review(result: &StudentResult, rubric: &Rubric) -> Vec<Flag> {
    let mut flags = Vec::new();

    for question in &result.question_results {
        if question.score > question.max_score + f64::EPSILON {
            flags.push(Flag {
                kind: FlagKind::ScoreExceedsMax,
                question_id: Some(question.question_id.clone()),
                detail: format!("score {} exceeds max_score {}", question.score, question.max_score),
            });
        }

        if !rubric.questions.iter().any(|q| q.question_id == question.question_id) {
            flags.push(Flag {
                kind: FlagKind::QuestionMissingFromRubric,
                question_id: Some(question.question_id.clone()),
                detail: "question result has no matching rubric entry".to_string(),
            });
        }

        if question.confidence < LOW_CONFIDENCE_THRESHOLD {
            flags.push(Flag {
                kind: FlagKind::LowConfidenceQuestion,
                question_id: Some(question.question_id.clone()),
                detail: format!("confidence {} below review threshold", question.confidence),
            });
        }
    }

    let summed: f64 = result.question_results.iter().map(|q| q.score).sum();
    if (summed - result.total_score).abs() > 1e-6 {
        flags.push(Flag {
            kind: FlagKind::InconsistentTotal,
            question_id: None,
            detail: format!("total_score {} != sum of question scores {summed}", result.total_score),
        });
    }

    flags
}
