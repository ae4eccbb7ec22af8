//! `rubric_review` (optional human gate): if the run requested manual
//! review or the parsed rubric's confidence is below
//! `rubric_confidence_threshold`, the run pauses awaiting an external
//! `rubric_review(action, parsed_rubric?)` signal.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::events::{EventLog, EventType};
use crate::run::Rubric;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Update,
    Reparse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricReviewSignal {
    pub action: ReviewAction,
    pub parsed_rubric: Option<Rubric>,
    pub notes: Option<String>,
}

/// What the orchestrator should do next after applying a review signal.
#[derive(Debug, Clone)]
pub enum RubricReviewOutcome {
    Proceed(Rubric),
    Reparse { notes: Option<String> },
}

/// Whether the run should pause before proceeding past `rubric_parse`.
pub fn needs_review(manual_review_requested: bool, rubric_confidence: f64, threshold: f64) -> bool {
    manual_review_requested || rubric_confidence < threshold
}

/// Apply an external resolution signal to a paused run.
pub fn apply_review_signal(
    signal: RubricReviewSignal,
    current_rubric: Option<Rubric>,
    events: &EventLog,
) -> Result<RubricReviewOutcome, String> {
    let outcome = match signal.action {
        ReviewAction::Approve => {
            let rubric = current_rubric.ok_or_else(|| "approve requires a current rubric".to_string())?;
            RubricReviewOutcome::Proceed(rubric)
        }
        ReviewAction::Update => {
            let rubric = signal
                .parsed_rubric
                .ok_or_else(|| "update requires a parsed_rubric payload".to_string())?;
            rubric.validate()?;
            RubricReviewOutcome::Proceed(rubric)
        }
        ReviewAction::Reparse => RubricReviewOutcome::Reparse { notes: signal.notes },
    };

    events.emit(
        EventType::RubricReviewResolved,
        json!({ "action": format!("{:?}", signal.action) }),
    );

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunId;

    fn sample_rubric(total: f64) -> Rubric {
        Rubric {
            total_questions: 1,
            total_score: total,
            general_notes: String::new(),
            questions: vec![crate::run::Question {
                question_id: "Q1".into(),
                max_score: total,
                standard_answer: String::new(),
                grading_notes: String::new(),
                scoring_points: vec![],
                alternative_solutions: vec![],
                source_pages: vec![0],
            }],
        }
    }

    #[test]
    fn low_confidence_forces_review_even_without_manual_request() {
        assert!(needs_review(false, 0.5, 0.7));
        assert!(!needs_review(false, 0.9, 0.7));
        assert!(needs_review(true, 0.99, 0.7));
    }

    #[test]
    fn update_with_invalid_rubric_is_rejected() {
        let mut bad = sample_rubric(10.0);
        bad.total_score = 999.0;
        let events = EventLog::new(RunId::new());
        let signal = RubricReviewSignal {
            action: ReviewAction::Update,
            parsed_rubric: Some(bad),
            notes: None,
        };
        let result = apply_review_signal(signal, None, &events);
        assert!(result.is_err());
    }

    #[test]
    fn reparse_carries_notes_forward() {
        let events = EventLog::new(RunId::new());
        let signal = RubricReviewSignal {
            action: ReviewAction::Reparse,
            parsed_rubric: None,
            notes: Some("question 3 is ambiguous".into()),
        };
        let outcome = apply_review_signal(signal, None, &events).unwrap();
        assert!(matches!(outcome, RubricReviewOutcome::Reparse { notes: Some(n) } if n == "question 3 is ambiguous"));
    }
}
