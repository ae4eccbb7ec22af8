//! `aggregate`: roll merged scoring-point results up into `QuestionResult`s
//! and `StudentResult`s. A question's score is the sum of its awarded
//! points bounded by `max_score`; its confidence is the mean of point
//! confidences weighted by each point's rubric `score` (its static max,
//! not what was actually awarded), penalised 0.2 if any point has a
//! missing citation and 0.15 if any point is an alternative solution
//! (both independent and additive). A student whose fraction of failed
//! grading units exceeds the configured threshold is excluded from the
//! export with reason `grading_failed` rather than reported with a
//! partial score.

use crate::run::{CitationQuality, Question, QuestionResult, ScoringPointResult, StudentResult};

pub const GRADING_FAILED_REASON: &str = "grading_failed";

/// Missing-citation penalty applied once if any point in the question
/// lacks a citation.
const MISSING_CITATION_PENALTY: f64 = 0.2;
/// Alternative-solution penalty applied once if any point in the
/// question was matched via an alternative solution.
const ALTERNATIVE_SOLUTION_PENALTY: f64 = 0.15;

pub fn aggregate_question(question: &Question, results: Vec<ScoringPointResult>) -> QuestionResult {
    let raw_score: f64 = results.iter().map(|r| r.awarded).sum();
    let score = raw_score.min(question.max_score).max(0.0);

    let point_weight = |point_id: &str| -> f64 {
        question
            .scoring_points
            .iter()
            .find(|p| p.point_id == point_id)
            .map(|p| p.score)
            .unwrap_or(0.0)
    };

    let confidence = if results.is_empty() {
        0.0
    } else {
        let weight_sum: f64 = results.iter().map(|r| point_weight(&r.point_id)).sum();
        let weighted = if weight_sum > 0.0 {
            results
                .iter()
                .map(|r| point_weight(&r.point_id) * r.confidence)
                .sum::<f64>()
                / weight_sum
        } else {
            results.iter().map(|r| r.confidence).sum::<f64>() / results.len() as f64
        };
        let missing_penalty = if results.iter().any(|r| r.citation_quality == CitationQuality::Missing) {
            MISSING_CITATION_PENALTY
        } else {
            0.0
        };
        let alternative_penalty = if results.iter().any(|r| r.is_alternative_solution) {
            ALTERNATIVE_SOLUTION_PENALTY
        } else {
            0.0
        };
        (weighted - missing_penalty - alternative_penalty).clamp(0.0, 1.0)
    };

    let mut page_indices: Vec<u32> = results.iter().map(|r| r.page_index).collect();
    page_indices.sort_unstable();
    page_indices.dedup();

    QuestionResult {
        question_id: question.question_id.clone(),
        score,
        max_score: question.max_score,
        feedback: String::new(),
        confidence,
        page_indices,
        typo_notes: Vec::new(),
        scoring_point_results: results,
    }
}

pub fn aggregate_student(
    student_key: impl Into<String>,
    question_results: Vec<QuestionResult>,
    unscored_fraction: f64,
    unscored_fraction_threshold: f64,
) -> StudentResult {
    let student_key = student_key.into();
    let max_total_score: f64 = question_results.iter().map(|q| q.max_score).sum();
    let total_score: f64 = question_results.iter().map(|q| q.score).sum();

    let excluded_reason = if unscored_fraction > unscored_fraction_threshold {
        Some(GRADING_FAILED_REASON.to_string())
    } else {
        None
    };

    StudentResult {
        student_key,
        total_score,
        max_total_score,
        question_results,
        review_note: None,
        excluded_reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::CitationQuality;

    fn question(max_score: f64) -> Question {
        Question {
            question_id: "Q1".into(),
            max_score,
            standard_answer: String::new(),
            grading_notes: String::new(),
            scoring_points: vec![],
            alternative_solutions: vec![],
            source_pages: vec![0],
        }
    }

    fn point(awarded: f64, confidence: f64, missing_citation: bool) -> ScoringPointResult {
        named_point("1.1", awarded, confidence, missing_citation, false)
    }

    fn named_point(
        point_id: &str,
        awarded: f64,
        confidence: f64,
        missing_citation: bool,
        is_alternative_solution: bool,
    ) -> ScoringPointResult {
        ScoringPointResult {
            point_id: point_id.into(),
            awarded,
            evidence: String::new(),
            rubric_reference: point_id.into(),
            rubric_text: String::new(),
            citation_quality: if missing_citation { CitationQuality::Missing } else { CitationQuality::High },
            is_alternative_solution,
            confidence,
            page_index: 0,
        }
    }

    fn scoring_point(point_id: &str, score: f64) -> crate::run::ScoringPoint {
        crate::run::ScoringPoint {
            point_id: point_id.into(),
            description: String::new(),
            expected_value: None,
            score,
            is_required: true,
            keywords: Default::default(),
            accumulation_mode: crate::run::AccumulationMode::MetOnce,
        }
    }

    fn question_with_points(max_score: f64, points: Vec<crate::run::ScoringPoint>) -> Question {
        Question {
            scoring_points: points,
            ..question(max_score)
        }
    }

    #[test]
    fn score_is_bounded_by_max_score() {
        let q = question(5.0);
        let result = aggregate_question(&q, vec![point(4.0, 0.9, false), point(4.0, 0.9, false)]);
        assert_eq!(result.score, 5.0);
    }

    #[test]
    fn missing_citation_penalizes_confidence() {
        let q = question(10.0);
        let clean = aggregate_question(&q, vec![point(10.0, 0.9, false)]);
        let penalized = aggregate_question(&q, vec![point(10.0, 0.9, true)]);
        assert!(penalized.confidence < clean.confidence);
        assert!((clean.confidence - penalized.confidence - 0.2).abs() < 1e-9);
    }

    #[test]
    fn student_total_sums_question_scores() {
        let q1 = aggregate_question(&question(5.0), vec![point(5.0, 0.9, false)]);
        let q2 = aggregate_question(&question(5.0), vec![point(3.0, 0.9, false)]);
        let student = aggregate_student("alice", vec![q1, q2], 0.0, 0.2);
        assert_eq!(student.total_score, 8.0);
        assert_eq!(student.max_total_score, 10.0);
        assert!(student.excluded_reason.is_none());
    }

    #[test]
    fn excess_unscored_fraction_excludes_the_student() {
        let q1 = aggregate_question(&question(5.0), vec![point(5.0, 0.9, false)]);
        let student = aggregate_student("bob", vec![q1], 0.3, 0.2);
        assert_eq!(student.excluded_reason.as_deref(), Some(GRADING_FAILED_REASON));
    }

    #[test]
    fn confidence_is_weighted_by_rubric_score_not_awarded_amount() {
        let q = question_with_points(10.0, vec![scoring_point("1.1", 9.0), scoring_point("1.2", 1.0)]);
        let results = vec![
            named_point("1.1", 1.0, 0.5, false, false),
            named_point("1.2", 1.0, 1.0, false, false),
        ];
        let result = aggregate_question(&q, results);
        // Weighted by rubric score (9 vs 1): close to 0.5, not the
        // awarded-weighted average (both awarded 1.0, which would be 0.75).
        assert!((result.confidence - 0.55).abs() < 1e-9);
    }

    #[test]
    fn distinct_points_trigger_additive_penalties() {
        let q = question_with_points(10.0, vec![scoring_point("1.1", 5.0), scoring_point("1.2", 5.0)]);
        let results = vec![
            named_point("1.1", 5.0, 0.9, true, false),
            named_point("1.2", 5.0, 0.9, false, true),
        ];
        let result = aggregate_question(&q, results);
        assert!((result.confidence - (0.9 - 0.35)).abs() < 1e-9);
    }
}
