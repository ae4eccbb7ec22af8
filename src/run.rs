//! Core data model: runs, rubrics, student boundaries, grading units and
//! their results. Grounded in the entity list laid out for the batch
//! pipeline; kept as plain serde structs rather than a dynamic/JSON-shaped
//! payload so stage boundaries reject unknown fields by construction.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run lifecycle status. Transitions are monotonic except for
/// `paused_* -> running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    PausedRubricReview,
    PausedResultsReview,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_paused(self) -> bool {
        matches!(self, Self::PausedRubricReview | Self::PausedResultsReview)
    }
}

/// Named pipeline stage, used both for `Run::current_stage` and for event
/// tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    Preprocess,
    RubricParse,
    RubricReview,
    Index,
    GradeBatch,
    CrossPageMerge,
    Aggregate,
    LogicReview,
    Confession,
    Export,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Preprocess => "preprocess",
            Stage::RubricParse => "rubric_parse",
            Stage::RubricReview => "rubric_review",
            Stage::Index => "index",
            Stage::GradeBatch => "grade_batch",
            Stage::CrossPageMerge => "cross_page_merge",
            Stage::Aggregate => "aggregate",
            Stage::LogicReview => "logic_review",
            Stage::Confession => "confession",
            Stage::Export => "export",
        }
    }

    /// The fixed stage order, used to compute `progress`.
    pub const ORDER: [Stage; 11] = [
        Stage::Intake,
        Stage::Preprocess,
        Stage::RubricParse,
        Stage::RubricReview,
        Stage::Index,
        Stage::GradeBatch,
        Stage::CrossPageMerge,
        Stage::Aggregate,
        Stage::LogicReview,
        Stage::Confession,
        Stage::Export,
    ];

    pub fn progress_fraction(self) -> f64 {
        let idx = Self::ORDER.iter().position(|s| *s == self).unwrap_or(0);
        (idx as f64) / (Self::ORDER.len() as f64 - 1.0)
    }
}

/// One batch execution from submission to export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub teacher_id: String,
    pub class_ids: BTreeSet<String>,
    pub status: RunStatus,
    pub current_stage: Stage,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub soft_budget_usd: f64,
    pub spent_usd: f64,
    pub failure_reason: Option<String>,
}

impl Run {
    pub fn new(teacher_id: impl Into<String>, class_ids: BTreeSet<String>, soft_budget_usd: f64) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            teacher_id: teacher_id.into(),
            class_ids,
            status: RunStatus::Queued,
            current_stage: Stage::Intake,
            progress: 0.0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            soft_budget_usd,
            spent_usd: 0.0,
            failure_reason: None,
        }
    }

    /// Advance to a new stage, bumping `progress` monotonically within the
    /// current status.
    pub fn advance_stage(&mut self, stage: Stage, at: DateTime<Utc>) {
        self.current_stage = stage;
        let next = stage.progress_fraction();
        if next > self.progress {
            self.progress = next;
        }
        self.updated_at = at;
    }

    pub fn transition(&mut self, status: RunStatus, at: DateTime<Utc>) {
        self.status = status;
        self.updated_at = at;
        if status.is_terminal() {
            self.completed_at = Some(at);
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>, at: DateTime<Utc>) {
        self.failure_reason = Some(reason.into());
        self.transition(RunStatus::Failed, at);
    }
}

/// How a scoring point accumulates evidence across the pages of a
/// grading unit: `MetOnce` keeps the single highest-confidence award,
/// `Cumulative` sums non-overlapping evidence bounded by the point's
/// own `score`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulationMode {
    MetOnce,
    Cumulative,
}

/// A single atomic criterion within a question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringPoint {
    pub point_id: String,
    pub description: String,
    pub expected_value: Option<String>,
    pub score: f64,
    pub is_required: bool,
    pub keywords: BTreeSet<String>,
    pub accumulation_mode: AccumulationMode,
}

/// One question of a rubric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub question_id: String,
    pub max_score: f64,
    pub standard_answer: String,
    pub grading_notes: String,
    pub scoring_points: Vec<ScoringPoint>,
    pub alternative_solutions: Vec<String>,
    pub source_pages: Vec<u32>,
}

impl Question {
    /// `sum(scoring_points.score) <= max_score`.
    pub fn scoring_points_within_max(&self) -> bool {
        let total: f64 = self.scoring_points.iter().map(|p| p.score).sum();
        total <= self.max_score + f64::EPSILON
    }
}

/// The parsed scoring standard for a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rubric {
    pub total_questions: u32,
    pub total_score: f64,
    pub general_notes: String,
    pub questions: Vec<Question>,
}

impl Rubric {
    /// Structural validation run at the end of `rubric_parse`: non-empty
    /// questions, `sum(scoring_points.score) <= question.max_score`, and
    /// `sum(questions.max_score) == total_score`.
    pub fn validate(&self) -> Result<(), String> {
        if self.questions.is_empty() {
            return Err("rubric has no questions".to_string());
        }
        let mut seen = HashSet::new();
        for q in &self.questions {
            if !seen.insert(q.question_id.clone()) {
                return Err(format!("duplicate question_id {}", q.question_id));
            }
            if !q.scoring_points_within_max() {
                return Err(format!(
                    "question {} scoring points exceed max_score",
                    q.question_id
                ));
            }
        }
        let sum_max: f64 = self.questions.iter().map(|q| q.max_score).sum();
        if (sum_max - self.total_score).abs() > 1e-6 {
            return Err(format!(
                "sum of question max_score ({sum_max}) != total_score ({})",
                self.total_score
            ));
        }
        Ok(())
    }
}

/// One student's page range within the answer document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StudentBoundary {
    pub student_key: String,
    pub start_page: u32,
    pub end_page: u32,
    pub class_id: Option<String>,
    pub confidence: f64,
}

impl StudentBoundary {
    pub fn pages(&self) -> impl Iterator<Item = u32> {
        self.start_page..=self.end_page
    }
}

/// Sentinel student key for pages that could not be attributed.
pub const UNIDENTIFIED: &str = "unidentified";

/// Check that a set of boundaries partitions `0..page_count`: every page
/// belongs to at most one named boundary.
pub fn boundaries_partition(boundaries: &[StudentBoundary], page_count: u32) -> bool {
    let mut seen = HashSet::new();
    for b in boundaries {
        if b.student_key == UNIDENTIFIED {
            continue;
        }
        if b.start_page > b.end_page {
            return false;
        }
        for p in b.pages() {
            if p >= page_count || !seen.insert(p) {
                return false;
            }
        }
    }
    true
}

/// The smallest schedulable work item: one student, one question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingUnit {
    pub run_id: RunId,
    pub student_key: String,
    pub question_id: String,
    pub page_indices: Vec<u32>,
    pub fingerprint: String,
}

/// Citation strength for one scoring point result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationQuality {
    High,
    Medium,
    Low,
    Missing,
}

/// Result for one scoring point of one question of one student.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringPointResult {
    pub point_id: String,
    pub awarded: f64,
    pub evidence: String,
    pub rubric_reference: String,
    pub rubric_text: String,
    pub citation_quality: CitationQuality,
    pub is_alternative_solution: bool,
    pub confidence: f64,
    pub page_index: u32,
}

/// Aggregate of ScoringPointResults for a question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionResult {
    pub question_id: String,
    pub score: f64,
    pub max_score: f64,
    pub feedback: String,
    pub confidence: f64,
    pub page_indices: Vec<u32>,
    pub typo_notes: Vec<String>,
    pub scoring_point_results: Vec<ScoringPointResult>,
}

/// Per-student aggregate result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentResult {
    pub student_key: String,
    pub total_score: f64,
    pub max_total_score: f64,
    pub question_results: Vec<QuestionResult>,
    pub review_note: Option<String>,
    pub excluded_reason: Option<String>,
}
