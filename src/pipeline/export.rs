//! `export`: the terminal stage. Packages per-student results into a
//! summary artifact and emits `results_ready`. Rendering that artifact into
//! a downloadable format (CSV, spreadsheet) is an external concern; this
//! stage only produces the typed summary and the event that tells a caller
//! one is ready.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::events::{EventLog, EventType};
use crate::run::{RunId, StudentResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentSummary {
    pub student_key: String,
    pub total_score: f64,
    pub max_total_score: f64,
    pub excluded_reason: Option<String>,
}

impl From<&StudentResult> for StudentSummary {
    fn from(result: &StudentResult) -> Self {
        Self {
            student_key: result.student_key.clone(),
            total_score: result.total_score,
            max_total_score: result.max_total_score,
            excluded_reason: result.excluded_reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportArtifact {
    pub run_id: RunId,
    pub summaries: Vec<StudentSummary>,
    pub excluded_count: usize,
}

pub fn export(run_id: RunId, students: &[StudentResult], events: &EventLog) -> ExportArtifact {
    let summaries: Vec<StudentSummary> = students.iter().map(StudentSummary::from).collect();
    let excluded_count = summaries.iter().filter(|s| s.excluded_reason.is_some()).count();

    let artifact = ExportArtifact {
        run_id,
        summaries,
        excluded_count,
    };

    events.emit(
        EventType::ResultsReady,
        json!({ "students": artifact.summaries.len(), "excluded": artifact.excluded_count }),
    );

    artifact
}
