//! `grade_batch`: the core fan-out stage. Forms one `GradingUnit` per
//! (student, question), consults the semantic cache before ever touching
//! the gateway, and classifies each unit as scored, cached or unscored.
//! Units are chunked so that only one chunk's worth of units is ever
//! in flight at a time; within a chunk, cache misses are dispatched
//! concurrently bounded by the run's LLM-call admission slots.
//!
//! Grounded in `BatchExecutor::execute`/`process_tasks_parallel`'s
//! two-level concurrency-bounded fan-out, adapted to
//! `futures::stream::buffer_unordered` in place of a hand-rolled
//! semaphore-gated task spawn, since the unit of work here is a single
//! gateway call rather than a subprocess.

use futures::stream::{self, StreamExt};
use serde_json::json;

use crate::admission::AdmissionController;
use crate::cache::ResultCache;
use crate::events::{EventLog, EventType};
use crate::gateway::{CancellationCheck, GatewayRequest, ImageRef, ModelGateway, RequestKind};
use crate::run::{GradingUnit, RunId, ScoringPointResult};

/// Parses the gateway's raw text response into the scoring-point results
/// for one grading unit. Injected for the same reason `rubric_parse`
/// injects its parser: the stage stays agnostic of the exact wire format.
pub type UnitParser = fn(&str) -> std::result::Result<Vec<ScoringPointResult>, String>;

pub fn parse_unit_json(content: &str) -> std::result::Result<Vec<ScoringPointResult>, String> {
    serde_json::from_str(content).map_err(|e| format!("unparseable grading result JSON: {e}"))
}

#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub unit: GradingUnit,
    pub results: Vec<ScoringPointResult>,
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub unit: GradingUnit,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct GradeBatchReport {
    pub scored: Vec<UnitOutcome>,
    pub failed: Vec<UnitFailure>,
}

impl GradeBatchReport {
    /// Fraction of units that ended up unscored, for the 20%
    /// exclusion-threshold check applied at aggregation.
    pub fn unscored_fraction(&self) -> f64 {
        let total = self.scored.len() + self.failed.len();
        if total == 0 {
            0.0
        } else {
            self.failed.len() as f64 / total as f64
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn grade_batch(
    gateway: &ModelGateway,
    cache: &ResultCache,
    admission: &AdmissionController,
    events: &EventLog,
    cancel: &CancellationCheck,
    run_id: RunId,
    units: Vec<GradingUnit>,
    rubric_fingerprint: &str,
    page_images: impl Fn(&GradingUnit) -> Vec<ImageRef> + Sync,
    parser: UnitParser,
    max_parallel: usize,
    chunk_size: usize,
) -> GradeBatchReport {
    let mut report = GradeBatchReport::default();
    for chunk in units.chunks(chunk_size.max(1)) {
        let outcomes = stream::iter(chunk.iter().map(|unit| {
            let images = page_images(unit);
            grade_one_unit(
                gateway,
                cache,
                admission,
                events,
                cancel,
                run_id,
                unit.clone(),
                rubric_fingerprint,
                images,
                parser,
            )
        }))
        .buffer_unordered(max_parallel.max(1))
        .collect::<Vec<_>>()
        .await;

        for outcome in outcomes {
            match outcome {
                Ok(o) => report.scored.push(o),
                Err(f) => report.failed.push(f),
            }
        }
    }
    report
}

async fn grade_one_unit(
    gateway: &ModelGateway,
    cache: &ResultCache,
    admission: &AdmissionController,
    events: &EventLog,
    cancel: &CancellationCheck,
    run_id: RunId,
    unit: GradingUnit,
    rubric_fingerprint: &str,
    images: Vec<ImageRef>,
    parser: UnitParser,
) -> Result<UnitOutcome, UnitFailure> {
    if let Some(entry) = cache.get(rubric_fingerprint, &unit.fingerprint) {
        events.emit(
            EventType::CacheHit,
            json!({ "student_key": unit.student_key, "question_id": unit.question_id }),
        );
        return Ok(UnitOutcome {
            unit,
            results: entry.artifact,
            from_cache: true,
        });
    }

    let permit = admission.llm_calls.clone().acquire_owned().await.map_err(|_| UnitFailure {
        unit: unit.clone(),
        reason: "llm_calls semaphore closed".to_string(),
    })?;

    let node_id = format!("grade_batch:{}:{}", unit.student_key, unit.question_id);
    let prompt = format!("Grade student {} on question {}.", unit.student_key, unit.question_id);
    let request = GatewayRequest::new(run_id, node_id, RequestKind::GradeBatch, prompt)
        .with_images(images)
        .with_rubric_fingerprint(rubric_fingerprint);

    let response = gateway.call_model(request, events, cancel).await.map_err(|e| {
        events.emit(
            EventType::GradeBatchUnitFailed,
            json!({ "student_key": unit.student_key, "question_id": unit.question_id, "reason": e.to_string() }),
        );
        UnitFailure {
            unit: unit.clone(),
            reason: e.to_string(),
        }
    });
    drop(permit);
    let response = response?;

    let results = parser(&response.content).map_err(|reason| {
        events.emit(
            EventType::GradeBatchUnitFailed,
            json!({ "student_key": unit.student_key, "question_id": unit.question_id, "reason": reason }),
        );
        UnitFailure {
            unit: unit.clone(),
            reason,
        }
    })?;

    cache.put(rubric_fingerprint, &unit.fingerprint, &results, response.confidence);

    events.emit(
        EventType::GradeBatchUnitCompleted,
        json!({ "student_key": unit.student_key, "question_id": unit.question_id, "points": results.len() }),
    );

    Ok(UnitOutcome {
        unit,
        results,
        from_cache: false,
    })
}
