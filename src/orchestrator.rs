//! Orchestrator: the multi-run batch coordinator. Owns run state, wires the
//! eleven pipeline stages in sequence, writes checkpoints at stage
//! boundaries, honours pause/resume signals, and checks cancellation at
//! every suspension point.
//!
//! Grounded in `GradeStore`/`GradeState` (`grade_orchestrator.rs`): a
//! `RwLock<HashMap<RunId, Run>>` registry plus a per-run event log, a
//! `run_*` method that drives the stage sequence emitting a `*Started`/
//! `*Completed` event pair around each stage, exactly like `run_grade`'s
//! `Cloning`/`Analyzing`/`Grading` progression. The two-level
//! `task_semaphore`/`criteria_semaphore` fan-out of `process_tasks_parallel`
//! is generalized into `admission::AdmissionController` (global + per-run
//! LLM-call slots) rather than re-implemented here.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;

use crate::admission::AdmissionController;
use crate::cache::ResultCache;
use crate::checkpoint::CheckpointStore;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{EventLog, EventType};
use crate::fingerprint::{rubric_fingerprint, unit_fingerprint};
use crate::gateway::{CancellationCheck, ModelGateway};
use crate::pipeline::confession::{confession, ConfessionParser};
use crate::pipeline::cross_page_merge::merge_points;
use crate::pipeline::grade_batch::{grade_batch, UnitParser};
use crate::pipeline::index::{index, HeaderProbe};
use crate::pipeline::intake::intake;
use crate::pipeline::logic_review::{logic_review, Flag};
use crate::pipeline::preprocess::{preprocess, PageEnhancer, PageRenderer};
use crate::pipeline::rubric_parse::{rubric_parse, RubricParseResult, RubricParser};
use crate::pipeline::rubric_review::{apply_review_signal, needs_review, RubricReviewOutcome, RubricReviewSignal};
use crate::pipeline::{aggregate, export};
use crate::pipeline::UploadedFile;
use crate::run::{
    boundaries_partition, AccumulationMode, GradingUnit, Rubric, Run, RunId, RunStatus, Stage,
    StudentResult,
};

/// Everything a pipeline run needs that can't be derived from the run's own
/// persisted state: the document bytes, the collaborators PDF rendering and
/// header probing are injected through, and the parsers for each stage's
/// expected wire format. Grouped here so `Orchestrator::run` stays a single
/// async function rather than a method with a dozen parameters.
pub struct RunInputs<'a> {
    pub teacher_id: String,
    pub class_ids: std::collections::BTreeSet<String>,
    pub files: Vec<UploadedFile>,
    pub pdf_page_count: Box<dyn Fn(&[u8]) -> u32 + Send + Sync + 'a>,
    pub renderer: Box<dyn PageRenderer + Send + Sync + 'a>,
    pub enhancer: Box<dyn PageEnhancer + Send + Sync + 'a>,
    pub header_probe: Box<dyn Fn(&crate::pipeline::PageImage) -> HeaderProbe + Send + Sync + 'a>,
    pub rubric_prompt: String,
    pub rubric_strict_prompt: String,
    pub rubric_parser: RubricParser,
    pub unit_parser: UnitParser,
    pub confession_prompt: String,
    pub confession_parser: ConfessionParser,
    pub manual_rubric_review_requested: bool,
}

/// Outcome of a run that completed without pausing.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub students: Vec<StudentResult>,
    pub flags: HashMap<String, Vec<Flag>>,
    pub overall_honesty_score: f64,
    pub artifact: export::ExportArtifact,
}

/// Multi-run coordinator. One instance serves every run submitted to a
/// deployment; per-run state lives in `runs`/`event_logs`, never on the
/// stack of the task driving a given run, so a crash mid-run can be
/// diagnosed from the checkpoint store alone.
pub struct Orchestrator {
    pub admission: Arc<AdmissionController>,
    pub gateway: Arc<ModelGateway>,
    pub cache: Arc<ResultCache>,
    pub checkpoints: Arc<CheckpointStore>,
    pub config: EngineConfig,
    runs: RwLock<HashMap<RunId, Run>>,
    event_logs: RwLock<HashMap<RunId, Arc<EventLog>>>,
}

impl Orchestrator {
    pub fn new(
        admission: Arc<AdmissionController>,
        gateway: Arc<ModelGateway>,
        cache: Arc<ResultCache>,
        checkpoints: Arc<CheckpointStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            admission,
            gateway,
            cache,
            checkpoints,
            config,
            runs: RwLock::new(HashMap::new()),
            event_logs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create_run(&self, teacher_id: impl Into<String>, class_ids: std::collections::BTreeSet<String>) -> RunId {
        let run = Run::new(teacher_id.into(), class_ids.clone(), self.config.soft_budget_usd_per_run);
        let run_id = run.run_id;
        let event_log = Arc::new(EventLog::new(run_id));
        event_log.emit(EventType::Queued, json!({ "teacher_id": run.teacher_id }));

        self.admission.register_run(run_id, &run.teacher_id).await;
        self.runs.write().await.insert(run_id, run);
        self.event_logs.write().await.insert(run_id, event_log);
        run_id
    }

    pub async fn run_snapshot(&self, run_id: RunId) -> Option<Run> {
        self.runs.read().await.get(&run_id).cloned()
    }

    pub async fn events(&self, run_id: RunId) -> Option<Arc<EventLog>> {
        self.event_logs.read().await.get(&run_id).cloned()
    }

    pub async fn cancel_run(&self, run_id: RunId) {
        self.admission.cancel(run_id).await;
        if let Some(run) = self.runs.write().await.get_mut(&run_id) {
            run.transition(RunStatus::Cancelled, Utc::now());
        }
    }

    /// On coordinator restart, a `running` run with no resumable checkpoint
    /// is marked `failed` with reason `coordinator_restart` rather than
    /// silently resumed from the beginning: the scheduler does not survive
    /// a coordinator restart by design.
    pub async fn recover_after_restart(&self, run_id: RunId) -> Result<()> {
        let checkpoint = self.checkpoints.latest(run_id)?;
        let mut runs = self.runs.write().await;
        if let Some(run) = runs.get_mut(&run_id) {
            if checkpoint.is_none() && run.status == RunStatus::Running {
                run.fail("coordinator_restart", Utc::now());
            }
        }
        Ok(())
    }

    async fn checkpoint(&self, run_id: RunId, stage: Stage, state_json: &str) -> Result<()> {
        self.checkpoints.write(run_id, stage, state_json)?;
        Ok(())
    }

    async fn advance(&self, run_id: RunId, stage: Stage) {
        if let Some(run) = self.runs.write().await.get_mut(&run_id) {
            run.advance_stage(stage, Utc::now());
        }
    }

    async fn cancellation_check(&self, run_id: RunId) -> CancellationCheck {
        let flag = self.admission.cancellation_flag(run_id).await;
        Arc::new(move || {
            flag.as_ref()
                .map(|f| f.load(std::sync::atomic::Ordering::SeqCst))
                .unwrap_or(false)
        })
    }

    /// Drive a run through every stage. Returns `Ok(Some(outcome))` on a
    /// completed run, `Ok(None)` if the run paused for rubric review (the
    /// caller resumes it later via `resolve_rubric_review`), and `Err` on an
    /// unrecoverable failure (already persisted onto the run's
    /// `failure_reason`).
    pub async fn run(self: &Arc<Self>, run_id: RunId, inputs: RunInputs<'_>) -> Result<Option<RunOutcome>> {
        if !self.admission.try_admit(run_id, &inputs.teacher_id).await {
            return Err(Error::admission_denied(format!("run {run_id} not yet head of its teacher queue")));
        }

        let events = self.events(run_id).await.ok_or_else(|| Error::internal("run not registered"))?;
        let cancel = self.cancellation_check(run_id).await;
        self.transition(run_id, RunStatus::Running).await;

        let result = self.run_inner(run_id, &events, &cancel, inputs).await;

        if let Err(ref e) = result {
            events.emit(EventType::Error, json!({ "error": e.to_string() }));
            if let Some(run) = self.runs.write().await.get_mut(&run_id) {
                run.fail(e.to_string(), Utc::now());
            }
            self.admission.release_slot(run_id).await;
        }

        result
    }

    async fn transition(&self, run_id: RunId, status: RunStatus) {
        if let Some(run) = self.runs.write().await.get_mut(&run_id) {
            run.transition(status, Utc::now());
        }
    }

    async fn run_inner(
        self: &Arc<Self>,
        run_id: RunId,
        events: &Arc<EventLog>,
        cancel: &CancellationCheck,
        inputs: RunInputs<'_>,
    ) -> Result<Option<RunOutcome>> {
        self.advance(run_id, Stage::Intake).await;
        let intake_result = intake(inputs.files, inputs.pdf_page_count.as_ref(), events)?;
        self.checkpoint(run_id, Stage::Intake, &json!({ "files": intake_result.accepted.len() }).to_string())
            .await?;

        self.advance(run_id, Stage::Preprocess).await;
        let pages = preprocess(&intake_result.accepted, inputs.renderer.as_ref(), inputs.enhancer.as_ref())?;
        self.checkpoint(run_id, Stage::Preprocess, &json!({ "pages": pages.len() }).to_string())
            .await?;

        self.advance(run_id, Stage::RubricParse).await;
        let (rubric, rubric_confidence) = match rubric_parse(
            &self.gateway,
            events,
            cancel,
            run_id,
            &inputs.rubric_prompt,
            &inputs.rubric_strict_prompt,
            inputs.rubric_parser,
        )
        .await?
        {
            RubricParseResult::Parsed { rubric, confidence } => (rubric, confidence),
            RubricParseResult::NeedsReview { reason } => {
                self.transition(run_id, RunStatus::PausedRubricReview).await;
                self.checkpoint(run_id, Stage::RubricParse, &json!({ "paused_reason": reason }).to_string())
                    .await?;
                return Ok(None);
            }
        };

        if needs_review(inputs.manual_rubric_review_requested, rubric_confidence, self.config.rubric_confidence_threshold) {
            self.transition(run_id, RunStatus::PausedRubricReview).await;
            events.emit(EventType::RubricReviewRequested, json!({ "reason": "manual_review_requested" }));
            self.checkpoint(run_id, Stage::RubricReview, &serde_json::to_string(&rubric).unwrap_or_default())
                .await?;
            return Ok(None);
        }

        self.advance(run_id, Stage::RubricReview).await;
        self.advance(run_id, Stage::Index).await;
        let boundaries = index(&pages, inputs.header_probe.as_ref(), events);
        if !boundaries_partition(&boundaries, pages.len() as u32) {
            return Err(Error::internal("index produced boundaries that do not partition the page set"));
        }
        self.checkpoint(run_id, Stage::Index, &json!({ "boundaries": boundaries.len() }).to_string())
            .await?;

        self.advance(run_id, Stage::GradeBatch).await;
        let rubric_fp = rubric_fingerprint(&serde_json::to_string(&rubric).unwrap_or_default());
        let mut units = Vec::new();
        for boundary in boundaries.iter().filter(|b| b.student_key != crate::run::UNIDENTIFIED) {
            let page_indices: Vec<u32> = boundary.pages().collect();
            let image_fps: Vec<_> = pages
                .iter()
                .filter(|p| page_indices.contains(&p.page_index))
                .map(|p| p.fingerprint)
                .collect();
            for question in &rubric.questions {
                units.push(GradingUnit {
                    run_id,
                    student_key: boundary.student_key.clone(),
                    question_id: question.question_id.clone(),
                    page_indices: page_indices.clone(),
                    fingerprint: unit_fingerprint(&rubric_fp, &image_fps),
                });
            }
        }

        let batch_report = grade_batch(
            &self.gateway,
            &self.cache,
            &self.admission,
            events,
            cancel,
            run_id,
            units,
            &rubric_fp,
            |_unit| Vec::new(),
            inputs.unit_parser,
            self.config.run_max_parallel_llm_calls,
            self.config.run_batch_chunk_size,
        )
        .await;
        self.checkpoint(
            run_id,
            Stage::GradeBatch,
            &json!({ "scored": batch_report.scored.len(), "failed": batch_report.failed.len() }).to_string(),
        )
        .await?;

        self.advance(run_id, Stage::CrossPageMerge).await;
        let mut by_student: HashMap<String, HashMap<String, Vec<_>>> = HashMap::new();
        for outcome in batch_report.scored {
            by_student
                .entry(outcome.unit.student_key.clone())
                .or_default()
                .entry(outcome.unit.question_id.clone())
                .or_insert_with(Vec::new)
                .extend(outcome.results);
        }
        let mut failed_units_by_student: HashMap<String, usize> = HashMap::new();
        let mut total_units_by_student: HashMap<String, usize> = HashMap::new();
        for failure in &batch_report.failed {
            *failed_units_by_student.entry(failure.unit.student_key.clone()).or_insert(0) += 1;
        }
        for boundary in boundaries.iter().filter(|b| b.student_key != crate::run::UNIDENTIFIED) {
            *total_units_by_student.entry(boundary.student_key.clone()).or_insert(0) += rubric.questions.len();
        }

        self.advance(run_id, Stage::Aggregate).await;
        let mut students = Vec::new();
        let mut flags_by_student = HashMap::new();
        for boundary in boundaries.iter().filter(|b| b.student_key != crate::run::UNIDENTIFIED) {
            let student_key = &boundary.student_key;
            let questions = by_student.remove(student_key).unwrap_or_default();
            let mut question_results = Vec::new();
            for question in &rubric.questions {
                let points = questions.get(&question.question_id).cloned().unwrap_or_default();
                let merged = merge_points(
                    points,
                    |point_id| {
                        question
                            .scoring_points
                            .iter()
                            .find(|p| p.point_id == point_id)
                            .map(|p| p.accumulation_mode)
                            .unwrap_or(AccumulationMode::MetOnce)
                    },
                    |point_id| {
                        question
                            .scoring_points
                            .iter()
                            .find(|p| p.point_id == point_id)
                            .map(|p| p.score)
                            .unwrap_or(question.max_score)
                    },
                );
                question_results.push(aggregate::aggregate_question(question, merged));
            }
            let total = *total_units_by_student.get(student_key).unwrap_or(&1);
            let failed = *failed_units_by_student.get(student_key).unwrap_or(&0);
            let unscored_fraction = failed as f64 / total.max(1) as f64;
            let student_result = aggregate::aggregate_student(
                student_key.clone(),
                question_results,
                unscored_fraction,
                self.config.unscored_fraction_threshold,
            );

            self.advance(run_id, Stage::LogicReview).await;
            let flags = logic_review(&student_result, &rubric);
            flags_by_student.insert(student_key.clone(), flags);

            students.push(student_result);
        }
        self.checkpoint(run_id, Stage::Aggregate, &json!({ "students": students.len() }).to_string())
            .await?;

        self.advance(run_id, Stage::Confession).await;
        let (_, overall_honesty_score) = confession(
            &self.gateway,
            events,
            cancel,
            run_id,
            &inputs.confession_prompt,
            inputs.confession_parser,
        )
        .await?;

        self.advance(run_id, Stage::Export).await;
        let artifact = export::export(run_id, &students, events);
        self.checkpoint(run_id, Stage::Export, &json!({ "exported": true }).to_string()).await?;

        self.transition(run_id, RunStatus::Completed).await;
        self.admission.release_slot(run_id).await;

        Ok(Some(RunOutcome {
            students,
            flags: flags_by_student,
            overall_honesty_score,
            artifact,
        }))
    }

    /// Resolve a paused `rubric_review`: either proceed with the resolved
    /// rubric (the caller must then re-invoke `run` with the same document
    /// inputs to continue past `index`) or request a re-parse.
    pub async fn resolve_rubric_review(
        &self,
        run_id: RunId,
        signal: RubricReviewSignal,
        current_rubric: Option<Rubric>,
    ) -> Result<RubricReviewOutcome> {
        let events = self.events(run_id).await.ok_or_else(|| Error::internal("run not registered"))?;
        let outcome = apply_review_signal(signal, current_rubric, &events).map_err(Error::validation)?;
        if let RubricReviewOutcome::Proceed(_) = &outcome {
            self.transition(run_id, RunStatus::Running).await;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionConfig;
    use crate::error::Result as CrateResult;
    use crate::gateway::types::{GatewayResponse, Provider, TokenUsage};
    use crate::gateway::{GatewayRequest, VlmClient};
    use crate::pipeline::confession::Confession;
    use crate::pipeline::preprocess::IdentityEnhancer;
    use crate::pipeline::FileKind;
    use crate::ratelimit::RateLimiter;
    use crate::retry::RetryConfig;
    use crate::run::{CitationQuality, Question, ScoringPoint, ScoringPointResult};
    use async_trait::async_trait;
    use image::DynamicImage;

    struct ScriptedClient;

    fn rubric_json() -> String {
        let rubric = Rubric {
            total_questions: 1,
            total_score: 10.0,
            general_notes: String::new(),
            questions: vec![Question {
                question_id: "Q1".into(),
                max_score: 10.0,
                standard_answer: String::new(),
                grading_notes: String::new(),
                scoring_points: vec![ScoringPoint {
                    point_id: "1.1".into(),
                    description: "correct answer".into(),
                    expected_value: None,
                    score: 10.0,
                    is_required: true,
                    keywords: Default::default(),
                    accumulation_mode: AccumulationMode::MetOnce,
                }],
                alternative_solutions: vec![],
                source_pages: vec![0],
            }],
        };
        serde_json::to_string(&rubric).unwrap()
    }

    fn grading_result_json() -> String {
        let results = vec![ScoringPointResult {
            point_id: "1.1".into(),
            awarded: 10.0,
            evidence: "student wrote the correct answer".into(),
            rubric_reference: "1.1".into(),
            rubric_text: "award 10".into(),
            citation_quality: CitationQuality::High,
            is_alternative_solution: false,
            confidence: 0.95,
            page_index: 0,
        }];
        serde_json::to_string(&results).unwrap()
    }

    #[async_trait]
    impl VlmClient for ScriptedClient {
        async fn call_remote(&self, request: &GatewayRequest) -> CrateResult<GatewayResponse> {
            let content = match request.kind {
                crate::gateway::RequestKind::RubricParse => rubric_json(),
                crate::gateway::RequestKind::GradeBatch => grading_result_json(),
                crate::gateway::RequestKind::Confession => {
                    serde_json::to_string(&Confession {
                        instructions_and_constraints: "followed the rubric exactly as given ".repeat(5),
                        compliance_analysis: "every award cites a page and a quote ".repeat(5),
                        uncertainties: "none of the scans were ambiguous ".repeat(5),
                    })
                    .unwrap()
                }
                _ => String::new(),
            };
            Ok(GatewayResponse {
                content,
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

    fn png_file(name: &str) -> UploadedFile {
        let img = DynamicImage::new_rgb8(4, 4);
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();
        UploadedFile {
            name: name.into(),
            kind: FileKind::Png,
            bytes,
        }
    }

    fn build_orchestrator() -> Arc<Orchestrator> {
        let gateway = Arc::new(ModelGateway::new(
            Arc::new(ScriptedClient),
            Arc::new(RateLimiter::in_process()),
            RetryConfig {
                initial_interval: std::time::Duration::from_millis(1),
                ..RetryConfig::default()
            },
            1000,
            60,
        ));
        Arc::new(Orchestrator::new(
            Arc::new(AdmissionController::new(AdmissionConfig::default())),
            gateway,
            Arc::new(ResultCache::in_memory(30, 0.9).unwrap()),
            Arc::new(CheckpointStore::in_memory().unwrap()),
            EngineConfig::default(),
        ))
    }

    #[tokio::test]
    async fn end_to_end_run_reaches_completed_and_produces_a_result_per_student() {
        let orchestrator = build_orchestrator();
        let run_id = orchestrator.create_run("teacher-1", Default::default()).await;

        let inputs = RunInputs {
            teacher_id: "teacher-1".into(),
            class_ids: Default::default(),
            files: vec![png_file("alice.png")],
            pdf_page_count: Box::new(|_| 1),
            renderer: Box::new(crate::pipeline::preprocess::RasterFileRenderer),
            enhancer: Box::new(IdentityEnhancer),
            header_probe: Box::new(|_page| HeaderProbe {
                student_key: Some("alice".into()),
                class_id: None,
                confidence: 0.9,
            }),
            rubric_prompt: "parse".into(),
            rubric_strict_prompt: "parse strictly".into(),
            rubric_parser: crate::pipeline::rubric_parse::parse_rubric_json,
            unit_parser: crate::pipeline::grade_batch::parse_unit_json,
            confession_prompt: "confess".into(),
            confession_parser: crate::pipeline::confession::parse_confession_json,
            manual_rubric_review_requested: false,
        };

        let outcome = orchestrator.run(run_id, inputs).await.unwrap().expect("run completes");
        assert_eq!(outcome.students.len(), 1);
        assert_eq!(outcome.students[0].student_key, "alice");
        assert_eq!(outcome.students[0].total_score, 10.0);
        assert!(outcome.overall_honesty_score > 0.9);

        let run = orchestrator.run_snapshot(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn manual_review_request_pauses_before_index() {
        let orchestrator = build_orchestrator();
        let run_id = orchestrator.create_run("teacher-1", Default::default()).await;

        let inputs = RunInputs {
            teacher_id: "teacher-1".into(),
            class_ids: Default::default(),
            files: vec![png_file("alice.png")],
            pdf_page_count: Box::new(|_| 1),
            renderer: Box::new(crate::pipeline::preprocess::RasterFileRenderer),
            enhancer: Box::new(IdentityEnhancer),
            header_probe: Box::new(|_page| HeaderProbe {
                student_key: Some("alice".into()),
                class_id: None,
                confidence: 0.9,
            }),
            rubric_prompt: "parse".into(),
            rubric_strict_prompt: "parse strictly".into(),
            rubric_parser: crate::pipeline::rubric_parse::parse_rubric_json,
            unit_parser: crate::pipeline::grade_batch::parse_unit_json,
            confession_prompt: "confess".into(),
            confession_parser: crate::pipeline::confession::parse_confession_json,
            manual_rubric_review_requested: true,
        };

        let outcome = orchestrator.run(run_id, inputs).await.unwrap();
        assert!(outcome.is_none());
        let run = orchestrator.run_snapshot(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::PausedRubricReview);
    }

    #[tokio::test]
    async fn coordinator_restart_without_a_checkpoint_fails_a_running_run() {
        let orchestrator = build_orchestrator();
        let run_id = orchestrator.create_run("teacher-1", Default::default()).await;
        orchestrator.transition(run_id, RunStatus::Running).await;

        orchestrator.recover_after_restart(run_id).await.unwrap();

        let run = orchestrator.run_snapshot(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure_reason.as_deref(), Some("coordinator_restart"));
    }
}
