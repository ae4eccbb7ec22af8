//! # gradewright-core
//!
//! Vision-native batch grading engine: the pipeline, run-control and model
//! gateway core behind an automated rubric-grading service. Takes scanned
//! student work and a rubric, fans grading out to a multimodal model with
//! caching, rate limiting and retries, and produces per-student scores with
//! citations back to the source pages.
//!
//! ## Core components
//!
//! - **run**: the data model — runs, rubrics, student boundaries, grading
//!   units and their results.
//! - **gateway**: the single choke point for model calls (rate limiting,
//!   retries, cost tracking).
//! - **pipeline**: the eleven grading stages, each a pure function over an
//!   explicit input/output pair.
//! - **orchestrator**: wires the stages together, owns run state, and
//!   handles pause/resume and crash recovery.

pub mod admission;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod gateway;
pub mod orchestrator;
pub mod pipeline;
pub mod ratelimit;
pub mod retry;
pub mod run;

pub use admission::{AdmissionConfig, AdmissionController, AdmissionOutcome};
pub use cache::{CacheEntry, CacheStats, ResultCache};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::EngineConfig;
pub use error::{Error, Result, Signal};
pub use events::{EventLog, EventRecord, EventType};
pub use fingerprint::{image_fingerprint, rubric_fingerprint, unit_fingerprint, ImageFingerprint};
pub use gateway::{
    AnthropicVlmClient, CancellationCheck, ClientConfig, GatewayRequest, GatewayResponse,
    ImageRef, ModelGateway, ModelPricing, Provider, RequestKind, TokenUsage, VlmClient,
};
pub use orchestrator::{Orchestrator, RunInputs, RunOutcome};
pub use ratelimit::RateLimiter;
pub use retry::{retry_with, RetryConfig};
pub use run::{
    boundaries_partition, AccumulationMode, CitationQuality, GradingUnit, Question, QuestionResult,
    Rubric, Run, RunId, RunStatus, ScoringPoint, ScoringPointResult, Stage, StudentBoundary,
    StudentResult, UNIDENTIFIED,
};
