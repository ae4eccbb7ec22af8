//! Engine configuration: the environment-variable-style options named in
//! the external interface table, loaded with `std::env` at the edges and
//! threaded through as a plain struct rather than a config-loading crate.

use std::env;

use serde::{Deserialize, Serialize};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Process-wide configuration, read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub run_max_concurrency: usize,
    pub teacher_max_active_runs: usize,
    pub run_max_parallel_llm_calls: usize,
    pub run_batch_chunk_size: usize,
    pub soft_budget_usd_per_run: f64,
    pub batch_image_cache_max_batches: usize,
    pub run_upload_queue_watermark: usize,
    pub run_upload_active_watermark: usize,
    pub cache_ttl_days: i64,
    pub cache_min_confidence: f64,
    pub rubric_confidence_threshold: f64,
    pub unscored_fraction_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_max_concurrency: 4,
            teacher_max_active_runs: 2,
            run_max_parallel_llm_calls: 16,
            run_batch_chunk_size: 50,
            soft_budget_usd_per_run: 0.0,
            batch_image_cache_max_batches: 32,
            run_upload_queue_watermark: 0,
            run_upload_active_watermark: 0,
            cache_ttl_days: 30,
            cache_min_confidence: 0.9,
            rubric_confidence_threshold: 0.7,
            unscored_fraction_threshold: 0.2,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            run_max_concurrency: env_or("RUN_MAX_CONCURRENCY", d.run_max_concurrency),
            teacher_max_active_runs: env_or("TEACHER_MAX_ACTIVE_RUNS", d.teacher_max_active_runs),
            run_max_parallel_llm_calls: env_or("RUN_MAX_PARALLEL_LLM_CALLS", d.run_max_parallel_llm_calls),
            run_batch_chunk_size: env_or("RUN_BATCH_CHUNK_SIZE", d.run_batch_chunk_size),
            soft_budget_usd_per_run: env_or("SOFT_BUDGET_USD_PER_RUN", d.soft_budget_usd_per_run),
            batch_image_cache_max_batches: env_or(
                "BATCH_IMAGE_CACHE_MAX_BATCHES",
                d.batch_image_cache_max_batches,
            ),
            run_upload_queue_watermark: env_or("RUN_UPLOAD_QUEUE_WATERMARK", d.run_upload_queue_watermark),
            run_upload_active_watermark: env_or("RUN_UPLOAD_ACTIVE_WATERMARK", d.run_upload_active_watermark),
            cache_ttl_days: env_or("CACHE_TTL_DAYS", d.cache_ttl_days),
            cache_min_confidence: env_or("CACHE_MIN_CONFIDENCE", d.cache_min_confidence),
            rubric_confidence_threshold: env_or(
                "RUBRIC_CONFIDENCE_THRESHOLD",
                d.rubric_confidence_threshold,
            ),
            unscored_fraction_threshold: d.unscored_fraction_threshold,
        }
    }
}
