//! Error taxonomy for the grading engine core.
//!
//! Only genuinely terminal conditions are represented as `Error`. Fail-open
//! signals (cache/rate-limit backing-store outages) and cooperative signals
//! (budget warnings, cancellation) are ordinary `Ok` values elsewhere in the
//! crate, not variants here — see `Signal` below for the non-error half of
//! the taxonomy.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal error kinds. Variant names mirror the taxonomy, not the call
/// sites that raise them.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input; terminal for the run, no retry.
    #[error("validation error: {0}")]
    Validation(String),

    /// The model returned output that could not be parsed into the expected
    /// schema, after the stage's own retry-with-stricter-prompt was exhausted.
    #[error("schema error: {0}")]
    Schema(String),

    /// Rate limit, timeout, or 5xx from an external service. Callers should
    /// route this through the retry envelope rather than propagate it raw.
    #[error("transient remote error from {provider}: {message}")]
    TransientRemote { provider: String, message: String },

    /// A gateway or HTTP-transport failure that could not be classified.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Coordinator crashed mid-stage and the run could not be resumed from
    /// a checkpoint on restart.
    #[error("coordinator crash: run {run_id} has no resumable checkpoint ({reason})")]
    CoordinatorCrash { run_id: String, reason: String },

    /// Checkpoint or cache backing-store error, surfaced as terminal only
    /// at call sites that require durability (checkpoint writes); the cache
    /// and rate-limiter themselves never raise this — they fail open.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error (missing or out-of-range option).
    #[error("configuration error: {0}")]
    Config(String),

    /// Run-control admission limit reached when a caller required an
    /// immediate slot rather than queuing.
    #[error("admission denied: {0}")]
    AdmissionDenied(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }

    pub fn transient_remote(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientRemote {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn gateway(message: impl Into<String>) -> Self {
        Self::Gateway(message.into())
    }

    pub fn coordinator_crash(run_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CoordinatorCrash {
            run_id: run_id.into(),
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn admission_denied(message: impl Into<String>) -> Self {
        Self::AdmissionDenied(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the retry envelope should attempt this error again.
    ///
    /// `transient_remote_error` is retryable; everything else either needs
    /// human/caller intervention or is already terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientRemote { .. } | Error::Gateway(_))
    }
}

/// Non-error signals: conditions that are reported but never abort the
/// caller. Kept as a plain enum (not `Error`) so call sites can't
/// accidentally `?` them away.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Soft per-run budget threshold exceeded; execution continues.
    BudgetWarning { run_id: String, spent_usd: f64, limit_usd: f64 },
    /// Cooperative cancellation observed at a suspension point.
    Cancellation { run_id: String },
    /// Cache backing store unavailable; caller proceeds without it.
    CacheUnavailable { reason: String },
    /// Rate-limit backing store unavailable; caller proceeds without it
    /// (fail-open, acquire returns `true`).
    RateLimitUnavailable { reason: String },
}
