//! Semantic result cache: `(rubric_fingerprint, image_fingerprint) ->
//! grading_artifact`, with TTL, confidence gating and rubric-scoped
//! invalidation.
//!
//! Grounded in `SqliteMemoryStore` (`with_conn` helper, `params!` macro,
//! explicit schema SQL) for the storage access pattern, and in
//! `llm/cache.rs::CacheStats` for the hit/miss accounting shape. This is
//! a *separate* store from the in-process image cache the gateway keeps
//! for decoded page bitmaps — they share no code and no invariants;
//! in-memory caches stay decoupled from the persistent semantic cache.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::run::ScoringPointResult;

pub const CACHE_KEY_PREFIX: &str = "grade_cache:v1";
pub const DEFAULT_TTL_DAYS: i64 = 30;
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.9;

fn cache_key(rubric_fp: &str, image_fp: &str) -> String {
    format!("{CACHE_KEY_PREFIX}:{rubric_fp}:{image_fp}")
}

/// A stored grading artifact: the scoring-point results produced for one
/// grading unit the last time it was graded with confidence above the
/// write threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub artifact: Vec<ScoringPointResult>,
    pub stored_at: DateTime<Utc>,
    pub ttl_days: i64,
    pub confidence: f64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.stored_at > Duration::days(self.ttl_days)
    }
}

/// Hit/miss counters for operability, same shape as `llm/cache.rs`'s
/// `CacheStats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub store_errors: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Disk-backed semantic result cache. All operations are fail-open: a
/// backing-store error is logged and treated as a miss / not-stored /
/// zero-invalidated rather than propagated.
pub struct ResultCache {
    conn: Arc<Mutex<Connection>>,
    ttl_days: i64,
    min_confidence: f64,
    stats: Mutex<CacheStats>,
}

impl ResultCache {
    pub fn open(path: &str, ttl_days: i64, min_confidence: f64) -> crate::error::Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl_days,
            min_confidence,
            stats: Mutex::new(CacheStats::default()),
        })
    }

    pub fn in_memory(ttl_days: i64, min_confidence: f64) -> crate::error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl_days,
            min_confidence,
            stats: Mutex::new(CacheStats::default()),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS grade_cache (
                key TEXT PRIMARY KEY,
                rubric_fp TEXT NOT NULL,
                artifact TEXT NOT NULL,
                stored_at TEXT NOT NULL,
                ttl_days INTEGER NOT NULL,
                confidence REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_grade_cache_rubric ON grade_cache(rubric_fp);",
        )
    }

    fn with_conn<F, T>(&self, f: F) -> rusqlite::Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn)
    }

    /// `get(rubric_fp, image_fp) -> CacheEntry?`. Fail-open: a storage
    /// error is logged and treated as a miss.
    pub fn get(&self, rubric_fp: &str, image_fp: &str) -> Option<CacheEntry> {
        let key = cache_key(rubric_fp, image_fp);
        let result = self.with_conn(|conn| {
            conn.query_row(
                "SELECT artifact, stored_at, ttl_days, confidence FROM grade_cache WHERE key = ?1",
                params![key],
                |row| {
                    let artifact_json: String = row.get(0)?;
                    let stored_at: String = row.get(1)?;
                    let ttl_days: i64 = row.get(2)?;
                    let confidence: f64 = row.get(3)?;
                    Ok((artifact_json, stored_at, ttl_days, confidence))
                },
            )
        });

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok((artifact_json, stored_at, ttl_days, confidence)) => {
                let artifact: Vec<ScoringPointResult> = match serde_json::from_str(&artifact_json) {
                    Ok(a) => a,
                    Err(e) => {
                        warn!(error = %e, "cache entry failed to deserialize, treating as miss");
                        stats.misses += 1;
                        return None;
                    }
                };
                let stored_at: DateTime<Utc> = stored_at.parse().unwrap_or_else(|_| Utc::now());
                let entry = CacheEntry {
                    key: key.clone(),
                    artifact,
                    stored_at,
                    ttl_days,
                    confidence,
                };
                if entry.is_expired(Utc::now()) {
                    stats.misses += 1;
                    None
                } else {
                    stats.hits += 1;
                    Some(entry)
                }
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                stats.misses += 1;
                None
            }
            Err(e) => {
                warn!(error = %e, "cache backing store unavailable on get, failing open");
                stats.store_errors += 1;
                stats.misses += 1;
                None
            }
        }
    }

    /// `put(...)`. Stores only when `confidence > min_confidence`. Returns
    /// whether it was stored; never raises.
    pub fn put(
        &self,
        rubric_fp: &str,
        image_fp: &str,
        artifact: &[ScoringPointResult],
        confidence: f64,
    ) -> bool {
        if confidence <= self.min_confidence {
            return false;
        }
        let key = cache_key(rubric_fp, image_fp);
        let artifact_json = match serde_json::to_string(artifact) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize grading artifact, not caching");
                return false;
            }
        };
        let stored_at = Utc::now().to_rfc3339();
        let result = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO grade_cache (key, rubric_fp, artifact, stored_at, ttl_days, confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(key) DO UPDATE SET
                    artifact = excluded.artifact,
                    stored_at = excluded.stored_at,
                    ttl_days = excluded.ttl_days,
                    confidence = excluded.confidence",
                params![key, rubric_fp, artifact_json, stored_at, self.ttl_days, confidence],
            )
        });
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "cache backing store unavailable on put, failing open");
                self.stats.lock().unwrap_or_else(|e| e.into_inner()).store_errors += 1;
                false
            }
        }
    }

    /// `invalidate_by_rubric(rubric_fp) -> count`. Fail-open: storage error
    /// returns 0.
    pub fn invalidate_by_rubric(&self, rubric_fp: &str) -> u64 {
        let result = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM grade_cache WHERE rubric_fp = ?1",
                params![rubric_fp],
            )
        });
        match result {
            Ok(n) => {
                let n = n as u64;
                self.stats.lock().unwrap_or_else(|e| e.into_inner()).invalidations += n;
                n
            }
            Err(e) => {
                warn!(error = %e, "cache backing store unavailable on invalidate, failing open");
                self.stats.lock().unwrap_or_else(|e| e.into_inner()).store_errors += 1;
                0
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
