//! Checkpoint store: run-state snapshots written at stage boundaries for
//! crash recovery. Grounded in the `SqliteMemoryStore` access pattern
//! (`with_conn` helper wrapping a `Mutex<Connection>`,
//! `rusqlite::params!`, explicit schema SQL) — a separate table from the
//! semantic result cache, since the two stores have unrelated eviction
//! policies (checkpoints are read once on resume and never TTL-expired).

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::run::{RunId, Stage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub stage: String,
    pub state_json: String,
    pub written_at: DateTime<Utc>,
}

pub struct CheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl CheckpointStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                run_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                state_json TEXT NOT NULL,
                written_at TEXT NOT NULL,
                PRIMARY KEY (run_id, stage)
            );",
        )
    }

    fn with_conn<F, T>(&self, f: F) -> rusqlite::Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn)
    }

    /// Write (or overwrite) the checkpoint for `(run_id, stage)`.
    pub fn write(&self, run_id: RunId, stage: Stage, state_json: &str) -> Result<()> {
        let written_at = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO checkpoints (run_id, stage, state_json, written_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(run_id, stage) DO UPDATE SET
                    state_json = excluded.state_json,
                    written_at = excluded.written_at",
                params![run_id.to_string(), stage.as_str(), state_json, written_at],
            )
        })?;
        Ok(())
    }

    /// The most recently written checkpoint for a run, across all stages —
    /// used on restart to decide whether a `running` run can resume or
    /// must be marked `failed` with reason `coordinator_restart`.
    pub fn latest(&self, run_id: RunId) -> Result<Option<Checkpoint>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT stage, state_json, written_at FROM checkpoints
                 WHERE run_id = ?1 ORDER BY written_at DESC LIMIT 1",
                params![run_id.to_string()],
                |row| {
                    let stage: String = row.get(0)?;
                    let state_json: String = row.get(1)?;
                    let written_at: String = row.get(2)?;
                    Ok((stage, state_json, written_at))
                },
            )
        });

        match row {
            Ok((stage, state_json, written_at)) => Ok(Some(Checkpoint {
                run_id,
                stage,
                state_json,
                written_at: written_at.parse().unwrap_or_else(|_| Utc::now()),
            })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_latest_round_trips() {
        let store = CheckpointStore::in_memory().unwrap();
        let run_id = RunId::new();
        store.write(run_id, Stage::Index, "{\"boundaries\":3}").unwrap();
        store.write(run_id, Stage::GradeBatch, "{\"units_done\":10}").unwrap();

        let latest = store.latest(run_id).unwrap().expect("checkpoint present");
        assert_eq!(latest.stage, "grade_batch");
    }

    #[test]
    fn no_checkpoint_is_none() {
        let store = CheckpointStore::in_memory().unwrap();
        assert!(store.latest(RunId::new()).unwrap().is_none());
    }
}
