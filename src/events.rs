//! Sequenced per-run event log with live-tail fan-out.
//!
//! Grounded in `GradeState`'s `tokio::sync::broadcast` channel
//! (`other_examples/.../grade_orchestrator.rs`), extended with an
//! append-only `Vec<EventRecord>` buffer: a broadcast channel alone drops
//! messages for subscribers who join late or lag, which cannot satisfy the
//! `events_after(seq)` replay requirement, so the buffer is the source of
//! truth and the broadcast channel is purely a live-tail convenience.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::run::RunId;

/// Event payload kind. Mirrors the stage-transition / gateway / progress
/// taxonomy as a closed enum rather than a single free-form string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Queued,
    StageStarted,
    StageCompleted,
    IntakeCompleted,
    RubricParseCompleted,
    RubricReviewRequested,
    RubricReviewResolved,
    IndexCompleted,
    GradeBatchUnitCompleted,
    GradeBatchUnitFailed,
    CacheHit,
    LlmStreamChunk,
    AggregateCompleted,
    ResultsReviewRequested,
    ResultsReviewResolved,
    BudgetWarning,
    ProgressTick,
    Error,
    Cancelled,
    ResultsReady,
}

/// One entry in a run's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub run_id: RunId,
    pub event_type: EventType,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Per-run event log: append-only buffer plus a broadcast channel for live
/// subscribers. `seq` is unique within a run, strictly increasing, and has
/// no gaps.
pub struct EventLog {
    run_id: RunId,
    records: Mutex<Vec<EventRecord>>,
    next_seq: Mutex<u64>,
    sender: broadcast::Sender<EventRecord>,
}

impl EventLog {
    pub fn new(run_id: RunId) -> Self {
        let (sender, _receiver) = broadcast::channel(1024);
        Self {
            run_id,
            records: Mutex::new(Vec::new()),
            next_seq: Mutex::new(1),
            sender,
        }
    }

    /// Append a new event, assigning the next sequence number. Never fails:
    /// a lagging/absent subscriber on the broadcast side is not an error,
    /// since the append-only buffer is the durable record.
    pub fn emit(&self, event_type: EventType, payload: Value) -> EventRecord {
        let mut next_seq = self.next_seq.lock().unwrap_or_else(|e| e.into_inner());
        let seq = *next_seq;
        *next_seq += 1;
        drop(next_seq);

        let record = EventRecord {
            seq,
            run_id: self.run_id,
            event_type,
            payload,
            at: Utc::now(),
        };

        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record.clone());
        // Best-effort: no live subscribers is not an error.
        let _ = self.sender.send(record.clone());
        record
    }

    /// Replay events strictly after `seq`, up to `limit` entries.
    pub fn events_after(&self, seq: u64, limit: usize) -> Vec<EventRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .filter(|r| r.seq > seq)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seq_is_strictly_increasing_with_no_gaps() {
        let log = EventLog::new(RunId::new());
        let a = log.emit(EventType::Queued, json!({}));
        let b = log.emit(EventType::StageStarted, json!({}));
        let c = log.emit(EventType::StageCompleted, json!({}));
        assert_eq!([a.seq, b.seq, c.seq], [1, 2, 3]);
    }

    #[test]
    fn events_after_replays_without_gaps_or_reordering() {
        let log = EventLog::new(RunId::new());
        for i in 0..5 {
            log.emit(EventType::ProgressTick, json!({ "i": i }));
        }
        let replayed = log.events_after(2, 10);
        let seqs: Vec<u64> = replayed.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn live_subscriber_receives_emitted_events() {
        let log = EventLog::new(RunId::new());
        let mut rx = log.subscribe();
        log.emit(EventType::Queued, json!({}));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.seq, 1);
    }
}
