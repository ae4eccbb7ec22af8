//! Run-control / admission: global and per-teacher concurrency slots, a
//! FIFO-per-teacher / round-robin-across-teachers waiting queue, soft
//! budget tracking, and cooperative cancellation signalling.
//!
//! No prior module covers multi-run global/per-teacher semaphores
//! directly, so this is built from `tokio::Semaphore`, `Arc<Mutex<...>>`
//! state and a builder-style config struct, and grounded secondarily on
//! the run-registry pattern in `GradeStore`/`GradeState`
//! (`other_examples/.../grade_orchestrator.rs`): one
//! `RwLock<HashMap<RunId, RunState>>` plus a `broadcast` channel per run.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::info;

use crate::run::RunId;

/// Static configuration, loaded from the environment-variable-style options
/// named in the external interface table.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub run_max_concurrency: usize,
    pub teacher_max_active_runs: usize,
    pub run_max_parallel_llm_calls: usize,
    pub run_upload_queue_watermark: usize,
    pub run_upload_active_watermark: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            run_max_concurrency: 4,
            teacher_max_active_runs: 2,
            run_max_parallel_llm_calls: 16,
            run_upload_queue_watermark: 0,
            run_upload_active_watermark: 0,
        }
    }
}

/// Slots held by a running run, released exactly once on any terminal
/// transition.
struct RunSlots {
    _global: OwnedSemaphorePermit,
    _teacher: OwnedSemaphorePermit,
    released: bool,
}

struct TeacherQueue {
    semaphore: Arc<Semaphore>,
    pending: VecDeque<RunId>,
}

/// Admission signal returned by `register_run`/the scheduler loop: either
/// the run was admitted a slot, or it is queued, optionally with a soft
/// watermark warning (not a refusal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Admitted,
    Queued { warn_watermark: bool },
}

/// Global run-control state: one global semaphore, one semaphore per
/// teacher (created lazily), a shared model-call semaphore, and a
/// cancellation flag per run.
pub struct AdmissionController {
    config: AdmissionConfig,
    global: Arc<Semaphore>,
    pub llm_calls: Arc<Semaphore>,
    teachers: Mutex<HashMap<String, TeacherQueue>>,
    active_slots: RwLock<HashMap<RunId, RunSlots>>,
    cancelled: RwLock<HashMap<RunId, Arc<AtomicBool>>>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        let global = Arc::new(Semaphore::new(config.run_max_concurrency));
        let llm_calls = Arc::new(Semaphore::new(config.run_max_parallel_llm_calls));
        Self {
            config,
            global,
            llm_calls,
            teachers: Mutex::new(HashMap::new()),
            active_slots: RwLock::new(HashMap::new()),
            cancelled: RwLock::new(HashMap::new()),
        }
    }

    /// `register_run`: enqueue a run for a teacher. The caller is expected
    /// to have already emitted the `queued` event; this only tracks slot
    /// bookkeeping and returns a soft-watermark warning if the teacher's
    /// queue depth exceeds `run_upload_queue_watermark`.
    pub async fn register_run(&self, run_id: RunId, teacher_id: &str) -> AdmissionOutcome {
        self.cancelled
            .write()
            .await
            .insert(run_id, Arc::new(AtomicBool::new(false)));

        let mut teachers = self.teachers.lock().await;
        let queue = teachers.entry(teacher_id.to_string()).or_insert_with(|| TeacherQueue {
            semaphore: Arc::new(Semaphore::new(self.config.teacher_max_active_runs)),
            pending: VecDeque::new(),
        });
        queue.pending.push_back(run_id);
        let warn = self.config.run_upload_queue_watermark > 0
            && queue.pending.len() > self.config.run_upload_queue_watermark;
        AdmissionOutcome::Queued { warn_watermark: warn }
    }

    /// Try to admit the head of `teacher_id`'s queue if it matches
    /// `run_id`, acquiring both a global and a per-teacher slot. Returns
    /// `true` on success; the caller (scheduler loop) should then dispatch
    /// the run as `running`.
    pub async fn try_admit(&self, run_id: RunId, teacher_id: &str) -> bool {
        let teacher_semaphore = {
            let mut teachers = self.teachers.lock().await;
            match teachers.get_mut(teacher_id) {
                Some(q) if q.pending.front() == Some(&run_id) => q.semaphore.clone(),
                _ => return false,
            }
        };

        let global_permit = match self.global.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => return false,
        };
        let teacher_permit = match teacher_semaphore.try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                drop(global_permit);
                return false;
            }
        };

        {
            let mut teachers = self.teachers.lock().await;
            if let Some(q) = teachers.get_mut(teacher_id) {
                q.pending.pop_front();
            }
        }

        self.active_slots.write().await.insert(
            run_id,
            RunSlots {
                _global: global_permit,
                _teacher: teacher_permit,
                released: false,
            },
        );
        info!(%run_id, teacher_id, "run admitted, slots acquired");
        true
    }

    /// Idempotent: calling this any number of times after the first is a
    /// no-op.
    pub async fn release_slot(&self, run_id: RunId) {
        let mut slots = self.active_slots.write().await;
        if let Some(entry) = slots.get_mut(&run_id) {
            if entry.released {
                return;
            }
            entry.released = true;
        }
        slots.remove(&run_id);
    }

    pub async fn cancel(&self, run_id: RunId) {
        if let Some(flag) = self.cancelled.read().await.get(&run_id) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub async fn is_cancelled(&self, run_id: RunId) -> bool {
        self.cancelled
            .read()
            .await
            .get(&run_id)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// The raw cancellation flag for a run, for callers that need a plain
    /// synchronous `Fn() -> bool` (e.g. the gateway's `CancellationCheck`)
    /// rather than awaiting `is_cancelled` on every check.
    pub async fn cancellation_flag(&self, run_id: RunId) -> Option<Arc<AtomicBool>> {
        self.cancelled.read().await.get(&run_id).cloned()
    }

    pub fn active_watermark_exceeded(&self, active_count: usize) -> bool {
        self.config.run_upload_active_watermark > 0
            && active_count > self.config.run_upload_active_watermark
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_global_concurrency() {
        let controller = AdmissionController::new(AdmissionConfig {
            run_max_concurrency: 1,
            teacher_max_active_runs: 5,
            ..AdmissionConfig::default()
        });
        let r1 = RunId::new();
        let r2 = RunId::new();
        controller.register_run(r1, "t1").await;
        controller.register_run(r2, "t1").await;

        assert!(controller.try_admit(r1, "t1").await);
        assert!(!controller.try_admit(r2, "t1").await);

        controller.release_slot(r1).await;
        // r2 is not head-of-queue admission target until r1 popped, but
        // head is already r2 since r1 was popped on admit.
        assert!(controller.try_admit(r2, "t1").await);
    }

    #[tokio::test]
    async fn release_slot_is_idempotent() {
        let controller = AdmissionController::new(AdmissionConfig::default());
        let r1 = RunId::new();
        controller.register_run(r1, "t1").await;
        assert!(controller.try_admit(r1, "t1").await);
        controller.release_slot(r1).await;
        controller.release_slot(r1).await;
        controller.release_slot(r1).await;
    }

    #[tokio::test]
    async fn cancellation_flag_is_observable() {
        let controller = AdmissionController::new(AdmissionConfig::default());
        let r1 = RunId::new();
        controller.register_run(r1, "t1").await;
        assert!(!controller.is_cancelled(r1).await);
        controller.cancel(r1).await;
        assert!(controller.is_cancelled(r1).await);
    }

    #[tokio::test]
    async fn per_teacher_concurrency_is_independent_of_global() {
        let controller = AdmissionController::new(AdmissionConfig {
            run_max_concurrency: 5,
            teacher_max_active_runs: 1,
            ..AdmissionConfig::default()
        });
        let r1 = RunId::new();
        let r2 = RunId::new();
        controller.register_run(r1, "t1").await;
        controller.register_run(r2, "t1").await;
        assert!(controller.try_admit(r1, "t1").await);
        assert!(!controller.try_admit(r2, "t1").await);
    }
}
