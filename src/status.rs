//! In-memory registry of run and batch progress, consulted by polling clients.
//!
//! Run and batch state share one lock, so a run's terminal transition and
//! the matching batch counter update are applied as a single step. Finished
//! work is released after a retention period; pollers then read the stored
//! rows instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::model::{
    BatchRunEntry, BatchStatus, ProgressSnapshot, RunOutcome, RunRequest, RunStatus, RunTotals,
};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Live view of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub test_set_id: i64,
    pub release_id: i64,
    pub batch_id: Option<String>,
    pub status: RunStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub totals: RunTotals,
    pub error: Option<String>,
    /// Present only while the run is `running`.
    pub progress: Option<ProgressSnapshot>,
    /// Stored row is stale; never release.
    #[serde(skip)]
    retained: bool,
}

impl RunState {
    fn queued(run_id: Uuid, request: &RunRequest, queued_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            test_set_id: request.test_set_id,
            release_id: request.release_id,
            batch_id: request.batch_id.clone(),
            status: RunStatus::Queued,
            queued_at,
            started_at: None,
            finished_at: None,
            totals: RunTotals::default(),
            error: None,
            progress: None,
            retained: false,
        }
    }
}

/// Live view of one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchState {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total_sets: u32,
    pub completed_sets: u32,
    pub passed_sets: u32,
    pub failed_sets: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub runs: Vec<BatchRunEntry>,
    /// Member runs currently `running`.
    pub running: u32,
    /// Highest value `running` has reached.
    pub peak_running: u32,
    pub error: Option<String>,
}

impl BatchState {
    fn entry_mut(&mut self, run_id: Uuid) -> Option<&mut BatchRunEntry> {
        self.runs.iter_mut().find(|e| e.run_id == run_id)
    }
}

#[derive(Default)]
struct Registry {
    runs: HashMap<Uuid, RunState>,
    batches: HashMap<String, BatchState>,
}

impl Registry {
    fn evict_run(&mut self, run_id: Uuid) {
        let finished = self
            .runs
            .get(&run_id)
            .is_some_and(|r| r.status.is_terminal() && !r.retained);
        if finished {
            self.runs.remove(&run_id);
            debug!(run_id = %run_id, "released finished run");
        }
    }

    /// Drop a closed batch with its members. Never-started members go too:
    /// their stored rows are still `queued`.
    fn evict_batch(&mut self, batch_id: &str) {
        let Some(batch) = self.batches.remove(batch_id) else {
            return;
        };
        for entry in &batch.runs {
            let releasable = self
                .runs
                .get(&entry.run_id)
                .is_some_and(|r| r.status != RunStatus::Running && !r.retained);
            if releasable {
                self.runs.remove(&entry.run_id);
            }
        }
        debug!(batch_id = %batch_id, "released closed batch");
    }
}

// ---------------------------------------------------------------------------
// StatusRegistry
// ---------------------------------------------------------------------------

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60);

/// Shared handle to the registry; cheap to clone.
#[derive(Clone)]
pub struct StatusRegistry {
    inner: Arc<RwLock<Registry>>,
    retention: Duration,
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep finished runs and closed batches for `retention` before
    /// releasing them. Zero releases immediately.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Registry::default())),
            retention,
        }
    }

    pub async fn register_run(&self, run_id: Uuid, request: &RunRequest, queued_at: DateTime<Utc>) {
        let state = RunState::queued(run_id, request, queued_at);
        self.inner.write().await.runs.insert(run_id, state);
    }

    /// Register a batch and all of its member runs in one step, in
    /// submission order.
    pub async fn register_batch(
        &self,
        batch_id: &str,
        members: &[(Uuid, RunRequest)],
        started_at: DateTime<Utc>,
    ) {
        let mut reg = self.inner.write().await;
        let mut entries = Vec::with_capacity(members.len());
        for (run_id, request) in members {
            reg.runs
                .insert(*run_id, RunState::queued(*run_id, request, started_at));
            entries.push(BatchRunEntry {
                run_id: *run_id,
                test_set_id: request.test_set_id,
                status: RunStatus::Queued,
            });
        }
        let state = BatchState {
            batch_id: batch_id.to_string(),
            status: BatchStatus::Running,
            total_sets: entries.len() as u32,
            completed_sets: 0,
            passed_sets: 0,
            failed_sets: 0,
            started_at,
            finished_at: None,
            runs: entries,
            running: 0,
            peak_running: 0,
            error: None,
        };
        reg.batches.insert(batch_id.to_string(), state);
    }

    /// `queued -> running`. Returns false if the transition is invalid.
    pub async fn mark_running(&self, run_id: Uuid, started_at: DateTime<Utc>) -> bool {
        let mut reg = self.inner.write().await;
        let Some(run) = reg.runs.get_mut(&run_id) else {
            warn!(run_id = %run_id, "mark_running on unknown run");
            return false;
        };
        if !run.status.can_transition_to(RunStatus::Running) {
            warn!(run_id = %run_id, status = %run.status, "rejected transition to running");
            return false;
        }
        run.status = RunStatus::Running;
        run.started_at = Some(started_at);
        let batch_id = run.batch_id.clone();

        let Some(batch_id) = batch_id else {
            return true;
        };
        if let Some(batch) = reg.batches.get_mut(&batch_id) {
            batch.running += 1;
            batch.peak_running = batch.peak_running.max(batch.running);
            if let Some(entry) = batch.entry_mut(run_id) {
                entry.status = RunStatus::Running;
            }
        }
        true
    }

    /// Overwrite the progress snapshot of a running run. Ignored otherwise.
    pub async fn update_progress(&self, run_id: Uuid, snapshot: ProgressSnapshot) {
        let mut reg = self.inner.write().await;
        if let Some(run) = reg.runs.get_mut(&run_id) {
            if run.status == RunStatus::Running {
                run.progress = Some(snapshot);
            }
        }
    }

    /// Subscribe a run to a progress channel: every snapshot received is
    /// applied until the sending side is dropped.
    pub fn subscribe_progress(
        &self,
        run_id: Uuid,
        mut rx: mpsc::UnboundedReceiver<ProgressSnapshot>,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                debug!(run_id = %run_id, ?snapshot, "progress");
                registry.update_progress(run_id, snapshot).await;
            }
        })
    }

    /// `running -> passed|failed`, folding the outcome into the owning batch.
    ///
    /// Returns the batch status when this completion made the batch terminal.
    pub async fn finish_run(
        &self,
        run_id: Uuid,
        outcome: &RunOutcome,
        finished_at: DateTime<Utc>,
    ) -> Option<BatchStatus> {
        let mut reg = self.inner.write().await;
        let terminal = outcome.run_status();

        let Some(run) = reg.runs.get_mut(&run_id) else {
            warn!(run_id = %run_id, "finish_run on unknown run");
            return None;
        };
        if !run.status.can_transition_to(terminal) {
            warn!(run_id = %run_id, from = %run.status, to = %terminal, "rejected terminal transition");
            return None;
        }
        run.status = terminal;
        run.finished_at = Some(finished_at);
        run.totals = outcome.totals;
        run.error = outcome.error.clone();
        run.progress = None;
        let batch_id = run.batch_id.clone()?;

        let batch = reg.batches.get_mut(&batch_id)?;
        batch.running = batch.running.saturating_sub(1);
        if let Some(entry) = batch.entry_mut(run_id) {
            entry.status = terminal;
        }
        if batch.status.is_terminal() || batch.completed_sets >= batch.total_sets {
            // Aborted batches still drain their in-flight runs.
            return None;
        }

        batch.completed_sets += 1;
        if terminal == RunStatus::Passed {
            batch.passed_sets += 1;
        } else {
            batch.failed_sets += 1;
        }

        if batch.completed_sets == batch.total_sets {
            batch.status = if batch.failed_sets == 0 {
                BatchStatus::Completed
            } else {
                BatchStatus::Failed
            };
            batch.finished_at = Some(finished_at);
            info!(
                batch_id = %batch_id,
                status = %batch.status,
                passed = batch.passed_sets,
                failed = batch.failed_sets,
                "batch finished"
            );
            return Some(batch.status);
        }
        None
    }

    /// Force a batch to `failed` after a scheduler-level error. No-op if the
    /// batch is already terminal.
    pub async fn abort_batch(&self, batch_id: &str, error: impl Into<String>) -> bool {
        let mut reg = self.inner.write().await;
        let Some(batch) = reg.batches.get_mut(batch_id) else {
            return false;
        };
        if batch.status.is_terminal() {
            return false;
        }
        let error = error.into();
        warn!(batch_id = %batch_id, error = %error, "batch aborted");
        batch.status = BatchStatus::Failed;
        batch.finished_at = Some(Utc::now());
        batch.error = Some(error);
        true
    }

    /// Pin a run whose stored row could not be written, so pollers keep
    /// seeing its live state.
    pub async fn retain(&self, run_id: Uuid) {
        if let Some(run) = self.inner.write().await.runs.get_mut(&run_id) {
            run.retained = true;
        }
    }

    /// Release a finished ad-hoc run after the retention period.
    pub async fn release_run(&self, run_id: Uuid) {
        self.after_retention(move |reg| reg.evict_run(run_id)).await;
    }

    /// Release a closed batch and its member runs after the retention period.
    pub async fn release_batch(&self, batch_id: &str) {
        let batch_id = batch_id.to_string();
        self.after_retention(move |reg| reg.evict_batch(&batch_id))
            .await;
    }

    async fn after_retention<F>(&self, evict: F)
    where
        F: FnOnce(&mut Registry) + Send + 'static,
    {
        if self.retention.is_zero() {
            evict(&mut *self.inner.write().await);
            return;
        }
        let inner = self.inner.clone();
        let delay = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            evict(&mut *inner.write().await);
        });
    }

    pub async fn run(&self, run_id: Uuid) -> Option<RunState> {
        self.inner.read().await.runs.get(&run_id).cloned()
    }

    pub async fn progress(&self, run_id: Uuid) -> Option<ProgressSnapshot> {
        self.inner
            .read()
            .await
            .runs
            .get(&run_id)
            .and_then(|r| r.progress.clone())
    }

    pub async fn batch(&self, batch_id: &str) -> Option<BatchState> {
        self.inner.read().await.batches.get(batch_id).cloned()
    }

    pub async fn has_batch(&self, batch_id: &str) -> bool {
        self.inner.read().await.batches.contains_key(batch_id)
    }
}
