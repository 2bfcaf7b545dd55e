//! Single-slot execution queue for ad-hoc runs.
//!
//! Strict FIFO: one active run at a time, the next pending run starts as
//! soon as the previous one is finalized. The drain task exists only while
//! there is work; `enqueue` never waits for execution. A run leaves the
//! status registry only after it has left the active slot.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::model::{ProgressSnapshot, RunRequest};
use crate::orchestrator::SubmitError;
use crate::runner::RunExecutor;
use crate::status::RunState;

struct QueuedRun {
    run_id: Uuid,
    request: RunRequest,
    enqueued_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    active: Option<Uuid>,
    pending: VecDeque<QueuedRun>,
    draining: bool,
}

/// A waiting run as shown to polling clients.
#[derive(Debug, Clone, Serialize)]
pub struct PendingRun {
    pub run_id: Uuid,
    pub test_set_id: i64,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub active: Option<RunState>,
    pub pending: Vec<PendingRun>,
}

#[derive(Clone)]
pub struct SerialQueue {
    state: Arc<Mutex<QueueState>>,
    executor: RunExecutor,
}

impl SerialQueue {
    pub fn new(executor: RunExecutor) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            executor,
        }
    }

    /// Admit the run and append it to the queue.
    pub async fn enqueue(&self, request: RunRequest) -> Result<Uuid, SubmitError> {
        let run_id = self.executor.admit(&request).await?;

        let mut state = self.state.lock().await;
        state.pending.push_back(QueuedRun {
            run_id,
            request,
            enqueued_at: Utc::now(),
        });
        debug!(run_id = %run_id, position = state.pending.len(), "run enqueued");

        if !state.draining {
            state.draining = true;
            tokio::spawn(self.clone().drain());
        }
        Ok(run_id)
    }

    async fn drain(self) {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                match state.pending.pop_front() {
                    Some(next) => {
                        state.active = Some(next.run_id);
                        next
                    }
                    None => {
                        state.active = None;
                        state.draining = false;
                        debug!("queue drained");
                        return;
                    }
                }
            };

            let run_id = next.run_id;
            info!(run_id = %run_id, test_set_id = next.request.test_set_id, "dequeued run");

            // Own task per run so a panic fails only that run.
            let executor = self.executor.clone();
            let request = next.request;
            let task = tokio::spawn(async move {
                executor.execute(run_id, &request).await;
            });
            if let Err(e) = task.await {
                error!(run_id = %run_id, error = %e, "queued run task aborted");
                self.executor
                    .fail_abandoned(run_id, format!("run execution aborted: {e}"))
                    .await;
            }

            self.state.lock().await.active = None;
            self.executor.registry().release_run(run_id).await;
        }
    }

    /// The active run (with live progress) and the pending list.
    pub async fn status(&self) -> QueueStatus {
        let (active, pending) = {
            let state = self.state.lock().await;
            let pending = state
                .pending
                .iter()
                .map(|q| PendingRun {
                    run_id: q.run_id,
                    test_set_id: q.request.test_set_id,
                    enqueued_at: q.enqueued_at,
                })
                .collect();
            (state.active, pending)
        };

        let active = match active {
            Some(run_id) => self.executor.registry().run(run_id).await,
            None => None,
        };
        QueueStatus { active, pending }
    }

    pub async fn is_running(&self, run_id: Uuid) -> bool {
        self.state.lock().await.active == Some(run_id)
    }

    pub async fn progress(&self, run_id: Uuid) -> Option<ProgressSnapshot> {
        self.executor.registry().progress(run_id).await
    }
}
