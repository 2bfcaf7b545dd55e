//! Parallel batch executor.
//!
//! A batch's runs share a pool of `max_concurrent` slots (7 by default),
//! independent of the serial queue. Slots are handed out in submission
//! order; a finished slot starts exactly one more pending run. Per-run
//! failures only count against the batch. A dead item task is a scheduler
//! failure: nothing new is started and the batch is closed as `failed`.

use anyhow::Context;
use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::model::{BatchHandle, RunRequest, RunStatus};
use crate::orchestrator::SubmitError;
use crate::report;
use crate::runner::RunExecutor;
use crate::storage::batches::{self, BatchClose, NewBatch};

pub const DEFAULT_MAX_CONCURRENT: usize = 7;

const MAX_BATCH_ID_LEN: usize = 128;

#[derive(Clone)]
pub struct BatchExecutor {
    executor: RunExecutor,
    max_concurrent: usize,
}

impl BatchExecutor {
    pub fn new(executor: RunExecutor, max_concurrent: usize) -> Self {
        Self {
            executor,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Accept a batch and start it in the background.
    ///
    /// Returns once the batch row and every member run are durable and
    /// registered; execution continues asynchronously.
    pub async fn start_batch(
        &self,
        batch_id: Option<String>,
        requests: Vec<RunRequest>,
    ) -> Result<BatchHandle, SubmitError> {
        if requests.is_empty() {
            return Err(SubmitError::EmptyBatch);
        }
        let batch_id = match batch_id {
            Some(id) => {
                validate_batch_id(&id)?;
                id
            }
            None => format!("batch-{}", Uuid::new_v4()),
        };

        let registry = self.executor.registry();
        if registry.has_batch(&batch_id).await {
            return Err(SubmitError::DuplicateBatch(batch_id));
        }

        let members: Vec<(Uuid, RunRequest)> = requests
            .into_iter()
            .map(|mut request| {
                request.batch_id = Some(batch_id.clone());
                (Uuid::new_v4(), request)
            })
            .collect();
        let release_id = shared(&members, |r| Some(r.release_id));
        let environment = shared(&members, |r| r.environment.clone());
        let started_at = Utc::now();

        let pool = self.executor.pool().clone();
        let row_id = batch_id.clone();
        let rows = members.clone();
        let admitted = tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let mut conn = pool.get()?;
            let batch = NewBatch {
                id: &row_id,
                release_id,
                environment: environment.as_deref(),
                started_at,
            };
            batches::admit(&mut conn, &batch, &rows)
        })
        .await
        .context("batch admission task failed")??;
        if !admitted {
            return Err(SubmitError::DuplicateBatch(batch_id));
        }

        registry
            .register_batch(&batch_id, &members, started_at)
            .await;

        let handle = BatchHandle {
            batch_id: batch_id.clone(),
            run_ids: members.iter().map(|(id, _)| *id).collect(),
        };
        info!(
            batch_id = %batch_id,
            runs = handle.run_ids.len(),
            max_concurrent = self.max_concurrent,
            "batch accepted"
        );

        tokio::spawn(self.clone().supervise(batch_id, members));
        Ok(handle)
    }

    /// Run the scheduler in its own task so even a failure of the loop
    /// itself still closes the batch.
    async fn supervise(self, batch_id: String, members: Vec<(Uuid, RunRequest)>) {
        let scheduler = tokio::spawn(self.clone().schedule(batch_id.clone(), members));
        if let Err(e) = scheduler.await {
            error!(batch_id = %batch_id, error = %e, "batch scheduler aborted");
            self.executor
                .registry()
                .abort_batch(&batch_id, format!("batch scheduler aborted: {e}"))
                .await;
        }
        self.close(&batch_id).await;
    }

    async fn schedule(self, batch_id: String, members: Vec<(Uuid, RunRequest)>) {
        let mut pending = members.into_iter();
        let mut live = JoinSet::new();
        let mut aborted = false;

        for (run_id, request) in pending.by_ref().take(self.max_concurrent) {
            self.start_item(&mut live, run_id, request);
        }

        while let Some(joined) = live.join_next().await {
            match joined {
                Ok(()) => {
                    if aborted {
                        continue;
                    }
                    if let Some((run_id, request)) = pending.next() {
                        self.start_item(&mut live, run_id, request);
                    }
                }
                Err(e) => {
                    error!(batch_id = %batch_id, error = %e, "batch item task aborted");
                    if !aborted {
                        aborted = true;
                        self.executor
                            .registry()
                            .abort_batch(&batch_id, format!("batch item task aborted: {e}"))
                            .await;
                    }
                }
            }
        }

        if aborted {
            self.fail_orphans(&batch_id).await;
        }
    }

    fn start_item(&self, live: &mut JoinSet<()>, run_id: Uuid, request: RunRequest) {
        let executor = self.executor.clone();
        live.spawn(async move {
            executor.execute(run_id, &request).await;
        });
    }

    /// Members left `running` by a dead item task. Never-started members
    /// stay `queued`.
    async fn fail_orphans(&self, batch_id: &str) {
        let Some(state) = self.executor.registry().batch(batch_id).await else {
            return;
        };
        for entry in state.runs.iter().filter(|e| e.status == RunStatus::Running) {
            self.executor
                .fail_abandoned(entry.run_id, "batch item task aborted")
                .await;
        }
    }

    /// Merge the batch report and write the terminal batch row, once.
    async fn close(&self, batch_id: &str) {
        let registry = self.executor.registry();
        let Some(mut state) = registry.batch(batch_id).await else {
            warn!(batch_id = %batch_id, "closing unknown batch");
            return;
        };
        if !state.status.is_terminal() {
            registry
                .abort_batch(batch_id, "batch ended with unfinished runs")
                .await;
            match registry.batch(batch_id).await {
                Some(refreshed) => state = refreshed,
                None => return,
            }
        }

        let layout = self.executor.layout().clone();
        let merge_id = batch_id.to_string();
        let status = state.status;
        let entries = state.runs.clone();
        let report_path = match tokio::task::spawn_blocking(move || {
            report::merge_batch(&layout, &merge_id, status, &entries)
        })
        .await
        {
            Ok(Ok(path)) => Some(path.display().to_string()),
            Ok(Err(e)) => {
                error!(batch_id = %batch_id, error = %e, "failed to merge batch report");
                None
            }
            Err(e) => {
                error!(batch_id = %batch_id, error = %e, "report merge task panicked");
                None
            }
        };

        let pool = self.executor.pool().clone();
        let row_id = batch_id.to_string();
        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = pool.get()?;
            batches::close(
                &conn,
                &row_id,
                &BatchClose {
                    status: state.status,
                    completed_sets: state.completed_sets,
                    passed_sets: state.passed_sets,
                    failed_sets: state.failed_sets,
                    finished_at: state.finished_at.unwrap_or_else(Utc::now),
                    report_path: report_path.as_deref(),
                    error: state.error.as_deref(),
                },
            )
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!(batch_id = %batch_id, status = %status, "batch closed");
                registry.release_batch(batch_id).await;
            }
            Ok(Err(e)) => error!(batch_id = %batch_id, error = %e, "failed to persist batch"),
            Err(e) => error!(batch_id = %batch_id, error = %e, "batch persistence task panicked"),
        }
    }
}

/// The value every member agrees on, if any.
fn shared<T: PartialEq>(
    members: &[(Uuid, RunRequest)],
    f: impl Fn(&RunRequest) -> Option<T>,
) -> Option<T> {
    let mut values = members.iter().map(|(_, r)| f(r));
    let first = values.next()??;
    values.all(|v| v.as_ref() == Some(&first)).then_some(first)
}

/// Batch ids name a report directory, so keep them path-safe.
fn validate_batch_id(id: &str) -> Result<(), SubmitError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_BATCH_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SubmitError::InvalidBatchId(id.to_string()))
    }
}
