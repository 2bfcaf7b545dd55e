//! The orchestrator: one object owning the status registry, the serial
//! queue and the batch executor, handed to the request layer by clone.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::batch::BatchExecutor;
use crate::config::Config;
use crate::model::{
    BatchHandle, BatchSubmission, ProgressSnapshot, RunRequest, RunStatus, StepResult, StoredRun,
};
use crate::queue::{QueueStatus, SerialQueue};
use crate::runner::RunExecutor;
use crate::status::{BatchState, RunState, StatusRegistry};
use crate::storage::batches::{self, BatchDetails, StoredBatch};
use crate::storage::{runs, Pool};

/// Why a submission was refused. Nothing was queued.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("batch contains no test sets")]
    EmptyBatch,

    #[error("batch '{0}' already exists")]
    DuplicateBatch(String),

    #[error("invalid batch id '{0}'")]
    InvalidBatchId(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Run status as seen by a poller: live while this process knows the run,
/// otherwise the stored row.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RunView {
    Live(RunState),
    Stored(StoredRun),
}

impl RunView {
    pub fn status(&self) -> RunStatus {
        match self {
            RunView::Live(state) => state.status,
            RunView::Stored(row) => row.status,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            RunView::Live(state) => state.error.as_deref(),
            RunView::Stored(row) => row.error.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BatchView {
    Live(BatchState),
    Stored(StoredBatch),
}

/// Full per-run breakdown once the batch is closed; the live snapshot before.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BatchDetailsView {
    Live(BatchState),
    Stored(BatchDetails),
}

#[derive(Clone)]
pub struct Orchestrator {
    executor: RunExecutor,
    queue: SerialQueue,
    batches: BatchExecutor,
}

impl Orchestrator {
    pub fn new(config: &Config, pool: Pool) -> Self {
        let registry = StatusRegistry::with_retention(config.status.retention());
        let executor = RunExecutor::new(pool, registry, config);
        Self {
            queue: SerialQueue::new(executor.clone()),
            batches: BatchExecutor::new(executor.clone(), config.batch.max_concurrent),
            executor,
        }
    }

    fn registry(&self) -> &StatusRegistry {
        self.executor.registry()
    }

    /// Queue one ad-hoc run on the serial queue.
    pub async fn submit_run(&self, mut request: RunRequest) -> Result<Uuid, SubmitError> {
        request.batch_id = None;
        self.queue.enqueue(request).await
    }

    /// Start one run per test set on the batch executor.
    pub async fn submit_batch(
        &self,
        submission: BatchSubmission,
    ) -> Result<BatchHandle, SubmitError> {
        let requests = submission.requests();
        self.batches
            .start_batch(submission.batch_id, requests)
            .await
    }

    pub async fn run_status(&self, run_id: Uuid) -> Result<Option<RunView>> {
        if let Some(state) = self.registry().run(run_id).await {
            return Ok(Some(RunView::Live(state)));
        }
        let stored = self.stored_run(run_id).await?;
        Ok(stored.map(RunView::Stored))
    }

    /// The stored row only, ignoring live state.
    pub async fn stored_run(&self, run_id: Uuid) -> Result<Option<StoredRun>> {
        self.with_conn(move |conn| runs::load(conn, run_id)).await
    }

    /// Persisted step rows. `None` if the run is unknown.
    pub async fn run_steps(&self, run_id: Uuid) -> Result<Option<Vec<StepResult>>> {
        self.with_conn(move |conn| {
            if runs::load(conn, run_id)?.is_none() {
                return Ok(None);
            }
            runs::load_steps(conn, run_id).map(Some)
        })
        .await
    }

    pub async fn batch_status(&self, batch_id: &str) -> Result<Option<BatchView>> {
        if let Some(state) = self.registry().batch(batch_id).await {
            return Ok(Some(BatchView::Live(state)));
        }
        let id = batch_id.to_string();
        let stored = self.with_conn(move |conn| batches::load(conn, &id)).await?;
        Ok(stored.map(BatchView::Stored))
    }

    pub async fn batch_details(&self, batch_id: &str) -> Result<Option<BatchDetailsView>> {
        let id = batch_id.to_string();
        let stored = self
            .with_conn(move |conn| batches::load_details(conn, &id))
            .await?;

        if let Some(details) = &stored {
            if details.batch.status.is_terminal() {
                return Ok(stored.map(BatchDetailsView::Stored));
            }
        }
        if let Some(state) = self.registry().batch(batch_id).await {
            return Ok(Some(BatchDetailsView::Live(state)));
        }
        // Left running by an earlier process.
        Ok(stored.map(BatchDetailsView::Stored))
    }

    pub async fn queue_status(&self) -> QueueStatus {
        self.queue.status().await
    }

    pub async fn is_running(&self, run_id: Uuid) -> bool {
        self.queue.is_running(run_id).await
    }

    pub async fn progress(&self, run_id: Uuid) -> Option<ProgressSnapshot> {
        self.queue.progress(run_id).await
    }

    /// Poll until the run is terminal; used by the one-shot CLI commands.
    /// `None` if the run is unknown.
    pub async fn wait_for_run(&self, run_id: Uuid, poll: Duration) -> Result<Option<RunView>> {
        loop {
            let Some(view) = self.run_status(run_id).await? else {
                return Ok(None);
            };
            if view.status().is_terminal() {
                return Ok(Some(view));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Poll until the batch row is closed, report merged.
    pub async fn wait_for_batch(&self, batch_id: &str, poll: Duration) -> Result<BatchDetails> {
        loop {
            let id = batch_id.to_string();
            let details = self
                .with_conn(move |conn| batches::load_details(conn, &id))
                .await?
                .with_context(|| format!("batch {batch_id} not found"))?;
            if details.batch.status.is_terminal() {
                return Ok(details);
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.executor.pool().clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&*conn)
        })
        .await
        .context("storage task failed")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BatchStatus, RunStatus};
    use crate::storage;
    use tempfile::TempDir;

    fn config(dir: &TempDir, script: &str) -> Config {
        let mut config = Config::default();
        config.worker.program = "sh".to_string();
        config.worker.args = vec!["-c".to_string(), script.to_string()];
        config.worker.artifacts_dir = dir.path().join("artifacts");
        config.reports.dir = dir.path().join("reports");
        config
    }

    fn orchestrator(dir: &TempDir, script: &str) -> Orchestrator {
        let pool = storage::open_pool(dir.path().join("testrig.db")).unwrap();
        Orchestrator::new(&config(dir, script), pool)
    }

    const PASSING: &str = r#"echo 'RESULT:{"status":"passed","totalSteps":1,"passedSteps":1,"steps":[{"description":"home","status":"passed","durationMs":3}]}'"#;

    #[tokio::test]
    async fn test_submit_run_and_poll() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, PASSING);

        let run_id = orch
            .submit_run(RunRequest::new(1, 1, "http://x"))
            .await
            .unwrap();
        let view = tokio::time::timeout(
            Duration::from_secs(10),
            orch.wait_for_run(run_id, Duration::from_millis(20)),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(view.status(), RunStatus::Passed);

        match orch.run_status(run_id).await.unwrap() {
            Some(RunView::Live(live)) => assert_eq!(live.totals.passed_steps, 1),
            other => panic!("unexpected view: {other:?}"),
        }

        // Steps land before the registry turns terminal.
        let steps = orch.run_steps(run_id).await.unwrap().unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].description, "home");

        assert!(orch.run_steps(Uuid::new_v4()).await.unwrap().is_none());
        assert!(orch.run_status(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_run_ignores_caller_batch_id() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, PASSING);
        let mut request = RunRequest::new(1, 1, "http://x");
        request.batch_id = Some("not-a-batch".to_string());

        let run_id = orch.submit_run(request).await.unwrap();
        match orch.run_status(run_id).await.unwrap() {
            Some(RunView::Live(live)) => assert!(live.batch_id.is_none()),
            other => panic!("unexpected view: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_batch_details_after_close() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir, PASSING);
        let handle = orch
            .submit_batch(BatchSubmission {
                batch_id: None,
                release_id: 3,
                release_label: Some("R3".to_string()),
                environment: Some("qa".to_string()),
                base_url: "http://qa".to_string(),
                test_set_ids: vec![1, 2, 3],
            })
            .await
            .unwrap();

        let details = tokio::time::timeout(
            Duration::from_secs(10),
            orch.wait_for_batch(&handle.batch_id, Duration::from_millis(20)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(details.batch.status, BatchStatus::Completed);
        assert_eq!(details.batch.release_id, Some(3));
        assert_eq!(details.batch.environment.as_deref(), Some("qa"));

        match orch.batch_details(&handle.batch_id).await.unwrap() {
            Some(BatchDetailsView::Stored(stored)) => {
                assert_eq!(stored.runs.len(), 3);
                assert!(stored.runs.iter().all(|r| r.duration_ms.is_some()));
            }
            other => panic!("unexpected view: {other:?}"),
        }
        match orch.batch_status(&handle.batch_id).await.unwrap() {
            Some(BatchView::Live(live)) => assert_eq!(live.completed_sets, 3),
            other => panic!("unexpected view: {other:?}"),
        }
        assert!(orch.batch_status("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_instances_are_isolated() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = orchestrator(&dir_a, PASSING);
        let b = orchestrator(&dir_b, PASSING);

        let run_id = a.submit_run(RunRequest::new(1, 1, "http://x")).await.unwrap();
        assert!(b.run_status(run_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finished_work_is_served_from_storage() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, PASSING);
        config.status.retain_finished_sec = 0;
        let pool = storage::open_pool(dir.path().join("testrig.db")).unwrap();
        let orch = Orchestrator::new(&config, pool);

        let mut run_ids = Vec::new();
        for set in 1..=5 {
            run_ids.push(orch.submit_run(RunRequest::new(set, 1, "http://x")).await.unwrap());
        }
        for run_id in &run_ids {
            let view = tokio::time::timeout(
                Duration::from_secs(10),
                orch.wait_for_run(*run_id, Duration::from_millis(10)),
            )
            .await
            .unwrap()
            .unwrap()
            .unwrap();
            assert_eq!(view.status(), RunStatus::Passed);
        }

        // Each run leaves the registry once it has left the queue's slot.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let mut stored = 0;
                for run_id in &run_ids {
                    if let Some(RunView::Stored(row)) = orch.run_status(*run_id).await.unwrap() {
                        assert_eq!(row.status, RunStatus::Passed);
                        stored += 1;
                    }
                }
                if stored == run_ids.len() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(orch.queue_status().await.active.is_none());

        let handle = orch
            .submit_batch(BatchSubmission {
                batch_id: Some("released".to_string()),
                release_id: 1,
                release_label: None,
                environment: None,
                base_url: "http://x".to_string(),
                test_set_ids: vec![1, 2],
            })
            .await
            .unwrap();
        tokio::time::timeout(
            Duration::from_secs(10),
            orch.wait_for_batch(&handle.batch_id, Duration::from_millis(10)),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !matches!(
                orch.batch_status(&handle.batch_id).await.unwrap(),
                Some(BatchView::Stored(_))
            ) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        for run_id in &handle.run_ids {
            match orch.run_status(*run_id).await.unwrap() {
                Some(RunView::Stored(row)) => assert_eq!(row.status, RunStatus::Passed),
                other => panic!("unexpected view: {other:?}"),
            }
        }
    }
}
