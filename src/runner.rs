//! Single-run execution shared by the serial queue and the batch executor:
//! admission, the worker attempt loop, durable finalization and the status
//! registry update.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::model::{RunOutcome, RunRequest, RunStatus};
use crate::orchestrator::SubmitError;
use crate::report::ReportLayout;
use crate::status::StatusRegistry;
use crate::storage::{runs, Pool};
use crate::worker::{run_worker, WorkerCommand, WorkerEnv, WorkerReport};

#[derive(Clone)]
pub struct RunExecutor {
    pool: Pool,
    registry: StatusRegistry,
    command: WorkerCommand,
    api_url: String,
    artifacts_dir: PathBuf,
    retries: u32,
    layout: ReportLayout,
    #[cfg(test)]
    panic_on_test_set: Option<i64>,
}

impl RunExecutor {
    pub fn new(pool: Pool, registry: StatusRegistry, config: &Config) -> Self {
        Self {
            pool,
            registry,
            command: WorkerCommand::from(&config.worker),
            api_url: config.worker.callback_api_url.clone(),
            artifacts_dir: config.worker.artifacts_dir.clone(),
            retries: config.retry.infrastructure_retries,
            layout: ReportLayout::new(&config.reports.dir),
            #[cfg(test)]
            panic_on_test_set: None,
        }
    }

    /// Make the execution task of one test set panic once it is running.
    #[cfg(test)]
    pub(crate) fn panic_on_test_set(mut self, test_set_id: i64) -> Self {
        self.panic_on_test_set = Some(test_set_id);
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn registry(&self) -> &StatusRegistry {
        &self.registry
    }

    pub fn layout(&self) -> &ReportLayout {
        &self.layout
    }

    /// Create the TestRun: new id, durable `queued` row, registry entry.
    pub async fn admit(&self, request: &RunRequest) -> Result<Uuid, SubmitError> {
        let run_id = Uuid::new_v4();
        let queued_at = Utc::now();

        let pool = self.pool.clone();
        let row = request.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = pool.get()?;
            runs::insert_queued(&conn, run_id, &row, &queued_at)
        })
        .await
        .context("admission task failed")??;

        self.registry.register_run(run_id, request, queued_at).await;
        info!(
            run_id = %run_id,
            test_set_id = request.test_set_id,
            batch_id = ?request.batch_id,
            "run admitted"
        );
        Ok(run_id)
    }

    /// Drive an admitted run to a terminal status. Never fails: every
    /// worker failure becomes a failed outcome, and persistence failures are
    /// logged while the registry is still updated.
    pub async fn execute(&self, run_id: Uuid, request: &RunRequest) -> RunOutcome {
        let clock = Instant::now();
        let started_at = Utc::now();

        if !self.registry.mark_running(run_id, started_at).await {
            warn!(run_id = %run_id, "registry did not accept running transition");
        }
        self.record_started(run_id, started_at).await;

        #[cfg(test)]
        if self.panic_on_test_set == Some(request.test_set_id) {
            panic!("execution task for test set {} blew up", request.test_set_id);
        }

        let artifacts_dir = self.artifacts_dir.join(run_id.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&artifacts_dir).await {
            warn!(run_id = %run_id, path = %artifacts_dir.display(), error = %e, "failed to create artifacts dir");
        }
        let report_path = self
            .layout
            .run_report_path(run_id, request.batch_id.as_deref());
        if let Some(parent) = report_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(run_id = %run_id, path = %parent.display(), error = %e, "failed to create report dir");
            }
        }

        let env = WorkerEnv::new(run_id, request, &self.api_url, report_path, artifacts_dir);
        let report = self.run_attempts(&env).await;

        let duration_ms = if report.outcome.duration_ms > 0 {
            report.outcome.duration_ms
        } else {
            clock.elapsed().as_millis() as u64
        };
        let finished_at = Utc::now();

        self.persist(run_id, &report.outcome, finished_at, duration_ms)
            .await;
        self.registry
            .finish_run(run_id, &report.outcome, finished_at)
            .await;

        info!(
            run_id = %run_id,
            status = %report.outcome.run_status(),
            duration_ms,
            "run finished"
        );
        report.outcome
    }

    /// Close out a run whose execution task died before reaching a verdict.
    pub async fn fail_abandoned(&self, run_id: Uuid, error: impl Into<String>) {
        let outcome = RunOutcome::failure(error);
        let now = Utc::now();

        let status = self.registry.run(run_id).await.map(|r| r.status);
        if status == Some(RunStatus::Queued) {
            self.registry.mark_running(run_id, now).await;
            self.record_started(run_id, now).await;
        }

        self.persist(run_id, &outcome, now, 0).await;
        self.registry.finish_run(run_id, &outcome, now).await;
        warn!(run_id = %run_id, error = ?outcome.error, "run failed after its task aborted");
    }

    /// Spawn the worker, re-spawning after infrastructure failures while the
    /// retry budget lasts.
    async fn run_attempts(&self, env: &WorkerEnv) -> WorkerReport {
        let mut attempt = 0;
        loop {
            let (tx, rx) = mpsc::unbounded_channel();
            let forwarder = self.registry.subscribe_progress(env.run_id, rx);

            let report = run_worker(&self.command, env, tx).await;

            // The sender is gone; let the last snapshots land before the
            // terminal transition clears them.
            if let Err(e) = forwarder.await {
                warn!(run_id = %env.run_id, error = %e, "progress forwarder failed");
            }

            if report.origin.is_infrastructure() && attempt < self.retries {
                attempt += 1;
                warn!(
                    run_id = %env.run_id,
                    attempt,
                    max_retries = self.retries,
                    origin = ?report.origin,
                    error = ?report.outcome.error,
                    "retrying worker after infrastructure failure"
                );
                continue;
            }
            return report;
        }
    }

    async fn record_started(&self, run_id: Uuid, started_at: DateTime<Utc>) {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = pool.get()?;
            runs::mark_running(&conn, run_id, &started_at)
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(run_id = %run_id, error = %e, "failed to record run start"),
            Err(e) => error!(run_id = %run_id, error = %e, "run start task panicked"),
        }
    }

    async fn persist(
        &self,
        run_id: Uuid,
        outcome: &RunOutcome,
        finished_at: DateTime<Utc>,
        duration_ms: u64,
    ) {
        let pool = self.pool.clone();
        let outcome = outcome.clone();
        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut conn = pool.get()?;
            runs::finalize(&mut conn, run_id, &outcome, &finished_at, duration_ms)
        })
        .await;

        match result {
            Ok(Ok(())) => {
                debug!(run_id = %run_id, "run outcome persisted");
                return;
            }
            Ok(Err(e)) => error!(run_id = %run_id, error = %e, "failed to persist run outcome"),
            Err(e) => error!(run_id = %run_id, error = %e, "persistence task panicked"),
        }
        self.registry.retain(run_id).await;
    }
}
