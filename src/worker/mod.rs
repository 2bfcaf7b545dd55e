//! Worker process protocol -- spawn one isolated worker per run, feed it the
//! environment contract, read `PROGRESS:` / `RESULT:` lines from its stdout.

pub mod process;
pub mod protocol;

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::model::{RunOutcome, RunRequest};

pub use process::{run_worker, WorkerCommand};

pub const ENV_RUN_ID: &str = "TESTRIG_RUN_ID";
pub const ENV_TEST_SET_ID: &str = "TESTRIG_TEST_SET_ID";
pub const ENV_RELEASE_ID: &str = "TESTRIG_RELEASE_ID";
pub const ENV_RELEASE_LABEL: &str = "TESTRIG_RELEASE_LABEL";
pub const ENV_BASE_URL: &str = "TESTRIG_BASE_URL";
pub const ENV_ENVIRONMENT: &str = "TESTRIG_ENVIRONMENT";
pub const ENV_API_URL: &str = "TESTRIG_API_URL";
pub const ENV_BATCH: &str = "TESTRIG_BATCH";
pub const ENV_BATCH_ID: &str = "TESTRIG_BATCH_ID";
pub const ENV_REPORT_PATH: &str = "TESTRIG_REPORT_PATH";
pub const ENV_ARTIFACTS_DIR: &str = "TESTRIG_ARTIFACTS_DIR";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} pipe was not captured")]
    MissingPipe(&'static str),

    #[error("i/o error while talking to worker: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters injected into the worker's environment at spawn time.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub run_id: Uuid,
    pub test_set_id: i64,
    pub release_id: i64,
    pub release_label: Option<String>,
    pub base_url: String,
    pub environment: Option<String>,
    pub api_url: String,
    pub batch_id: Option<String>,
    pub report_path: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl WorkerEnv {
    pub fn new(
        run_id: Uuid,
        request: &RunRequest,
        api_url: impl Into<String>,
        report_path: PathBuf,
        artifacts_dir: PathBuf,
    ) -> Self {
        Self {
            run_id,
            test_set_id: request.test_set_id,
            release_id: request.release_id,
            release_label: request.release_label.clone(),
            base_url: request.base_url.clone(),
            environment: request.environment.clone(),
            api_url: api_url.into(),
            batch_id: request.batch_id.clone(),
            report_path,
            artifacts_dir,
        }
    }

    pub fn is_batch_member(&self) -> bool {
        self.batch_id.is_some()
    }

    /// The full variable set, in a stable order.
    pub fn vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            (ENV_RUN_ID, self.run_id.to_string()),
            (ENV_TEST_SET_ID, self.test_set_id.to_string()),
            (ENV_RELEASE_ID, self.release_id.to_string()),
            (
                ENV_RELEASE_LABEL,
                self.release_label.clone().unwrap_or_default(),
            ),
            (ENV_BASE_URL, self.base_url.clone()),
            (ENV_ENVIRONMENT, self.environment.clone().unwrap_or_default()),
            (ENV_API_URL, self.api_url.clone()),
            (
                ENV_BATCH,
                if self.is_batch_member() { "1" } else { "0" }.to_string(),
            ),
            (ENV_REPORT_PATH, self.report_path.display().to_string()),
            (ENV_ARTIFACTS_DIR, self.artifacts_dir.display().to_string()),
        ];
        if let Some(batch_id) = &self.batch_id {
            vars.push((ENV_BATCH_ID, batch_id.clone()));
        }
        vars
    }
}

/// Where a run's final outcome came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A `RESULT:` line was parsed; used verbatim.
    Reported,
    /// Exit 0 with no `RESULT:` line.
    SilentExit,
    /// Non-zero exit (or signal) with no `RESULT:` line.
    Crashed,
    /// The last `RESULT:` line did not parse.
    Malformed,
    /// The executable could not be started.
    SpawnFailed,
    /// Killed after exceeding the configured worker timeout.
    TimedOut,
}

impl Origin {
    /// Outcomes synthesized because the worker itself misbehaved.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Origin::Crashed | Origin::Malformed | Origin::SpawnFailed | Origin::TimedOut
        )
    }
}

/// Everything the orchestrator learns from one worker invocation.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub outcome: RunOutcome,
    pub origin: Origin,
    pub exit_code: Option<i32>,
}

impl WorkerReport {
    pub fn spawn_failed(err: &WorkerError) -> Self {
        Self {
            outcome: RunOutcome::failure(err.to_string()),
            origin: Origin::SpawnFailed,
            exit_code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(batch_id: Option<&str>) -> WorkerEnv {
        let mut request = RunRequest::new(12, 3, "https://staging.example.com")
            .with_release_label("R3")
            .with_environment("staging");
        request.batch_id = batch_id.map(str::to_string);
        WorkerEnv::new(
            Uuid::nil(),
            &request,
            "http://127.0.0.1:8080/api",
            PathBuf::from("/tmp/report.json"),
            PathBuf::from("/tmp/artifacts"),
        )
    }

    fn lookup<'a>(vars: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        vars.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_single_run_env() {
        let vars = env(None).vars();
        assert_eq!(lookup(&vars, ENV_TEST_SET_ID), Some("12"));
        assert_eq!(lookup(&vars, ENV_RELEASE_ID), Some("3"));
        assert_eq!(lookup(&vars, ENV_RELEASE_LABEL), Some("R3"));
        assert_eq!(lookup(&vars, ENV_BASE_URL), Some("https://staging.example.com"));
        assert_eq!(lookup(&vars, ENV_BATCH), Some("0"));
        assert_eq!(lookup(&vars, ENV_BATCH_ID), None);
    }

    #[test]
    fn test_batch_child_env() {
        let vars = env(Some("batch-7")).vars();
        assert_eq!(lookup(&vars, ENV_BATCH), Some("1"));
        assert_eq!(lookup(&vars, ENV_BATCH_ID), Some("batch-7"));
    }

    #[test]
    fn test_infrastructure_origins() {
        assert!(!Origin::Reported.is_infrastructure());
        assert!(!Origin::SilentExit.is_infrastructure());
        assert!(Origin::Crashed.is_infrastructure());
        assert!(Origin::Malformed.is_infrastructure());
        assert!(Origin::SpawnFailed.is_infrastructure());
        assert!(Origin::TimedOut.is_infrastructure());
    }
}
