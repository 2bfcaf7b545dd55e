//! Core data model: run requests, run/step outcomes, batch and progress state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Caller-supplied description of one test-set execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub test_set_id: i64,
    pub release_id: i64,
    #[serde(default)]
    pub release_label: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    pub base_url: String,
    /// Set by the batch executor for batch children.
    #[serde(default)]
    pub batch_id: Option<String>,
}

impl RunRequest {
    pub fn new(test_set_id: i64, release_id: i64, base_url: impl Into<String>) -> Self {
        Self {
            test_set_id,
            release_id,
            release_label: None,
            environment: None,
            base_url: base_url.into(),
            batch_id: None,
        }
    }

    pub fn with_release_label(mut self, label: impl Into<String>) -> Self {
        self.release_label = Some(label.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }
}

/// A batch request: one run per listed test set, sharing release and target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSubmission {
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    pub batch_id: Option<String>,
    pub release_id: i64,
    #[serde(default)]
    pub release_label: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    pub base_url: String,
    pub test_set_ids: Vec<i64>,
}

impl BatchSubmission {
    /// Expand into one run request per test set, in submission order.
    pub fn requests(&self) -> Vec<RunRequest> {
        self.test_set_ids
            .iter()
            .map(|&test_set_id| RunRequest {
                test_set_id,
                release_id: self.release_id,
                release_label: self.release_label.clone(),
                environment: self.environment.clone(),
                base_url: self.base_url.clone(),
                batch_id: None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle of a TestRun: `queued -> running -> {passed | failed}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Passed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed)
    }

    /// Only the forward edges of the lifecycle are valid.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Queued, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Passed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "passed" => Ok(RunStatus::Passed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Verdict carried by a worker `RESULT` line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Passed,
    Failed,
}

impl From<Verdict> for RunStatus {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Passed => RunStatus::Passed,
            Verdict::Failed => RunStatus::Failed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Passed => "passed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passed" => Ok(StepStatus::Passed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("unknown step status '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// One executed step as reported by the worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    #[serde(default)]
    pub scenario_id: Option<i64>,
    #[serde(default)]
    pub scenario_name: Option<String>,
    #[serde(default)]
    pub step_id: Option<i64>,
    #[serde(default)]
    pub description: String,
    pub status: StepStatus,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub screenshot_path: Option<String>,
}

/// Aggregate counters for a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTotals {
    #[serde(default)]
    pub total_scenarios: u32,
    #[serde(default)]
    pub passed_scenarios: u32,
    #[serde(default)]
    pub failed_scenarios: u32,
    #[serde(default)]
    pub total_steps: u32,
    #[serde(default)]
    pub passed_steps: u32,
    #[serde(default)]
    pub failed_steps: u32,
    #[serde(default)]
    pub skipped_steps: u32,
}

/// Full structured outcome of one run, the payload of a `RESULT:` line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub status: Verdict,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(flatten)]
    pub totals: RunTotals,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub video_path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunOutcome {
    /// Outcome for a worker that exited cleanly without reporting anything.
    pub fn empty_pass() -> Self {
        Self {
            status: Verdict::Passed,
            duration_ms: 0,
            totals: RunTotals::default(),
            steps: Vec::new(),
            video_path: None,
            error: None,
        }
    }

    /// Outcome synthesized for infrastructure failures (spawn, crash, bad protocol).
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: Verdict::Failed,
            duration_ms: 0,
            totals: RunTotals::default(),
            steps: Vec::new(),
            video_path: None,
            error: Some(error.into()),
        }
    }

    pub fn run_status(&self) -> RunStatus {
        self.status.into()
    }

    pub fn passed(&self) -> bool {
        self.status == Verdict::Passed
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Last-known position of an in-flight worker, the payload of a `PROGRESS:` line.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    #[serde(default)]
    pub scenario_index: Option<u32>,
    #[serde(default)]
    pub total_scenarios: Option<u32>,
    #[serde(default)]
    pub scenario_name: Option<String>,
    #[serde(default)]
    pub step_index: Option<u32>,
    #[serde(default)]
    pub total_steps: Option<u32>,
    #[serde(default)]
    pub step_description: Option<String>,
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Running)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(BatchStatus::Running),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(format!("unknown batch status '{other}'")),
        }
    }
}

/// Per-set entry of a batch, in submission order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRunEntry {
    pub run_id: Uuid,
    pub test_set_id: i64,
    pub status: RunStatus,
}

/// Returned to the caller as soon as a batch is accepted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchHandle {
    pub batch_id: String,
    pub run_ids: Vec<Uuid>,
}

/// Durable view of a TestRun row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredRun {
    pub id: Uuid,
    pub test_set_id: i64,
    pub release_id: i64,
    pub release_label: Option<String>,
    pub environment: Option<String>,
    pub base_url: String,
    pub batch_id: Option<String>,
    pub status: RunStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub totals: RunTotals,
    pub video_path: Option<String>,
    pub error: Option<String>,
}
