//! Structured report files: where workers write them, and how a batch's
//! per-run parts are merged into one artifact once the batch is terminal.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Map, Number, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{BatchRunEntry, BatchStatus};

pub const MERGED_REPORT_FILE: &str = "report.json";

/// Directory layout under the configured reports root.
///
/// ```text
/// <root>/runs/<run_id>.json
/// <root>/batches/<batch_id>/parts/<run_id>.json
/// <root>/batches/<batch_id>/report.json
/// ```
#[derive(Debug, Clone)]
pub struct ReportLayout {
    root: PathBuf,
}

impl ReportLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn batch_dir(&self, batch_id: &str) -> PathBuf {
        self.root.join("batches").join(batch_id)
    }

    pub fn parts_dir(&self, batch_id: &str) -> PathBuf {
        self.batch_dir(batch_id).join("parts")
    }

    pub fn merged_path(&self, batch_id: &str) -> PathBuf {
        self.batch_dir(batch_id).join(MERGED_REPORT_FILE)
    }

    /// Where the worker for `run_id` writes its report. Batch children write
    /// an intermediate part; single runs write their final report directly.
    pub fn run_report_path(&self, run_id: Uuid, batch_id: Option<&str>) -> PathBuf {
        let file = format!("{run_id}.json");
        match batch_id {
            Some(batch_id) => self.parts_dir(batch_id).join(file),
            None => self.root.join("runs").join(file),
        }
    }
}

/// Merge every part of a terminal batch into `report.json` and remove the
/// parts directory. Returns the merged report path.
///
/// Missing or unreadable parts are recorded as `report: null`.
pub fn merge_batch(
    layout: &ReportLayout,
    batch_id: &str,
    status: BatchStatus,
    runs: &[BatchRunEntry],
) -> Result<PathBuf> {
    let mut stats = Map::new();
    let mut suites = Vec::new();
    let mut entries = Vec::with_capacity(runs.len());

    for run in runs {
        let part_path = layout.run_report_path(run.run_id, Some(batch_id));
        let report = read_part(&part_path);

        if let Some(report) = &report {
            if let Some(Value::Object(part_stats)) = report.get("stats") {
                sum_stats(&mut stats, part_stats);
            }
            if let Some(Value::Array(part_suites)) = report.get("suites") {
                suites.extend(part_suites.iter().cloned());
            }
        }

        entries.push(json!({
            "runId": run.run_id,
            "testSetId": run.test_set_id,
            "status": run.status,
            "report": report,
        }));
    }

    let merged = json!({
        "batchId": batch_id,
        "status": status,
        "generatedAt": Utc::now().to_rfc3339(),
        "stats": stats,
        "runs": entries,
        "suites": suites,
    });

    let dir = layout.batch_dir(batch_id);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
    let path = layout.merged_path(batch_id);
    fs::write(&path, serde_json::to_vec_pretty(&merged)?)
        .with_context(|| format!("Failed to write merged report {}", path.display()))?;

    let parts = layout.parts_dir(batch_id);
    if parts.exists() {
        if let Err(e) = fs::remove_dir_all(&parts) {
            warn!(batch_id = %batch_id, error = %e, "failed to remove report parts");
        }
    }

    info!(batch_id = %batch_id, path = %path.display(), runs = runs.len(), "merged batch report");
    Ok(path)
}

fn read_part(path: &Path) -> Option<Value> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "report part missing");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "report part is not valid JSON");
            None
        }
    }
}

/// Add every numeric field of `part` onto `acc`. Integers stay integers.
fn sum_stats(acc: &mut Map<String, Value>, part: &Map<String, Value>) {
    for (key, value) in part {
        let Value::Number(n) = value else {
            continue;
        };
        let sum = match acc.get(key) {
            Some(Value::Number(current)) => add_numbers(current, n),
            _ => Some(n.clone()),
        };
        if let Some(sum) = sum {
            acc.insert(key.clone(), Value::Number(sum));
        }
    }
}

fn add_numbers(a: &Number, b: &Number) -> Option<Number> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Some(sum.into());
        }
    }
    Number::from_f64(a.as_f64()? + b.as_f64()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunStatus;
    use tempfile::TempDir;

    fn entry(test_set_id: i64, status: RunStatus) -> BatchRunEntry {
        BatchRunEntry {
            run_id: Uuid::new_v4(),
            test_set_id,
            status,
        }
    }

    fn write_part(layout: &ReportLayout, batch_id: &str, run: &BatchRunEntry, body: &str) {
        let path = layout.run_report_path(run.run_id, Some(batch_id));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_report_paths() {
        let layout = ReportLayout::new("/var/reports");
        let id = Uuid::nil();
        assert_eq!(
            layout.run_report_path(id, None),
            PathBuf::from(format!("/var/reports/runs/{id}.json"))
        );
        assert_eq!(
            layout.run_report_path(id, Some("b1")),
            PathBuf::from(format!("/var/reports/batches/b1/parts/{id}.json"))
        );
        assert_eq!(
            layout.merged_path("b1"),
            PathBuf::from("/var/reports/batches/b1/report.json")
        );
    }

    #[test]
    fn test_merge_sums_stats_and_concatenates_suites() {
        let dir = TempDir::new().unwrap();
        let layout = ReportLayout::new(dir.path());
        let a = entry(1, RunStatus::Passed);
        let b = entry(2, RunStatus::Failed);
        let missing = entry(3, RunStatus::Passed);

        write_part(
            &layout,
            "b1",
            &a,
            r#"{"stats":{"tests":3,"failures":0,"duration":1.5,"label":"x"},"suites":[{"title":"login"}]}"#,
        );
        write_part(
            &layout,
            "b1",
            &b,
            r#"{"stats":{"tests":2,"failures":1,"duration":2.0},"suites":[{"title":"cart"},{"title":"pay"}]}"#,
        );

        let path = merge_batch(&layout, "b1", BatchStatus::Failed, &[a, b, missing]).unwrap();
        let merged: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();

        assert_eq!(merged["batchId"], "b1");
        assert_eq!(merged["status"], "failed");
        assert_eq!(merged["stats"]["tests"], 5);
        assert_eq!(merged["stats"]["failures"], 1);
        assert_eq!(merged["stats"]["duration"], 3.5);
        assert!(merged["stats"].get("label").is_none());
        assert_eq!(merged["suites"].as_array().unwrap().len(), 3);
        assert_eq!(merged["runs"][1]["testSetId"], 2);
        assert_eq!(merged["runs"][1]["status"], "failed");
        assert!(merged["runs"][2]["report"].is_null());

        assert!(!layout.parts_dir("b1").exists());
    }

    #[test]
    fn test_merge_with_no_parts() {
        let dir = TempDir::new().unwrap();
        let layout = ReportLayout::new(dir.path());
        let path = merge_batch(&layout, "empty", BatchStatus::Completed, &[]).unwrap();
        let merged: Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(merged["runs"].as_array().unwrap().len(), 0);
        assert_eq!(merged["stats"], json!({}));
    }

    #[test]
    fn test_unparsable_part_is_null() {
        let dir = TempDir::new().unwrap();
        let layout = ReportLayout::new(dir.path());
        let run = entry(1, RunStatus::Failed);
        write_part(&layout, "b2", &run, "{not json");

        let path = merge_batch(&layout, "b2", BatchStatus::Failed, &[run]).unwrap();
        let merged: Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert!(merged["runs"][0]["report"].is_null());
    }
}
