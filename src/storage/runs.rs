//! TestRun and StepResult persistence.
//!
//! A run row is written three times: inserted `queued` at admission, moved to
//! `running` when its worker starts, and finalized together with all of its
//! step rows in one transaction.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{conversion_error, from_db_time, to_db_time};
use crate::model::{RunOutcome, RunRequest, RunTotals, StepResult, StepStatus, StoredRun};

const RUN_COLUMNS: &str = "id, test_set_id, release_id, release_label, environment, base_url, batch_id,
     status, queued_at, started_at, finished_at, duration_ms,
     total_scenarios, passed_scenarios, failed_scenarios,
     total_steps, passed_steps, failed_steps, skipped_steps,
     video_path, error_message";

/// Insert a freshly admitted run in `queued` state.
pub fn insert_queued(
    conn: &Connection,
    run_id: Uuid,
    request: &RunRequest,
    queued_at: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO test_runs (id, test_set_id, release_id, release_label, environment, base_url, batch_id, status, queued_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'queued', ?8)",
        params![
            run_id.to_string(),
            request.test_set_id,
            request.release_id,
            request.release_label,
            request.environment,
            request.base_url,
            request.batch_id,
            to_db_time(queued_at),
        ],
    )
    .context("Failed to insert test run")?;
    Ok(())
}

/// `queued -> running`. Errors if the row is missing or not queued.
pub fn mark_running(conn: &Connection, run_id: Uuid, started_at: &DateTime<Utc>) -> Result<()> {
    let changed = conn.execute(
        "UPDATE test_runs SET status = 'running', started_at = ?2 WHERE id = ?1 AND status = 'queued'",
        params![run_id.to_string(), to_db_time(started_at)],
    )?;
    if changed == 0 {
        bail!("Test run {} is not queued", run_id);
    }
    Ok(())
}

/// `running -> passed|failed` plus every step row, atomically.
///
/// Either the run is terminal with all of its steps, or nothing changed.
pub fn finalize(
    conn: &mut Connection,
    run_id: Uuid,
    outcome: &RunOutcome,
    finished_at: &DateTime<Utc>,
    duration_ms: u64,
) -> Result<()> {
    let tx = conn.transaction()?;
    let id = run_id.to_string();
    let t = &outcome.totals;

    let changed = tx.execute(
        "UPDATE test_runs SET
            status = ?2, finished_at = ?3, duration_ms = ?4,
            total_scenarios = ?5, passed_scenarios = ?6, failed_scenarios = ?7,
            total_steps = ?8, passed_steps = ?9, failed_steps = ?10, skipped_steps = ?11,
            video_path = ?12, error_message = ?13
         WHERE id = ?1 AND status = 'running'",
        params![
            id,
            outcome.run_status().as_str(),
            to_db_time(finished_at),
            duration_ms as i64,
            t.total_scenarios,
            t.passed_scenarios,
            t.failed_scenarios,
            t.total_steps,
            t.passed_steps,
            t.failed_steps,
            t.skipped_steps,
            outcome.video_path,
            outcome.error,
        ],
    )?;
    if changed == 0 {
        // Dropping `tx` rolls back.
        bail!("Test run {} is not running", run_id);
    }

    {
        let mut stmt = tx.prepare(
            "INSERT INTO step_results
                (run_id, position, scenario_id, scenario_name, step_id, description, status, duration_ms, error_message, screenshot_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for (position, step) in outcome.steps.iter().enumerate() {
            stmt.execute(params![
                id,
                position as i64,
                step.scenario_id,
                step.scenario_name,
                step.step_id,
                step.description,
                step.status.as_str(),
                step.duration_ms as i64,
                step.error,
                step.screenshot_path,
            ])?;
        }
    }

    tx.commit().context("Failed to commit run outcome")?;
    Ok(())
}

fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<StoredRun> {
    let id: String = row.get(0)?;
    let status: String = row.get(7)?;
    let queued_at: String = row.get(8)?;
    let started_at: Option<String> = row.get(9)?;
    let finished_at: Option<String> = row.get(10)?;
    let duration_ms: Option<i64> = row.get(11)?;

    Ok(StoredRun {
        id: parse_uuid(&id)?,
        test_set_id: row.get(1)?,
        release_id: row.get(2)?,
        release_label: row.get(3)?,
        environment: row.get(4)?,
        base_url: row.get(5)?,
        batch_id: row.get(6)?,
        status: status.parse().map_err(|e| conversion_error(7, e))?,
        queued_at: from_db_time(&queued_at)
            .ok_or_else(|| conversion_error(8, format!("bad timestamp '{queued_at}'")))?,
        started_at: started_at.as_deref().and_then(from_db_time),
        finished_at: finished_at.as_deref().and_then(from_db_time),
        duration_ms: duration_ms.map(|d| d.max(0) as u64),
        totals: RunTotals {
            total_scenarios: row.get(12)?,
            passed_scenarios: row.get(13)?,
            failed_scenarios: row.get(14)?,
            total_steps: row.get(15)?,
            passed_steps: row.get(16)?,
            failed_steps: row.get(17)?,
            skipped_steps: row.get(18)?,
        },
        video_path: row.get(19)?,
        error: row.get(20)?,
    })
}

pub fn load(conn: &Connection, run_id: Uuid) -> Result<Option<StoredRun>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM test_runs WHERE id = ?1");
    let run = conn
        .query_row(&sql, params![run_id.to_string()], run_from_row)
        .optional()?;
    Ok(run)
}

/// Member runs of a batch, in admission order.
pub fn list_for_batch(conn: &Connection, batch_id: &str) -> Result<Vec<StoredRun>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM test_runs WHERE batch_id = ?1 ORDER BY rowid");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![batch_id], run_from_row)?;
    let mut runs = Vec::new();
    for r in rows {
        runs.push(r?);
    }
    Ok(runs)
}

/// Step rows of a run, in reported order.
pub fn load_steps(conn: &Connection, run_id: Uuid) -> Result<Vec<StepResult>> {
    let mut stmt = conn.prepare(
        "SELECT scenario_id, scenario_name, step_id, description, status, duration_ms, error_message, screenshot_path
         FROM step_results WHERE run_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![run_id.to_string()], |row| {
        let status: String = row.get(4)?;
        let duration_ms: i64 = row.get(5)?;
        Ok(StepResult {
            scenario_id: row.get(0)?,
            scenario_name: row.get(1)?,
            step_id: row.get(2)?,
            description: row.get(3)?,
            status: status
                .parse::<StepStatus>()
                .map_err(|e| conversion_error(4, e))?,
            duration_ms: duration_ms.max(0) as u64,
            error: row.get(6)?,
            screenshot_path: row.get(7)?,
        })
    })?;

    let mut steps = Vec::new();
    for r in rows {
        steps.push(r?);
    }
    Ok(steps)
}

/// Runs left `queued` or `running` by a previous process.
pub fn count_unfinished(conn: &Connection) -> Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM test_runs WHERE status IN ('queued', 'running')",
        [],
        |row| row.get(0),
    )?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunStatus;
    use crate::storage::schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        schema::migrate(&conn).unwrap();
        conn
    }

    fn outcome() -> RunOutcome {
        serde_json::from_str(
            r#"{"status":"failed","durationMs":700,"totalScenarios":2,"passedScenarios":1,"failedScenarios":1,
                "totalSteps":3,"passedSteps":1,"failedSteps":1,"skippedSteps":1,
                "steps":[
                  {"scenarioId":10,"scenarioName":"login","stepId":100,"description":"open","status":"passed","durationMs":100},
                  {"scenarioId":10,"scenarioName":"login","stepId":101,"description":"submit","status":"failed","durationMs":500,"error":"button disabled","screenshotPath":"/shots/101.png"},
                  {"scenarioId":11,"stepId":102,"description":"logout","status":"skipped"}
                ],
                "videoPath":"/media/run.webm"}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_full_lifecycle_and_step_roundtrip() {
        let mut conn = conn();
        let id = Uuid::new_v4();
        let request = RunRequest::new(5, 2, "http://app.local").with_release_label("R2");
        let now = Utc::now();

        insert_queued(&conn, id, &request, &now).unwrap();
        assert_eq!(load(&conn, id).unwrap().unwrap().status, RunStatus::Queued);

        mark_running(&conn, id, &now).unwrap();
        let expected = outcome();
        finalize(&mut conn, id, &expected, &Utc::now(), 700).unwrap();

        let run = load(&conn, id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.duration_ms, Some(700));
        assert_eq!(run.totals, expected.totals);
        assert_eq!(run.video_path.as_deref(), Some("/media/run.webm"));
        assert_eq!(run.release_label.as_deref(), Some("R2"));

        let steps = load_steps(&conn, id).unwrap();
        assert_eq!(steps, expected.steps);
    }

    #[test]
    fn test_finalize_requires_running() {
        let mut conn = conn();
        let id = Uuid::new_v4();
        insert_queued(&conn, id, &RunRequest::new(1, 1, "http://x"), &Utc::now()).unwrap();

        let err = finalize(&mut conn, id, &outcome(), &Utc::now(), 1);
        assert!(err.is_err());

        // Nothing was written: still queued, no orphan steps.
        assert_eq!(load(&conn, id).unwrap().unwrap().status, RunStatus::Queued);
        assert!(load_steps(&conn, id).unwrap().is_empty());
    }

    #[test]
    fn test_finalize_is_once_only() {
        let mut conn = conn();
        let id = Uuid::new_v4();
        insert_queued(&conn, id, &RunRequest::new(1, 1, "http://x"), &Utc::now()).unwrap();
        mark_running(&conn, id, &Utc::now()).unwrap();
        finalize(&mut conn, id, &outcome(), &Utc::now(), 1).unwrap();

        let again = RunOutcome::empty_pass();
        assert!(finalize(&mut conn, id, &again, &Utc::now(), 1).is_err());
        assert_eq!(load_steps(&conn, id).unwrap().len(), 3);
        assert_eq!(load(&conn, id).unwrap().unwrap().status, RunStatus::Failed);
    }

    #[test]
    fn test_mark_running_twice_fails() {
        let conn = conn();
        let id = Uuid::new_v4();
        insert_queued(&conn, id, &RunRequest::new(1, 1, "http://x"), &Utc::now()).unwrap();
        mark_running(&conn, id, &Utc::now()).unwrap();
        assert!(mark_running(&conn, id, &Utc::now()).is_err());
        assert_eq!(count_unfinished(&conn).unwrap(), 1);
    }

    #[test]
    fn test_load_unknown_run() {
        let conn = conn();
        assert!(load(&conn, Uuid::new_v4()).unwrap().is_none());
    }
}
