//! BatchExecution records: inserted together with their member runs at
//! submission, closed once at terminal.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use super::{conversion_error, from_db_time, runs, to_db_time};
use crate::model::{BatchStatus, RunRequest, StoredRun};

/// Durable view of a batch row.
#[derive(Debug, Clone, Serialize)]
pub struct StoredBatch {
    pub id: String,
    pub release_id: Option<i64>,
    pub environment: Option<String>,
    pub status: BatchStatus,
    pub total_sets: u32,
    pub completed_sets: u32,
    pub passed_sets: u32,
    pub failed_sets: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub report_path: Option<String>,
    pub error: Option<String>,
}

/// Batch row plus every member run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchDetails {
    #[serde(flatten)]
    pub batch: StoredBatch,
    pub runs: Vec<StoredRun>,
}

/// Final figures written when a batch turns terminal.
#[derive(Debug, Clone)]
pub struct BatchClose<'a> {
    pub status: BatchStatus,
    pub completed_sets: u32,
    pub passed_sets: u32,
    pub failed_sets: u32,
    pub finished_at: DateTime<Utc>,
    pub report_path: Option<&'a str>,
    pub error: Option<&'a str>,
}

/// A batch row about to be admitted.
#[derive(Debug, Clone)]
pub struct NewBatch<'a> {
    pub id: &'a str,
    pub release_id: Option<i64>,
    pub environment: Option<&'a str>,
    pub started_at: DateTime<Utc>,
}

/// Insert the batch row and every member run `queued`, in one transaction.
///
/// Returns `false` without writing anything if the id is taken. Any other
/// failure also leaves nothing behind.
pub fn admit(
    conn: &mut Connection,
    batch: &NewBatch<'_>,
    members: &[(Uuid, RunRequest)],
) -> Result<bool> {
    let tx = conn.transaction()?;
    if exists(&tx, batch.id)? {
        return Ok(false);
    }
    insert(
        &tx,
        batch.id,
        batch.release_id,
        batch.environment,
        members.len() as u32,
        &batch.started_at,
    )?;
    for (run_id, request) in members {
        runs::insert_queued(&tx, *run_id, request, &batch.started_at)?;
    }
    tx.commit()
        .with_context(|| format!("Failed to commit batch {}", batch.id))?;
    Ok(true)
}

pub fn insert(
    conn: &Connection,
    batch_id: &str,
    release_id: Option<i64>,
    environment: Option<&str>,
    total_sets: u32,
    started_at: &DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO batch_executions (id, release_id, environment, status, total_sets, started_at)
         VALUES (?1, ?2, ?3, 'running', ?4, ?5)",
        params![batch_id, release_id, environment, total_sets, to_db_time(started_at)],
    )
    .with_context(|| format!("Failed to insert batch {batch_id}"))?;
    Ok(())
}

/// `running -> completed|failed`, exactly once.
pub fn close(conn: &Connection, batch_id: &str, close: &BatchClose<'_>) -> Result<()> {
    let changed = conn.execute(
        "UPDATE batch_executions SET
            status = ?2, completed_sets = ?3, passed_sets = ?4, failed_sets = ?5,
            finished_at = ?6, report_path = ?7, error_message = ?8
         WHERE id = ?1 AND status = 'running'",
        params![
            batch_id,
            close.status.as_str(),
            close.completed_sets,
            close.passed_sets,
            close.failed_sets,
            to_db_time(&close.finished_at),
            close.report_path,
            close.error,
        ],
    )?;
    if changed == 0 {
        bail!("Batch {} is not running", batch_id);
    }
    Ok(())
}

pub fn exists(conn: &Connection, batch_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM batch_executions WHERE id = ?1",
            params![batch_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn load(conn: &Connection, batch_id: &str) -> Result<Option<StoredBatch>> {
    let batch = conn
        .query_row(
            "SELECT id, release_id, environment, status, total_sets, completed_sets, passed_sets, failed_sets,
                    started_at, finished_at, report_path, error_message
             FROM batch_executions WHERE id = ?1",
            params![batch_id],
            |row| {
                let status: String = row.get(3)?;
                let started_at: String = row.get(8)?;
                let finished_at: Option<String> = row.get(9)?;
                Ok(StoredBatch {
                    id: row.get(0)?,
                    release_id: row.get(1)?,
                    environment: row.get(2)?,
                    status: status.parse().map_err(|e| conversion_error(3, e))?,
                    total_sets: row.get(4)?,
                    completed_sets: row.get(5)?,
                    passed_sets: row.get(6)?,
                    failed_sets: row.get(7)?,
                    started_at: from_db_time(&started_at).ok_or_else(|| {
                        conversion_error(8, format!("bad timestamp '{started_at}'"))
                    })?,
                    finished_at: finished_at.as_deref().and_then(from_db_time),
                    report_path: row.get(10)?,
                    error: row.get(11)?,
                })
            },
        )
        .optional()?;
    Ok(batch)
}

pub fn load_details(conn: &Connection, batch_id: &str) -> Result<Option<BatchDetails>> {
    let Some(batch) = load(conn, batch_id)? else {
        return Ok(None);
    };
    let runs = runs::list_for_batch(conn, batch_id)?;
    Ok(Some(BatchDetails { batch, runs }))
}
