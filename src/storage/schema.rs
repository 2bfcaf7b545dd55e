//! Database schema and migrations.

use anyhow::Result;
use rusqlite::{params, Connection};

/// Bump when the table layout below changes.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS batch_executions (
            id TEXT PRIMARY KEY,
            release_id INTEGER,
            environment TEXT,
            status TEXT NOT NULL DEFAULT 'running',
            total_sets INTEGER NOT NULL,
            completed_sets INTEGER NOT NULL DEFAULT 0,
            passed_sets INTEGER NOT NULL DEFAULT 0,
            failed_sets INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            report_path TEXT,
            error_message TEXT
        );

        CREATE TABLE IF NOT EXISTS test_runs (
            id TEXT PRIMARY KEY,
            test_set_id INTEGER NOT NULL,
            release_id INTEGER NOT NULL,
            release_label TEXT,
            environment TEXT,
            base_url TEXT NOT NULL,
            batch_id TEXT REFERENCES batch_executions(id),
            status TEXT NOT NULL DEFAULT 'queued',
            queued_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            duration_ms INTEGER,
            total_scenarios INTEGER NOT NULL DEFAULT 0,
            passed_scenarios INTEGER NOT NULL DEFAULT 0,
            failed_scenarios INTEGER NOT NULL DEFAULT 0,
            total_steps INTEGER NOT NULL DEFAULT 0,
            passed_steps INTEGER NOT NULL DEFAULT 0,
            failed_steps INTEGER NOT NULL DEFAULT 0,
            skipped_steps INTEGER NOT NULL DEFAULT 0,
            video_path TEXT,
            error_message TEXT
        );

        CREATE TABLE IF NOT EXISTS step_results (
            id INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES test_runs(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            scenario_id INTEGER,
            scenario_name TEXT,
            step_id INTEGER,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            screenshot_path TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_test_runs_batch ON test_runs(batch_id);
        CREATE INDEX IF NOT EXISTS idx_test_runs_status ON test_runs(status);
        CREATE INDEX IF NOT EXISTS idx_step_results_run ON step_results(run_id, position);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        params![SCHEMA_VERSION],
    )?;

    Ok(())
}
