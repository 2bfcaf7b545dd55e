//! testrig -- release-scoped test execution orchestrator.
//!
//! This crate provides the core library for running browser test sets in
//! isolated worker processes: a single-slot queue for ad-hoc runs, a bounded
//! parallel executor for batches, the worker stdout protocol, durable run
//! results and merged batch reports.

pub mod api;
pub mod batch;
pub mod config;
pub mod model;
pub mod orchestrator;
pub mod queue;
pub mod report;
pub mod runner;
pub mod status;
pub mod storage;
pub mod worker;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::orchestrator::Orchestrator;

/// Start the testrig daemon: storage, orchestrator and API server.
pub async fn serve(config: &Config) -> Result<()> {
    // 1. Initialize Storage
    let db_path = config.storage.db_path.display().to_string();
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;

    let conn = pool.get()?;
    let unfinished = storage::runs::count_unfinished(&conn)?;
    drop(conn);
    if unfinished > 0 {
        tracing::warn!(unfinished, "runs left queued or running by a previous process");
    }

    // 2. Build the orchestrator
    let orchestrator = Orchestrator::new(config, pool);

    // 3. Start API Server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let app = api::router(api::state::AppState { orchestrator });

    tracing::info!(%addr, "testrig listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
