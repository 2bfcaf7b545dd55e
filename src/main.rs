use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use testrig::config::{Config, LoggingConfig};
use testrig::model::{BatchStatus, BatchSubmission, RunRequest, RunStatus};
use testrig::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(
    name = "testrig",
    about = "Release-scoped test execution orchestrator",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $TESTRIG_CONFIG, then /etc/testrig/testrig.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + serial queue + batch executor)
    Serve {
        /// Bind address, overrides the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Execute one test set and wait for its verdict
    Run {
        #[arg(long)]
        test_set: i64,

        #[arg(long)]
        release: i64,

        /// Base URL of the application under test
        #[arg(long)]
        base_url: String,

        #[arg(long)]
        environment: Option<String>,

        #[arg(long)]
        release_label: Option<String>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Execute several test sets as one batch and wait for it to close
    Batch {
        /// Comma-separated test-set ids
        #[arg(long, value_delimiter = ',', required = true)]
        test_sets: Vec<i64>,

        #[arg(long)]
        release: i64,

        #[arg(long)]
        base_url: String,

        #[arg(long)]
        environment: Option<String>,

        #[arg(long)]
        release_label: Option<String>,

        /// Batch id (generated when omitted)
        #[arg(long)]
        batch_id: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Resolve captured worker stdout into the outcome the orchestrator would record
    ParseOutput {
        /// File with captured stdout (stdin when omitted)
        file: Option<PathBuf>,

        /// Exit code the worker terminated with
        #[arg(long, default_value = "0")]
        exit_code: i32,

        /// File with captured stderr
        #[arg(long)]
        stderr: Option<PathBuf>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting testrig daemon");
            testrig::serve(&config).await?;
        }
        Commands::Run {
            test_set,
            release,
            base_url,
            environment,
            release_label,
            json,
        } => {
            let orchestrator = open(&config)?;
            let request = RunRequest {
                test_set_id: test_set,
                release_id: release,
                release_label,
                environment,
                base_url,
                batch_id: None,
            };
            let run_id = orchestrator.submit_run(request).await?;
            tracing::info!(%run_id, "Run submitted");

            orchestrator
                .wait_for_run(run_id, Duration::from_millis(200))
                .await?
                .context("run not found")?;
            let steps = orchestrator.run_steps(run_id).await?.unwrap_or_default();
            let run = orchestrator
                .run_status(run_id)
                .await?
                .context("run not found")?;

            if json {
                let out = serde_json::json!({ "run": run, "steps": steps });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                let stored = orchestrator
                    .stored_run(run_id)
                    .await?
                    .context("run not persisted")?;
                println!("\nRun {}", run_id);
                println!("Status:   {}", stored.status);
                println!("Duration: {} ms", stored.duration_ms.unwrap_or(0));
                println!(
                    "Steps:    {} passed, {} failed, {} skipped",
                    stored.totals.passed_steps, stored.totals.failed_steps, stored.totals.skipped_steps
                );
                if let Some(err) = &stored.error {
                    println!("Error:    {}", err);
                }
                for step in &steps {
                    println!(" - [{}] {}", step.status.as_str(), step.description);
                }
                println!();
                if stored.status == RunStatus::Failed {
                    std::process::exit(1);
                }
            }
        }
        Commands::Batch {
            test_sets,
            release,
            base_url,
            environment,
            release_label,
            batch_id,
            json,
        } => {
            let orchestrator = open(&config)?;
            let handle = orchestrator
                .submit_batch(BatchSubmission {
                    batch_id,
                    release_id: release,
                    release_label,
                    environment,
                    base_url,
                    test_set_ids: test_sets,
                })
                .await?;
            tracing::info!(batch_id = %handle.batch_id, runs = handle.run_ids.len(), "Batch submitted");

            let details = orchestrator
                .wait_for_batch(&handle.batch_id, Duration::from_millis(250))
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&details)?);
            } else {
                let b = &details.batch;
                println!("\nBatch {}", b.id);
                println!("Status: {}", b.status);
                println!(
                    "Sets:   {}/{} completed, {} passed, {} failed",
                    b.completed_sets, b.total_sets, b.passed_sets, b.failed_sets
                );
                if let Some(path) = &b.report_path {
                    println!("Report: {}", path);
                }
                println!("{:<38} | {:<8} | {:<8} | Duration", "Run", "Set", "Status");
                println!("{:-<38}-|-{:-<8}-|-{:-<8}-|-{:-<10}", "", "", "", "");
                for run in &details.runs {
                    println!(
                        "{:<38} | {:<8} | {:<8} | {} ms",
                        run.id.to_string(),
                        run.test_set_id,
                        run.status,
                        run.duration_ms.unwrap_or(0)
                    );
                }
                println!();
                if b.status != BatchStatus::Completed {
                    std::process::exit(1);
                }
            }
        }
        Commands::ParseOutput {
            file,
            exit_code,
            stderr,
        } => {
            let stdout = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let stderr = match stderr {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => String::new(),
            };
            let report = testrig::worker::protocol::resolve(&stdout, &stderr, Some(exit_code));
            let out = serde_json::json!({
                "origin": format!("{:?}", report.origin),
                "outcome": report.outcome,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }

    Ok(())
}

fn open(config: &Config) -> Result<Orchestrator> {
    if config.worker.program.is_empty() {
        bail!("worker.program is not configured");
    }
    let pool = testrig::storage::open_pool(&config.storage.db_path)?;
    Ok(Orchestrator::new(config, pool))
}
