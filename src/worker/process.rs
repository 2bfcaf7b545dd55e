//! Worker process wrapper -- spawn, stream stdout, capture stderr, resolve
//! the final outcome.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{self, WorkerLine};
use super::{Origin, WorkerEnv, WorkerError, WorkerReport};
use crate::config::WorkerConfig;
use crate::model::{ProgressSnapshot, RunOutcome};

/// Executable and launch options for worker processes.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `sh -c <script>`, handy for fixtures and local wrappers.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }
}

impl From<&WorkerConfig> for WorkerCommand {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            program: cfg.program.clone(),
            args: cfg.args.clone(),
            working_dir: cfg.working_dir.clone(),
            timeout: cfg.timeout(),
        }
    }
}

/// Run one worker to completion and resolve its outcome.
///
/// Every `PROGRESS:` line is forwarded on `progress` as it arrives; malformed
/// ones are dropped. The sender is dropped when this returns, which closes the
/// channel for the subscriber. Never fails: spawn errors, crashes and
/// timeouts all become failed outcomes.
pub async fn run_worker(
    command: &WorkerCommand,
    env: &WorkerEnv,
    progress: mpsc::UnboundedSender<ProgressSnapshot>,
) -> WorkerReport {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(env.vars())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &command.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            let err = WorkerError::Spawn {
                program: command.program.clone(),
                source,
            };
            warn!(run_id = %env.run_id, error = %err, "worker spawn failed");
            return WorkerReport::spawn_failed(&err);
        }
    };

    info!(
        run_id = %env.run_id,
        test_set_id = env.test_set_id,
        pid = ?child.id(),
        "worker started"
    );

    let driven = match command.timeout {
        Some(limit) => match tokio::time::timeout(limit, drive(&mut child, env, &progress)).await {
            Ok(driven) => driven,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(run_id = %env.run_id, error = %e, "failed to kill timed-out worker");
                }
                warn!(run_id = %env.run_id, timeout_sec = limit.as_secs(), "worker timed out");
                return WorkerReport {
                    outcome: RunOutcome::failure(format!(
                        "worker timed out after {}s",
                        limit.as_secs()
                    )),
                    origin: Origin::TimedOut,
                    exit_code: None,
                };
            }
        },
        None => drive(&mut child, env, &progress).await,
    };

    match driven {
        Ok((stdout, stderr, status)) => {
            let report = protocol::resolve(&stdout, &stderr, status.code());
            info!(
                run_id = %env.run_id,
                exit_code = ?report.exit_code,
                origin = ?report.origin,
                status = %report.outcome.run_status(),
                "worker finished"
            );
            report
        }
        Err(err) => {
            let _ = child.kill().await;
            warn!(run_id = %env.run_id, error = %err, "lost contact with worker");
            WorkerReport {
                outcome: RunOutcome::failure(err.to_string()),
                origin: Origin::Crashed,
                exit_code: None,
            }
        }
    }
}

/// Pump stdout line by line until EOF, collect stderr, then reap the child.
async fn drive(
    child: &mut Child,
    env: &WorkerEnv,
    progress: &mpsc::UnboundedSender<ProgressSnapshot>,
) -> Result<(String, String, ExitStatus), WorkerError> {
    let stdout = child
        .stdout
        .take()
        .ok_or(WorkerError::MissingPipe("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(WorkerError::MissingPipe("stderr"))?;

    let stderr_task = tokio::spawn(read_to_string_lossy(stderr));

    let mut reader = BufReader::new(stdout);
    let mut captured = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        captured.push_str(&line);

        match protocol::parse_line(&line) {
            Ok(WorkerLine::Progress(snapshot)) => {
                // Receiver may already be gone; progress is advisory.
                let _ = progress.send(snapshot);
            }
            Ok(WorkerLine::Result(_)) => {
                debug!(run_id = %env.run_id, "worker reported result");
            }
            Ok(WorkerLine::Diagnostic(_)) => {}
            Err(e) => {
                debug!(run_id = %env.run_id, error = %e, "ignoring malformed worker line");
            }
        }
    }

    let status = child.wait().await?;
    let stderr = match stderr_task.await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!(run_id = %env.run_id, error = %e, "stderr capture failed");
            String::new()
        }
        Err(e) => {
            warn!(run_id = %env.run_id, error = %e, "stderr task panicked");
            String::new()
        }
    };

    Ok((captured, stderr, status))
}

async fn read_to_string_lossy<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
