//! Line protocol spoken by workers on stdout.
//!
//! Grammar: one record per `\n`-terminated line. A line starting with
//! `PROGRESS:` or `RESULT:` carries exactly one JSON document after the
//! prefix; every other line is free-form diagnostic text.

use thiserror::Error;

use super::{Origin, WorkerReport};
use crate::model::{ProgressSnapshot, RunOutcome};

pub const PROGRESS_PREFIX: &str = "PROGRESS:";
pub const RESULT_PREFIX: &str = "RESULT:";

/// Characters of diagnostic output kept as the error of a crashed run.
pub const ERROR_TAIL_CHARS: usize = 2000;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// One classified stdout line.
#[derive(Debug, PartialEq)]
pub enum WorkerLine<'a> {
    Progress(ProgressSnapshot),
    Result(RunOutcome),
    Diagnostic(&'a str),
}

/// Classify a single line. Trailing `\r` / `\n` are ignored.
pub fn parse_line(line: &str) -> Result<WorkerLine<'_>, ProtocolError> {
    let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');

    if let Some(payload) = line.strip_prefix(PROGRESS_PREFIX) {
        return serde_json::from_str(payload)
            .map(WorkerLine::Progress)
            .map_err(|source| ProtocolError::Malformed {
                kind: "PROGRESS",
                source,
            });
    }

    if let Some(payload) = line.strip_prefix(RESULT_PREFIX) {
        return parse_result(payload).map(WorkerLine::Result);
    }

    Ok(WorkerLine::Diagnostic(line))
}

fn parse_result(payload: &str) -> Result<RunOutcome, ProtocolError> {
    serde_json::from_str(payload).map_err(|source| ProtocolError::Malformed {
        kind: "RESULT",
        source,
    })
}

/// Find and parse the last `RESULT:` line anywhere in the captured stdout.
///
/// Returns `None` when no such line exists. Only the last one is considered.
pub fn find_result(stdout: &str) -> Option<Result<RunOutcome, ProtocolError>> {
    stdout
        .lines()
        .rev()
        .map(|line| line.trim_end_matches('\r'))
        .find_map(|line| line.strip_prefix(RESULT_PREFIX))
        .map(parse_result)
}

/// The last `max` characters of `text`, cut on a char boundary.
pub fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

fn describe_exit(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}

/// Diagnostic text for a worker that died without a usable RESULT:
/// stderr's tail, or stdout's tail when stderr is blank.
fn crash_message(stdout: &str, stderr: &str, exit_code: Option<i32>) -> String {
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    let tail = tail_chars(source.trim_end(), ERROR_TAIL_CHARS);
    if tail.trim().is_empty() {
        format!(
            "worker exited with {} without producing a result",
            describe_exit(exit_code)
        )
    } else {
        tail.to_string()
    }
}

/// Turn a finished worker's captured output into its final outcome.
///
/// `exit_code` is `None` when the process was terminated by a signal.
pub fn resolve(stdout: &str, stderr: &str, exit_code: Option<i32>) -> WorkerReport {
    match find_result(stdout) {
        Some(Ok(outcome)) => WorkerReport {
            outcome,
            origin: Origin::Reported,
            exit_code,
        },
        Some(Err(err)) => WorkerReport {
            outcome: RunOutcome::failure(format!(
                "{err}\n{}",
                crash_message(stdout, stderr, exit_code)
            )),
            origin: Origin::Malformed,
            exit_code,
        },
        None if exit_code == Some(0) => WorkerReport {
            outcome: RunOutcome::empty_pass(),
            origin: Origin::SilentExit,
            exit_code,
        },
        None => WorkerReport {
            outcome: RunOutcome::failure(crash_message(stdout, stderr, exit_code)),
            origin: Origin::Crashed,
            exit_code,
        },
    }
}
