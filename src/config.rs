//! TOML configuration for the testrig orchestrator.
//!
//! Layered model: an explicit path, the `TESTRIG_CONFIG` environment
//! variable, the system location, then compiled-in defaults. Every section
//! is optional so partial files work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV: &str = "TESTRIG_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/testrig/testrig.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the orchestrator process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded testrig configuration");
        Ok(config)
    }

    /// Resolve configuration, in order:
    /// 1. `explicit` (from `--config`); a failure here is an error.
    /// 2. The path in `TESTRIG_CONFIG`.
    /// 3. `/etc/testrig/testrig.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        Ok(Self::load_or_default())
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "TESTRIG_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP request layer.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file holding runs, step results and batches.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/testrig.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// How worker processes are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Path (or bare command name resolved via `$PATH`) to the worker executable.
    pub program: String,
    /// Arguments passed before any environment is applied.
    pub args: Vec<String>,
    /// Working directory for the worker; inherits ours when unset.
    pub working_dir: Option<PathBuf>,
    /// Base URL the worker calls back to for test-definition data.
    pub callback_api_url: String,
    /// Root under which one media directory per run is created.
    pub artifacts_dir: PathBuf,
    /// Kill a worker after this many seconds. Unset means no limit.
    pub timeout_sec: Option<u64>,
}

impl WorkerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_sec.map(Duration::from_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            args: vec!["worker/run-test-set.js".to_string()],
            working_dir: None,
            callback_api_url: "http://127.0.0.1:8080/api".to_string(),
            artifacts_dir: PathBuf::from("data/artifacts"),
            timeout_sec: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Live workers allowed per batch.
    pub max_concurrent: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_concurrent: 7 }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Re-spawn policy for infrastructure failures (spawn error, crash, bad RESULT).
/// Reported test failures are never retried.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub infrastructure_retries: u32,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportsConfig {
    /// Root for per-run and merged per-batch report files.
    pub dir: PathBuf,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/reports"),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Live status registry. Finished runs and batches are served from the
/// database once they leave it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Seconds a finished run or closed batch stays in memory.
    pub retain_finished_sec: u64,
}

impl StatusConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retain_finished_sec)
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            retain_finished_sec: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of the human format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();

        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.storage.db_path, PathBuf::from("data/testrig.db"));
        assert_eq!(cfg.worker.program, "node");
        assert!(cfg.worker.timeout().is_none());
        assert_eq!(cfg.batch.max_concurrent, 7);
        assert_eq!(cfg.retry.infrastructure_retries, 0);
        assert_eq!(cfg.reports.dir, PathBuf::from("data/reports"));
        assert_eq!(cfg.status.retention(), Duration::from_secs(60));
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[server]
bind = "127.0.0.1:9000"

[storage]
db_path = "/var/lib/testrig/runs.db"

[worker]
program = "/usr/bin/env"
args = ["node", "runner.js"]
working_dir = "/opt/tests"
callback_api_url = "http://10.0.0.5:3000/api"
artifacts_dir = "/var/lib/testrig/media"
timeout_sec = 900

[batch]
max_concurrent = 3

[retry]
infrastructure_retries = 2

[reports]
dir = "/var/lib/testrig/reports"

[status]
retain_finished_sec = 5

[logging]
level = "debug"
json = true
"#;

        let cfg: Config = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert_eq!(cfg.storage.db_path, PathBuf::from("/var/lib/testrig/runs.db"));
        assert_eq!(cfg.worker.program, "/usr/bin/env");
        assert_eq!(cfg.worker.args, vec!["node", "runner.js"]);
        assert_eq!(cfg.worker.working_dir, Some(PathBuf::from("/opt/tests")));
        assert_eq!(cfg.worker.callback_api_url, "http://10.0.0.5:3000/api");
        assert_eq!(cfg.worker.timeout(), Some(Duration::from_secs(900)));
        assert_eq!(cfg.batch.max_concurrent, 3);
        assert_eq!(cfg.retry.infrastructure_retries, 2);
        assert_eq!(cfg.reports.dir, PathBuf::from("/var/lib/testrig/reports"));
        assert_eq!(cfg.status.retain_finished_sec, 5);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: Config = toml::from_str("[batch]\nmax_concurrent = 2\n").unwrap();

        assert_eq!(cfg.batch.max_concurrent, 2);
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.worker.program, "node");
        assert_eq!(cfg.retry.infrastructure_retries, 0);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("testrig.toml");
        std::fs::write(&path, "[server]\nbind = \"0.0.0.0:9999\"\n").unwrap();

        let cfg = Config::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:9999");
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        let result = Config::resolve(Some(Path::new("/nonexistent/testrig.toml")));
        assert!(result.is_err());
    }
}
