//! Code Executor
//!
//! Runs a generated script in a separate interpreter process with a
//! wall-clock timeout. Before each run the session's artifact namespace is
//! cleared unconditionally and a fresh run bucket is allocated; the script is
//! written there and executed with the bucket as working directory, so charts
//! reported for a run are exactly the charts that run produced.
//!
//! stdout and stderr are kept as opaque text. Interpreting them is the job of
//! the report stage.

use crate::artifacts::{ArtifactStore, RunBucket};
use crate::domain::RUN_DIR_ENV;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{info, warn};

pub const SCRIPT_FILE: &str = "analysis.py";

/// Captured output beyond this is cut off.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

const TRACEBACK_MARKER: &str = "Traceback (most recent call last)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionErrorKind {
    /// Process exited with a non-zero status.
    NonZeroExit(i32),
    /// A Python traceback appeared on stderr.
    Exception,
    /// Killed after exceeding the wall-clock limit.
    TimeoutExceeded,
    /// The interpreter could not be started or the run could not be prepared.
    SpawnFailed,
    /// Generated code broke the table binding contract and was not run.
    ContractViolation,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionErrorKind::NonZeroExit(code) => write!(f, "non-zero exit ({})", code),
            ExecutionErrorKind::Exception => f.write_str("exception"),
            ExecutionErrorKind::TimeoutExceeded => f.write_str("timeout exceeded"),
            ExecutionErrorKind::SpawnFailed => f.write_str("could not start"),
            ExecutionErrorKind::ContractViolation => f.write_str("contract violation"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

/// Outcome of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Run bucket id; `None` when nothing was run.
    pub run_id: Option<String>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub failure: Option<ExecutionFailure>,
    /// Charts produced by this run only.
    pub charts: Vec<PathBuf>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(run_id: String, stdout: String, stderr: String, charts: Vec<PathBuf>, duration_ms: u64) -> Self {
        Self {
            run_id: Some(run_id),
            success: true,
            stdout,
            stderr,
            failure: None,
            charts,
            duration_ms,
        }
    }

    pub fn failed(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            run_id: None,
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            failure: Some(ExecutionFailure {
                kind,
                message: message.into(),
            }),
            charts: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn error_kind(&self) -> Option<&ExecutionErrorKind> {
        self.failure.as_ref().map(|f| &f.kind)
    }

    pub fn error_text(&self) -> Option<String> {
        self.failure.as_ref().map(|f| format!("{}: {}", f.kind, f.message))
    }
}

/// Something that can run analysis code and manage its artifacts.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    /// Never returns an error: every failure is part of the result.
    async fn execute(&self, code: &str, timeout: Duration) -> ExecutionResult;

    fn clear_artifacts(&self) -> Result<()>;

    fn artifacts(&self) -> Result<Vec<PathBuf>>;
}

/// Subprocess executor bound to one session's artifact namespace.
#[derive(Debug, Clone)]
pub struct CodeExecutor {
    interpreter: String,
    interpreter_args: Vec<String>,
    store: ArtifactStore,
    max_output_bytes: usize,
}

impl CodeExecutor {
    pub fn new(interpreter: impl Into<String>, store: ArtifactStore) -> Self {
        Self {
            interpreter: interpreter.into(),
            interpreter_args: Vec::new(),
            store,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Extra arguments placed before the script path (e.g. `-u`).
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.interpreter_args = args;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    fn prepare(&self, code: &str) -> Result<(RunBucket, PathBuf)> {
        self.store.clear()?;
        let run = self.store.allocate_run()?;
        let script = run.dir.join(SCRIPT_FILE);
        std::fs::write(&script, code)?;
        Ok((run, script))
    }

    fn render_output(&self, captured: Captured) -> String {
        let text = String::from_utf8_lossy(&captured.bytes).into_owned();
        if captured.truncated {
            format!("{}\n... (output truncated)", text)
        } else {
            text
        }
    }

    fn charts_for(&self, run: &RunBucket) -> Vec<PathBuf> {
        self.store.list_run(run).unwrap_or_else(|e| {
            warn!("Could not list artifacts of run {}: {}", run.id, e);
            Vec::new()
        })
    }
}

#[async_trait]
impl CodeRunner for CodeExecutor {
    async fn execute(&self, code: &str, timeout: Duration) -> ExecutionResult {
        let (run, script) = match self.prepare(code) {
            Ok(prepared) => prepared,
            Err(e) => {
                return ExecutionResult::failed(
                    ExecutionErrorKind::SpawnFailed,
                    format!("could not prepare run directory: {}", e),
                )
            }
        };

        info!("Executing run {} with {} (timeout {:?})", run.id, self.interpreter, timeout);

        let mut cmd = Command::new(&self.interpreter);
        cmd.args(&self.interpreter_args)
            .arg(&script)
            .current_dir(&run.dir)
            .env(RUN_DIR_ENV, &run.dir)
            .env_remove("ANALYST_OUTPUT_DIR")
            .env("MPLBACKEND", "Agg")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut failed = ExecutionResult::failed(
                    ExecutionErrorKind::SpawnFailed,
                    format!("failed to run '{}': {}", self.interpreter, e),
                );
                failed.run_id = Some(run.id.clone());
                return failed;
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cap = self.max_output_bytes;
        let outcome = tokio::time::timeout(timeout, async {
            let (stdout, stderr, status) =
                tokio::join!(read_capped(stdout, cap), read_capped(stderr, cap), child.wait());
            Ok::<_, std::io::Error>((stdout?, stderr?, status?))
        })
        .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut result = match outcome {
            Ok(Ok((stdout, stderr, status))) => {
                let stdout = self.render_output(stdout);
                let stderr = self.render_output(stderr);
                let has_traceback = stderr.contains(TRACEBACK_MARKER);

                if status.success() && !has_traceback {
                    ExecutionResult::succeeded(run.id.clone(), stdout, stderr, Vec::new(), duration_ms)
                } else {
                    let exit_code = status.code().unwrap_or(-1);
                    let kind = if has_traceback {
                        ExecutionErrorKind::Exception
                    } else {
                        ExecutionErrorKind::NonZeroExit(exit_code)
                    };
                    let message = last_line(&stderr)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("process exited with status {}", exit_code));
                    ExecutionResult {
                        run_id: Some(run.id.clone()),
                        success: false,
                        stdout,
                        stderr,
                        failure: Some(ExecutionFailure { kind, message }),
                        charts: Vec::new(),
                        duration_ms,
                    }
                }
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                let mut failed = ExecutionResult::failed(
                    ExecutionErrorKind::SpawnFailed,
                    format!("lost contact with '{}': {}", self.interpreter, e),
                );
                failed.run_id = Some(run.id.clone());
                failed.duration_ms = duration_ms;
                failed
            }
            Err(_) => {
                warn!("Run {} exceeded {:?}; killing process", run.id, timeout);
                if let Err(e) = child.kill().await {
                    warn!("Could not kill run {}: {}", run.id, e);
                }
                let mut failed = ExecutionResult::failed(
                    ExecutionErrorKind::TimeoutExceeded,
                    format!("code execution exceeded {} seconds", timeout.as_secs_f64()),
                );
                failed.run_id = Some(run.id.clone());
                failed.duration_ms = duration_ms;
                failed
            }
        };

        result.charts = self.charts_for(&run);
        info!(
            "Run {} finished: success={} charts={} ({} ms)",
            run.id,
            result.success,
            result.charts.len(),
            duration_ms
        );
        result
    }

    fn clear_artifacts(&self) -> Result<()> {
        self.store.clear().map(|_| ())
    }

    fn artifacts(&self) -> Result<Vec<PathBuf>> {
        self.store.list_all()
    }
}

/// Output kept from one pipe.
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Keep at most `cap` bytes of a pipe and drain the rest, so the child never
/// blocks on a full pipe and memory stays bounded.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> std::io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Captured {
            bytes: Vec::new(),
            truncated: false,
        });
    };
    let mut bytes = Vec::with_capacity(cap.min(8 * 1024));
    (&mut reader).take(cap as u64).read_to_end(&mut bytes).await?;
    let discarded = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok(Captured {
        bytes,
        truncated: discarded > 0,
    })
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty())
}
