//! Sandboxed execution of one submission against one check.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::check::Check;
use crate::error::Error;
use crate::harness::{
    CHECK_FILE, HARNESS_FAULT_STATUS, HARNESS_FILE, HARNESS_SOURCE, HarnessSpec, Report,
    SUBMISSION_FILE, new_nonce, parse_report,
};
use crate::outcome::{ExecutionOutcome, Outcome};
use crate::process::{Capture, ExecutionContext, ProcessLimits};

/// Upper bound on the harness report stream.
const REPORT_CAPTURE_BYTES: usize = 256 * 1024;

/// One unit of work for an [`Executor`].
#[derive(Debug, Clone, Copy)]
pub struct Job<'a> {
    /// Submitted source text. Not assumed to be valid.
    pub source: &'a str,
    /// The check to evaluate after the source has loaded.
    pub check: &'a Check,
    /// Wall-clock bound for the run.
    pub time_limit: Duration,
}

/// Runs submitted source against a check and classifies what happened.
///
/// Implementations never fail: faults of the executor itself are reported as
/// [`Outcome::InternalError`].
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `job` in a fresh execution context.
    async fn run(&self, job: Job<'_>) -> ExecutionOutcome;
}

/// Resource limits for sandbox execution.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Bytes of submission output kept; the rest is dropped.
    pub max_output_bytes: usize,
    /// Address-space limit for the interpreter.
    pub max_memory_bytes: Option<u64>,
    /// Interpreter recursion limit.
    pub max_recursion_depth: u32,
    /// Largest file the submission may write.
    pub max_file_bytes: u64,
    /// Open descriptor limit.
    pub max_open_files: u64,
    /// Process limit for the interpreter's user. `None` leaves it unset.
    pub max_processes: Option<u64>,
    /// How long output readers may lag behind process exit.
    pub kill_grace: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_output_bytes: 64 * 1024,
            max_memory_bytes: Some(512 * 1024 * 1024), // 512 MB
            max_recursion_depth: 1000,
            max_file_bytes: 1024 * 1024,
            max_open_files: 64,
            max_processes: Some(512),
            kill_grace: Duration::from_millis(250),
        }
    }
}

/// A sandbox that runs each job in its own `python3` process group.
#[derive(Debug, Clone)]
pub struct Sandbox {
    python: PathBuf,
    limits: ResourceLimits,
}

impl Sandbox {
    /// Create a sandbox builder.
    #[must_use]
    pub fn builder() -> SandboxBuilder {
        SandboxBuilder::new()
    }

    /// The interpreter this sandbox runs.
    #[must_use]
    pub fn python(&self) -> &Path {
        &self.python
    }

    /// The configured limits.
    #[must_use]
    pub fn resource_limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Ask the interpreter for its version.
    ///
    /// # Errors
    ///
    /// Returns an error if the interpreter cannot be started or exits with a failure.
    pub async fn interpreter_version(&self) -> Result<String, Error> {
        let output = tokio::process::Command::new(&self.python)
            .args(["-I", "-c", "import sys; print(sys.version.split()[0])"])
            .env_clear()
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Sandbox(format!(
                "{} exited with {}",
                self.python.display(),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn execute(&self, job: &Job<'_>) -> Result<ExecutionOutcome, Error> {
        let started = Instant::now();

        let mut ctx = ExecutionContext::create()?;
        let spec = HarnessSpec::new(job.check, self.limits.max_recursion_depth)
            .to_json()
            .map_err(|e| Error::Sandbox(format!("failed to encode check: {e}")))?;
        ctx.write(HARNESS_FILE, HARNESS_SOURCE.as_bytes())?;
        ctx.write(CHECK_FILE, &spec)?;
        ctx.write(SUBMISSION_FILE, job.source.as_bytes())?;

        let limits = ProcessLimits::for_run(
            job.time_limit,
            self.limits.max_memory_bytes,
            self.limits.max_file_bytes,
            self.limits.max_open_files,
            self.limits.max_processes,
        );
        let mut child = ctx.spawn(&self.python, limits)?;
        tracing::debug!(pid = ?child.id(), workdir = %ctx.path().display(), "Spawned interpreter");

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(Error::Sandbox("child pipes were not captured".to_string()));
        };
        let output = Capture::spawn(stdout, self.limits.max_output_bytes);
        let reports = Capture::spawn(stderr, REPORT_CAPTURE_BYTES);

        let nonce = new_nonce();
        if let Err(e) = stdin.write_all(format!("{nonce}\n").as_bytes()).await {
            tracing::debug!(error = %e, "Interpreter closed stdin early");
        }
        drop(stdin);

        let status = match tokio::time::timeout(job.time_limit, child.wait()).await {
            Ok(status) => Some(status?),
            Err(_) => {
                tracing::debug!(limit = ?job.time_limit, "Execution bound exceeded, killing process group");
                ctx.kill();
                child.wait().await?;
                None
            }
        };
        ctx.kill();

        let (output, output_truncated) = output.finish(self.limits.kill_grace).await;
        let (reports, _) = reports.finish(self.limits.kill_grace).await;
        let report = parse_report(&reports, &nonce);

        let mut outcome = classify(status, report, job.time_limit);
        outcome.output = String::from_utf8_lossy(&output).into_owned();
        outcome.output_truncated = output_truncated;
        outcome.duration = started.elapsed();
        Ok(outcome)
    }
}

#[async_trait]
impl Executor for Sandbox {
    async fn run(&self, job: Job<'_>) -> ExecutionOutcome {
        match self.execute(&job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, check = %job.check.id, "Sandbox failed");
                ExecutionOutcome::internal(e.to_string())
            }
        }
    }
}

/// Turn how the interpreter ended, plus its report if any, into an outcome.
///
/// `status` is `None` when the run was killed for exceeding its bound.
fn classify(
    status: Option<ExitStatus>,
    report: Option<Report>,
    time_limit: Duration,
) -> ExecutionOutcome {
    let Some(status) = status else {
        return ExecutionOutcome::new(
            Outcome::Timeout,
            format!(
                "Timeout: the code did not finish within {:.1} seconds.",
                time_limit.as_secs_f64()
            ),
        );
    };

    if let Some(report) = report {
        let score = report.score();
        let mut outcome = ExecutionOutcome::new(report.outcome.into(), report.message);
        outcome.score = score;
        return outcome;
    }

    match (status.signal(), status.code()) {
        (Some(libc::SIGXCPU), _) => ExecutionOutcome::new(
            Outcome::Timeout,
            "Timeout: the code used up its CPU time allowance.",
        ),
        (Some(signal), _) => {
            ExecutionOutcome::internal(format!("interpreter terminated by signal {signal}"))
        }
        (None, Some(HARNESS_FAULT_STATUS)) => {
            ExecutionOutcome::internal("harness failed before reporting")
        }
        (None, code) => ExecutionOutcome::new(
            Outcome::RuntimeError,
            format!(
                "The code exited before the check completed (exit status {}).",
                code.unwrap_or(-1)
            ),
        ),
    }
}

/// Builder for constructing a [`Sandbox`].
#[derive(Debug, Clone)]
pub struct SandboxBuilder {
    python: PathBuf,
    resource_limits: ResourceLimits,
}

impl Default for SandboxBuilder {
    fn default() -> Self {
        Self {
            python: PathBuf::from("python3"),
            resource_limits: ResourceLimits::default(),
        }
    }
}

impl SandboxBuilder {
    /// Create a new sandbox builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interpreter. A bare name is looked up on `PATH`.
    #[must_use]
    pub fn with_python(mut self, python: impl Into<PathBuf>) -> Self {
        self.python = python.into();
        self
    }

    /// Set resource limits.
    #[must_use]
    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    /// Build the sandbox.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit interpreter path does not exist or a
    /// limit is zero.
    pub fn build(self) -> Result<Sandbox, Error> {
        if self.python.components().count() > 1 && !self.python.exists() {
            return Err(Error::MissingPath(self.python));
        }
        let limits = &self.resource_limits;
        if limits.max_recursion_depth == 0
            || limits.max_open_files == 0
            || limits.max_processes == Some(0)
        {
            return Err(Error::Sandbox(
                "sandbox limits must be positive".to_string(),
            ));
        }
        Ok(Sandbox {
            python: self.python,
            limits: self.resource_limits,
        })
    }
}
