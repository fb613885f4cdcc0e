//! Command-line and environment configuration.
//!
//! Every flag can also be set through a `QUIZCHECK_*` environment variable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use quizcheck::{
    CheckRegistry, Grader, RequestLimits, ResourceLimits, Sandbox, TestBank, TimeBounds,
};

use crate::admission::AdmissionPolicy;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// `key=value` lines.
    Logfmt,
    /// Human-readable lines.
    Text,
}

/// What to do with requests when every grading slot is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AdmissionMode {
    /// Wait in a bounded queue.
    Queue,
    /// Reject immediately.
    Reject,
}

/// Settings for the grading engine, shared by `serve` and `run`.
#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    /// Test bank directories or files (repeatable, or comma separated)
    #[arg(long = "testbank", env = "QUIZCHECK_TESTBANK", value_delimiter = ',', required = true)]
    pub testbank: Vec<PathBuf>,

    /// Python interpreter used to run submissions
    #[arg(long, env = "QUIZCHECK_PYTHON", default_value = "python3")]
    pub python: PathBuf,

    /// Execution bound for checks that do not set their own, in milliseconds
    #[arg(long, env = "QUIZCHECK_TIMEOUT_MS", default_value_t = 2000)]
    pub timeout_ms: u64,

    /// Ceiling for any check's execution bound, in milliseconds
    #[arg(long, env = "QUIZCHECK_MAX_TIMEOUT_MS", default_value_t = 30_000)]
    pub max_timeout_ms: u64,

    /// Bytes of submission output kept in the response
    #[arg(long, env = "QUIZCHECK_MAX_OUTPUT_BYTES", default_value_t = 64 * 1024)]
    pub max_output_bytes: usize,

    /// Address-space limit for the interpreter in MiB (0 disables)
    #[arg(long, env = "QUIZCHECK_MEMORY_LIMIT_MB", default_value_t = 512)]
    pub memory_limit_mb: u64,

    /// Interpreter recursion limit
    #[arg(long, env = "QUIZCHECK_RECURSION_LIMIT", default_value_t = 1000)]
    pub recursion_limit: u32,

    /// Process limit for the interpreter's user (0 disables)
    #[arg(long, env = "QUIZCHECK_MAX_PROCESSES", default_value_t = 512)]
    pub max_processes: u64,

    /// Longest accepted check id, in bytes
    #[arg(long, env = "QUIZCHECK_MAX_ID_BYTES", default_value_t = 256)]
    pub max_id_bytes: usize,

    /// Longest accepted source, in bytes
    #[arg(long, env = "QUIZCHECK_MAX_SOURCE_BYTES", default_value_t = 64 * 1024)]
    pub max_source_bytes: usize,
}

impl EngineArgs {
    /// Sandbox limits derived from the flags.
    #[must_use]
    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_output_bytes: self.max_output_bytes,
            max_memory_bytes: (self.memory_limit_mb > 0)
                .then(|| self.memory_limit_mb.saturating_mul(1024 * 1024)),
            max_recursion_depth: self.recursion_limit,
            max_processes: (self.max_processes > 0).then_some(self.max_processes),
            ..ResourceLimits::default()
        }
    }

    /// Request validation limits.
    #[must_use]
    pub fn request_limits(&self) -> RequestLimits {
        RequestLimits {
            max_id_bytes: self.max_id_bytes,
            max_source_bytes: self.max_source_bytes,
        }
    }

    /// Execution bounds derived from the flags.
    #[must_use]
    pub fn time_bounds(&self) -> TimeBounds {
        let default = Duration::from_millis(self.timeout_ms);
        TimeBounds {
            default,
            max: Duration::from_millis(self.max_timeout_ms).max(default),
        }
    }

    /// Load the test bank.
    ///
    /// # Errors
    ///
    /// Returns an error if a path is missing or the bank does not load.
    pub fn load_registry(&self) -> Result<CheckRegistry> {
        let mut bank = TestBank::new();
        for path in &self.testbank {
            bank.add_path(path)
                .with_context(|| format!("invalid test bank path {}", path.display()))?;
        }
        CheckRegistry::from_bank(bank).context("failed to load test bank")
    }

    /// Build the sandbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the interpreter path or limits are invalid.
    pub fn sandbox(&self) -> Result<Sandbox> {
        if self.timeout_ms == 0 {
            anyhow::bail!("--timeout-ms must be positive");
        }
        Sandbox::builder()
            .with_python(&self.python)
            .with_resource_limits(self.resource_limits())
            .build()
            .context("failed to configure sandbox")
    }

    /// Build a grader over a freshly loaded registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the bank or the sandbox cannot be set up.
    pub fn grader(&self) -> Result<Grader> {
        let registry = Arc::new(self.load_registry()?);
        let sandbox = Arc::new(self.sandbox()?);
        Ok(Grader::new(registry, sandbox).with_time_bounds(self.time_bounds()))
    }
}

/// Settings for `quizcheck serve`.
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Engine settings.
    #[command(flatten)]
    pub engine: EngineArgs,

    /// gRPC listen address
    #[arg(long, env = "QUIZCHECK_LISTEN", default_value = "[::]:32453")]
    pub listen: SocketAddr,

    /// Concurrent grading sessions (defaults to the number of CPUs)
    #[arg(long, env = "QUIZCHECK_MAX_IN_FLIGHT")]
    pub max_in_flight: Option<usize>,

    /// Policy when every session slot is busy
    #[arg(long, env = "QUIZCHECK_ADMISSION", value_enum, default_value_t = AdmissionMode::Queue)]
    pub admission: AdmissionMode,

    /// Requests allowed to wait for a slot
    #[arg(long, env = "QUIZCHECK_QUEUE_DEPTH", default_value_t = 64)]
    pub queue_depth: usize,

    /// Longest a request may wait for a slot, in milliseconds
    #[arg(long, env = "QUIZCHECK_QUEUE_TIMEOUT_MS")]
    pub queue_timeout_ms: Option<u64>,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "QUIZCHECK_METRICS_LISTEN")]
    pub metrics_listen: Option<SocketAddr>,

    /// Export traces to this OTLP gRPC endpoint
    #[arg(long, env = "QUIZCHECK_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

impl ServeArgs {
    /// Concurrent session limit.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        })
    }

    /// Admission policy.
    #[must_use]
    pub fn admission_policy(&self) -> AdmissionPolicy {
        match self.admission {
            AdmissionMode::Reject => AdmissionPolicy::Reject,
            AdmissionMode::Queue => AdmissionPolicy::Queue {
                depth: self.queue_depth,
                timeout: self.queue_timeout_ms.map(Duration::from_millis),
            },
        }
    }
}
