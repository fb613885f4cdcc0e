//! Grading sessions: one registry lookup plus one sandboxed run per request.
//!
//! A [`Grader`] is the long-lived, shareable entry point. Each call to
//! [`Grader::grade`] resolves the check, then hands it to a fresh
//! [`GradingSession`] that owns the request's lifecycle and produces exactly
//! one [`CheckResult`]. Nothing is cached between requests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::check::Check;
use crate::error::Error;
use crate::outcome::{CheckResult, ExecutionOutcome, Outcome, Status};
use crate::registry::CheckRegistry;
use crate::sandbox::{Executor, Job};

/// Appended to output cut at the capture limit.
const TRUNCATION_NOTICE: &str = "[output truncated]";

/// A request to grade `source` against the check registered as `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    /// Check identifier.
    pub id: String,
    /// Submitted source text.
    pub source: String,
}

impl CheckRequest {
    /// Create a request.
    #[must_use]
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
        }
    }
}

/// Size limits checked before a request is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    /// Longest accepted id, in bytes.
    pub max_id_bytes: usize,
    /// Longest accepted source, in bytes.
    pub max_source_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_id_bytes: 256,
            max_source_bytes: 64 * 1024,
        }
    }
}

impl RequestLimits {
    /// Reject empty or oversized fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] naming the offending field.
    pub fn validate(&self, request: &CheckRequest) -> Result<(), Error> {
        if request.id.trim().is_empty() {
            return Err(Error::InvalidRequest("id must not be empty".to_string()));
        }
        if request.id.len() > self.max_id_bytes {
            return Err(Error::InvalidRequest(format!(
                "id is {} bytes, the limit is {}",
                request.id.len(),
                self.max_id_bytes
            )));
        }
        if request.source.trim().is_empty() {
            return Err(Error::InvalidRequest("source must not be empty".to_string()));
        }
        if request.source.len() > self.max_source_bytes {
            return Err(Error::InvalidRequest(format!(
                "source is {} bytes, the limit is {}",
                request.source.len(),
                self.max_source_bytes
            )));
        }
        Ok(())
    }
}

/// Execution bounds applied to checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBounds {
    /// Bound for checks that do not set their own.
    pub default: Duration,
    /// Ceiling for any check.
    pub max: Duration,
}

impl Default for TimeBounds {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(2),
            max: Duration::from_secs(30),
        }
    }
}

impl TimeBounds {
    /// The bound that applies to `check`.
    #[must_use]
    pub fn resolve(&self, check: &Check) -> Duration {
        check.timeout().unwrap_or(self.default).min(self.max)
    }
}

/// Shared entry point for grading requests.
#[derive(Clone)]
pub struct Grader {
    registry: Arc<CheckRegistry>,
    executor: Arc<dyn Executor>,
    bounds: TimeBounds,
}

impl fmt::Debug for Grader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grader")
            .field("checks", &self.registry.len())
            .field("bounds", &self.bounds)
            .finish_non_exhaustive()
    }
}

impl Grader {
    /// Create a grader with default time bounds.
    #[must_use]
    pub fn new(registry: Arc<CheckRegistry>, executor: Arc<dyn Executor>) -> Self {
        Self {
            registry,
            executor,
            bounds: TimeBounds::default(),
        }
    }

    /// Set the time bounds.
    #[must_use]
    pub fn with_time_bounds(mut self, bounds: TimeBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// The registry checks are resolved from.
    #[must_use]
    pub fn registry(&self) -> &Arc<CheckRegistry> {
        &self.registry
    }

    /// The configured time bounds.
    #[must_use]
    pub fn time_bounds(&self) -> TimeBounds {
        self.bounds
    }

    /// Grade one request.
    ///
    /// An unknown id, or one naming a group, yields [`Status::NotFound`]
    /// without running anything.
    #[tracing::instrument(skip_all, fields(check = %request.id, source_len = request.source.len()))]
    pub async fn grade(&self, request: &CheckRequest) -> CheckResult {
        let check = match self.registry.lookup(&request.id) {
            Ok(check) => check,
            Err(Error::GroupNotGradeable { id, checks }) => {
                tracing::info!(group = %id, "Requested id names a group");
                return CheckResult::group_not_found(&id, &checks);
            }
            Err(e) => {
                tracing::info!(error = %e, "Unknown check");
                return CheckResult::not_found(&request.id);
            }
        };
        let time_limit = self.bounds.resolve(&check);
        GradingSession::new(check, time_limit)
            .run(self.executor.as_ref(), &request.source)
            .await
    }
}

/// The lifecycle of a single grading request.
///
/// Consumed by [`run`](Self::run), so a session cannot be reused.
#[derive(Debug)]
pub struct GradingSession {
    check: Arc<Check>,
    time_limit: Duration,
}

impl GradingSession {
    /// Create a session for `check` bounded by `time_limit`.
    #[must_use]
    pub fn new(check: Arc<Check>, time_limit: Duration) -> Self {
        Self { check, time_limit }
    }

    /// Run `source` through `executor` and map the result.
    pub async fn run(self, executor: &dyn Executor, source: &str) -> CheckResult {
        let outcome = executor
            .run(Job {
                source,
                check: &self.check,
                time_limit: self.time_limit,
            })
            .await;
        tracing::info!(
            outcome = %outcome.outcome,
            duration_ms = outcome.duration.as_millis(),
            output_bytes = outcome.output.len(),
            truncated = outcome.output_truncated,
            "Graded submission"
        );
        render(outcome)
    }
}

/// Map an execution outcome to the client-visible result.
#[must_use]
pub fn render(outcome: ExecutionOutcome) -> CheckResult {
    if outcome.outcome == Outcome::InternalError {
        tracing::error!(detail = %outcome.diagnostic, "Sandbox reported an internal error");
        return CheckResult::internal_error();
    }

    let mut output = outcome.output;
    if outcome.output_truncated {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(TRUNCATION_NOTICE);
    }

    let response = if outcome.outcome.is_success() {
        output
    } else if output.is_empty() {
        outcome.diagnostic
    } else {
        format!("{}\n\nOutput:\n{output}", outcome.diagnostic)
    };

    CheckResult {
        response,
        status: Status::from(outcome.outcome),
        score: outcome.score,
    }
}
