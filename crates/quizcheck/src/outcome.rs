//! The closed result vocabulary of a grading attempt.
//!
//! [`Outcome`] is what the executor can observe about one run. [`Status`]
//! adds the classifications only the router or the registry can produce
//! (unknown id, rejected request, admission control) and is the single
//! enumeration both wire forms are projected from:
//!
//! - form B: [`Status::code`], a small integer where `0` means success;
//! - form A: [`Status::error_text`], a message that is empty on success.

use std::fmt;
use std::time::Duration;

/// Terminal state of one sandboxed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// The source loaded and every assertion of the check passed.
    Success,
    /// The source loaded but an assertion or structural rule failed.
    AssertionFailure,
    /// An exception escaped while loading or exercising the source.
    RuntimeError,
    /// The source failed to parse or compile.
    SyntaxError,
    /// The execution bound was exceeded.
    Timeout,
    /// The sandbox itself faulted.
    InternalError,
}

impl Outcome {
    /// Every outcome, in status-code order.
    pub const ALL: [Outcome; 6] = [
        Outcome::Success,
        Outcome::AssertionFailure,
        Outcome::RuntimeError,
        Outcome::SyntaxError,
        Outcome::Timeout,
        Outcome::InternalError,
    ];

    /// Whether this outcome is a pass.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Status::from(*self).fmt(f)
    }
}

/// Client-visible classification of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    /// See [`Outcome::Success`].
    Success = 0,
    /// See [`Outcome::AssertionFailure`].
    AssertionFailure = 1,
    /// See [`Outcome::RuntimeError`].
    RuntimeError = 2,
    /// See [`Outcome::SyntaxError`].
    SyntaxError = 3,
    /// See [`Outcome::Timeout`].
    Timeout = 4,
    /// See [`Outcome::InternalError`].
    InternalError = 5,
    /// The requested check id is not registered.
    NotFound = 6,
    /// The request was malformed or exceeded a size limit.
    InvalidRequest = 7,
    /// Admission control turned the request away.
    Overloaded = 8,
}

impl Status {
    /// Integer status code (wire form B).
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Inverse of [`Status::code`].
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Status::Success,
            1 => Status::AssertionFailure,
            2 => Status::RuntimeError,
            3 => Status::SyntaxError,
            4 => Status::Timeout,
            5 => Status::InternalError,
            6 => Status::NotFound,
            7 => Status::InvalidRequest,
            8 => Status::Overloaded,
            _ => return None,
        })
    }

    /// Short label, suitable for metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::AssertionFailure => "assertion_failure",
            Status::RuntimeError => "runtime_error",
            Status::SyntaxError => "syntax_error",
            Status::Timeout => "timeout",
            Status::InternalError => "internal_error",
            Status::NotFound => "not_found",
            Status::InvalidRequest => "invalid_request",
            Status::Overloaded => "overloaded",
        }
    }

    /// Free-text error (wire form A). Empty exactly when the status is a success.
    #[must_use]
    pub const fn error_text(self) -> &'static str {
        match self {
            Status::Success => "",
            Status::AssertionFailure => "The check failed.",
            Status::RuntimeError => "The code raised an exception.",
            Status::SyntaxError => "The code has a syntax error.",
            Status::Timeout => "The code took too long to run.",
            Status::InternalError => "The checker encountered an internal error.",
            Status::NotFound => "No check is registered under that id.",
            Status::InvalidRequest => "The request is malformed or too large.",
            Status::Overloaded => "The checker is busy, try again shortly.",
        }
    }

    /// Whether this status is a pass.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

impl From<Outcome> for Status {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => Status::Success,
            Outcome::AssertionFailure => Status::AssertionFailure,
            Outcome::RuntimeError => Status::RuntimeError,
            Outcome::SyntaxError => Status::SyntaxError,
            Outcome::Timeout => Status::Timeout,
            Outcome::InternalError => Status::InternalError,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assertion counts for a check run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Score {
    /// Assertions that passed.
    pub passed: u32,
    /// Assertions the check defines.
    pub total: u32,
}

/// Everything the executor reports about one run.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Classification of the run.
    pub outcome: Outcome,
    /// Captured stdout and stderr of the submission.
    pub output: String,
    /// Whether `output` was cut at the capture limit.
    pub output_truncated: bool,
    /// Diagnostic for non-success outcomes: the failed assertions, the
    /// exception traceback, the syntax error, or a timeout notice.
    pub diagnostic: String,
    /// Assertion counts, when the check got far enough to evaluate them.
    pub score: Option<Score>,
    /// Wall-clock time spent in the sandbox.
    pub duration: Duration,
}

impl ExecutionOutcome {
    /// An outcome with no captured output.
    #[must_use]
    pub fn new(outcome: Outcome, diagnostic: impl Into<String>) -> Self {
        Self {
            outcome,
            output: String::new(),
            output_truncated: false,
            diagnostic: diagnostic.into(),
            score: None,
            duration: Duration::ZERO,
        }
    }

    /// An internal fault. The detail is for logs only and never reaches the client.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(Outcome::InternalError, detail)
    }
}

/// The verdict returned for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    /// Human-readable output or diagnostic text.
    pub response: String,
    /// Classification.
    pub status: Status,
    /// Assertion counts, when known.
    pub score: Option<Score>,
}

impl CheckResult {
    /// A result with no score.
    #[must_use]
    pub fn new(status: Status, response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            status,
            score: None,
        }
    }

    /// Result for an unknown check id.
    #[must_use]
    pub fn not_found(id: &str) -> Self {
        Self::new(
            Status::NotFound,
            format!("I can't find a check with the id \"{id}\"."),
        )
    }

    /// Result for an id that names a group rather than a single check.
    #[must_use]
    pub fn group_not_found(id: &str, members: &[String]) -> Self {
        Self::new(
            Status::NotFound,
            format!(
                "\"{id}\" is a group of checks. Try one of: {}.",
                members.join(", ")
            ),
        )
    }

    /// Result for a request turned away by admission control.
    #[must_use]
    pub fn overloaded() -> Self {
        Self::new(Status::Overloaded, Status::Overloaded.error_text())
    }

    /// Result for a service-side fault, without any host detail.
    #[must_use]
    pub fn internal_error() -> Self {
        Self::new(
            Status::InternalError,
            "The checker encountered an internal error. Please try again later.",
        )
    }

    /// Wire form A.
    #[must_use]
    pub fn error_text(&self) -> &'static str {
        self.status.error_text()
    }
}
